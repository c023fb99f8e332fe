use accu_runtime::WorkflowError;

/// Errors returned to orchestrator callers.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
  #[error("unknown trigger type '{trigger}'")]
  UnknownTrigger { trigger: String },

  #[error(transparent)]
  Workflow(#[from] WorkflowError),
}

impl OrchestratorError {
  /// The runtime error behind this one, if any.
  pub fn workflow(&self) -> Option<&WorkflowError> {
    match self {
      OrchestratorError::Workflow(e) => Some(e),
      OrchestratorError::UnknownTrigger { .. } => None,
    }
  }
}
