//! Runtime errors.

use accu_activity::RetryError;
use accu_store::{StoreError, WorkflowKind};

/// Errors surfaced by workflow operations.
///
/// Guard failures (`InvalidTransition`, `DependencyNotMet`,
/// `PreconditionFailed`, `ValidationFailed`) leave the instance untouched.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
  /// The signal is not legal in the instance's current state.
  #[error("signal '{signal}' is not valid in state '{state}'")]
  InvalidTransition { signal: String, state: String },

  /// A milestone's dependencies are not all completed.
  #[error("milestone '{milestone_id}' has incomplete dependencies: {}", pending.join(", "))]
  DependencyNotMet {
    milestone_id: String,
    pending: Vec<String>,
  },

  /// A business precondition of the transition does not hold.
  #[error("precondition failed: {message}")]
  PreconditionFailed { message: String },

  /// The business-rule validation activity returned false.
  #[error("business rule validation failed for {entity_id}: {}", rules.join(", "))]
  ValidationFailed { entity_id: String, rules: Vec<String> },

  /// An activity kept failing after its retry budget was spent.
  #[error("activity failure: {0}")]
  ActivityFailure(#[from] RetryError),

  /// A live instance already exists for this workflow type and entity.
  #[error("{kind} workflow already running for entity '{entity_id}' ({workflow_id})")]
  AlreadyExists {
    kind: WorkflowKind,
    entity_id: String,
    workflow_id: String,
  },

  /// No instance with this id exists.
  #[error("no such workflow: {workflow_id}")]
  NoSuchWorkflow { workflow_id: String },

  /// No definition is registered for the workflow type.
  #[error("workflow type '{kind}' is not registered")]
  NotRegistered { kind: WorkflowKind },

  /// The workflow type does not define this signal.
  #[error("unknown signal '{signal}'")]
  UnknownSignal { signal: String },

  /// The signal payload does not match the signal's shape.
  #[error("invalid payload for '{signal}': {message}")]
  InvalidPayload { signal: String, message: String },

  /// The workflow type does not define this query.
  #[error("unknown query '{query}'")]
  UnknownQuery { query: String },

  /// A deadline or milestone referenced by a signal does not exist.
  #[error("{item} '{id}' not found")]
  NotFound { item: &'static str, id: String },

  /// History could not be replayed into workflow state.
  #[error("replay of '{workflow_id}' failed at entry {sequence}: {message}")]
  Replay {
    workflow_id: String,
    sequence: u64,
    message: String,
  },

  /// The instance was terminated before the operation completed.
  #[error("workflow '{workflow_id}' was terminated")]
  Terminated { workflow_id: String },

  /// The runtime is shutting down.
  #[error("runtime is shutting down")]
  Shutdown,

  #[error("store error: {0}")]
  Store(#[from] StoreError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
  pub fn invalid_transition(signal: impl Into<String>, state: impl Into<String>) -> Self {
    WorkflowError::InvalidTransition {
      signal: signal.into(),
      state: state.into(),
    }
  }

  pub fn precondition(message: impl Into<String>) -> Self {
    WorkflowError::PreconditionFailed {
      message: message.into(),
    }
  }

  /// Whether the error rejected the request without touching the instance.
  pub fn is_rejection(&self) -> bool {
    matches!(
      self,
      WorkflowError::InvalidTransition { .. }
        | WorkflowError::DependencyNotMet { .. }
        | WorkflowError::PreconditionFailed { .. }
        | WorkflowError::ValidationFailed { .. }
        | WorkflowError::UnknownSignal { .. }
        | WorkflowError::InvalidPayload { .. }
        | WorkflowError::NotFound { .. }
    )
  }
}
