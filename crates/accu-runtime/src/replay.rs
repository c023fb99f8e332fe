//! Rebuilding workflow state from history.

use accu_store::{HistoryEntry, InstanceStatus};

use crate::error::WorkflowError;
use crate::workflow::{Workflow, decode_event};

/// History action written by `terminate`.
pub const TERMINATED_ACTION: &str = "workflowTerminated";

/// History action written when an activity exhausts its retries.
pub const FAILED_ACTION: &str = "workflowFailed";

/// State and status rebuilt from a history log.
#[derive(Debug, Clone)]
pub struct Replayed<W> {
  pub state: W,
  pub status: InstanceStatus,
}

/// Fold `history` into a fresh `W`, in order.
///
/// Runtime entries (`workflowTerminated`, `workflowFailed`) set the status
/// without touching the workflow state.
pub fn replay<W: Workflow>(workflow_id: &str, history: &[HistoryEntry]) -> Result<Replayed<W>, WorkflowError> {
  let mut state = W::default();
  let mut forced = None;

  for entry in history {
    match entry.action.as_str() {
      TERMINATED_ACTION => forced = Some(InstanceStatus::Cancelled),
      FAILED_ACTION => forced = Some(InstanceStatus::Failed),
      action => {
        let event: W::Event = decode_event(action, &entry.details).map_err(|e| WorkflowError::Replay {
          workflow_id: workflow_id.to_string(),
          sequence: entry.sequence,
          message: e.to_string(),
        })?;
        state.apply(&event);
      }
    }
  }

  let status = forced.unwrap_or_else(|| state.status());
  Ok(Replayed { state, status })
}
