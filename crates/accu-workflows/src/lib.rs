//! Accu Workflows
//!
//! The three workflow definitions run by the engine:
//!
//! - [`DeadlineWorkflow`]: a set of calendar deadlines for one entity, with
//!   priority-tiered reminders and escalation chains driven by the monitor tick
//! - [`ApplicationWorkflow`]: ACCU application approval
//!   (`draft → submitted → under_review → approved/rejected → issued`) with
//!   review and approval timeouts and auto-issue
//! - [`ProjectWorkflow`]: project phases, milestone dependencies, progress
//!   accounting and the stall monitor
//!
//! # Usage
//!
//! ```ignore
//! let runtime = accu_workflows::register_all(Runtime::builder(config))
//!   .store(store)
//!   .build();
//! ```

pub mod application;
pub mod deadline;
pub mod policy;
pub mod project;

pub use application::{ApplicationState, ApplicationWorkflow};
pub use deadline::{Deadline, DeadlineStatus, DeadlineWorkflow};
pub use project::{Milestone, MilestoneStatus, Phase, ProjectState, ProjectWorkflow};

use accu_activity::Notification;
use accu_runtime::{RuntimeBuilder, StepContext, WorkflowError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

/// Register every workflow definition of this crate.
pub fn register_all(builder: RuntimeBuilder) -> RuntimeBuilder {
  builder
    .register::<DeadlineWorkflow>()
    .register::<ApplicationWorkflow>()
    .register::<ProjectWorkflow>()
}

/// Send a notification whose failure must not fail the step.
///
/// Returns whether it was delivered; callers record delivery only on `true`
/// so the next tick tries again.
pub(crate) async fn notify(ctx: &mut StepContext<'_>, notification: &Notification) -> bool {
  match ctx.send_notification(notification).await {
    Ok(()) => true,
    Err(e) => {
      warn!(
        workflow_id = %ctx.workflow_id(),
        user_id = %notification.user_id,
        channel = %notification.channel,
        error = %e,
        "notification_failed"
      );
      false
    }
  }
}

/// Decode a start input, treating `null` as an empty object.
pub(crate) fn parse_input<T: DeserializeOwned + Default>(input: &Value) -> Result<T, WorkflowError> {
  if input.is_null() {
    return Ok(T::default());
  }
  serde_json::from_value(input.clone()).map_err(|e| WorkflowError::InvalidPayload {
    signal: "start".to_string(),
    message: e.to_string(),
  })
}
