//! Accu Activity
//!
//! The contract between the workflow engine and its collaborators. Workflow
//! steps never perform I/O themselves; they call an [`ActivityGateway`] with
//! an [`IdempotencyKey`], and the runtime wraps each call in
//! [`with_retry`] according to the configured [`RetryPolicy`](accu_config::RetryPolicy).
//!
//! Concrete transports (email, SMS, push, the business-entity database) live
//! outside this repository. [`RecordingGateway`] is the in-process adapter
//! used by tests and the CLI.

mod error;
mod gateway;
mod recording;
mod retry;
mod types;

pub use error::{ActivityError, RetryError};
pub use gateway::{ActivityGateway, IdempotencyKey};
pub use recording::{ActivityCall, RecordingGateway};
pub use retry::with_retry;
pub use types::{
  CalendarDeadline, Channel, HistoryRecord, Notification, Priority, RuleCheck, StatusUpdate,
};

/// Activity names as they appear in logs, errors and the journal.
pub mod names {
  pub const UPDATE_ENTITY_STATUS: &str = "updateEntityStatus";
  pub const CREATE_CALENDAR_DEADLINE: &str = "createCalendarDeadline";
  pub const SEND_NOTIFICATION: &str = "sendNotification";
  pub const VALIDATE_BUSINESS_RULES: &str = "validateBusinessRules";
  pub const RECORD_HISTORY_ENTRY: &str = "recordHistoryEntry";
}
