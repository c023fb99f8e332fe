//! Accu Runtime
//!
//! Durable execution of long-running workflow instances.
//!
//! # Architecture
//!
//! ```text
//! Runtime
//!   ├── definitions   one per WorkflowKind, registered at build time
//!   ├── instances     id -> handle (snapshot + command queue)
//!   └── Shared
//!         ├── Store           records + activity journal
//!         ├── ActivityGateway side effects
//!         └── TimerHeap       wake-up times
//!
//! instance actor (one tokio task per live instance)
//!   loop:
//!     recv Signal | Wake
//!     run handler -> events      (activities keyed, journaled, retried)
//!     commit: append history, save record, publish snapshot
//!     re-arm timers implied by the new state
//! ```
//!
//! A workflow definition implements [`Workflow`]: handlers return events,
//! `apply` folds events into state. History is the list of committed
//! events, so [`replay`] rebuilds any instance from its log.
//!
//! Queries read the last published snapshot and never wait for the actor.

mod context;
mod error;
mod instance;
mod replay;
mod runtime;
mod summary;
mod workflow;

pub use context::StepContext;
pub use error::WorkflowError;
pub use replay::{FAILED_ACTION, Replayed, TERMINATED_ACTION, replay};
pub use runtime::{Runtime, RuntimeBuilder, SignalTicket};
pub use summary::{ListFilter, RecoveryReport, WorkflowSummary};
pub use workflow::{TimerRequest, Workflow, parse_signal};

pub use accu_store::{HistoryEntry, InstanceStatus, WorkflowKind, WorkflowRecord};
pub use accu_timer::TimerReason;
