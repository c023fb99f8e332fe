//! Accu Orchestrator
//!
//! The only component the CRUD/API layer talks to. It maps triggers and
//! business-entity status changes onto workflow starts and signals.
//!
//! # Architecture
//!
//! ```text
//! CRUD layer
//!   ├── trigger_workflow(entity, trigger)  ──▶ Runtime::start (or existing id)
//!   ├── handle_status_change(entity, status)
//!   │      status ─▶ signal name ──▶ Runtime::signal ─▶ outcome
//!   ├── signal / query / list / terminate  ──▶ Runtime
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let runtime = accu_workflows::register_all(Runtime::builder(config))
//!   .store(store)
//!   .build();
//! let orchestrator = Orchestrator::new(runtime);
//!
//! let id = orchestrator
//!   .trigger_workflow("project", "p-1", "project_lifecycle", input, "api")
//!   .await?;
//! orchestrator
//!   .handle_status_change("project", "p-1", "active", "api", Value::Null)
//!   .await?;
//! ```

mod error;
mod orchestrator;
mod trigger;

pub use error::OrchestratorError;
pub use orchestrator::Orchestrator;
pub use trigger::TriggerType;
