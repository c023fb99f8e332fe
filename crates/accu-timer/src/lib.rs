//! Accu Timer
//!
//! Timer infrastructure for suspended workflow instances. The [`TimerHeap`]
//! is the only component that reads wall-clock time: instances register a
//! [`TimerHandle`] for a [`TimerReason`] and yield, and the runtime's driver
//! pops expired timers and wakes the owning instance.
//!
//! Time comes from a [`Clock`]: [`SystemClock`] in production and
//! [`ManualClock`] when tests need to step through weeks of schedule.

mod clock;
mod heap;

pub use clock::{Clock, ManualClock, SystemClock};
pub use heap::{Expired, TimerHandle, TimerHeap, TimerReason};
