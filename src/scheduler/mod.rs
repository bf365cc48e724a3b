//! Timed task scheduling.
//!
//! [`TimedTask`]s are deferred callbacks with an absolute expiry; the
//! [`TaskScheduler`] owns the set of live tasks and fires them when due.
//! Bounty spawners, escape respawns and housekeeping jobs are all timed tasks.

pub mod runner;
pub mod task;

pub use runner::{FireOutcome, TaskScheduler};
pub use task::{
    DelayGenerator, ExpiryFn, Reschedule, TaskId, TaskState, TimedTask, TimedTaskBuilder,
    delay_generator, expiry_fn,
};
