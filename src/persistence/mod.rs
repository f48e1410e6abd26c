//! Asynchronous persistence pipeline.
//!
//! A file scheduled for persistence enters the [`PersistQueue`] as a
//! [`PersistRequest`] carrying an [`ExponentialTimer`]. The
//! [`PersistenceScheduler`] heartbeat submits ready requests to the job
//! service and tracks the resulting [`PersistJob`]s; the
//! [`PersistenceChecker`] heartbeat polls them, requeues failures with their
//! original timer and finalizes completed jobs.

mod checker;
mod job;
mod queue;
mod scheduler;
mod timer;

pub use checker::PersistenceChecker;
pub use job::{CancelState, PersistJob, PersistRequest};
pub use queue::PersistQueue;
pub use scheduler::PersistenceScheduler;
pub use timer::{ExponentialTimer, TimerTick};
