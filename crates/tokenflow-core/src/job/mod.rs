//! Job execution: acquisition, locking and retry of deferred work.
//!
//! Async continuations and timers are stored as jobs on their process
//! instance. The `JobExecutor` claims due jobs, runs each one through the
//! engine as its own unit of work, and books failures against the job's
//! retry budget.

pub mod executor;
pub mod retry;

pub use executor::{JobExecutor, JobRunSummary};
pub use retry::RetryPolicy;
