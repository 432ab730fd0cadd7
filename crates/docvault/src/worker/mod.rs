pub mod job;
pub mod pool;
pub mod runner;
pub mod watchdog;

pub use job::{JobOutcome, JobResult};
pub use pool::{PoolOptions, WorkerPool};
pub use runner::JobRunner;
pub use watchdog::StalledJobWatchdog;

// Re-export crossbeam_channel for use in the binary
pub use crossbeam_channel;
