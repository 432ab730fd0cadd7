//! Real-time job progress events.
//!
//! Workers publish to a tokio broadcast channel; any number of subscribers
//! (a status endpoint, a CLI, tests) can listen without slowing them down.

pub mod job_progress;

pub use job_progress::{
    JobPhase, JobProgressBroadcaster, JobProgressEvent, JobProgressTracker, JobStatus,
};
