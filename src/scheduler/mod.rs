//! Compute job scheduling: admission, collision resolution, execution and
//! lifecycle tracking of jobs sent by remote task originators.

pub mod bounded;
pub mod collision;
pub mod gate;
pub mod job;
pub mod metrics;
pub mod processor;
pub mod reservation;
pub mod worker;

pub use collision::{CollisionJobContext, CollisionPolicy, FifoQueuePolicy};
pub use job::{ComputeJob, ExecuteRequest, JobContext, JobSession};
pub use processor::{JobProcessor, JobView, JobViewState};
pub use worker::{JobWorker, WorkerStatus};
