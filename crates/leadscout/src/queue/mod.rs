//! Durable job queue: job records, the store that claims and settles them,
//! and the async worker pool that executes them.

pub mod job;
pub mod store;
pub mod worker;

pub use job::{ClaimedJob, Exclusive, Job, JobFilter, JobStatus, JobTask, NewJob, TaskStatus};
pub use store::JobStore;
pub use worker::{JobHandler, JobOutcome, WorkerPool};
