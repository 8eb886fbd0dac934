//! Job scheduling.
//!
//! - [`job`]: the persisted job record and its state machine
//! - [`admission`]: slot accounting for jobs this process is driving
//! - [`engine`]: the [`Scheduler`] itself
//!
//! # Job lifecycle
//!
//! ```text
//! Queued --admit--> Executing --enough deals--> Success
//!    |                  |------shortfall------> Failed
//!    +----cancel--------+-------cancel-------> Canceled
//! ```

pub mod admission;
pub mod engine;
pub mod job;

pub use engine::Scheduler;
pub use job::{ContentId, DealError, DealRecord, Job, JobId, JobState, StorageConfig};
