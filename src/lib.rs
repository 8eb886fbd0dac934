pub mod config;
pub mod deals;
pub mod error;
pub mod scheduler;
pub mod selector;
pub mod shutdown;
pub mod store;

pub use error::{Result, SchedulerError};
pub use scheduler::{ContentId, Job, JobId, JobState, Scheduler, StorageConfig};
