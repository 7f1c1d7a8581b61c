pub mod clean;
pub mod config;
pub mod error;
pub mod ingest;
pub mod job;
pub mod session;
pub mod table;
pub mod write;

pub use job::{run, BatchJob, JobSummary};
