use thiserror::Error;

/// Failures callers may want to match on. They travel inside `anyhow::Error`
/// and can be recovered with `err.downcast_ref::<JobError>()`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no input files matched {location}")]
    NoInputFiles { location: String },

    #[error("input file {path} does not exist")]
    MissingInput { path: String },

    #[error("input file {path} is listed more than once")]
    DuplicateInput { path: String },

    #[error("header of {file} does not match: expected {expected:?}, found {found:?}")]
    SchemaMismatch {
        file: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("unknown column {column:?} in drop subset")]
    UnknownColumn { column: String },

    #[error("output location {location} already contains data")]
    OutputExists { location: String },

    #[error("session {app_name} has been stopped")]
    SessionStopped { app_name: String },

    #[error("invalid location {location:?}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}
