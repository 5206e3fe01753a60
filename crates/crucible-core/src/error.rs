//! Error types for Crucible.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Sentinel conditions callers branch on
    #[error("no such build")]
    NoBuild,

    #[error("no satisfiable input versions")]
    NoVersions,

    #[error("config version mismatch")]
    ConfigComparisonFailed,

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("container not found")]
    ContainerNotFound,

    #[error("found multiple containers: {}", handles.join(", "))]
    MultipleContainers { handles: Vec<String> },

    #[error("lock is already held")]
    LockConflict,

    #[error("end of event stream")]
    EndOfStream,

    #[error("event stream closed")]
    StreamClosed,

    #[error("step timed out")]
    StepTimedOut,

    #[error("build aborted")]
    Aborted,

    // Worker errors
    #[error("no workers satisfy the container spec")]
    NoCompatibleWorkers,

    #[error("unsupported resource type: {0}")]
    UnsupportedResourceType(String),

    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    #[error("worker call failed: {0}")]
    Worker(String),

    // Resource script errors
    #[error("resource script exited {status}: {stderr}")]
    ScriptFailed { status: i32, stderr: String },

    // Build errors
    #[error("input {input} refers to a disabled version")]
    DisabledVersion { input: String },

    #[error("missing task config for step {0}")]
    MissingTaskConfig(String),

    #[error("unknown artifact source: {0}")]
    UnknownArtifactSource(String),

    // Infrastructure errors
    #[error("database error: {0}")]
    Database(String),

    #[error("notification bus error: {0}")]
    Bus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
