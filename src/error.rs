//! Error kinds for the block-pipeline engine.
//!
//! Internal plumbing and the CLI binary use `anyhow::Result` with
//! `.context(...)` throughout, the same as the rest of this crate. This
//! module exists for the boundary where callers need to match on *kind*
//! (worker supervision, retry-never policy, user-visible diagnostics).

use thiserror::Error;

/// Result alias for fallible operations that need a matchable error kind.
pub type Result<T> = std::result::Result<T, RiosError>;

/// A worker-side failure captured at the worker boundary and shipped back
/// to the driver over the exception queue (or, for thread workers, directly
/// through a shared channel).
#[derive(Debug, Clone)]
pub struct WorkerErrorRecord {
    pub exception_type: String,
    pub message: String,
    pub traceback: String,
    pub worker_kind: WorkerKind,
    pub worker_id: usize,
}

impl std::fmt::Display for WorkerErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} worker {} raised {}: {}\n{}",
            self.worker_kind, self.worker_id, self.exception_type, self.message, self.traceback
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WorkerKind {
    Read,
    Compute,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Read => write!(f, "read"),
            WorkerKind::Compute => write!(f, "compute"),
        }
    }
}

/// Every error kind named in the specification's error-handling design.
#[derive(Debug, Error)]
pub enum RiosError {
    #[error("failed to open raster '{path}': {reason}")]
    FileOpen { path: String, reason: String },

    #[error("invalid parameter '{name}': {reason}")]
    Parameter { name: String, reason: String },

    #[error("grid mismatch: {0}")]
    GridMismatch(String),

    #[error("resample needed: inputs are not comparable/aligned and no reference grid was supplied")]
    ResampleNeeded,

    #[error("empty intersection: the requested footprint produced zero-area common region")]
    EmptyIntersection,

    #[error("output '{name}' was not produced by the user function (key mismatch)")]
    KeyMismatch { name: String },

    #[error("list length mismatch for '{name}': expected {expected}, got {actual}")]
    ListLengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("array shape error for output '{name}': {reason}")]
    ArrayShape { name: String, reason: String },

    #[error("unsupported element type for '{name}': {type_name}")]
    TypeConversion { name: String, type_name: String },

    #[error("RAT column '{column}' has unsupported type: {reason}")]
    RatType { column: String, reason: String },

    #[error("RAT column '{column}' error: {reason}")]
    RatColumn { column: String, reason: String },

    #[error("RAT block length mismatch: expected {expected} rows, got {actual}")]
    RatBlockLength { expected: usize, actual: usize },

    #[error("RAT mismatch: {0}")]
    RatMismatch(String),

    #[error("worker exception: {0}")]
    WorkerException(#[from] Box<WorkerErrorRecord>),

    #[error("timeout waiting on {what} after {seconds:.1}s; consider raising `{config_key}`")]
    Timeout {
        what: String,
        seconds: f64,
        config_key: String,
    },

    #[error("unavailable: {feature} requires an optional dependency that is not present")]
    Unavailable { feature: String },

    #[error("single-pass {action} was requested but is incompatible with the driver/datatype: {reason}")]
    SinglePassActions { action: String, reason: String },

    #[error("run cancelled: {0}")]
    ProcessCancelled(String),

    #[error("batch queue error: {0}")]
    BatchQueue(String),

    #[error("AWS ECS task-run failure: {0}")]
    Ecs(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<WorkerErrorRecord> for RiosError {
    fn from(record: WorkerErrorRecord) -> Self {
        RiosError::WorkerException(Box::new(record))
    }
}
