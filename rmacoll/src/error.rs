use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, RmaCollError>;

/// Integer codes shared with the surrounding runtime.
pub mod codes {
    pub const OK: i32 = 0;
    pub const OUT_OF_RESOURCES: i32 = 1;
    pub const BAD_SCHEDULE: i32 = 2;
    pub const DATATYPE_NOT_SUPPORTED: i32 = 4;
    pub const NOT_IMPLEMENTED: i32 = 6;
    pub const INVALID_PARAM: i32 = 7;
    /// Generic failure for errors that carry no transport code of their own.
    pub const ERROR: i32 = -1;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RmaCollError {
    #[error("out of resources: {0}")]
    ResourceExhausted(String),

    #[error("schedule corrupt at byte {offset}: {reason}")]
    ScheduleCorrupt { offset: usize, reason: String },

    #[error("{operation} on rank {rank} failed (code {code}): {reason}")]
    OperationFailed {
        operation: &'static str,
        rank: Rank,
        code: i32,
        reason: String,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("schedule already committed")]
    ScheduleCommitted,

    #[error("request is already active")]
    RequestActive,

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("window error: {0}")]
    Window(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl RmaCollError {
    /// Create an `OperationFailed` error.
    pub fn operation_failed(
        operation: &'static str,
        rank: Rank,
        code: i32,
        reason: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation,
            rank,
            code,
            reason: reason.into(),
        }
    }

    /// Create a `ScheduleCorrupt` error at a byte offset.
    pub fn corrupt(offset: usize, reason: impl Into<String>) -> Self {
        Self::ScheduleCorrupt {
            offset,
            reason: reason.into(),
        }
    }

    /// Create an `InvalidParameter` error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// The integer code the runtime's wait/test primitives report.
    pub fn code(&self) -> i32 {
        match self {
            Self::ResourceExhausted(_) => codes::OUT_OF_RESOURCES,
            Self::ScheduleCorrupt { .. } => codes::BAD_SCHEDULE,
            Self::OperationFailed { code, .. } => *code,
            Self::InvalidParameter(_)
            | Self::ScheduleCommitted
            | Self::RequestActive
            | Self::BufferSizeMismatch { .. }
            | Self::InvalidRank { .. } => codes::INVALID_PARAM,
            Self::UnsupportedDType { .. } => codes::DATATYPE_NOT_SUPPORTED,
            Self::Window(_) | Self::LockPoisoned(_) => codes::ERROR,
        }
    }
}
