//! Error types for ferrite-core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate unknown: {0}")]
    DuplicateUnknown(String),

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("topology already finalized")]
    TopologyFinalized,

    #[error("topology not finalized")]
    TopologyNotFinalized,

    #[error("jacobian entry ({row}, {col}) is outside the {size}x{size} system")]
    EntryOutOfBounds { row: usize, col: usize, size: usize },

    #[error("jacobian entry ({row}, {col}) was never registered")]
    UnregisteredEntry { row: usize, col: usize },

    #[error("restart buffer underflow: wanted {wanted} bytes, {remaining} remaining")]
    BufferUnderflow { wanted: usize, remaining: usize },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
