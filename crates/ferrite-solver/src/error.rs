//! Error types for ferrite-solver.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("singular matrix")]
    SingularMatrix,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("linear solver failed during {stage}: {reason}")]
    LinearSolve { stage: String, reason: String },

    #[error("DC operating point failed: Newton status {status}")]
    DcOpFailed { status: i32 },

    #[error("time step too small at t = {time:.6e}: h = {step:.3e} below minimum {min:.3e}")]
    TimeStepTooSmall { time: f64, step: f64, min: f64 },

    #[error("{count} successive step failures at t = {time:.6e}")]
    TooManyFailures { count: usize, time: f64 },

    #[error("invalid port list: {0}")]
    InvalidPortList(String),

    #[error("unsupported frequency sweep type '{0}' (expected LIN, DEC or OCT)")]
    UnsupportedSweep(String),

    #[error("sparsification is incompatible with basis scale type {0}")]
    IncompatibleScaling(u8),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid analysis state: {0}")]
    InvalidState(String),

    #[error("analysis context is missing its {0}")]
    MissingCollaborator(&'static str),

    #[error("device error: {0}")]
    Device(#[from] ferrite_devices::Error),

    #[error("core error: {0}")]
    Core(#[from] ferrite_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
