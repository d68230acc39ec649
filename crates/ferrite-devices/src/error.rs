//! Error types for ferrite-devices.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("core error: {0}")]
    Core(#[from] ferrite_core::Error),

    #[error("no device constructor registered for kind '{kind}' level {level}")]
    UnknownKind { kind: String, level: u32 },

    #[error("device {name}: expected {expected} nodes, got {actual}")]
    NodeCount {
        name: String,
        expected: String,
        actual: usize,
    },

    #[error("device {name}: missing parameter '{param}'")]
    MissingParameter { name: String, param: String },

    #[error("device {name} has no parameter '{param}'")]
    UnknownParameter { name: String, param: String },

    #[error("device {name}: {reason}")]
    InvalidDevice { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
