//! Configuration and consistency error kinds.
//!
//! Both are fatal at startup: a missing setting or an inconsistent model
//! cannot be recovered from inside the solve.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    MissingSetting(String),

    #[error("setting {name} has the wrong type (expected {expected})")]
    WrongType { name: String, expected: &'static str },

    #[error("unknown physics module: {0}")]
    UnknownPhysics(String),

    #[error("cannot parse expression {name}: {reason}")]
    BadExpression { name: String, reason: String },

    #[error("unsupported spatial dimension: {0}")]
    UnsupportedDimension(usize),
}

#[derive(Error, Debug)]
pub enum ConsistencyError {
    #[error("variable {0} declared but not used by any physics module")]
    UnusedVariable(String),

    #[error("boundary condition on unknown side set: {0}")]
    UnknownSideSet(String),

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("parameter {name}: bounds length {bounds} does not match value length {values}")]
    BoundsMismatch {
        name: String,
        bounds: usize,
        values: usize,
    },

    #[error("block {0} not found in mesh")]
    UnknownBlock(String),
}
