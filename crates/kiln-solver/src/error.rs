//! Assembly and solve error kinds.
//!
//! Assembly errors abort the current simulation; nonlinear non-convergence
//! is recoverable and reported back to the driver. Subgrid failures surface
//! as assembly errors at the macro level.

use thiserror::Error;

use kiln_la::LinearSolveError;
use kiln_model::{ConfigError, ConsistencyError};

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("coefficient function {name} is not registered at {location}")]
    MissingCoefficient { name: String, location: String },

    #[error(
        "derivative capacity exceeded: need {needed} slots ({dofs} dofs + {extra} parameter slots), have {capacity}"
    )]
    DerivativeCapacity {
        needed: usize,
        dofs: usize,
        extra: usize,
        capacity: usize,
    },

    #[error("unsupported spatial dimension {0}")]
    UnsupportedDimension(usize),

    #[error("variable {0} not present in workset variable list")]
    UnknownVariable(String),

    #[error("size mismatch between local and global index tables: {0}")]
    IndexMismatch(String),

    #[error("subgrid model {id}: {reason}")]
    Subgrid { id: usize, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Linear(#[from] LinearSolveError),
}

#[derive(Error, Debug)]
pub enum SolveError {
    #[error(
        "nonlinear iteration did not converge: {iters} iterations, scaled residual {residual:.3e} (tol {tol:.1e})"
    )]
    NonlinearNonConvergence {
        iters: usize,
        residual: f64,
        tol: f64,
    },

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Linear(#[from] LinearSolveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("i/o failure writing {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SubgridError {
    #[error("subgrid nonlinear solve failed: {0}")]
    Nonlinear(String),

    #[error("subgrid linear solve failed: {0}")]
    Linear(String),
}
