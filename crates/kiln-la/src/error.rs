//! Linear-solve error kinds.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinearSolveError {
    #[error("krylov solver did not converge after {iters} iterations (residual {residual:.3e})")]
    Unconverged { iters: usize, residual: f64 },

    #[error("preconditioner setup failed: {0}")]
    PreconditionerSetup(String),

    #[error("preconditioner cascade exhausted after {attempts} attempts (best residual {residual:.3e})")]
    CascadeExhausted { attempts: usize, residual: f64 },

    #[error("zero pivot during ILU factorization at row {0}")]
    ZeroPivot(usize),

    #[error("entry ({row}, {col}) not present in the matrix graph")]
    GraphMismatch { row: u64, col: u64 },

    #[error("index {0} not present in map")]
    NotInMap(u64),

    #[error("map mismatch: {0}")]
    MapMismatch(String),
}
