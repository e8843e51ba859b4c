//! Distributed linear-algebra facade.
//!
//! Vectors and matrices live over index maps: an *owned* map partitions the
//! global index space disjointly across ranks, an *overlapped* map adds the
//! ghost indices a rank assembles into. Export plans move data between the
//! two with explicit combine modes and a deterministic (ascending-GID)
//! additive order. On top sit a restarted GMRES solver and two
//! preconditioners (drop-tolerance ILU and smoothed-aggregation multigrid)
//! with the re-setup cascade the nonlinear solver relies on.

pub mod csr;
pub mod error;
pub mod export;
pub mod krylov;
pub mod map;
pub mod matrix;
pub mod precond;
pub mod vector;

pub use error::LinearSolveError;
pub use export::{CombineMode, Export};
pub use krylov::{gmres, solve_with_cascade, GmresConfig, LinearSolverConfig, Precond, SolveInfo};
pub use map::{Comm, Map};
pub use matrix::{CrsGraph, DistMatrix};
pub use precond::{AmgConfig, Identity, Ilu, Preconditioner, SmootherKind, SmoothedAggregation};
pub use vector::DistVector;
