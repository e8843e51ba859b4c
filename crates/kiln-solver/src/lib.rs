//! Multi-physics finite-element assembly, nonlinear solve, adjoint
//! sensitivities, and multiscale (mortar) coupling.
//!
//! The pipeline: physics modules declare variables, the dof manager builds
//! the numbering, the discretization builds reference tables, cells are
//! instantiated per block and bound to a workset, the assembler traverses
//! cells on each Newton step invoking the physics to fill AD residuals, and
//! the solver drives forward, adjoint, and sensitivity passes over the
//! shared linear-algebra layer.

pub mod assembly;
pub mod cells;
pub mod disc;
pub mod dofs;
pub mod error;
pub mod functions;
pub mod multiscale;
pub mod params;
pub mod physics;
pub mod postprocess;
pub mod solver;
pub mod workset;

/// Fixed derivative capacity of the AD scalar: element dofs, then active
/// scalar parameters, then discretized-parameter dofs must fit.
pub const MAX_DERIVS: usize = 64;

/// The AD scalar used throughout assembly.
pub type EvalScalar = kiln_ad::Dual<MAX_DERIVS>;

pub use assembly::{AssembleOptions, AssembleTargets, AssemblyManager, SolutionState};
pub use cells::{BoundaryCell, Cell, GatherKind, SeedMode};
pub use dofs::{BcSpec, DirichletBc, DofManager, Variable};
pub use error::{AssemblyError, SolveError, SubgridError};
pub use functions::{FunctionManager, Location};
pub use multiscale::{MultiscaleManager, SubgridModel};
pub use params::{ParamUsage, ParameterManager};
pub use physics::{create_physics, PhysicsModule};
pub use postprocess::{Postprocessor, ResponseType};
pub use solver::{GradientResult, NewtonReport, SolverManager, SolverMode};
pub use workset::Workset;
