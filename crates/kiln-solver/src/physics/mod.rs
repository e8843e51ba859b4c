//! Physics modules: residual/flux contributors obeying a uniform contract.
//!
//! A module declares its variables, records their workset indices in
//! `set_vars`, and fills the workset's AD residual in the volume, boundary,
//! and interface passes. Modules never touch global state; everything flows
//! through the workset and the function manager.
//!
//! New physics are added by extension: implement [`PhysicsModule`] and add a
//! factory entry to [`create_physics`].

mod elasticity;
mod thermal;

pub use elasticity::LinearElasticity;
pub use thermal::ThermalDiffusion;

use kiln_model::{ConfigError, Settings};

use crate::dofs::Variable;
use crate::error::AssemblyError;
use crate::functions::FunctionManager;
use crate::workset::Workset;

pub trait PhysicsModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// The variables this module contributes to, with basis orders.
    fn variables(&self) -> Vec<Variable>;

    /// Coefficient functions this module evaluates unconditionally; a
    /// missing registration is a configuration error at startup.
    fn required_functions(&self) -> Vec<&'static str>;

    /// Record the workset index of each used variable; detect optional
    /// couplings (e.g. a velocity field enabling convective transport).
    fn set_vars(&mut self, vars: &[String]) -> Result<(), AssemblyError>;

    /// Accumulate the volume weak-form contribution into `ws.res`.
    fn volume_residual(
        &self,
        fm: &FunctionManager,
        ws: &mut Workset,
    ) -> Result<(), AssemblyError>;

    /// Accumulate boundary contributions according to the side tags: weak
    /// Dirichlet (Nitsche), Neumann, and interface sides (which forward to
    /// [`PhysicsModule::compute_flux`]).
    fn boundary_residual(
        &self,
        fm: &FunctionManager,
        ws: &mut Workset,
    ) -> Result<(), AssemblyError>;

    /// Produce the outward numerical flux on interface sides into
    /// `ws.flux`, using the auxiliary variable as the mortar trace.
    fn compute_flux(&self, fm: &FunctionManager, ws: &mut Workset) -> Result<(), AssemblyError>;
}

type Factory = fn(usize, &Settings) -> Box<dyn PhysicsModule>;

/// Registry of module factories keyed by name. One direct call per block;
/// no dispatch cost inside the element loops.
const REGISTRY: &[(&str, Factory)] = &[
    ("thermal", |dim, settings| {
        Box::new(ThermalDiffusion::new(dim, settings))
    }),
    ("elasticity", |dim, settings| {
        Box::new(LinearElasticity::new(dim, settings))
    }),
];

/// Instantiate a physics module by name.
pub fn create_physics(
    name: &str,
    dim: usize,
    settings: &Settings,
) -> Result<Box<dyn PhysicsModule>, ConfigError> {
    REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, factory)| factory(dim, settings))
        .ok_or_else(|| ConfigError::UnknownPhysics(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_thermal_and_elasticity() {
        let settings = Settings::new();
        let thermal = create_physics("thermal", 2, &settings).unwrap();
        assert_eq!(thermal.name(), "thermal");
        assert_eq!(thermal.variables().len(), 1);
        assert!(thermal.required_functions().contains(&"thermal diffusion"));

        let elastic = create_physics("elasticity", 3, &settings).unwrap();
        assert_eq!(elastic.variables().len(), 3);
        assert!(elastic.required_functions().contains(&"mu"));
    }

    #[test]
    fn unknown_physics_is_a_config_error() {
        let settings = Settings::new();
        assert!(matches!(
            create_physics("magnetohydrodynamics", 2, &settings),
            Err(ConfigError::UnknownPhysics(_))
        ));
    }
}
