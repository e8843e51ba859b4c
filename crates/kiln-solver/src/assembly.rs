//! Assembly manager: builds the per-block machinery from the settings tree
//! and traverses cells to fill the global residual, Jacobian, and
//! sensitivity blocks.
//!
//! Per Newton step the order is strict: residual/Jacobian assembly into the
//! overlapped containers, additive export to the owned containers, then
//! strong-Dirichlet row enforcement on the owned side.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_la::{CombineMode, CrsGraph, DistMatrix, DistVector, Map};
use kiln_model::{ConfigError, Mesh, SettingValue, Settings, SideKind};

use crate::cells::{BoundaryCell, Cell, GatherKind, SeedMode};
use crate::dofs::{BcSpec, DirichletBc, DofManager};
use crate::error::{AssemblyError, SolveError};
use crate::functions::{FunctionManager, Location};
use crate::multiscale::MultiscaleManager;
use crate::params::ParameterManager;
use crate::physics::{create_physics, PhysicsModule};
use crate::workset::Workset;

/// Flags controlling one assembly traversal.
#[derive(Debug, Clone)]
pub struct AssembleOptions {
    /// Skip Jacobian extraction (residual-only seeded passes).
    pub residual_only: bool,
    /// Seed the active scalar parameters.
    pub seed_params: bool,
    /// Seed the discretized-parameter dofs.
    pub seed_param_dofs: bool,
    pub is_adjoint: bool,
    /// Mass-matrix pass: seed u_dot with unit slots instead of alpha.
    pub mass_only: bool,
    pub time: f64,
    pub deltat: f64,
    pub alpha: f64,
    pub is_final_time: bool,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            residual_only: false,
            seed_params: false,
            seed_param_dofs: false,
            is_adjoint: false,
            mass_only: false,
            time: 0.0,
            deltat: 1.0,
            alpha: 0.0,
            is_final_time: false,
        }
    }
}

/// Extraction targets of one traversal; any subset may be requested.
#[derive(Default)]
pub struct AssembleTargets<'a> {
    pub res: Option<&'a mut DistVector>,
    pub mat: Option<&'a mut DistMatrix>,
    pub param_sens: Option<&'a mut [DistVector]>,
    pub param_jac: Option<&'a mut DistMatrix>,
}

/// Overlapped state vectors the gathers read from.
#[derive(Debug, Clone)]
pub struct SolutionState {
    pub u: DistVector,
    pub u_dot: DistVector,
    pub phi: DistVector,
    pub phi_dot: DistVector,
    pub adj_prev: DistVector,
    /// Mortar trace; defaults to a copy of u on interface sides.
    pub aux: DistVector,
    pub param: Option<DistVector>,
}

impl SolutionState {
    pub fn new(overlapped: Arc<Map>, param_overlapped: Option<Arc<Map>>) -> Self {
        Self {
            u: DistVector::new(overlapped.clone()),
            u_dot: DistVector::new(overlapped.clone()),
            phi: DistVector::new(overlapped.clone()),
            phi_dot: DistVector::new(overlapped.clone()),
            adj_prev: DistVector::new(overlapped.clone()),
            aux: DistVector::new(overlapped),
            param: param_overlapped.map(DistVector::new),
        }
    }
}

pub struct AssemblyManager {
    pub mesh: Mesh,
    pub dofs: DofManager,
    pub physics: Vec<Vec<Box<dyn PhysicsModule>>>,
    pub fms: Vec<FunctionManager>,
    pub worksets: Vec<Workset>,
    pub cells: Vec<Vec<Cell>>,
    pub bcells: Vec<Vec<BoundaryCell>>,
    pub params: ParameterManager,
    pub dirichlet: Vec<DirichletBc>,
    pub multiscale: Option<MultiscaleManager>,
    pub form_param: f64,
    pub use_strong_dbcs: bool,
    pub measurements_as_dbcs: bool,
}

impl AssemblyManager {
    /// Build the full per-block machinery from the settings tree.
    pub fn new(mesh: Mesh, settings: &Settings) -> Result<Self, SolveError> {
        let physics_settings = settings.require_sublist("Physics")?;
        let solver_settings = settings.sublist("Solver");
        let form_param = physics_settings.get_real("form_param", 1.0);

        let module_names: Vec<String> = physics_settings
            .get_str_list("modules")
            .map(|l| l.to_vec())
            .unwrap_or_else(|| vec!["thermal".to_string()]);

        // Instantiate modules and collect variable declarations per block.
        let mut physics: Vec<Vec<Box<dyn PhysicsModule>>> = Vec::new();
        let mut block_vars = Vec::new();
        for _ in &mesh.blocks {
            let mut mods = Vec::new();
            let mut vars: Vec<crate::dofs::Variable> = Vec::new();
            for name in &module_names {
                let module = create_physics(name, mesh.dim, physics_settings)?;
                for v in module.variables() {
                    if !vars.iter().any(|existing| existing.name == v.name) {
                        vars.push(v);
                    }
                }
                mods.push(module);
            }
            physics.push(mods);
            block_vars.push(vars);
        }

        let params = ParameterManager::from_settings(settings.sublist("Parameters"), &mesh)
            .map_err(SolveError::Assembly)?;
        let dofs = DofManager::build(&mesh, &block_vars).map_err(SolveError::Assembly)?;

        // Let the modules record their variable indices.
        let var_names_per_block: Vec<Vec<String>> = block_vars
            .iter()
            .map(|vars| vars.iter().map(|v| v.name.clone()).collect())
            .collect();
        for (b, mods) in physics.iter_mut().enumerate() {
            for module in mods.iter_mut() {
                module
                    .set_vars(&var_names_per_block[b])
                    .map_err(SolveError::Assembly)?;
            }
        }

        // Function managers: user coefficients plus boundary-value entries.
        let flat_params = params.flat_layout();
        let field_names: Vec<String> = params
            .discretized
            .iter()
            .map(|d| d.name.clone())
            .collect();
        let mut fms = Vec::with_capacity(mesh.blocks.len());
        for vars in &var_names_per_block {
            let mut fm = FunctionManager::new(vars.clone(), flat_params.clone(), field_names.clone());
            if let Some(functions) = settings.sublist("Functions") {
                for (name, value) in functions.iter() {
                    if let SettingValue::Str(expr) = value {
                        fm.register(name, expr, Location::Ip)?;
                        fm.register(name, expr, Location::SideIp)?;
                    }
                }
            }
            fms.push(fm);
        }

        let (use_strong_dbcs, measurements_as_dbcs) = match solver_settings {
            Some(s) => (
                s.get_bool("use strong DBCs", true),
                s.get_bool("Use Measurements as DBCs", false),
            ),
            None => (true, false),
        };

        // Boundary conditions: Physics -> "Boundary Conditions" -> var -> sideset.
        let mut bc_specs: Vec<BcSpec> = Vec::new();
        if let Some(bcs) = physics_settings.sublist("Boundary Conditions") {
            for (var, entry) in bcs.iter() {
                let SettingValue::Sublist(per_var) = entry else {
                    continue;
                };
                for (sideset, bc) in per_var.iter() {
                    let SettingValue::Sublist(bc) = bc else {
                        continue;
                    };
                    let kind = match bc.get_str("type", "strong Dirichlet") {
                        "weak Dirichlet" => SideKind::WeakDirichlet,
                        "Neumann" => SideKind::Neumann,
                        "interface" => SideKind::Interface,
                        _ => SideKind::StrongDirichlet,
                    };
                    match bc.require_str("value") {
                        Ok(expr) => {
                            let fname = format!("{var} {sideset}");
                            for fm in fms.iter_mut() {
                                fm.register(&fname, expr, Location::SideIp)?;
                                fm.register(&fname, expr, Location::Ip)?;
                            }
                        }
                        Err(_) => {
                            // Interface sides take their data from the mortar
                            // trace; measurement-driven Dirichlet values come
                            // from nodal data. Everything else needs a value.
                            let value_required = match kind {
                                SideKind::Interface => false,
                                SideKind::StrongDirichlet => !measurements_as_dbcs,
                                _ => true,
                            };
                            if value_required {
                                return Err(SolveError::Config(ConfigError::MissingSetting(
                                    format!(
                                        "Physics/Boundary Conditions/{var}/{sideset}/value"
                                    ),
                                )));
                            }
                        }
                    }
                    bc_specs.push(BcSpec {
                        var: var.to_string(),
                        sideset: sideset.to_string(),
                        kind,
                    });
                }
            }
        }
        let dirichlet = dofs.set_bc_data(&mesh, &bc_specs)?;

        // Worksets, one per block.
        let mut worksets = Vec::with_capacity(mesh.blocks.len());
        for (b, vars) in var_names_per_block.iter().enumerate() {
            let mut ws = Workset::new(
                b,
                vars.clone(),
                dofs.blocks[b].offsets.clone(),
                dofs.blocks[b].num_dofs_per_elem,
            );
            ws.form_param = form_param;
            if params.discretized.is_some() {
                ws.param_fields = vec![Vec::new()];
            }
            worksets.push(ws);
        }

        // Multiscale manager (before cells, so cells can carry subgrid ids).
        let multiscale = match settings.sublist("Multiscale") {
            Some(ms) => Some(MultiscaleManager::new(&mesh, ms, settings)?),
            None => None,
        };

        // Volume cells, batched; multiscale blocks use one element per cell.
        let workset_size = solver_settings
            .map(|s| s.get_int("workset size", 100) as usize)
            .unwrap_or(100)
            .max(1);
        let num_active = params.num_active();
        let param_dofs_per_elem = |b: usize| -> usize {
            params
                .discretized
                .as_ref()
                .map(|d| d.dofs.blocks[b].num_dofs_per_elem)
                .unwrap_or(0)
        };
        let offsets = mesh.block_offsets();
        let mut cells = Vec::with_capacity(mesh.blocks.len());
        for b in 0..mesh.blocks.len() {
            let is_ms = multiscale
                .as_ref()
                .map(|m| m.covers_block(b))
                .unwrap_or(false);
            let chunk = if is_ms { 1 } else { workset_size };
            let extra = num_active + param_dofs_per_elem(b);
            let ne = mesh.blocks[b].num_elements();
            let mut block_cells = Vec::new();
            let mut start = 0;
            while start < ne {
                let end = (start + chunk).min(ne);
                let mut cell = Cell::new(
                    b,
                    (start..end).collect(),
                    &mesh,
                    &dofs.blocks[b],
                    &dofs.overlapped,
                    offsets[b],
                    params.discretized.as_ref(),
                    extra,
                )
                .map_err(SolveError::Assembly)?;
                if is_ms {
                    cell.subgrid = multiscale
                        .as_ref()
                        .and_then(|m| m.subgrid_for(b, start));
                }
                block_cells.push(cell);
                start = end;
            }
            cells.push(block_cells);
        }

        // Boundary cells grouped by (block, side set).
        let kind_of: HashMap<(String, String), SideKind> = bc_specs
            .iter()
            .map(|s| ((s.var.clone(), s.sideset.clone()), s.kind))
            .collect();
        let mut bcells: Vec<Vec<BoundaryCell>> = (0..mesh.blocks.len()).map(|_| Vec::new()).collect();
        for (sid, sideset) in mesh.side_sets.iter().enumerate() {
            let mut per_block: HashMap<usize, Vec<(usize, usize)>> = HashMap::new();
            for &(b, e, s) in &sideset.sides {
                per_block.entry(b).or_default().push((e, s));
            }
            for (b, entries) in per_block {
                let vars = &var_names_per_block[b];
                let mut side_info = Vec::with_capacity(entries.len() * vars.len());
                let mut any = false;
                for _ in &entries {
                    for var in vars {
                        let kind = kind_of
                            .get(&(var.clone(), sideset.name.clone()))
                            .copied()
                            .unwrap_or(SideKind::None);
                        // Strong Dirichlet is enforced on rows, not by side
                        // integration, so it does not require a boundary cell.
                        if kind != SideKind::None && kind != SideKind::StrongDirichlet {
                            any = true;
                        }
                        let neighbor = if kind == SideKind::Interface { -1 } else { 0 };
                        side_info.push([kind as i32, sid as i32, neighbor, 0]);
                    }
                }
                if !any {
                    continue;
                }
                bcells[b].push(BoundaryCell::new(
                    b,
                    sid,
                    sideset.name.clone(),
                    entries,
                    &mesh,
                    &dofs.blocks[b],
                    &dofs.overlapped,
                    side_info,
                    params.discretized.as_ref(),
                )?);
            }
        }

        Ok(Self {
            mesh,
            dofs,
            physics,
            fms,
            worksets,
            cells,
            bcells,
            params,
            dirichlet,
            multiscale,
            form_param,
            use_strong_dbcs,
            measurements_as_dbcs,
        })
    }

    pub fn overlapped_map(&self) -> Arc<Map> {
        self.dofs.overlapped.clone()
    }

    pub fn owned_map(&self) -> Arc<Map> {
        self.dofs.owned.clone()
    }

    /// Graph of the rectangular dR/dp block (dof rows, parameter columns).
    pub fn param_jacobian_graph(&self) -> Option<Arc<CrsGraph>> {
        self.params.discretized.as_ref()?;
        let mut cols: Vec<Vec<u64>> = vec![Vec::new(); self.dofs.overlapped.num_local()];
        for block_cells in &self.cells {
            for cell in block_cells {
                let Some(pt) = &cell.params else { continue };
                for (e, gids) in cell.gids.iter().enumerate() {
                    for &r in gids {
                        let lid = self.dofs.overlapped.lid(r).unwrap();
                        cols[lid].extend_from_slice(&pt.gids[e]);
                    }
                }
            }
        }
        Some(Arc::new(CrsGraph::new(self.dofs.overlapped.clone(), cols)))
    }

    fn configure_workset(&mut self, b: usize, opts: &AssembleOptions) {
        let num_active = self.params.num_active();
        let ws = &mut self.worksets[b];
        ws.time = opts.time;
        ws.deltat = opts.deltat;
        ws.alpha = opts.alpha;
        ws.is_adjoint = opts.is_adjoint;
        ws.is_final_time = opts.is_final_time;
        ws.only_residual = opts.residual_only;
        ws.seed_params = opts.seed_params;
        ws.seed_param_dofs = opts.seed_param_dofs;
        ws.param_seed_base = ws.num_dofs;
        ws.param_dof_seed_base = ws.num_dofs + num_active;
        ws.scalar_params = self.params.sacadoize(opts.seed_params, ws.num_dofs);
    }

    fn gather_all(
        cell_gather: &mut dyn FnMut(GatherKind, &DistVector, SeedMode),
        state: &SolutionState,
        opts: &AssembleOptions,
    ) {
        if opts.mass_only {
            cell_gather(GatherKind::Soln, &state.u, SeedMode::None);
            cell_gather(GatherKind::SolnDot, &state.u_dot, SeedMode::Dofs);
        } else {
            cell_gather(GatherKind::Soln, &state.u, SeedMode::Dofs);
            cell_gather(GatherKind::SolnDot, &state.u_dot, SeedMode::DofsScaled(opts.alpha));
        }
        if opts.is_adjoint {
            cell_gather(GatherKind::Adjoint, &state.phi, SeedMode::None);
            cell_gather(GatherKind::AdjointDot, &state.phi_dot, SeedMode::None);
            cell_gather(GatherKind::AdjointPrev, &state.adj_prev, SeedMode::None);
        }
    }

    /// One traversal of all cells, filling the requested targets.
    pub fn assemble(
        &mut self,
        state: &SolutionState,
        targets: &mut AssembleTargets<'_>,
        opts: &AssembleOptions,
    ) -> Result<(), AssemblyError> {
        if let Some(res) = targets.res.as_deref_mut() {
            res.put_scalar(0.0);
        }
        if let Some(mat) = targets.mat.as_deref_mut() {
            mat.put_scalar(0.0);
        }
        if let Some(sens) = targets.param_sens.as_deref_mut() {
            for v in sens.iter_mut() {
                v.put_scalar(0.0);
            }
        }
        if let Some(pjac) = targets.param_jac.as_deref_mut() {
            pjac.put_scalar(0.0);
        }

        let param_seed = if opts.seed_param_dofs {
            SeedMode::ParamDofs
        } else {
            SeedMode::None
        };

        for b in 0..self.mesh.blocks.len() {
            self.configure_workset(b, opts);
            // Split borrows: the workset and cells live in different fields.
            let ws = &mut self.worksets[b];
            let fm = &self.fms[b];
            let mods = &self.physics[b];

            for cell in &self.cells[b] {
                cell.update_workset(ws);
                Self::gather_all(
                    &mut |kind, vec, seed| cell.gather(ws, kind, vec, seed),
                    state,
                    opts,
                );
                if let (Some(param_state), Some(_)) = (&state.param, &cell.params) {
                    cell.gather(ws, GatherKind::Param, param_state, param_seed);
                }

                if let (Some(ms), Some(sg)) = (self.multiscale.as_mut(), cell.subgrid) {
                    ms.macro_contribution(sg, cell, ws, fm, mods, state, opts)?;
                } else {
                    for module in mods {
                        module.volume_residual(fm, ws)?;
                    }
                }

                if let Some(res) = targets.res.as_deref_mut() {
                    cell.scatter_residual(ws, res)?;
                }
                if !opts.residual_only {
                    if let Some(mat) = targets.mat.as_deref_mut() {
                        cell.scatter_jacobian(ws, mat)?;
                    }
                }
                if let Some(sens) = targets.param_sens.as_deref_mut() {
                    cell.scatter_param_sens(ws, sens)?;
                }
                if let Some(pjac) = targets.param_jac.as_deref_mut() {
                    cell.scatter_param_jacobian(ws, pjac)?;
                }
            }

            for bcell in &self.bcells[b] {
                bcell.update_workset(ws);
                Self::gather_all(
                    &mut |kind, vec, seed| bcell.gather(ws, kind, vec, seed),
                    state,
                    opts,
                );
                bcell.gather(ws, GatherKind::Aux, &state.aux, SeedMode::Dofs);
                if let (Some(param_state), Some(_)) = (&state.param, &bcell.params) {
                    bcell.gather(ws, GatherKind::Param, param_state, param_seed);
                }

                for module in mods {
                    module.boundary_residual(fm, ws)?;
                }

                if let Some(res) = targets.res.as_deref_mut() {
                    bcell.scatter_residual(ws, res)?;
                }
                if !opts.residual_only {
                    if let Some(mat) = targets.mat.as_deref_mut() {
                        bcell.scatter_jacobian(ws, mat)?;
                    }
                }
                if let Some(sens) = targets.param_sens.as_deref_mut() {
                    bcell.scatter_param_sens(ws, sens)?;
                }
                if let Some(pjac) = targets.param_jac.as_deref_mut() {
                    bcell.scatter_param_jacobian(ws, pjac)?;
                }
            }
        }
        Ok(())
    }

    /// Enforce strong Dirichlet rows on the owned residual/matrix and
    /// impose the prescribed values on the solution vector.
    pub fn apply_dirichlet(
        &self,
        time: f64,
        mut res: Option<&mut DistVector>,
        mut mat: Option<&mut DistMatrix>,
        mut u: Option<&mut DistVector>,
    ) -> Result<(), AssemblyError> {
        if !self.use_strong_dbcs {
            return Ok(());
        }
        let scalar_flat: Vec<f64> = {
            let ad = self.params.sacadoize(false, 0);
            ad.iter().map(|v| v.val()).collect()
        };
        let measurements = if self.measurements_as_dbcs {
            self.mesh.nodal_data.get("measurement")
        } else {
            None
        };

        for bc in &self.dirichlet {
            let value = if let Some(data) = measurements {
                data[bc.node]
            } else {
                let expr = self.fms[0].get(&bc.value_fn, Location::Ip)?;
                expr.eval_at_points(&[self.mesh.coords[bc.node]], time, &scalar_flat)?[0]
            };
            if let Some(res) = res.as_deref_mut() {
                res.replace_global(bc.gid, 0.0)?;
            }
            if let Some(mat) = mat.as_deref_mut() {
                mat.set_row_identity(bc.gid)?;
            }
            if let Some(u) = u.as_deref_mut() {
                u.replace_global(bc.gid, value)?;
            }
        }
        Ok(())
    }

    /// Export the overlapped residual into the owned container with an
    /// additive, deterministic combine.
    pub fn export_residual(&self, overlapped: &DistVector, owned: &mut DistVector) {
        owned.put_scalar(0.0);
        self.dofs.export.apply(overlapped, owned, CombineMode::Add);
    }

    pub fn export_matrix(
        &self,
        overlapped: &DistMatrix,
        owned: &mut DistMatrix,
    ) -> Result<(), AssemblyError> {
        owned.put_scalar(0.0);
        self.dofs
            .export
            .apply_matrix(overlapped, owned, CombineMode::Add)?;
        Ok(())
    }

    /// Check that every coefficient the active physics modules will ask for
    /// has been registered, so configuration problems surface at startup
    /// instead of mid-assembly.
    pub fn validate_functions(&self) -> Result<(), ConfigError> {
        for (b, mods) in self.physics.iter().enumerate() {
            for module in mods {
                for name in module.required_functions() {
                    if !self.fms[b].is_registered(name, Location::Ip)
                        || !self.fms[b].is_registered(name, Location::SideIp)
                    {
                        return Err(ConfigError::MissingSetting(format!("Functions/{name}")));
                    }
                }
            }
        }
        Ok(())
    }
}
