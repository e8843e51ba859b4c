//! Multiscale (mortar) coupling manager.
//!
//! Each macro element of a multiscale block embeds an independent finer
//! subgrid problem over the element's extent. The subgrid trace is slaved
//! to the macro solution through the mortar matching (the macro basis
//! evaluated at the subgrid boundary nodes), the subgrid resolves its
//! interior with its own Newton loop and cached direct factorization, and
//! the interface reaction paired through the matching is returned to the
//! macro workset. Sensitivities flow by the chain rule: the subgrid state
//! carries AD derivatives with respect to the macro trace (and active
//! parameters), supplied by one linear solve against the subgrid Jacobian.
//!
//! With a single trivial subgrid element and identical physics, the
//! returned contribution is exactly the macro element's own residual, so
//! the coupled system matches the uncoupled one to round-off.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Dyn};

use kiln_model::{CellTopology, Mesh, Settings};

use crate::assembly::{AssembleOptions, SolutionState};
use crate::cells::{build_cell_geometry, Cell};
use crate::disc::Basis;
use crate::error::{AssemblyError, SolveError, SubgridError};
use crate::functions::FunctionManager;
use crate::physics::PhysicsModule;
use crate::workset::Workset;
use crate::{EvalScalar, MAX_DERIVS};

pub struct MultiscaleManager {
    pub subgrids: Vec<SubgridModel>,
    covered_blocks: Vec<usize>,
    elem_to_subgrid: HashMap<(usize, usize), usize>,
}

impl MultiscaleManager {
    pub fn new(mesh: &Mesh, ms: &Settings, _settings: &Settings) -> Result<Self, SolveError> {
        let refine = ms.get_int("refine", 1) as usize;
        let time_steps = ms.get_int("time steps", 1) as usize;
        let block_names: Vec<String> = ms
            .get_str_list("blocks")
            .map(|l| l.to_vec())
            .unwrap_or_default();

        let mut covered_blocks = Vec::new();
        let mut subgrids = Vec::new();
        let mut elem_to_subgrid = HashMap::new();

        for name in &block_names {
            let (b, block) = mesh.block(name)?;
            covered_blocks.push(b);
            for e in 0..block.num_elements() {
                let id = subgrids.len();
                let coords: Vec<[f64; 3]> = block.connectivity[e]
                    .iter()
                    .map(|&n| mesh.coords[n])
                    .collect();
                subgrids.push(SubgridModel::new(
                    id,
                    b,
                    e,
                    block.topology,
                    coords,
                    refine.max(1),
                    time_steps.max(1),
                )?);
                elem_to_subgrid.insert((b, e), id);
            }
        }

        log::info!(
            "multiscale manager: {} subgrids over {} blocks (refine {}, {} substeps)",
            subgrids.len(),
            covered_blocks.len(),
            refine,
            time_steps
        );

        Ok(Self {
            subgrids,
            covered_blocks,
            elem_to_subgrid,
        })
    }

    pub fn covers_block(&self, b: usize) -> bool {
        self.covered_blocks.contains(&b)
    }

    pub fn subgrid_for(&self, b: usize, e: usize) -> Option<usize> {
        self.elem_to_subgrid.get(&(b, e)).copied()
    }

    /// Macro-side contribution of one multiscale element: runs the subgrid
    /// solver with the current trace and writes the mortar-paired reaction
    /// (value plus derivatives) into the macro workset residual.
    #[allow(clippy::too_many_arguments)]
    pub fn macro_contribution(
        &mut self,
        subgrid_id: usize,
        cell: &Cell,
        ws: &mut Workset,
        fm: &FunctionManager,
        mods: &[Box<dyn PhysicsModule>],
        state: &SolutionState,
        opts: &AssembleOptions,
    ) -> Result<(), AssemblyError> {
        debug_assert_eq!(cell.num_elems(), 1);
        if ws.num_vars() != 1 {
            return Err(AssemblyError::Subgrid {
                id: subgrid_id,
                reason: "multiscale blocks carry a single scalar field".to_string(),
            });
        }
        let subgrid = &mut self.subgrids[subgrid_id];

        // Package the trace: macro dof coefficients in slot order.
        let iv = 0;
        let offsets = ws.offsets[iv].clone();
        let lambda: Vec<f64> = offsets
            .iter()
            .map(|&slot| state.u.local(cell.index[0][slot]))
            .collect();

        let contribution = subgrid
            .solve(
                &lambda,
                &offsets,
                ws,
                fm,
                mods,
                opts,
                !opts.residual_only,
                opts.seed_params,
            )
            .map_err(|err| AssemblyError::Subgrid {
                id: subgrid_id,
                reason: err.to_string(),
            })?;

        for (i, r) in contribution.into_iter().enumerate() {
            let idx = ws.res_index(0, offsets[i]);
            ws.res[idx] += r;
        }
        Ok(())
    }

    /// Total cost estimate across subgrids (elements times substeps).
    pub fn cost_estimate(&self) -> usize {
        self.subgrids.iter().map(|s| s.cost_estimate).sum()
    }

    /// Max/min load imbalance factor across ranks. Migration is out of
    /// scope; this is the hook the balancer consumes.
    pub fn load_imbalance(&self, comm: &kiln_la::Comm) -> f64 {
        let local = self.cost_estimate() as f64;
        let max = comm.max_all(local);
        let min = comm.min_all(local).max(1.0);
        max / min
    }

    /// Advance the stored subgrid states past an accepted macro step.
    pub fn accept_step(&mut self) {
        for s in self.subgrids.iter_mut() {
            s.accept_step();
        }
    }

    /// Rewind subgrid states to the start of the trajectory (new transient).
    pub fn reset_history(&mut self) {
        for s in self.subgrids.iter_mut() {
            s.reset_history();
        }
    }
}

/// A single macro element's embedded fine-scale problem.
pub struct SubgridModel {
    pub id: usize,
    pub macro_block: usize,
    pub macro_elem: usize,
    pub refine: usize,
    time_steps: usize,
    sub_topo: CellTopology,
    macro_basis: Basis,
    /// Sub-node positions in the macro reference frame.
    node_ref: Vec<[f64; 3]>,
    conn: Vec<Vec<usize>>,
    boundary_nodes: Vec<usize>,
    interior_nodes: Vec<usize>,
    /// Mortar matching: macro basis values at every sub node.
    matching: Vec<Vec<f64>>,
    geom: std::sync::Arc<crate::workset::CellGeometry>,
    sub_ws: Workset,
    /// Committed state at the last accepted macro step.
    u_committed: Vec<f64>,
    /// Whether the committed state has been seeded from the first trace.
    initialized: bool,
    /// Per-macro-step solution trajectory of the fine state.
    pub trajectory: Vec<Vec<f64>>,
    factor: Option<nalgebra::LU<f64, Dyn, Dyn>>,
    have_sym_factor: bool,
    pub cost_estimate: usize,
}

impl SubgridModel {
    pub fn new(
        id: usize,
        macro_block: usize,
        macro_elem: usize,
        macro_topo: CellTopology,
        macro_coords: Vec<[f64; 3]>,
        refine: usize,
        time_steps: usize,
    ) -> Result<Self, SolveError> {
        let dim = macro_topo.dim();
        let sub_topo = match dim {
            1 => CellTopology::Line2,
            2 => CellTopology::Quad4,
            _ => CellTopology::Hex8,
        };
        let macro_basis = Basis::new(macro_topo, macro_topo.order()).map_err(SolveError::Assembly)?;

        // Structured refine^dim grid over the reference box.
        let n = refine + 1;
        let counts = [n, if dim > 1 { n } else { 1 }, if dim > 2 { n } else { 1 }];
        let mut node_ref = Vec::new();
        for iz in 0..counts[2] {
            for iy in 0..counts[1] {
                for ix in 0..counts[0] {
                    let f = |i: usize| -1.0 + 2.0 * i as f64 / refine as f64;
                    node_ref.push([
                        f(ix),
                        if dim > 1 { f(iy) } else { 0.0 },
                        if dim > 2 { f(iz) } else { 0.0 },
                    ]);
                }
            }
        }
        let node_index =
            |ix: usize, iy: usize, iz: usize| ix + counts[0] * (iy + counts[1] * iz);

        let mut conn = Vec::new();
        let ecounts = [
            refine,
            if dim > 1 { refine } else { 1 },
            if dim > 2 { refine } else { 1 },
        ];
        for ez in 0..ecounts[2] {
            for ey in 0..ecounts[1] {
                for ex in 0..ecounts[0] {
                    let mut c = Vec::new();
                    for lz in 0..=(dim > 2) as usize {
                        for ly in 0..=(dim > 1) as usize {
                            for lx in 0..=1usize {
                                c.push(node_index(ex + lx, ey + ly, ez + lz));
                            }
                        }
                    }
                    conn.push(c);
                }
            }
        }

        let mut boundary_nodes = Vec::new();
        let mut interior_nodes = Vec::new();
        for (i, p) in node_ref.iter().enumerate() {
            let on_boundary = (0..dim).any(|d| p[d].abs() >= 1.0 - 1e-12);
            if on_boundary {
                boundary_nodes.push(i);
            } else {
                interior_nodes.push(i);
            }
        }

        let num_sub = node_ref.len();
        let nb_macro = macro_basis.num_basis();
        if nb_macro > MAX_DERIVS || (sub_topo.num_nodes()) > MAX_DERIVS {
            return Err(SolveError::Assembly(AssemblyError::DerivativeCapacity {
                needed: nb_macro.max(sub_topo.num_nodes()),
                dofs: nb_macro,
                extra: 0,
                capacity: MAX_DERIVS,
            }));
        }

        // Physical coordinates through the macro isoparametric map.
        let mut node_phys = Vec::with_capacity(num_sub);
        for &p in &node_ref {
            let g = crate::disc::eval_geometry(macro_topo, &macro_coords, p)
                .map_err(SolveError::Assembly)?;
            node_phys.push(g.x);
        }
        let elem_coords: Vec<Vec<[f64; 3]>> = conn
            .iter()
            .map(|c| c.iter().map(|&i| node_phys[i]).collect())
            .collect();
        let sub_basis = Basis::new(sub_topo, 1).map_err(SolveError::Assembly)?;
        let geom = std::sync::Arc::new(
            build_cell_geometry(sub_topo, &[sub_basis], &elem_coords)
                .map_err(SolveError::Assembly)?,
        );

        let matching: Vec<Vec<f64>> = node_ref.iter().map(|&p| macro_basis.eval(p)).collect();

        let nb_sub = sub_topo.num_nodes();
        let sub_ws = Workset::new(
            usize::MAX,
            vec!["T".to_string()],
            vec![(0..nb_sub).collect()],
            nb_sub,
        );

        Ok(Self {
            id,
            macro_block,
            macro_elem,
            refine,
            time_steps,
            sub_topo,
            macro_basis,
            node_ref,
            conn,
            boundary_nodes,
            interior_nodes,
            matching,
            geom,
            sub_ws,
            u_committed: vec![0.0; num_sub],
            initialized: false,
            trajectory: Vec::new(),
            factor: None,
            have_sym_factor: false,
            cost_estimate: refine.pow(dim as u32) * time_steps,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.node_ref.len()
    }

    pub fn accept_step(&mut self) {
        if let Some(last) = self.trajectory.last() {
            self.u_committed = last.clone();
        }
    }

    pub fn reset_history(&mut self) {
        self.trajectory.clear();
        self.u_committed = vec![0.0; self.num_nodes()];
        self.initialized = false;
        self.factor = None;
        self.have_sym_factor = false;
    }

    /// Solve the fine problem for the given macro trace and return the
    /// mortar-paired reaction per macro dof (value + AD derivatives in the
    /// macro slot layout).
    #[allow(clippy::too_many_arguments)]
    pub fn solve(
        &mut self,
        lambda: &[f64],
        macro_slots: &[usize],
        macro_ws: &Workset,
        fm: &FunctionManager,
        mods: &[Box<dyn PhysicsModule>],
        opts: &AssembleOptions,
        compute_jacobian: bool,
        compute_sens: bool,
    ) -> Result<Vec<EvalScalar>, SubgridError> {
        let n = self.num_nodes();
        let nb_macro = self.macro_basis.num_basis();
        let substeps = if opts.alpha == 0.0 { 1 } else { self.time_steps };
        let sub_dt = if opts.alpha == 0.0 {
            opts.deltat
        } else {
            opts.deltat / substeps as f64
        };
        let sub_alpha = if opts.alpha == 0.0 { 0.0 } else { 1.0 / sub_dt };

        // Boundary state slaved to the trace, in AD form: derivative slots
        // follow the macro slot layout, so extraction on the macro side can
        // reuse the standard pipeline.
        let mut u_bc_ad = vec![EvalScalar::zero(); n];
        for &bnode in &self.boundary_nodes {
            let mut v = EvalScalar::zero();
            for i in 0..nb_macro {
                let l = if compute_jacobian {
                    EvalScalar::seeded(lambda[i], macro_slots[i])
                } else {
                    EvalScalar::constant(lambda[i])
                };
                v += l * self.matching[bnode][i];
            }
            u_bc_ad[bnode] = v;
        }

        // First contact: seed the committed history from the incoming
        // trace (the macro state is the initial condition at that point).
        if !self.initialized {
            self.u_committed = (0..n)
                .map(|node| {
                    (0..nb_macro)
                        .map(|i| lambda[i] * self.matching[node][i])
                        .sum()
                })
                .collect();
            self.initialized = true;
        }
        let mut u: Vec<f64> = self.u_committed.clone();
        let mut prev_ad: Vec<EvalScalar> = self
            .u_committed
            .iter()
            .map(|&v| EvalScalar::constant(v))
            .collect();

        // Scalar parameters: constants for the Newton passes, seeded copies
        // for the sensitivity propagation.
        let params_plain: Vec<EvalScalar> = macro_ws
            .scalar_params
            .iter()
            .map(|p| EvalScalar::constant(p.val()))
            .collect();
        let params_seeded = macro_ws.scalar_params.clone();

        self.trajectory.clear();
        let mut state_ad: Vec<EvalScalar> = Vec::new();
        let mut reaction_prev = prev_ad.clone();

        for step in 0..substeps {
            reaction_prev = prev_ad.clone();
            let time = opts.time - opts.deltat + sub_dt * (step + 1) as f64;

            // Impose the boundary values.
            for &bnode in &self.boundary_nodes {
                u[bnode] = u_bc_ad[bnode].val();
            }

            // Newton on the interior unknowns.
            let max_iter = 20;
            let mut converged = self.interior_nodes.is_empty();
            for _ in 0..max_iter {
                if self.interior_nodes.is_empty() {
                    break;
                }
                let (res, jac) = self.assemble_plain(
                    &u,
                    &prev_ad,
                    sub_alpha,
                    time,
                    sub_dt,
                    macro_ws,
                    fm,
                    mods,
                    &params_plain,
                )?;
                let r_int = DVector::from_iterator(
                    self.interior_nodes.len(),
                    self.interior_nodes.iter().map(|&i| res[i]),
                );
                if r_int.norm() < 1e-12 {
                    converged = true;
                    break;
                }
                if !self.have_sym_factor {
                    let j_int = self.interior_block(&jac);
                    self.factor = Some(j_int.lu());
                    self.have_sym_factor = true;
                }
                let delta = self
                    .factor
                    .as_ref()
                    .unwrap()
                    .solve(&r_int)
                    .ok_or_else(|| {
                        SubgridError::Linear("singular subgrid jacobian".to_string())
                    })?;
                for (row, &node) in self.interior_nodes.iter().enumerate() {
                    u[node] -= delta[row];
                }
                if delta.norm() < 1e-13 {
                    converged = true;
                    break;
                }
            }
            if !converged {
                return Err(SubgridError::Nonlinear(format!(
                    "substep {step} did not converge"
                )));
            }

            // Propagate derivatives: assemble with the AD boundary state and
            // zero-derivative interior, then close the interior derivatives
            // with one multi-RHS solve against the cached factorization.
            state_ad = (0..n)
                .map(|i| {
                    if self.boundary_nodes.contains(&i) {
                        u_bc_ad[i]
                    } else {
                        EvalScalar::constant(u[i])
                    }
                })
                .collect();

            let propagate = compute_jacobian || compute_sens;
            if propagate && !self.interior_nodes.is_empty() {
                let params = if compute_sens {
                    &params_seeded
                } else {
                    &params_plain
                };
                let res_ad = self.assemble_ad(
                    &state_ad,
                    &prev_ad,
                    sub_alpha,
                    time,
                    sub_dt,
                    macro_ws,
                    fm,
                    mods,
                    params,
                )?;

                let nslots = macro_ws.param_dof_seed_base.max(
                    macro_slots.iter().copied().max().map(|m| m + 1).unwrap_or(0),
                );
                let nint = self.interior_nodes.len();
                let mut rhs = DMatrix::zeros(nint, nslots);
                for (row, &node) in self.interior_nodes.iter().enumerate() {
                    for s in 0..nslots {
                        rhs[(row, s)] = -res_ad[node].dx(s);
                    }
                }
                let x = self
                    .factor
                    .as_ref()
                    .unwrap()
                    .solve(&rhs)
                    .ok_or_else(|| {
                        SubgridError::Linear("singular subgrid jacobian".to_string())
                    })?;
                for (row, &node) in self.interior_nodes.iter().enumerate() {
                    let mut v = EvalScalar::constant(u[node]);
                    for s in 0..nslots {
                        v.set_dx(s, x[(row, s)]);
                    }
                    state_ad[node] = v;
                }
            }

            self.trajectory.push(u.clone());
            prev_ad = state_ad.clone();
        }

        // Interface reaction: residual rows at the slaved boundary nodes of
        // the final substate, paired through the mortar matching.
        let params = if compute_sens {
            &params_seeded
        } else {
            &params_plain
        };
        let res_ad = self.assemble_ad(
            &state_ad,
            &reaction_prev,
            sub_alpha,
            opts.time,
            sub_dt,
            macro_ws,
            fm,
            mods,
            params,
        )?;

        let mut out = vec![EvalScalar::zero(); nb_macro];
        for &bnode in &self.boundary_nodes {
            for i in 0..nb_macro {
                let w = self.matching[bnode][i];
                if w != 0.0 {
                    out[i] += res_ad[bnode] * w;
                }
            }
        }
        Ok(out)
    }

    fn interior_block(&self, jac: &DMatrix<f64>) -> DMatrix<f64> {
        let nint = self.interior_nodes.len();
        let mut j = DMatrix::zeros(nint, nint);
        for (r, &nr) in self.interior_nodes.iter().enumerate() {
            for (c, &nc) in self.interior_nodes.iter().enumerate() {
                j[(r, c)] = jac[(nr, nc)];
            }
        }
        j
    }

    /// Plain-valued assembly with per-element dof seeding: returns the
    /// nodal residual and the dense subgrid Jacobian.
    #[allow(clippy::too_many_arguments)]
    fn assemble_plain(
        &mut self,
        u: &[f64],
        prev_ad: &[EvalScalar],
        alpha: f64,
        time: f64,
        deltat: f64,
        macro_ws: &Workset,
        fm: &FunctionManager,
        mods: &[Box<dyn PhysicsModule>],
        params: &[EvalScalar],
    ) -> Result<(Vec<f64>, DMatrix<f64>), SubgridError> {
        let n = self.num_nodes();
        let state: Vec<EvalScalar> = u
            .iter()
            .map(|&v| EvalScalar::constant(v))
            .collect();
        let res_ad = self.run_physics(
            &state, prev_ad, alpha, time, deltat, macro_ws, fm, mods, params, true,
        )?;

        // res_ad here is per (element, local dof) with local seeding.
        let nb = self.sub_topo.num_nodes();
        let mut res = vec![0.0; n];
        let mut jac = DMatrix::zeros(n, n);
        for (e, c) in self.conn.iter().enumerate() {
            for (i, &ni) in c.iter().enumerate() {
                let r = res_ad[e * nb + i];
                res[ni] += r.val();
                for (j, &nj) in c.iter().enumerate() {
                    jac[(ni, nj)] += r.dx(j);
                }
            }
        }
        Ok((res, jac))
    }

    /// AD assembly with derivatives carried by the state itself (no dof
    /// seeding): returns the nodal residual with trace/parameter slots.
    #[allow(clippy::too_many_arguments)]
    fn assemble_ad(
        &mut self,
        state: &[EvalScalar],
        prev_ad: &[EvalScalar],
        alpha: f64,
        time: f64,
        deltat: f64,
        macro_ws: &Workset,
        fm: &FunctionManager,
        mods: &[Box<dyn PhysicsModule>],
        params: &[EvalScalar],
    ) -> Result<Vec<EvalScalar>, SubgridError> {
        let res_elem = self.run_physics(
            state, prev_ad, alpha, time, deltat, macro_ws, fm, mods, params, false,
        )?;
        let nb = self.sub_topo.num_nodes();
        let mut res = vec![EvalScalar::zero(); self.num_nodes()];
        for (e, c) in self.conn.iter().enumerate() {
            for (i, &ni) in c.iter().enumerate() {
                res[ni] += res_elem[e * nb + i];
            }
        }
        Ok(res)
    }

    /// Interpolate the nodal state into the subgrid workset and run the
    /// physics volume pass; returns the per-element AD residual.
    #[allow(clippy::too_many_arguments)]
    fn run_physics(
        &mut self,
        state: &[EvalScalar],
        prev_ad: &[EvalScalar],
        alpha: f64,
        time: f64,
        deltat: f64,
        macro_ws: &Workset,
        fm: &FunctionManager,
        mods: &[Box<dyn PhysicsModule>],
        params: &[EvalScalar],
        seed_dofs: bool,
    ) -> Result<Vec<EvalScalar>, SubgridError> {
        let ws = &mut self.sub_ws;
        ws.geom = Some(self.geom.clone());
        ws.side_geom = None;
        ws.time = time;
        ws.deltat = deltat;
        ws.alpha = alpha;
        ws.form_param = macro_ws.form_param;
        ws.is_adjoint = macro_ws.is_adjoint;
        ws.scalar_params = params.to_vec();
        ws.param_seed_base = macro_ws.param_seed_base;
        ws.param_dof_seed_base = macro_ws.param_dof_seed_base;
        ws.reset(self.conn.len(), self.geom.num_ip);

        let nb = self.sub_topo.num_nodes();
        let nq = self.geom.num_ip;
        let tables = &self.geom.basis[0];
        let ne = self.conn.len();

        let mut field = vec![EvalScalar::zero(); ne * nq];
        let mut gradient = vec![[EvalScalar::zero(); 3]; ne * nq];
        let mut dot = vec![EvalScalar::zero(); ne * nq];
        for (e, c) in self.conn.iter().enumerate() {
            for (i, &node) in c.iter().enumerate() {
                let coeff = if seed_dofs {
                    // Local dof seeding for the subgrid Jacobian, combined
                    // with the transient chain du_dot/du = alpha.
                    EvalScalar::seeded(state[node].val(), i)
                } else {
                    state[node]
                };
                let udot = if alpha == 0.0 {
                    EvalScalar::zero()
                } else if seed_dofs {
                    EvalScalar::seeded_scaled(
                        alpha * (state[node].val() - prev_ad[node].val()),
                        i,
                        alpha,
                    )
                } else {
                    (state[node] - prev_ad[node]) * alpha
                };
                for k in 0..nq {
                    let p = e * nq + k;
                    let v = tables.val(e, i, k);
                    field[p] += coeff * v;
                    dot[p] += udot * v;
                    for d in 0..3 {
                        gradient[p][d] += coeff * tables.gradv(e, i, k, d);
                    }
                }
            }
        }
        ws.soln[0] = field;
        ws.soln_grad[0] = gradient;
        ws.soln_dot[0] = dot;

        for module in mods {
            module
                .volume_residual(fm, ws)
                .map_err(|e| SubgridError::Nonlinear(e.to_string()))?;
        }
        Ok(ws.res.clone())
    }
}

