//! Forward, adjoint, and sensitivity solver.
//!
//! Time stepping is backward-difference: first order (alpha = 1/dt) or
//! second order (alpha = 3/(2 dt), three-level history with a first-order
//! startup step); steady mode sets alpha = 0. Each step runs a damped
//! Newton iteration with an inf-norm relative stopping test; the adjoint
//! walks the stored trajectory in reverse, solving the transposed
//! linearization and accumulating parameter sensitivities step by step.

use std::sync::Arc;

use kiln_la::{
    solve_with_cascade, AmgConfig, CrsGraph, DistMatrix, DistVector, GmresConfig,
    LinearSolverConfig, Precond, SmootherKind,
};
use kiln_model::{Mesh, SettingValue, Settings};

use crate::assembly::{AssembleOptions, AssembleTargets, AssemblyManager, SolutionState};
use crate::error::SolveError;
use crate::functions::Location;
use crate::postprocess::{assemble_regularization, Postprocessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverMode {
    Steady,
    Transient,
}

/// Convergence report of one nonlinear solve.
#[derive(Debug, Clone)]
pub struct NewtonReport {
    pub iterations: usize,
    pub initial_residual: f64,
    pub final_scaled_residual: f64,
    pub converged: bool,
}

/// Gradient of the objective with respect to the registered parameters.
#[derive(Debug, Clone)]
pub struct GradientResult {
    pub objective: f64,
    /// One entry per active scalar parameter, in slot order.
    pub scalar: Vec<f64>,
    /// Discretized-parameter gradient over its owned map.
    pub field: Option<Vec<f64>>,
}

impl GradientResult {
    /// Flattened layout written to sens.dat: scalars first, then the field.
    pub fn flat(&self) -> Vec<f64> {
        let mut out = self.scalar.clone();
        if let Some(f) = &self.field {
            out.extend_from_slice(f);
        }
        out
    }
}

pub struct SolverManager {
    pub assembler: AssemblyManager,
    pub postprocessor: Postprocessor,
    pub mode: SolverMode,
    num_steps: usize,
    final_time: f64,
    time_order: usize,
    nl_tol: f64,
    max_nl_iter: usize,
    use_line_search: bool,
    lin_config: LinearSolverConfig,

    /// Owned solution, one entry per accepted step; index 0 is the initial
    /// condition. Append-only during the forward run.
    pub trajectory: Vec<DistVector>,
    pub times: Vec<f64>,
    /// Adjoint states in reverse time order (terminal step first).
    pub adjoint_trajectory: Vec<DistVector>,
}

impl std::fmt::Debug for SolverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverManager").finish_non_exhaustive()
    }
}

impl SolverManager {
    pub fn new(mesh: Mesh, settings: &Settings) -> Result<Self, SolveError> {
        let mut assembler = AssemblyManager::new(mesh, settings)?;
        assembler.validate_functions()?;
        let postprocessor = Postprocessor::from_settings(settings, &mut assembler)?;

        let solver = settings.require_sublist("Solver")?;
        let mode = match solver.get_str("solver", "steady-state") {
            "transient" => SolverMode::Transient,
            _ => SolverMode::Steady,
        };
        let num_steps = solver.get_int("numSteps", 1).max(1) as usize;
        let final_time = solver.get_real("finaltime", 1.0);
        let time_order = solver.get_int("time order", 1).clamp(1, 2) as usize;

        let gmres = GmresConfig {
            tol: solver.get_real("lintol", 1e-10),
            max_iters: solver.get_int("liniter", 200) as usize,
            restart: solver.get_int("krylov restart", 50) as usize,
        };
        let precond = match solver.get_str("preconditioner", "ilu") {
            "none" => Precond::None,
            "amg" => Precond::Amg(AmgConfig {
                max_levels: solver.get_int("max levels", 10) as usize,
                coarse_size: solver.get_int("coarse size", 64) as usize,
                strength_threshold: solver.get_real("strength threshold", 0.02),
                smoother: match solver.get_str("smoother", "Chebyshev") {
                    "Jacobi" => SmootherKind::Jacobi {
                        omega: solver.get_real("jacobi omega", 0.66),
                        sweeps: solver.get_int("jacobi sweeps", 2) as usize,
                    },
                    _ => SmootherKind::Chebyshev {
                        degree: solver.get_int("chebyshev degree", 2) as usize,
                    },
                },
                prolongator_damping: 4.0 / 3.0,
            }),
            _ => Precond::Ilu {
                drop_tol: solver.get_real("dropTol", 1e-3),
                fill_param: solver.get_real("fillParam", 2.0),
            },
        };

        // Register initial-condition expressions.
        let ic_exprs: Vec<(String, String)> = solver
            .sublist("Initial Conditions")
            .map(|ics| {
                ics.iter()
                    .filter_map(|(var, v)| match v {
                        SettingValue::Str(expr) => Some((var.to_string(), expr.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        for (var, expr) in &ic_exprs {
            let name = format!("initial {var}");
            for fm in assembler.fms.iter_mut() {
                fm.register(&name, expr, Location::Ip)?;
            }
        }

        Ok(Self {
            assembler,
            postprocessor,
            mode,
            num_steps,
            final_time,
            time_order,
            nl_tol: solver.get_real("NLtol", 1e-10),
            max_nl_iter: solver.get_int("MaxNLiter", 10) as usize,
            use_line_search: solver.get_bool("line search", false),
            lin_config: LinearSolverConfig { gmres, precond },
            trajectory: Vec::new(),
            times: Vec::new(),
            adjoint_trajectory: Vec::new(),
        })
    }

    pub fn deltat(&self) -> f64 {
        match self.mode {
            SolverMode::Steady => 1.0,
            SolverMode::Transient => self.final_time / self.num_steps as f64,
        }
    }

    fn steps(&self) -> usize {
        match self.mode {
            SolverMode::Steady => 1,
            SolverMode::Transient => self.num_steps,
        }
    }

    /// BDF coefficients at a step: (alpha, c_prev, c_prev2) such that
    /// u_dot = alpha*u + c_prev*u_{n-1} + c_prev2*u_{n-2}.
    fn bdf_coefficients(&self, step: usize) -> (f64, f64, f64) {
        match self.mode {
            SolverMode::Steady => (0.0, 0.0, 0.0),
            SolverMode::Transient => {
                let dt = self.deltat();
                if self.time_order == 2 && step >= 2 {
                    (3.0 / (2.0 * dt), -4.0 / (2.0 * dt), 1.0 / (2.0 * dt))
                } else {
                    (1.0 / dt, -1.0 / dt, 0.0)
                }
            }
        }
    }

    /// Initial condition: nodal data field when present, else registered
    /// expressions, else zero.
    pub fn initial_condition(&self) -> Result<DistVector, SolveError> {
        let am = &self.assembler;
        let owned = am.owned_map();
        let mut u0 = DistVector::new(owned.clone());
        let nvars = am.dofs.num_vars();
        let scalar_flat: Vec<f64> = am.params.sacadoize(false, 0).iter().map(|v| v.val()).collect();

        for lid in 0..owned.num_local() {
            let gid = owned.gid(lid);
            let node = (gid / nvars as u64) as usize;
            let var = (gid % nvars as u64) as usize;
            let var_name = &am.dofs.var_names[var];

            let nodal_key = format!("initial {var_name}");
            if let Some(data) = am.mesh.nodal_data.get(&nodal_key) {
                u0.set_local(lid, data[node]);
                continue;
            }
            if am.fms[0].is_registered(&nodal_key, Location::Ip) {
                let v = am.fms[0]
                    .get(&nodal_key, Location::Ip)
                    .map_err(SolveError::Assembly)?
                    .eval_at_points(&[am.mesh.coords[node]], 0.0, &scalar_flat)
                    .map_err(SolveError::Assembly)?[0];
                u0.set_local(lid, v);
            }
        }
        Ok(u0)
    }

    fn fresh_state(&self) -> SolutionState {
        SolutionState::new(
            self.assembler.overlapped_map(),
            self.assembler
                .params
                .discretized
                .as_ref()
                .map(|d| d.dofs.overlapped.clone()),
        )
    }

    /// Load the parameter-field coefficients into the overlapped state.
    fn sync_param_state(&self, state: &mut SolutionState) {
        if let (Some(disc), Some(pv)) = (
            self.assembler.params.discretized.as_ref(),
            state.param.as_mut(),
        ) {
            disc.dofs.export.import(&disc.psol, pv);
        }
    }

    /// Scatter owned solution data into the overlapped gather vectors and
    /// rebuild u_dot from the BDF stencil.
    fn load_state(
        &self,
        state: &mut SolutionState,
        u: &DistVector,
        prev: Option<&DistVector>,
        prev2: Option<&DistVector>,
        coeffs: (f64, f64, f64),
    ) {
        let export = &self.assembler.dofs.export;
        let mut u_dot = DistVector::new(u.map().clone());
        let (c0, c1, c2) = coeffs;
        if c0 != 0.0 {
            u_dot.update(c0, u, 0.0);
            if let Some(p) = prev {
                u_dot.update(c1, p, 1.0);
            }
            if let Some(p2) = prev2 {
                if c2 != 0.0 {
                    u_dot.update(c2, p2, 1.0);
                }
            }
        }
        export.import(u, &mut state.u);
        export.import(&u_dot, &mut state.u_dot);
        // The mortar trace defaults to the primary solution.
        export.import(u, &mut state.aux);
    }

    /// Damped Newton at one time step. `u` enters as the initial guess and
    /// leaves as the converged solution.
    #[allow(clippy::too_many_arguments)]
    fn newton(
        &mut self,
        u: &mut DistVector,
        prev: Option<&DistVector>,
        prev2: Option<&DistVector>,
        time: f64,
        step: usize,
        is_final_time: bool,
    ) -> Result<NewtonReport, SolveError> {
        let (alpha, c1, c2) = self.bdf_coefficients(step);
        let opts = AssembleOptions {
            time,
            deltat: self.deltat(),
            alpha,
            is_final_time,
            ..Default::default()
        };

        let overlapped = self.assembler.overlapped_map();
        let owned = self.assembler.owned_map();
        let graph_over = self.assembler.dofs.graph_overlapped.clone();
        let graph_owned = self.assembler.dofs.graph_owned.clone();

        let mut state = self.fresh_state();
        self.sync_param_state(&mut state);
        let mut res_over = DistVector::new(overlapped);
        let mut res_owned = DistVector::new(owned.clone());
        let mut mat_over = DistMatrix::new(graph_over);
        let mut mat_owned = DistMatrix::new(graph_owned);

        // Impose prescribed values on the initial guess.
        self.assembler
            .apply_dirichlet(time, None, None, Some(u))
            .map_err(SolveError::Assembly)?;

        let mut r0 = 0.0;
        let mut scaled = f64::INFINITY;
        let mut iterations = 0;

        for iter in 0..self.max_nl_iter {
            self.load_state(&mut state, u, prev, prev2, (alpha, c1, c2));

            {
                let mut targets = AssembleTargets {
                    res: Some(&mut res_over),
                    mat: Some(&mut mat_over),
                    ..Default::default()
                };
                self.assembler
                    .assemble(&state, &mut targets, &opts)
                    .map_err(SolveError::Assembly)?;
            }
            self.assembler.export_residual(&res_over, &mut res_owned);
            self.assembler
                .export_matrix(&mat_over, &mut mat_owned)
                .map_err(SolveError::Assembly)?;
            self.assembler
                .apply_dirichlet(time, Some(&mut res_owned), Some(&mut mat_owned), None)
                .map_err(SolveError::Assembly)?;

            let r_norm = res_owned.norm_inf();
            if iter == 0 {
                r0 = r_norm;
                // Absolute residual below round-off: treat as converged.
                if r0 < 1e-14 {
                    return Ok(NewtonReport {
                        iterations: 0,
                        initial_residual: r0,
                        final_scaled_residual: 0.0,
                        converged: true,
                    });
                }
            }
            scaled = r_norm / r0;
            log::debug!(
                "newton step {step} iter {iter}: |r| = {r_norm:.3e} (scaled {scaled:.3e})"
            );
            if scaled <= self.nl_tol {
                return Ok(NewtonReport {
                    iterations: iter,
                    initial_residual: r0,
                    final_scaled_residual: scaled,
                    converged: true,
                });
            }

            let csr = mat_owned
                .to_csr(&owned)
                .map_err(SolveError::Linear)?;
            let (delta, info) =
                match solve_with_cascade(&csr, res_owned.values(), None, &self.lin_config) {
                    Ok(ok) => ok,
                    Err(err) => {
                        log::warn!("linear solve failed at step {step}: {err}");
                        return Err(SolveError::NonlinearNonConvergence {
                            iters: iter,
                            residual: scaled,
                            tol: self.nl_tol,
                        });
                    }
                };
            log::debug!(
                "linear solve: {} iterations, residual {:.3e} ({})",
                info.iterations,
                info.residual,
                info.precond_name
            );

            let step_size = if self.use_line_search {
                self.parabolic_step(u, &delta, prev, prev2, (alpha, c1, c2), &opts, r_norm)?
            } else {
                1.0
            };
            for lid in 0..u.len() {
                u.set_local(lid, u.local(lid) - step_size * delta[lid]);
            }
            iterations = iter + 1;
        }

        Err(SolveError::NonlinearNonConvergence {
            iters: iterations,
            residual: scaled,
            tol: self.nl_tol,
        })
    }

    /// Three-point parabolic line search on ||r(u - a*delta)||^2.
    #[allow(clippy::too_many_arguments)]
    fn parabolic_step(
        &mut self,
        u: &DistVector,
        delta: &nalgebra::DVector<f64>,
        prev: Option<&DistVector>,
        prev2: Option<&DistVector>,
        coeffs: (f64, f64, f64),
        opts: &AssembleOptions,
        r_at_zero: f64,
    ) -> Result<f64, SolveError> {
        let mut state = self.fresh_state();
        self.sync_param_state(&mut state);
        let mut res_over = DistVector::new(self.assembler.overlapped_map());
        let mut res_owned = DistVector::new(self.assembler.owned_map());

        let mut eval = |a: f64| -> Result<f64, SolveError> {
            let mut trial = u.clone();
            for lid in 0..trial.len() {
                trial.set_local(lid, trial.local(lid) - a * delta[lid]);
            }
            self.load_state(&mut state, &trial, prev, prev2, coeffs);
            let mut targets = AssembleTargets {
                res: Some(&mut res_over),
                ..Default::default()
            };
            let ropts = AssembleOptions {
                residual_only: true,
                ..opts.clone()
            };
            self.assembler
                .assemble(&state, &mut targets, &ropts)
                .map_err(SolveError::Assembly)?;
            self.assembler.export_residual(&res_over, &mut res_owned);
            self.assembler
                .apply_dirichlet(opts.time, Some(&mut res_owned), None, None)
                .map_err(SolveError::Assembly)?;
            Ok(res_owned.norm_two())
        };

        let f0 = r_at_zero * r_at_zero;
        let rh = eval(0.5)?;
        let fh = rh * rh;
        let r1 = eval(1.0)?;
        let f1 = r1 * r1;

        // Quadratic through (0, f0), (1/2, fh), (1, f1).
        let c2 = 2.0 * f1 + 2.0 * f0 - 4.0 * fh;
        let c1 = -f1 + 4.0 * fh - 3.0 * f0;
        let a = if c2 > 0.0 {
            (-c1 / (2.0 * c2)).clamp(0.1, 1.0)
        } else if f1 < f0 {
            1.0
        } else {
            0.5
        };
        log::debug!("line search: f(0)={f0:.3e} f(0.5)={fh:.3e} f(1)={f1:.3e} -> a={a:.3}");
        Ok(a)
    }

    /// Forward simulation: march the steps, storing every state (the
    /// adjoint pass revisits all of them).
    pub fn forward_solve(&mut self) -> Result<NewtonReport, SolveError> {
        let u0 = self.initial_condition()?;
        self.trajectory.clear();
        self.times.clear();
        self.trajectory.push(u0.clone());
        self.times.push(0.0);
        if let Some(ms) = self.assembler.multiscale.as_mut() {
            ms.reset_history();
        }

        let dt = self.deltat();
        let mut u = u0;
        let mut last_report = NewtonReport {
            iterations: 0,
            initial_residual: 0.0,
            final_scaled_residual: 0.0,
            converged: true,
        };

        for step in 1..=self.steps() {
            let time = match self.mode {
                SolverMode::Steady => 0.0,
                SolverMode::Transient => dt * step as f64,
            };
            let prev = self.trajectory[step - 1].clone();
            let prev2 = if step >= 2 {
                Some(self.trajectory[step - 2].clone())
            } else {
                None
            };
            let is_final = step == self.steps();

            last_report = self.newton(
                &mut u,
                Some(&prev),
                prev2.as_ref(),
                time,
                step,
                is_final,
            )?;
            log::info!(
                "step {step}/{total} t = {time:.4e}: {iters} newton iterations, scaled residual {res:.3e}",
                total = self.steps(),
                iters = last_report.iterations,
                res = last_report.final_scaled_residual
            );
            self.trajectory.push(u.clone());
            self.times.push(time);
            if let Some(ms) = self.assembler.multiscale.as_mut() {
                ms.accept_step();
            }
        }
        Ok(last_report)
    }

    /// Objective over the stored trajectory (transient objectives integrate
    /// the per-step response with weight dt).
    pub fn objective(&mut self) -> Result<f64, SolveError> {
        let mut total = 0.0;
        for step in 1..=self.steps() {
            let (weight, opts) = self.step_objective_opts(step);
            let mut state = self.fresh_state();
            self.sync_param_state(&mut state);
            let (alpha, c1, c2) = self.bdf_coefficients(step);
            let u = self.trajectory[step].clone();
            let prev = self.trajectory.get(step - 1).cloned();
            let prev2 = step.checked_sub(2).and_then(|i| self.trajectory.get(i)).cloned();
            self.load_state(&mut state, &u, prev.as_ref(), prev2.as_ref(), (alpha, c1, c2));
            let result = self
                .postprocessor
                .objective(&mut self.assembler, &state, &opts)
                .map_err(SolveError::Assembly)?;
            total += weight * result.value;
        }
        if let Some((reg, _)) = assemble_regularization(&self.assembler).map_err(SolveError::Assembly)? {
            total += reg;
        }
        Ok(total)
    }

    fn step_objective_opts(&self, step: usize) -> (f64, AssembleOptions) {
        let weight = match self.mode {
            SolverMode::Steady => 1.0,
            SolverMode::Transient => self.deltat(),
        };
        let opts = AssembleOptions {
            time: self.times.get(step).copied().unwrap_or(0.0),
            deltat: self.deltat(),
            seed_params: true,
            seed_param_dofs: self.assembler.params.discretized.is_some(),
            ..Default::default()
        };
        (weight, opts)
    }

    /// Adjoint sweep over the stored trajectory, producing the gradient of
    /// the objective with respect to active scalar parameters and the
    /// discretized parameter field.
    pub fn adjoint_solve(&mut self) -> Result<GradientResult, SolveError> {
        assert!(
            !self.trajectory.is_empty(),
            "adjoint_solve requires a stored forward trajectory"
        );
        let owned = self.assembler.owned_map();
        let graph_over = self.assembler.dofs.graph_overlapped.clone();
        let graph_owned = self.assembler.dofs.graph_owned.clone();
        let num_active = self.assembler.params.num_active();
        let dt = self.deltat();
        let n_steps = self.steps();

        let mut g_scalar = vec![0.0; num_active];
        let mut g_field = self
            .assembler
            .params
            .discretized
            .as_ref()
            .map(|d| DistVector::new(d.dofs.owned.clone()));
        let param_graph = self.assembler.param_jacobian_graph();

        let mut phi_next: Option<DistVector> = None;
        let mut phi_next2: Option<DistVector> = None;
        let mut objective = 0.0;
        self.adjoint_trajectory.clear();

        for step in (1..=n_steps).rev() {
            let is_final = step == n_steps;
            let time = self.times[step];
            let (alpha, c1, c2) = self.bdf_coefficients(step);

            let u = self.trajectory[step].clone();
            let prev = self.trajectory.get(step - 1).cloned();
            let prev2 = step.checked_sub(2).and_then(|i| self.trajectory.get(i)).cloned();

            let mut state = self.fresh_state();
            self.sync_param_state(&mut state);
            self.load_state(&mut state, &u, prev.as_ref(), prev2.as_ref(), (alpha, c1, c2));
            if let Some(phi) = &phi_next {
                self.assembler.dofs.export.import(phi, &mut state.adj_prev);
            }

            // Forward linearization at the stored state (adjoint symmetry
            // flag on for the Nitsche terms).
            let opts = AssembleOptions {
                time,
                deltat: dt,
                alpha,
                is_adjoint: true,
                is_final_time: is_final,
                ..Default::default()
            };
            let mut res_over = DistVector::new(self.assembler.overlapped_map());
            let mut mat_over = DistMatrix::new(graph_over.clone());
            let mut mat_owned = DistMatrix::new(graph_owned.clone());
            {
                let mut targets = AssembleTargets {
                    res: Some(&mut res_over),
                    mat: Some(&mut mat_over),
                    ..Default::default()
                };
                self.assembler
                    .assemble(&state, &mut targets, &opts)
                    .map_err(SolveError::Assembly)?;
            }
            self.assembler
                .export_matrix(&mat_over, &mut mat_owned)
                .map_err(SolveError::Assembly)?;
            self.assembler
                .apply_dirichlet(time, None, Some(&mut mat_owned), None)
                .map_err(SolveError::Assembly)?;

            // Objective derivative at this step.
            let (weight, obj_opts) = self.step_objective_opts(step);
            let obj = self
                .postprocessor
                .objective(&mut self.assembler, &state, &obj_opts)
                .map_err(SolveError::Assembly)?;
            objective += weight * obj.value;

            let mut rhs = DistVector::new(owned.clone());
            self.assembler.export_residual(&obj.djdu, &mut rhs);
            rhs.scale(weight);

            // History terms from the future steps' mass matrices.
            if let Some(phi) = &phi_next {
                let future = step + 1;
                let (_, fc1, _) = self.bdf_coefficients(future);
                let m = self.mass_matrix(future)?;
                let mut term = DistVector::new(owned.clone());
                m.apply_transpose(phi, &mut term);
                rhs.update(-fc1, &term, 1.0);
            }
            if let Some(phi2) = &phi_next2 {
                let future = step + 2;
                if future <= n_steps {
                    let (_, _, fc2) = self.bdf_coefficients(future);
                    if fc2 != 0.0 {
                        let m = self.mass_matrix(future)?;
                        let mut term = DistVector::new(owned.clone());
                        m.apply_transpose(phi2, &mut term);
                        rhs.update(-fc2, &term, 1.0);
                    }
                }
            }

            // Adjoint rows of strongly constrained dofs are zero.
            for bc in &self.assembler.dirichlet {
                rhs.replace_global(bc.gid, 0.0).map_err(SolveError::Linear)?;
            }

            // Transposed solve; the problem is linear in phi, so at most
            // two refinement iterations are taken.
            let mut jt = self.transpose_owned(&mat_owned)?;
            for bc in &self.assembler.dirichlet {
                jt.set_row_identity(bc.gid).map_err(SolveError::Linear)?;
            }
            let csr = jt.to_csr(&owned).map_err(SolveError::Linear)?;
            let mut phi = DistVector::new(owned.clone());
            for _ in 0..2 {
                let mut r = rhs.clone();
                let mut jtphi = DistVector::new(owned.clone());
                jt.apply(&phi, &mut jtphi);
                r.update(-1.0, &jtphi, 1.0);
                if r.norm_inf() < 1e-13 * (1.0 + rhs.norm_inf()) {
                    break;
                }
                let (dphi, _info) =
                    solve_with_cascade(&csr, r.values(), None, &self.lin_config)
                        .map_err(SolveError::Linear)?;
                for lid in 0..phi.len() {
                    phi.set_local(lid, phi.local(lid) + dphi[lid]);
                }
            }

            // Scalar gradient: g_p += dJ/dtheta - phi . dR/dtheta.
            if num_active > 0 {
                let mut sens_over: Vec<DistVector> = (0..num_active)
                    .map(|_| DistVector::new(self.assembler.overlapped_map()))
                    .collect();
                let sopts = AssembleOptions {
                    residual_only: true,
                    seed_params: true,
                    time,
                    deltat: dt,
                    alpha,
                    is_final_time: is_final,
                    ..Default::default()
                };
                let mut res_tmp = DistVector::new(self.assembler.overlapped_map());
                let mut targets = AssembleTargets {
                    res: Some(&mut res_tmp),
                    param_sens: Some(&mut sens_over),
                    ..Default::default()
                };
                self.assembler
                    .assemble(&state, &mut targets, &sopts)
                    .map_err(SolveError::Assembly)?;
                for (p, sens) in sens_over.iter().enumerate() {
                    let mut sens_owned = DistVector::new(owned.clone());
                    self.assembler.export_residual(sens, &mut sens_owned);
                    for bc in &self.assembler.dirichlet {
                        sens_owned
                            .replace_global(bc.gid, 0.0)
                            .map_err(SolveError::Linear)?;
                    }
                    g_scalar[p] += weight * obj.djdtheta[p] - phi.dot(&sens_owned);
                }
            }

            // Field gradient: g -= (dR/dp)^T phi, plus the explicit dJ/dp.
            if let (Some(gf), Some(pgraph)) = (g_field.as_mut(), param_graph.as_ref()) {
                let (p_overlapped, p_owned, p_export) = {
                    let disc = self.assembler.params.discretized.as_ref().unwrap();
                    (
                        disc.dofs.overlapped.clone(),
                        disc.dofs.owned.clone(),
                        disc.dofs.export.clone(),
                    )
                };
                let mut pjac = DistMatrix::new(pgraph.clone());
                let sopts = AssembleOptions {
                    residual_only: true,
                    seed_param_dofs: true,
                    time,
                    deltat: dt,
                    alpha,
                    is_final_time: is_final,
                    ..Default::default()
                };
                let mut res_tmp = DistVector::new(self.assembler.overlapped_map());
                let mut targets = AssembleTargets {
                    res: Some(&mut res_tmp),
                    param_jac: Some(&mut pjac),
                    ..Default::default()
                };
                self.assembler
                    .assemble(&state, &mut targets, &sopts)
                    .map_err(SolveError::Assembly)?;

                // Rows at strong Dirichlet dofs carry no sensitivity.
                for bc in &self.assembler.dirichlet {
                    if let Some(lid) = pjac.row_map().lid(bc.gid) {
                        pjac.row_values_mut(lid).fill(0.0);
                    }
                }

                let mut phi_over = DistVector::new(self.assembler.overlapped_map());
                self.assembler.dofs.export.import(&phi, &mut phi_over);
                let mut contrib = DistVector::new(p_overlapped);
                pjac.apply_transpose(&phi_over, &mut contrib);
                let mut contrib_owned = DistVector::new(p_owned.clone());
                p_export.apply(&contrib, &mut contrib_owned, kiln_la::CombineMode::Add);
                gf.update(-1.0, &contrib_owned, 1.0);
                if let Some(djdp) = &obj.djdp {
                    let mut djdp_owned = DistVector::new(p_owned);
                    p_export.apply(djdp, &mut djdp_owned, kiln_la::CombineMode::Add);
                    gf.update(weight, &djdp_owned, 1.0);
                }
            }

            self.adjoint_trajectory.push(phi.clone());
            phi_next2 = phi_next.take();
            phi_next = Some(phi);
        }

        // Regularization contributes to both the value and the gradient.
        if let Some((reg_val, reg_grad)) =
            assemble_regularization(&self.assembler).map_err(SolveError::Assembly)?
        {
            objective += reg_val;
            if let Some(gf) = g_field.as_mut() {
                gf.update(1.0, &reg_grad, 1.0);
            }
        }

        let comm = *owned.comm();
        comm.sum_all_slice(&mut g_scalar);

        Ok(GradientResult {
            objective,
            scalar: g_scalar,
            field: g_field.map(|g| g.values().iter().copied().collect()),
        })
    }

    /// Mass matrix at a stored step: a pass with unit u_dot seeding.
    fn mass_matrix(&mut self, step: usize) -> Result<DistMatrix, SolveError> {
        let (alpha, c1, c2) = self.bdf_coefficients(step);
        let u = self.trajectory[step].clone();
        let prev = self.trajectory.get(step - 1).cloned();
        let prev2 = step.checked_sub(2).and_then(|i| self.trajectory.get(i)).cloned();

        let mut state = self.fresh_state();
        self.sync_param_state(&mut state);
        self.load_state(&mut state, &u, prev.as_ref(), prev2.as_ref(), (alpha, c1, c2));

        let opts = AssembleOptions {
            mass_only: true,
            time: self.times[step],
            deltat: self.deltat(),
            alpha,
            ..Default::default()
        };
        let mut res_over = DistVector::new(self.assembler.overlapped_map());
        let mut mat_over = DistMatrix::new(self.assembler.dofs.graph_overlapped.clone());
        let mut mat_owned = DistMatrix::new(self.assembler.dofs.graph_owned.clone());
        {
            let mut targets = AssembleTargets {
                res: Some(&mut res_over),
                mat: Some(&mut mat_over),
                ..Default::default()
            };
            self.assembler
                .assemble(&state, &mut targets, &opts)
                .map_err(SolveError::Assembly)?;
        }
        self.assembler
            .export_matrix(&mat_over, &mut mat_owned)
            .map_err(SolveError::Assembly)?;
        // Constrained rows carry no time derivative.
        for bc in &self.assembler.dirichlet {
            if let Some(lid) = mat_owned.row_map().lid(bc.gid) {
                mat_owned.row_values_mut(lid).fill(0.0);
            }
        }
        Ok(mat_owned)
    }

    /// Transpose an owned square matrix onto the (structurally symmetric)
    /// owned graph.
    fn transpose_owned(&self, mat: &DistMatrix) -> Result<DistMatrix, SolveError> {
        let graph: Arc<CrsGraph> = mat.graph().clone();
        let mut out = DistMatrix::new(graph);
        let map = mat.row_map().clone();
        for lid in 0..map.num_local() {
            let row_gid = map.gid(lid);
            let (cols, vals) = mat.row(lid);
            for (c, v) in cols.iter().zip(vals.iter()) {
                out.sum_into_global(*c, &[row_gid], &[*v])
                    .map_err(SolveError::Linear)?;
            }
        }
        Ok(out)
    }

    /// Forward + adjoint: the full gradient pipeline.
    pub fn compute_gradient(&mut self) -> Result<GradientResult, SolveError> {
        self.forward_solve()?;
        self.adjoint_solve()
    }

    /// Write the gradient to `sens.dat` (rank 0, one line, 16 digits).
    pub fn write_gradient(&self, path: &str, gradient: &GradientResult) -> Result<(), SolveError> {
        crate::postprocess::write_sensitivities(
            path,
            &gradient.flat(),
            self.assembler.dofs.owned.comm(),
        )
    }
}
