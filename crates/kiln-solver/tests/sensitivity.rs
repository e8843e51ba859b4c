//! Parameter sensitivities: the adjoint gradient against central
//! differences for a scalar diffusivity, and the rectangular dR/dp block's
//! dot-product identity plus the adjoint field gradient for a discretized
//! diffusivity field.

mod common;

use common::{pseudo_random, set_bc, thermal_settings};
use kiln_la::{DistMatrix, DistVector};
use kiln_model::mesh::unit_square;
use kiln_model::Settings;
use kiln_solver::{AssembleOptions, AssembleTargets, SolverManager};

const SIDES: [&str; 4] = ["left", "right", "bottom", "top"];

fn scalar_kappa_settings() -> Settings {
    let mut s = thermal_settings();
    {
        let functions = s.sublist_mut("Functions");
        functions.set_str("thermal diffusion", "kappa");
        functions.set_str("thermal source", "1.0");
    }
    {
        let params = s.sublist_mut("Parameters");
        let kappa = params.sublist_mut("kappa");
        kappa.set_str("type", "scalar");
        kappa.set_str("usage", "active");
        kappa.set_real("value", 1.0);
        kappa.set_real("lower", 0.1);
        kappa.set_real("upper", 10.0);
    }
    for side in SIDES {
        set_bc(&mut s, "T", side, "strong Dirichlet", "0.0");
    }
    {
        let pp = s.sublist_mut("Postprocess");
        pp.set_str("response type", "global");
        pp.set_bool("compute objective", true);
        pp.set_bool("compute sensitivities", true);
        pp.set_str("objective", "T");
    }
    s
}

#[test]
fn adjoint_gradient_matches_central_difference() {
    let settings = scalar_kappa_settings();
    let mut solver = SolverManager::new(unit_square(6, 6, 1), &settings).unwrap();
    let gradient = solver.compute_gradient().unwrap();
    assert_eq!(gradient.scalar.len(), 1);
    let adjoint = gradient.scalar[0];

    let h = 1e-5;
    let mut objective_at = |kappa: f64| -> f64 {
        let mut s = SolverManager::new(unit_square(6, 6, 1), &settings).unwrap();
        s.assembler
            .params
            .update_parameters(&[kappa], &["kappa"])
            .unwrap();
        s.forward_solve().unwrap();
        s.objective().unwrap()
    };
    let fd = (objective_at(1.0 + h) - objective_at(1.0 - h)) / (2.0 * h);

    let rel = (adjoint - fd).abs() / fd.abs().max(1e-12);
    assert!(
        rel < 1e-7,
        "adjoint {adjoint:.12e} vs central difference {fd:.12e} (rel {rel:.3e})"
    );
}

#[test]
fn gradient_file_has_sixteen_digit_entries() {
    let settings = scalar_kappa_settings();
    let mut solver = SolverManager::new(unit_square(3, 3, 1), &settings).unwrap();
    let gradient = solver.compute_gradient().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sens.dat");
    solver
        .write_gradient(path.to_str().unwrap(), &gradient)
        .unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let line = text.trim();
    let fields: Vec<&str> = line.split(' ').collect();
    assert_eq!(fields.len(), 1);
    let parsed: f64 = fields[0].parse().unwrap();
    assert!((parsed - gradient.scalar[0]).abs() <= parsed.abs() * 1e-15);
    assert!(fields[0].contains('.'));
}

fn field_kappa_settings() -> Settings {
    let mut s = thermal_settings();
    {
        let functions = s.sublist_mut("Functions");
        functions.set_str("thermal diffusion", "kfield");
        functions.set_str("thermal source", "1.0");
    }
    {
        let params = s.sublist_mut("Parameters");
        let field = params.sublist_mut("kfield");
        field.set_str("usage", "discretized");
        field.set_int("order", 1);
        field.set_str("source", "1 + 0.1*sin(pi*x)");
    }
    for side in SIDES {
        set_bc(&mut s, "T", side, "strong Dirichlet", "0.0");
    }
    {
        let pp = s.sublist_mut("Postprocess");
        pp.set_str("response type", "global");
        pp.set_bool("compute objective", true);
        pp.set_bool("compute sensitivities", true);
        // Misfit against a synthetic measured field.
        pp.set_str("objective", "(T - 0.01*x)^2");
    }
    s
}

#[test]
fn rectangular_block_passes_dot_product_test() {
    let settings = field_kappa_settings();
    let mut solver = SolverManager::new(unit_square(4, 4, 1), &settings).unwrap();
    solver.forward_solve().unwrap();

    // Assemble dR/dp at the converged state.
    let graph = solver.assembler.param_jacobian_graph().unwrap();
    let mut pjac = DistMatrix::new(graph);
    let u = solver.trajectory.last().unwrap().clone();
    let mut state = kiln_solver::SolutionState::new(
        solver.assembler.overlapped_map(),
        solver
            .assembler
            .params
            .discretized
            .as_ref()
            .map(|d| d.dofs.overlapped.clone()),
    );
    solver.assembler.dofs.export.import(&u, &mut state.u);
    solver.assembler.dofs.export.import(&u, &mut state.aux);
    if let (Some(disc), Some(pv)) = (
        solver.assembler.params.discretized.as_ref(),
        state.param.as_mut(),
    ) {
        disc.dofs.export.import(&disc.psol, pv);
    }
    let opts = AssembleOptions {
        residual_only: true,
        seed_param_dofs: true,
        ..Default::default()
    };
    let mut res = DistVector::new(solver.assembler.overlapped_map());
    let mut targets = AssembleTargets {
        res: Some(&mut res),
        param_jac: Some(&mut pjac),
        ..Default::default()
    };
    solver.assembler.assemble(&state, &mut targets, &opts).unwrap();

    let disc = solver.assembler.params.discretized.as_ref().unwrap();
    let dof_map = solver.assembler.overlapped_map();
    for pair in 0..5 {
        let mut v = DistVector::new(disc.dofs.overlapped.clone());
        for (lid, r) in pseudo_random(v.len(), 100 + pair).iter().enumerate() {
            v.set_local(lid, *r);
        }
        let mut w = DistVector::new(dof_map.clone());
        for (lid, r) in pseudo_random(w.len(), 200 + pair).iter().enumerate() {
            w.set_local(lid, *r);
        }

        let mut jv = DistVector::new(dof_map.clone());
        pjac.apply(&v, &mut jv);
        let mut jtw = DistVector::new(disc.dofs.overlapped.clone());
        pjac.apply_transpose(&w, &mut jtw);

        let lhs = jv.dot(&w);
        let rhs = v.dot(&jtw);
        assert!(
            (lhs - rhs).abs() < 1e-10 * lhs.abs().max(1.0),
            "pair {pair}: <Jv, w> = {lhs:.14e}, <v, J^T w> = {rhs:.14e}"
        );
    }
}

#[test]
fn field_gradient_matches_central_difference() {
    let settings = field_kappa_settings();
    let mut solver = SolverManager::new(unit_square(4, 4, 1), &settings).unwrap();
    let gradient = solver.compute_gradient().unwrap();
    let field = gradient.field.as_ref().unwrap().clone();

    let base: Vec<f64> = {
        let disc = solver.assembler.params.discretized.as_ref().unwrap();
        disc.psol.values().iter().copied().collect()
    };

    let h = 1e-5;
    let mut objective_with = |p: &[f64]| -> f64 {
        let mut s = SolverManager::new(unit_square(4, 4, 1), &settings).unwrap();
        s.assembler.params.update_discretized(p);
        s.forward_solve().unwrap();
        s.objective().unwrap()
    };

    // Spot-check a few parameter dofs against central differences.
    for &dof in &[0usize, 7, 12] {
        let mut plus = base.clone();
        plus[dof] += h;
        let mut minus = base.clone();
        minus[dof] -= h;
        let fd = (objective_with(&plus) - objective_with(&minus)) / (2.0 * h);
        let rel = (field[dof] - fd).abs() / fd.abs().max(1e-10);
        assert!(
            rel < 1e-5,
            "dof {dof}: adjoint {a:.10e} vs fd {fd:.10e} (rel {rel:.3e})",
            a = field[dof]
        );
    }
}
