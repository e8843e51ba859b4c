//! Transient 1-D heat equation: u(0, x) = sin(pi x), homogeneous strong
//! Dirichlet, BDF-1 with dt = 0.01 over 100 steps. The final state must
//! track the analytic decay exp(-pi^2 t) sin(pi x).

mod common;

use common::{set_bc, thermal_settings};
use kiln_model::mesh::unit_interval;
use kiln_solver::SolverManager;

fn heat_settings(order: i64, num_steps: i64) -> kiln_model::Settings {
    let mut s = thermal_settings();
    {
        let solver = s.sublist_mut("Solver");
        solver.set_str("solver", "transient");
        solver.set_int("numSteps", num_steps);
        solver.set_real("finaltime", 1.0);
        solver.set_int("time order", order);
        solver
            .sublist_mut("Initial Conditions")
            .set_str("T", "sin(pi*x)");
    }
    set_bc(&mut s, "T", "left", "strong Dirichlet", "0.0");
    set_bc(&mut s, "T", "right", "strong Dirichlet", "0.0");
    s
}

#[test]
fn bdf1_tracks_analytic_decay() {
    let mesh = unit_interval(40, 1);
    let coords = mesh.coords.clone();
    let settings = heat_settings(1, 100);
    let mut solver = SolverManager::new(mesh, &settings).unwrap();

    let report = solver.forward_solve().unwrap();
    assert!(report.converged);
    assert_eq!(solver.trajectory.len(), 101);

    let decay = (-std::f64::consts::PI.powi(2)).exp();
    let u = solver.trajectory.last().unwrap();
    let mut max_err: f64 = 0.0;
    for (node, c) in coords.iter().enumerate() {
        let exact = decay * (std::f64::consts::PI * c[0]).sin();
        let value = u.get_global(node as u64).unwrap();
        max_err = max_err.max((value - exact).abs());
    }
    assert!(max_err < 5e-3, "max error {max_err:e}");
}

#[test]
fn solution_decays_monotonically_at_midpoint() {
    let mesh = unit_interval(20, 1);
    let settings = heat_settings(1, 50);
    let mut solver = SolverManager::new(mesh, &settings).unwrap();
    solver.forward_solve().unwrap();

    // Mid node of the interval (node count is odd).
    let mid = 10u64;
    let mut prev = f64::INFINITY;
    for u in &solver.trajectory {
        let v = u.get_global(mid).unwrap();
        assert!(v <= prev + 1e-12, "midpoint value increased: {v} > {prev}");
        assert!(v >= 0.0);
        prev = v;
    }
}

#[test]
fn bdf2_beats_bdf1_on_coarse_steps() {
    let coords = unit_interval(60, 1).coords;
    let decay = (-std::f64::consts::PI.powi(2)).exp();

    let mut errors = Vec::new();
    for order in [1, 2] {
        let settings = heat_settings(order, 20);
        let mut solver = SolverManager::new(unit_interval(60, 1), &settings).unwrap();
        solver.forward_solve().unwrap();
        let u = solver.trajectory.last().unwrap();
        let mut max_err: f64 = 0.0;
        for (node, c) in coords.iter().enumerate() {
            let exact = decay * (std::f64::consts::PI * c[0]).sin();
            max_err = max_err.max((u.get_global(node as u64).unwrap() - exact).abs());
        }
        errors.push(max_err);
    }
    assert!(
        errors[1] < errors[0],
        "BDF-2 error {:.3e} should beat BDF-1 error {:.3e}",
        errors[1],
        errors[0]
    );
}
