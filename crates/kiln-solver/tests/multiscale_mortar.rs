//! Multiscale mortar consistency: with the subgrid physics identical to the
//! macro physics and a single trivial subgrid element, the coupled system
//! must reproduce the uncoupled one to round-off, in steady and transient
//! modes. Refined subgrids still converge and report their load estimate.

mod common;

use common::{set_bc, thermal_settings};
use kiln_la::Comm;
use kiln_model::mesh::unit_square;
use kiln_model::Settings;
use kiln_solver::SolverManager;

const SIDES: [&str; 4] = ["left", "right", "bottom", "top"];

fn base_settings(transient: bool) -> Settings {
    let mut s = thermal_settings();
    {
        let functions = s.sublist_mut("Functions");
        functions.set_str("thermal source", "1.0");
    }
    if transient {
        let solver = s.sublist_mut("Solver");
        solver.set_str("solver", "transient");
        solver.set_int("numSteps", 5);
        solver.set_real("finaltime", 0.1);
        solver
            .sublist_mut("Initial Conditions")
            .set_str("T", "0.0");
    }
    for side in SIDES {
        set_bc(&mut s, "T", side, "strong Dirichlet", "0.0");
    }
    s
}

fn with_multiscale(mut s: Settings, refine: i64, time_steps: i64) -> Settings {
    let ms = s.sublist_mut("Multiscale");
    ms.set_str_list("blocks", vec!["block0".to_string()]);
    ms.set_int("refine", refine);
    ms.set_int("time steps", time_steps);
    s
}

fn final_state(settings: &Settings) -> Vec<f64> {
    let mut solver = SolverManager::new(unit_square(2, 2, 1), settings).unwrap();
    let report = solver.forward_solve().unwrap();
    assert!(report.converged);
    let u = solver.trajectory.last().unwrap();
    (0..u.len()).map(|lid| u.local(lid)).collect()
}

#[test]
fn trivial_subgrid_reproduces_uncoupled_steady_system() {
    let reference = final_state(&base_settings(false));
    let coupled = final_state(&with_multiscale(base_settings(false), 1, 1));

    for (i, (a, b)) in reference.iter().zip(coupled.iter()).enumerate() {
        assert!(
            (a - b).abs() < 1e-12,
            "dof {i}: uncoupled {a:.15e} vs mortar {b:.15e}"
        );
    }
}

#[test]
fn trivial_subgrid_reproduces_uncoupled_transient_system() {
    let reference = final_state(&base_settings(true));
    let coupled = final_state(&with_multiscale(base_settings(true), 1, 1));

    for (i, (a, b)) in reference.iter().zip(coupled.iter()).enumerate() {
        assert!(
            (a - b).abs() < 1e-12,
            "dof {i}: uncoupled {a:.15e} vs mortar {b:.15e}"
        );
    }
}

#[test]
fn refined_subgrid_converges_near_the_coarse_answer() {
    let reference = final_state(&base_settings(false));
    let refined = final_state(&with_multiscale(base_settings(false), 2, 1));

    // The embedded fine scale changes the discrete answer, but only by a
    // discretization-level amount on this smooth problem.
    for (a, b) in reference.iter().zip(refined.iter()) {
        assert!((a - b).abs() < 0.05, "{a} vs {b}");
    }
}

#[test]
fn manager_reports_cost_and_balance() {
    let settings = with_multiscale(base_settings(false), 3, 2);
    let solver = SolverManager::new(unit_square(2, 2, 1), &settings).unwrap();
    let ms = solver.assembler.multiscale.as_ref().unwrap();

    assert_eq!(ms.subgrids.len(), 4);
    // 3^2 elements times 2 substeps, per subgrid.
    assert_eq!(ms.cost_estimate(), 4 * 9 * 2);
    // A single rank is trivially balanced.
    assert_eq!(ms.load_imbalance(&Comm::serial()), 1.0);
}
