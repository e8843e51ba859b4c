//! Weak (Nitsche) Dirichlet enforcement on the unit cube with the exact
//! solution u = x^2 + y^2 + z^2. The quadratic basis reproduces the exact
//! solution to solver precision; the linear basis converges under uniform
//! refinement.

mod common;

use common::{set_bc, thermal_settings};
use kiln_model::mesh::unit_cube;
use kiln_model::Settings;
use kiln_solver::SolverManager;

const SIDES: [&str; 6] = ["left", "right", "bottom", "top", "back", "front"];

fn cube_settings() -> Settings {
    let mut s = thermal_settings();
    {
        let functions = s.sublist_mut("Functions");
        // Residual convention: kappa*grad(u).grad(phi) - f*phi, i.e.
        // -lap(u) = f, so the quadratic exact solution needs f = -6.
        functions.set_str("thermal source", "-6.0");
    }
    for side in SIDES {
        set_bc(&mut s, "T", side, "weak Dirichlet", "x^2 + y^2 + z^2");
    }
    s
}

fn max_nodal_error(n: usize, order: usize) -> f64 {
    let mesh = unit_cube(n, n, n, order);
    let coords = mesh.coords.clone();
    let mut settings = cube_settings();
    settings.sublist_mut("Physics").set_int("order", order as i64);
    let mut solver = SolverManager::new(mesh, &settings).unwrap();
    let report = solver.forward_solve().unwrap();
    assert!(report.converged);

    let u = solver.trajectory.last().unwrap();
    let mut max_err: f64 = 0.0;
    for (node, c) in coords.iter().enumerate() {
        let exact = c[0] * c[0] + c[1] * c[1] + c[2] * c[2];
        let value = u.get_global(node as u64).unwrap();
        max_err = max_err.max((value - exact).abs());
    }
    max_err
}

#[test]
fn quadratic_basis_reproduces_exact_solution() {
    // u is in the HGRAD-2 space and the Nitsche form is consistent, so the
    // discrete solution matches to linear-solver precision.
    let err = max_nodal_error(2, 2);
    assert!(err < 1e-8, "max nodal error {err:e}");
}

#[test]
fn linear_basis_converges_under_refinement() {
    let coarse = max_nodal_error(2, 1);
    let fine = max_nodal_error(4, 1);
    assert!(
        fine < coarse / 2.0,
        "halving h should at least halve the error: {coarse:e} -> {fine:e}"
    );
}
