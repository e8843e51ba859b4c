//! AD Jacobian versus finite differences for every physics module in 1, 2,
//! and 3 dimensions, at a random state, including the Nitsche and Neumann
//! boundary paths and the transient (alpha) contribution.

mod common;

use common::{pseudo_random, set_bc, thermal_settings};
use kiln_la::{DistMatrix, DistVector};
use kiln_model::mesh::{unit_cube, unit_interval, unit_square};
use kiln_model::{Mesh, Settings};
use kiln_solver::{AssembleOptions, AssembleTargets, AssemblyManager, SolutionState};
use nalgebra::DVector;

fn residual(
    am: &mut AssemblyManager,
    u_owned: &DistVector,
    alpha: f64,
) -> DVector<f64> {
    let mut state = SolutionState::new(am.overlapped_map(), None);
    let mut u_dot = u_owned.clone();
    u_dot.scale(alpha);
    am.dofs.export.import(u_owned, &mut state.u);
    am.dofs.export.import(&u_dot, &mut state.u_dot);
    am.dofs.export.import(u_owned, &mut state.aux);

    let mut res_over = DistVector::new(am.overlapped_map());
    let opts = AssembleOptions {
        residual_only: true,
        alpha,
        deltat: 0.1,
        ..Default::default()
    };
    let mut targets = AssembleTargets {
        res: Some(&mut res_over),
        ..Default::default()
    };
    am.assemble(&state, &mut targets, &opts).unwrap();

    let mut owned = DistVector::new(am.owned_map());
    am.export_residual(&res_over, &mut owned);
    owned.values().clone()
}

fn jacobian(am: &mut AssemblyManager, u_owned: &DistVector, alpha: f64) -> DistMatrix {
    let mut state = SolutionState::new(am.overlapped_map(), None);
    let mut u_dot = u_owned.clone();
    u_dot.scale(alpha);
    am.dofs.export.import(u_owned, &mut state.u);
    am.dofs.export.import(&u_dot, &mut state.u_dot);
    am.dofs.export.import(u_owned, &mut state.aux);

    let mut res_over = DistVector::new(am.overlapped_map());
    let mut mat_over = DistMatrix::new(am.dofs.graph_overlapped.clone());
    let mut mat_owned = DistMatrix::new(am.dofs.graph_owned.clone());
    let opts = AssembleOptions {
        alpha,
        deltat: 0.1,
        ..Default::default()
    };
    let mut targets = AssembleTargets {
        res: Some(&mut res_over),
        mat: Some(&mut mat_over),
        ..Default::default()
    };
    am.assemble(&state, &mut targets, &opts).unwrap();
    am.export_matrix(&mat_over, &mut mat_owned).unwrap();
    mat_owned
}

fn check_jacobian(mesh: Mesh, settings: &Settings, alpha: f64, seed: u64) {
    let mut am = AssemblyManager::new(mesh, settings).unwrap();
    let owned = am.owned_map();
    let n = owned.num_local();

    let random = pseudo_random(n, seed);
    let mut u = DistVector::new(owned.clone());
    for (lid, r) in random.iter().enumerate() {
        u.set_local(lid, 0.3 * r);
    }

    let jac = jacobian(&mut am, &u, alpha);
    let eps = 1e-6;

    for j in 0..n {
        let mut up = u.clone();
        up.set_local(j, up.local(j) + eps);
        let rp = residual(&mut am, &up, alpha);
        let mut um = u.clone();
        um.set_local(j, um.local(j) - eps);
        let rm = residual(&mut am, &um, alpha);

        let col_gid = owned.gid(j);
        for i in 0..n {
            let fd = (rp[i] - rm[i]) / (2.0 * eps);
            let (cols, vals) = jac.row(i);
            let ad = cols
                .iter()
                .position(|&c| c == col_gid)
                .map(|p| vals[p])
                .unwrap_or(0.0);
            let scale = ad.abs().max(1.0);
            assert!(
                (fd - ad).abs() <= 1e-6 * scale,
                "J[{i}][{j}]: ad = {ad:.10e}, fd = {fd:.10e}"
            );
        }
    }
}

fn nonlinear_thermal(mut s: Settings) -> Settings {
    let functions = s.sublist_mut("Functions");
    functions.set_str("thermal diffusion", "1 + 0.1*T^2");
    functions.set_str("thermal source", "1 + 0.2*x");
    s
}

#[test]
fn thermal_1d_steady() {
    let mut s = nonlinear_thermal(thermal_settings());
    set_bc(&mut s, "T", "left", "weak Dirichlet", "1 + x");
    set_bc(&mut s, "T", "right", "Neumann", "0.5");
    check_jacobian(unit_interval(3, 1), &s, 0.0, 11);
}

#[test]
fn thermal_2d_transient() {
    // Covers the Nitsche, Neumann, and interface-flux boundary paths at
    // once; the interface side exercises compute_flux with the mortar
    // trace from the auxiliary gather.
    let mut s = nonlinear_thermal(thermal_settings());
    set_bc(&mut s, "T", "left", "weak Dirichlet", "1 + y");
    set_bc(&mut s, "T", "top", "Neumann", "0.25");
    set_bc(&mut s, "T", "right", "interface", "0.0");
    check_jacobian(unit_square(2, 2, 1), &s, 10.0, 12);
}

#[test]
fn thermal_2d_quadratic_basis() {
    let mut s = nonlinear_thermal(thermal_settings());
    s.sublist_mut("Physics").set_int("order", 2);
    set_bc(&mut s, "T", "bottom", "weak Dirichlet", "x*y");
    check_jacobian(unit_square(2, 1, 2), &s, 0.0, 13);
}

#[test]
fn thermal_3d_steady() {
    let mut s = nonlinear_thermal(thermal_settings());
    set_bc(&mut s, "T", "left", "weak Dirichlet", "z");
    set_bc(&mut s, "T", "front", "Neumann", "0.1");
    check_jacobian(unit_cube(2, 1, 1, 1), &s, 0.0, 14);
}

fn elasticity_settings(dim: usize) -> Settings {
    let mut s = thermal_settings();
    {
        let physics = s.sublist_mut("Physics");
        physics.set_str_list("modules", vec!["elasticity".to_string()]);
    }
    {
        let functions = s.sublist_mut("Functions");
        functions.set_str("lambda", "1.2");
        functions.set_str("mu", "0.8");
        functions.set_str("density", "1.0");
        functions.set_str("body force x", "0.3");
    }
    set_bc(&mut s, "ux", "left", "weak Dirichlet", "0.0");
    set_bc(&mut s, "ux", "right", "Neumann", "0.2");
    if dim >= 2 {
        set_bc(&mut s, "uy", "left", "weak Dirichlet", "0.0");
    }
    if dim >= 3 {
        set_bc(&mut s, "uz", "left", "weak Dirichlet", "0.0");
    }
    s
}

#[test]
fn elasticity_1d_steady() {
    check_jacobian(unit_interval(3, 1), &elasticity_settings(1), 0.0, 21);
}

#[test]
fn thermal_with_velocity_coupling_2d() {
    // Thermal detects the ux/uy fields of the co-registered module and
    // switches on convective transport; the coupling block of the Jacobian
    // must match finite differences too.
    let mut s = elasticity_settings(2);
    s.sublist_mut("Physics").set_str_list(
        "modules",
        vec!["thermal".to_string(), "elasticity".to_string()],
    );
    {
        let functions = s.sublist_mut("Functions");
        functions.set_str("specific heat", "1.0");
        functions.set_str("thermal diffusion", "1 + 0.1*T^2");
        functions.set_str("thermal source", "0.5");
    }
    set_bc(&mut s, "T", "left", "weak Dirichlet", "1.0");
    check_jacobian(unit_square(2, 1, 1), &s, 0.0, 31);
}

#[test]
fn elasticity_2d_transient() {
    check_jacobian(unit_square(2, 1, 1), &elasticity_settings(2), 5.0, 22);
}

#[test]
fn elasticity_3d_steady() {
    check_jacobian(unit_cube(1, 1, 2, 1), &elasticity_settings(3), 0.0, 23);
}
