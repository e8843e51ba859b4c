//! Startup validation, failure semantics, and the pointwise response and
//! regularization paths.

mod common;

use common::{set_bc, thermal_settings};
use kiln_model::mesh::unit_square;
use kiln_model::{ConfigError, Settings};
use kiln_solver::{SolveError, SolverManager};

#[test]
fn missing_coefficient_function_is_fatal_at_startup() {
    let mut s = thermal_settings();
    // Drop the thermal diffusion entry entirely.
    let mut bare = Settings::new();
    bare.set_str("density", "1.0");
    bare.set_str("specific heat", "1.0");
    bare.set_str("thermal source", "0.0");
    s.set("Functions", kiln_model::SettingValue::Sublist(bare));
    set_bc(&mut s, "T", "left", "strong Dirichlet", "0.0");

    let err = SolverManager::new(unit_square(2, 2, 1), &s).unwrap_err();
    match err {
        SolveError::Config(ConfigError::MissingSetting(name)) => {
            assert!(name.contains("thermal diffusion"));
        }
        other => panic!("expected missing-setting error, got {other}"),
    }
}

#[test]
fn missing_elasticity_coefficient_is_fatal_at_startup() {
    let mut s = thermal_settings();
    s.sublist_mut("Physics")
        .set_str_list("modules", vec!["elasticity".to_string()]);
    {
        // lambda is registered, mu is not.
        let functions = s.sublist_mut("Functions");
        functions.set_str("lambda", "1.2");
    }
    set_bc(&mut s, "ux", "left", "strong Dirichlet", "0.0");

    let err = SolverManager::new(unit_square(2, 2, 1), &s).unwrap_err();
    match err {
        SolveError::Config(ConfigError::MissingSetting(name)) => {
            assert!(name.contains("mu"));
        }
        other => panic!("expected missing-setting error, got {other}"),
    }
}

#[test]
fn boundary_condition_without_value_is_fatal_at_startup() {
    let mut s = thermal_settings();
    // A weak Dirichlet side with no value expression.
    s.sublist_mut("Physics")
        .sublist_mut("Boundary Conditions")
        .sublist_mut("T")
        .sublist_mut("left")
        .set_str("type", "weak Dirichlet");

    let err = SolverManager::new(unit_square(2, 2, 1), &s).unwrap_err();
    match err {
        SolveError::Config(ConfigError::MissingSetting(name)) => {
            assert!(name.contains("left"));
            assert!(name.contains("value"));
        }
        other => panic!("expected missing-setting error, got {other}"),
    }
}

#[test]
fn interface_condition_needs_no_value() {
    // The mortar trace supplies interface data, so the value entry is
    // genuinely optional there.
    let mut s = thermal_settings();
    s.sublist_mut("Physics")
        .sublist_mut("Boundary Conditions")
        .sublist_mut("T")
        .sublist_mut("right")
        .set_str("type", "interface");
    set_bc(&mut s, "T", "left", "strong Dirichlet", "0.0");

    assert!(SolverManager::new(unit_square(2, 2, 1), &s).is_ok());
}

#[test]
fn unknown_physics_module_is_rejected() {
    let mut s = thermal_settings();
    s.sublist_mut("Physics")
        .set_str_list("modules", vec!["plasma".to_string()]);
    let err = SolverManager::new(unit_square(2, 2, 1), &s).unwrap_err();
    assert!(matches!(
        err,
        SolveError::Config(ConfigError::UnknownPhysics(_))
    ));
}

#[test]
fn dirichlet_on_unknown_side_set_is_rejected() {
    let mut s = thermal_settings();
    set_bc(&mut s, "T", "outer rim", "strong Dirichlet", "0.0");
    let err = SolverManager::new(unit_square(2, 2, 1), &s).unwrap_err();
    assert!(matches!(err, SolveError::Consistency(_)));
}

#[test]
fn iteration_cap_reports_recoverable_nonconvergence() {
    let mut s = thermal_settings();
    {
        let functions = s.sublist_mut("Functions");
        // Strongly nonlinear diffusivity with a tight budget.
        functions.set_str("thermal diffusion", "1 + 20*T^2");
        functions.set_str("thermal source", "50.0");
    }
    {
        let solver = s.sublist_mut("Solver");
        solver.set_int("MaxNLiter", 1);
        solver.set_real("NLtol", 1e-14);
    }
    for side in ["left", "right", "bottom", "top"] {
        set_bc(&mut s, "T", side, "strong Dirichlet", "0.0");
    }

    let mut solver = SolverManager::new(unit_square(3, 3, 1), &s).unwrap();
    let err = solver.forward_solve().unwrap_err();
    assert!(matches!(err, SolveError::NonlinearNonConvergence { .. }));
}

#[test]
fn pointwise_response_measures_sensor_misfit() {
    let mut mesh = unit_square(3, 3, 1);
    let ne = mesh.num_elements();
    let mut have = vec![0.0; ne];
    let mut sx = vec![0.0; ne];
    let mut sy = vec![0.0; ne];
    let mut meas = vec![0.0; ne];
    // One sensor in the first element, reading far from the solution.
    have[0] = 1.0;
    sx[0] = 0.1;
    sy[0] = 0.1;
    meas[0] = 3.0;
    mesh.set_element_data("have sensor", have);
    mesh.set_element_data("sensor x", sx);
    mesh.set_element_data("sensor y", sy);
    mesh.set_element_data("measurement", meas);

    let mut s = thermal_settings();
    s.sublist_mut("Functions").set_str("thermal source", "1.0");
    for side in ["left", "right", "bottom", "top"] {
        set_bc(&mut s, "T", side, "strong Dirichlet", "0.0");
    }
    {
        let pp = s.sublist_mut("Postprocess");
        pp.set_str("response type", "pointwise");
        pp.set_bool("compute objective", true);
        pp.set_str("response variable", "T");
    }

    let mut solver = SolverManager::new(mesh, &s).unwrap();
    assert_eq!(solver.postprocessor.sensors.len(), 1);
    solver.forward_solve().unwrap();
    let objective = solver.objective().unwrap();

    // Solution stays well below 3, so the misfit is order (3 - u)^2.
    assert!(objective > 7.0 && objective < 9.5, "objective {objective}");
}

#[test]
fn regularization_adds_to_the_objective() {
    let make = |weight: f64| -> f64 {
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
            field.set_str("source", "1 + 0.2*x");
            if weight > 0.0 {
                let regs = field.sublist_mut("regularization");
                let r0 = regs.sublist_mut("r0");
                r0.set_str("type", "L2");
                r0.set_real("weight", weight);
                let r1 = regs.sublist_mut("r1");
                r1.set_str("type", "TV");
                r1.set_real("weight", weight);
                let r2 = regs.sublist_mut("r2");
                r2.set_str("type", "L1");
                r2.set_real("weight", weight);
                r2.set_str("boundary", "left");
            }
        }
        for side in ["left", "right", "bottom", "top"] {
            set_bc(&mut s, "T", side, "strong Dirichlet", "0.0");
        }
        {
            let pp = s.sublist_mut("Postprocess");
            pp.set_str("response type", "global");
            pp.set_bool("compute objective", true);
            pp.set_str("objective", "T^2");
        }
        let mut solver = SolverManager::new(unit_square(3, 3, 1), &s).unwrap();
        solver.forward_solve().unwrap();
        solver.objective().unwrap()
    };

    let plain = make(0.0);
    let regularized = make(1e-2);
    assert!(
        regularized > plain,
        "regularization should increase the objective: {plain} vs {regularized}"
    );
}
