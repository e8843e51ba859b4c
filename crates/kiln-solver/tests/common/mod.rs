//! Shared builders for the end-to-end scenarios.

use kiln_model::Settings;

/// Baseline thermal configuration: steady, strong Dirichlet enforcement,
/// near-exact ILU so linear-solve error stays below the test tolerances.
pub fn thermal_settings() -> Settings {
    let mut s = Settings::new();
    {
        let solver = s.sublist_mut("Solver");
        solver.set_str("solver", "steady-state");
        solver.set_real("NLtol", 1e-12);
        solver.set_int("MaxNLiter", 10);
        solver.set_real("lintol", 1e-13);
        solver.set_int("liniter", 500);
        solver.set_str("preconditioner", "ilu");
        solver.set_real("dropTol", 0.0);
        solver.set_real("fillParam", 1.0e6);
        solver.set_bool("use strong DBCs", true);
    }
    {
        let physics = s.sublist_mut("Physics");
        physics.set_str_list("modules", vec!["thermal".to_string()]);
        physics.set_real("form_param", 1.0);
    }
    {
        let functions = s.sublist_mut("Functions");
        functions.set_str("density", "1.0");
        functions.set_str("specific heat", "1.0");
        functions.set_str("thermal diffusion", "1.0");
        functions.set_str("thermal source", "0.0");
    }
    s
}

/// Add a boundary condition for variable `var` on a side set.
pub fn set_bc(s: &mut Settings, var: &str, sideset: &str, kind: &str, value: &str) {
    let bc = s
        .sublist_mut("Physics")
        .sublist_mut("Boundary Conditions")
        .sublist_mut(var)
        .sublist_mut(sideset);
    bc.set_str("type", kind);
    bc.set_str("value", value);
}

/// Deterministic pseudo-random sequence for test states.
pub fn pseudo_random(n: usize, seed: u64) -> Vec<f64> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 11) as f64 / (1u64 << 53) as f64) - 0.5
        })
        .collect()
}
