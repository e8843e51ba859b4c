//! Parameter manager: scalar, stochastic, discrete, and discretized (field)
//! parameters, AD seeding, and regularization configuration.
//!
//! Active parameters take the derivative slots after the element dofs; the
//! sacadoized copy is regenerated from scratch on every `sacadoize` call.
//! A discretized parameter owns its own dof numbering over the same mesh.

use kiln_la::DistVector;
use kiln_model::{ConsistencyError, Mesh, SettingValue, Settings};

use crate::dofs::{DofManager, Variable};
use crate::error::AssemblyError;
use crate::functions::{FunctionManager, Location};
use crate::EvalScalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamUsage {
    Inactive,
    Active,
    Stochastic,
    Discrete,
    Discretized,
}

impl ParamUsage {
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => ParamUsage::Active,
            "stochastic" => ParamUsage::Stochastic,
            "discrete" => ParamUsage::Discrete,
            "discretized" => ParamUsage::Discretized,
            _ => ParamUsage::Inactive,
        }
    }
}

/// Distribution tag for stochastic parameters (sampling is the driver's
/// business; the engine only carries the description).
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    pub name: String,
    pub p1: f64,
    pub p2: f64,
}

#[derive(Debug, Clone)]
pub struct ScalarParam {
    pub name: String,
    pub usage: ParamUsage,
    pub value: Vec<f64>,
    pub lower: Option<Vec<f64>>,
    pub upper: Option<Vec<f64>>,
    pub distribution: Option<Distribution>,
    /// Admissible set for discrete parameters.
    pub admissible: Option<Vec<f64>>,
    /// Offset into the flattened component array.
    pub flat_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    L1,
    L2,
    Tv,
}

#[derive(Debug, Clone)]
pub struct RegTerm {
    pub kind: RegKind,
    pub weight: f64,
    /// Restrict the quadrature to a side set when present.
    pub boundary: Option<String>,
}

/// A field parameter discretized on the mesh with its own dof numbering.
#[derive(Debug, Clone)]
pub struct DiscretizedParam {
    pub name: String,
    pub order: usize,
    pub dofs: DofManager,
    /// Current coefficients over the owned map.
    pub psol: DistVector,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub regularization: Vec<RegTerm>,
    /// Smoothing width for the L1 and TV integrands.
    pub smoothing_eps: f64,
}

impl DiscretizedParam {
    pub fn num_dofs(&self) -> usize {
        self.dofs.owned.num_local()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterManager {
    pub scalars: Vec<ScalarParam>,
    /// (param index, component) per active derivative slot, in slot order.
    pub active_slots: Vec<(usize, usize)>,
    pub discretized: Option<DiscretizedParam>,
    num_flat: usize,
}

impl ParameterManager {
    /// Build from the `Parameters` settings sublist.
    pub fn from_settings(
        params: Option<&Settings>,
        mesh: &Mesh,
    ) -> Result<Self, AssemblyError> {
        let mut manager = ParameterManager::default();
        let Some(params) = params else {
            return Ok(manager);
        };

        for (name, value) in params.iter() {
            let SettingValue::Sublist(entry) = value else {
                continue;
            };
            let usage = ParamUsage::parse(entry.get_str("usage", "inactive"));
            if usage == ParamUsage::Discretized {
                manager.discretized = Some(build_discretized(name, entry, mesh)?);
                continue;
            }

            let value: Vec<f64> = match entry.get_str("type", "scalar") {
                "vector" => entry
                    .get_real_list("value")
                    .map(|v| v.to_vec())
                    .unwrap_or_default(),
                _ => vec![entry.get_real("value", 0.0)],
            };
            let bounds = |key: &str| -> Result<Option<Vec<f64>>, ConsistencyError> {
                match entry.get(key) {
                    Some(SettingValue::Real(v)) => Ok(Some(vec![*v; value.len()])),
                    Some(SettingValue::RealList(v)) => {
                        if v.len() != value.len() {
                            return Err(ConsistencyError::BoundsMismatch {
                                name: name.to_string(),
                                bounds: v.len(),
                                values: value.len(),
                            });
                        }
                        Ok(Some(v.clone()))
                    }
                    _ => Ok(None),
                }
            };
            let lower = bounds("lower").map_err(consistency_to_assembly)?;
            let upper = bounds("upper").map_err(consistency_to_assembly)?;

            let distribution = entry.sublist("distribution").map(|d| Distribution {
                name: d.get_str("name", "uniform").to_string(),
                p1: d.get_real("p1", 0.0),
                p2: d.get_real("p2", 1.0),
            });
            let admissible = entry.get_real_list("admissible").map(|v| v.to_vec());

            let flat_offset = manager.num_flat;
            manager.num_flat += value.len();
            if usage == ParamUsage::Active {
                let idx = manager.scalars.len();
                for c in 0..value.len() {
                    manager.active_slots.push((idx, c));
                }
            }
            manager.scalars.push(ScalarParam {
                name: name.to_string(),
                usage,
                value,
                lower,
                upper,
                distribution,
                admissible,
                flat_offset,
            });
        }
        Ok(manager)
    }

    pub fn num_active(&self) -> usize {
        self.active_slots.len()
    }

    pub fn num_flat(&self) -> usize {
        self.num_flat
    }

    /// Flattened (name, offset, components) list for the function manager.
    pub fn flat_layout(&self) -> Vec<(String, usize, usize)> {
        self.scalars
            .iter()
            .map(|p| (p.name.clone(), p.flat_offset, p.value.len()))
            .collect()
    }

    /// Current values of the active parameters, in slot order.
    pub fn active_values(&self) -> Vec<f64> {
        self.active_slots
            .iter()
            .map(|&(p, c)| self.scalars[p].value[c])
            .collect()
    }

    /// Regenerate the AD copies from scratch. Active parameters are seeded
    /// into slots `base..base + num_active` when `seed_active` is set.
    pub fn sacadoize(&self, seed_active: bool, base: usize) -> Vec<EvalScalar> {
        let mut out = vec![EvalScalar::zero(); self.num_flat];
        for p in &self.scalars {
            for (c, &v) in p.value.iter().enumerate() {
                out[p.flat_offset + c] = EvalScalar::constant(v);
            }
        }
        if seed_active {
            for (slot, &(p, c)) in self.active_slots.iter().enumerate() {
                let param = &self.scalars[p];
                out[param.flat_offset + c] =
                    EvalScalar::seeded(param.value[c], base + slot);
            }
        }
        out
    }

    /// Shared-write transition: replace named parameter values.
    pub fn update_parameters(
        &mut self,
        values: &[f64],
        names: &[&str],
    ) -> Result<(), ConsistencyError> {
        let mut cursor = 0;
        for name in names {
            let param = self
                .scalars
                .iter_mut()
                .find(|p| p.name == *name)
                .ok_or_else(|| ConsistencyError::UnknownParameter(name.to_string()))?;
            let n = param.value.len();
            if cursor + n > values.len() {
                return Err(ConsistencyError::BoundsMismatch {
                    name: name.to_string(),
                    bounds: values.len(),
                    values: cursor + n,
                });
            }
            param.value.copy_from_slice(&values[cursor..cursor + n]);
            cursor += n;
        }
        Ok(())
    }

    /// Replace the discretized-parameter coefficients.
    pub fn update_discretized(&mut self, values: &[f64]) {
        if let Some(disc) = self.discretized.as_mut() {
            for (i, v) in values.iter().enumerate() {
                disc.psol.set_local(i, *v);
            }
        }
    }
}

fn consistency_to_assembly(err: ConsistencyError) -> AssemblyError {
    AssemblyError::IndexMismatch(err.to_string())
}

fn build_discretized(
    name: &str,
    entry: &Settings,
    mesh: &Mesh,
) -> Result<DiscretizedParam, AssemblyError> {
    let order = entry.get_int("order", 1) as usize;
    let block_vars: Vec<Vec<Variable>> = mesh
        .blocks
        .iter()
        .map(|_| {
            vec![Variable {
                name: name.to_string(),
                order,
            }]
        })
        .collect();
    let dofs = DofManager::build(mesh, &block_vars)?;
    let n = dofs.owned.num_local();

    let mut psol = DistVector::new(dofs.owned.clone());
    if let Some(source) = entry.get("source") {
        if let SettingValue::Str(expr) = source {
            let mut fm = FunctionManager::new(Vec::new(), Vec::new(), Vec::new());
            fm.register(name, expr, Location::Ip)?;
            let pts: Vec<[f64; 3]> = (0..n)
                .map(|lid| {
                    let node = dofs.owned.gid(lid) as usize;
                    mesh.coords[node]
                })
                .collect();
            let vals = fm.get(name, Location::Ip)?.eval_at_points(&pts, 0.0, &[])?;
            for (lid, v) in vals.into_iter().enumerate() {
                psol.set_local(lid, v);
            }
        }
    }

    let bound_vec = |key: &str, default: f64| -> Result<Vec<f64>, AssemblyError> {
        match entry.get(key) {
            Some(SettingValue::Real(v)) => Ok(vec![*v; n]),
            Some(SettingValue::RealList(v)) => {
                if v.len() != n {
                    return Err(consistency_to_assembly(ConsistencyError::BoundsMismatch {
                        name: name.to_string(),
                        bounds: v.len(),
                        values: n,
                    }));
                }
                Ok(v.clone())
            }
            _ => Ok(vec![default; n]),
        }
    };
    let lower = bound_vec("lower", f64::NEG_INFINITY)?;
    let upper = bound_vec("upper", f64::INFINITY)?;

    let mut regularization = Vec::new();
    if let Some(regs) = entry.sublist("regularization") {
        for (_, reg) in regs.iter() {
            if let SettingValue::Sublist(r) = reg {
                let kind = match r.get_str("type", "L2") {
                    "L1" => RegKind::L1,
                    "TV" => RegKind::Tv,
                    _ => RegKind::L2,
                };
                regularization.push(RegTerm {
                    kind,
                    weight: r.get_real("weight", 1.0),
                    boundary: match r.get_str("boundary", "") {
                        "" => None,
                        s => Some(s.to_string()),
                    },
                });
            }
        }
    }

    Ok(DiscretizedParam {
        name: name.to_string(),
        order,
        dofs,
        psol,
        lower,
        upper,
        regularization,
        smoothing_eps: entry.get_real("smoothing eps", 1e-8),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_model::mesh::unit_square;

    fn settings_with_params() -> Settings {
        let mut s = Settings::new();
        let p = s.sublist_mut("Parameters");
        {
            let kappa = p.sublist_mut("kappa");
            kappa.set_str("type", "scalar");
            kappa.set_str("usage", "active");
            kappa.set_real("value", 2.5);
            kappa.set_real("lower", 0.1);
            kappa.set_real("upper", 10.0);
        }
        {
            let src = p.sublist_mut("source_mag");
            src.set_str("type", "vector");
            src.set_str("usage", "inactive");
            src.set_real_list("value", vec![1.0, 2.0]);
        }
        {
            let xi = p.sublist_mut("xi");
            xi.set_str("type", "scalar");
            xi.set_str("usage", "stochastic");
            xi.set_real("value", 0.0);
            let d = xi.sublist_mut("distribution");
            d.set_str("name", "normal");
            d.set_real("p1", 0.0);
            d.set_real("p2", 1.0);
        }
        s
    }

    #[test]
    fn builds_flat_layout_and_active_slots() {
        let mesh = unit_square(2, 2, 1);
        let s = settings_with_params();
        let pm = ParameterManager::from_settings(s.sublist("Parameters"), &mesh).unwrap();

        assert_eq!(pm.scalars.len(), 3);
        assert_eq!(pm.num_flat(), 4);
        assert_eq!(pm.num_active(), 1);
        assert_eq!(pm.active_values(), vec![2.5]);
        let layout = pm.flat_layout();
        assert!(layout.contains(&("source_mag".to_string(), 1, 2)));
        assert_eq!(
            pm.scalars.iter().find(|p| p.name == "xi").unwrap().usage,
            ParamUsage::Stochastic
        );
    }

    #[test]
    fn sacadoize_seeds_active_slots_only() {
        let mesh = unit_square(1, 1, 1);
        let s = settings_with_params();
        let pm = ParameterManager::from_settings(s.sublist("Parameters"), &mesh).unwrap();

        let base = 8;
        let ad = pm.sacadoize(true, base);
        // kappa (flat 0) seeded at slot base; the rest constant.
        assert_eq!(ad[0].val(), 2.5);
        assert_eq!(ad[0].dx(base), 1.0);
        assert_eq!(ad[1].dx(base), 0.0);

        let ad0 = pm.sacadoize(false, base);
        assert_eq!(ad0[0].dx(base), 0.0);
    }

    #[test]
    fn update_parameters_by_name() {
        let mesh = unit_square(1, 1, 1);
        let s = settings_with_params();
        let mut pm = ParameterManager::from_settings(s.sublist("Parameters"), &mesh).unwrap();

        pm.update_parameters(&[5.0], &["kappa"]).unwrap();
        assert_eq!(pm.active_values(), vec![5.0]);
        assert!(matches!(
            pm.update_parameters(&[1.0], &["nope"]),
            Err(ConsistencyError::UnknownParameter(_))
        ));
    }

    #[test]
    fn bounds_length_mismatch_is_rejected() {
        let mesh = unit_square(1, 1, 1);
        let mut s = Settings::new();
        let p = s.sublist_mut("Parameters");
        let bad = p.sublist_mut("v");
        bad.set_str("type", "vector");
        bad.set_str("usage", "inactive");
        bad.set_real_list("value", vec![1.0, 2.0, 3.0]);
        bad.set_real_list("lower", vec![0.0]);
        assert!(ParameterManager::from_settings(s.sublist("Parameters"), &mesh).is_err());
    }

    #[test]
    fn discretized_parameter_gets_own_numbering() {
        let mesh = unit_square(2, 2, 1);
        let mut s = Settings::new();
        let p = s.sublist_mut("Parameters");
        let field = p.sublist_mut("kfield");
        field.set_str("usage", "discretized");
        field.set_int("order", 1);
        field.set_str("source", "1 + 0.5*x");
        let regs = field.sublist_mut("regularization");
        let r0 = regs.sublist_mut("r0");
        r0.set_str("type", "L2");
        r0.set_real("weight", 1e-2);

        let pm = ParameterManager::from_settings(s.sublist("Parameters"), &mesh).unwrap();
        let disc = pm.discretized.as_ref().unwrap();
        assert_eq!(disc.num_dofs(), 9);
        assert_eq!(disc.regularization.len(), 1);
        // Initial field interpolates the source expression at the nodes.
        let node4 = disc.psol.get_global(4).unwrap();
        let x4 = mesh.coords[4][0];
        assert!((node4 - (1.0 + 0.5 * x4)).abs() < 1e-14);
    }
}
