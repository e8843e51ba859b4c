//! Responses, objectives, and objective gradients.
//!
//! Two response types: `global` integrates a registered expression over the
//! volume; `pointwise` sums squared misfits at sensor locations carried as
//! element data. Both produce the objective value, its derivative with
//! respect to the solution (the adjoint right-hand side), and explicit
//! parameter derivatives, through the same AD seeding as the assembler.
//! Regularization of discretized parameters is evaluated here by cell-level
//! quadrature.

use std::io::Write as IoWrite;

use kiln_la::DistVector;
use kiln_model::Settings;

use crate::assembly::{AssembleOptions, AssemblyManager, SolutionState};
use crate::cells::{build_side_geometry, GatherKind, SeedMode};
use crate::disc::{self, Basis};
use crate::error::{AssemblyError, SolveError};
use crate::functions::Location;
use crate::params::RegKind;
use crate::EvalScalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Global,
    Pointwise,
}

/// One sensor: a point inside an element with a reference measurement.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub block: usize,
    pub elem: usize,
    pub ref_pt: [f64; 3],
    pub weight: f64,
    pub measurement: f64,
}

/// Objective evaluation output.
pub struct ObjectiveResult {
    pub value: f64,
    /// dJ/du over the overlapped dof map (export before solving).
    pub djdu: DistVector,
    /// Explicit dJ/dtheta for the active scalar parameters.
    pub djdtheta: Vec<f64>,
    /// Explicit dJ/dp for the discretized parameter, when seeded.
    pub djdp: Option<DistVector>,
}

pub struct Postprocessor {
    pub response_type: ResponseType,
    pub compute_objective: bool,
    pub compute_sensitivities: bool,
    /// Variable sampled by pointwise responses.
    pub response_var: String,
    pub sensors: Vec<Sensor>,
}

impl Postprocessor {
    /// Read the `Postprocess` sublist and register the objective integrand.
    pub fn from_settings(
        settings: &Settings,
        am: &mut AssemblyManager,
    ) -> Result<Self, SolveError> {
        let pp = settings.sublist("Postprocess");
        let (rtype, compute_objective, compute_sensitivities, response_var) = match pp {
            Some(pp) => (
                match pp.get_str("response type", "global") {
                    "pointwise" => ResponseType::Pointwise,
                    _ => ResponseType::Global,
                },
                pp.get_bool("compute objective", false),
                pp.get_bool("compute sensitivities", false),
                pp.get_str("response variable", "T").to_string(),
            ),
            None => (ResponseType::Global, false, false, "T".to_string()),
        };

        if let Some(pp) = pp {
            if let Ok(expr) = pp.require_str("objective") {
                for fm in am.fms.iter_mut() {
                    fm.register("objective", expr, Location::Ip)?;
                }
            }
        }

        let mut sensors = Vec::new();
        if rtype == ResponseType::Pointwise && am.mesh.has_element_data() {
            let have = am.mesh.element_data.get("have sensor");
            let sx = am.mesh.element_data.get("sensor x");
            let sy = am.mesh.element_data.get("sensor y");
            let sz = am.mesh.element_data.get("sensor z");
            let meas = am.mesh.element_data.get("measurement");
            let weight = am.mesh.element_data.get("sensor weight");
            if let (Some(have), Some(sx), Some(meas)) = (have, sx, meas) {
                let offsets = am.mesh.block_offsets();
                for (b, block) in am.mesh.blocks.iter().enumerate() {
                    for e in 0..block.num_elements() {
                        let ge = offsets[b] + e;
                        if have[ge] < 0.5 {
                            continue;
                        }
                        let x = [
                            sx[ge],
                            sy.map(|v| v[ge]).unwrap_or(0.0),
                            sz.map(|v| v[ge]).unwrap_or(0.0),
                        ];
                        let coords: Vec<[f64; 3]> = block.connectivity[e]
                            .iter()
                            .map(|&n| am.mesh.coords[n])
                            .collect();
                        let ref_pt = disc::map_to_reference(block.topology, &coords, x)
                            .map_err(SolveError::Assembly)?;
                        if !disc::in_reference_cell(am.mesh.dim, ref_pt) {
                            log::warn!("sensor at {:?} falls outside element {}", x, ge);
                            continue;
                        }
                        sensors.push(Sensor {
                            block: b,
                            elem: e,
                            ref_pt,
                            weight: weight.map(|v| v[ge]).unwrap_or(1.0),
                            measurement: meas[ge],
                        });
                    }
                }
            }
        }

        Ok(Self {
            response_type: rtype,
            compute_objective,
            compute_sensitivities,
            response_var,
            sensors,
        })
    }

    /// Evaluate the objective with AD seeding: dof slots give dJ/du, the
    /// parameter slots give the explicit dJ/dtheta (and dJ/dp).
    pub fn objective(
        &self,
        am: &mut AssemblyManager,
        state: &SolutionState,
        opts: &AssembleOptions,
    ) -> Result<ObjectiveResult, AssemblyError> {
        let mut value = EvalScalar::zero();
        let mut djdu = DistVector::new(am.dofs.overlapped.clone());
        let num_active = am.params.num_active();
        let mut djdtheta = vec![0.0; num_active];
        let mut djdp = am
            .params
            .discretized
            .as_ref()
            .filter(|_| opts.seed_param_dofs)
            .map(|d| DistVector::new(d.dofs.overlapped.clone()));

        match self.response_type {
            ResponseType::Global => self.global_objective(
                am,
                state,
                opts,
                &mut value,
                &mut djdu,
                &mut djdtheta,
                &mut djdp,
            )?,
            ResponseType::Pointwise => {
                self.pointwise_objective(am, state, &mut value, &mut djdu)?
            }
        }

        let comm = *am.dofs.owned.comm();
        comm.sum_all_slice(&mut djdtheta);
        Ok(ObjectiveResult {
            value: comm.sum_all(value.val()),
            djdu,
            djdtheta,
            djdp,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn global_objective(
        &self,
        am: &mut AssemblyManager,
        state: &SolutionState,
        opts: &AssembleOptions,
        value: &mut EvalScalar,
        djdu: &mut DistVector,
        djdtheta: &mut [f64],
        djdp: &mut Option<DistVector>,
    ) -> Result<(), AssemblyError> {
        let param_seed = if opts.seed_param_dofs {
            SeedMode::ParamDofs
        } else {
            SeedMode::None
        };
        for b in 0..am.mesh.blocks.len() {
            let num_active = am.params.num_active();
            let ws = &mut am.worksets[b];
            ws.time = opts.time;
            ws.seed_params = opts.seed_params;
            ws.param_seed_base = ws.num_dofs;
            ws.param_dof_seed_base = ws.num_dofs + num_active;
            ws.scalar_params = am.params.sacadoize(opts.seed_params, ws.num_dofs);
            let fm = &am.fms[b];

            for cell in &am.cells[b] {
                cell.update_workset(ws);
                cell.gather(ws, GatherKind::Soln, &state.u, SeedMode::Dofs);
                cell.gather(ws, GatherKind::SolnDot, &state.u_dot, SeedMode::None);
                if let (Some(param_state), Some(_)) = (&state.param, &cell.params) {
                    cell.gather(ws, GatherKind::Param, param_state, param_seed);
                }
                let integrand = fm.evaluate("objective", Location::Ip, ws)?;
                let geom = cell.geom.clone();
                let nq = geom.num_ip;

                for e in 0..cell.num_elems() {
                    let mut obj_e = EvalScalar::zero();
                    for k in 0..nq {
                        obj_e += integrand[e * nq + k] * geom.wts[e * nq + k];
                    }
                    for (slot, &gid) in cell.gids[e].iter().enumerate() {
                        djdu.sum_into_global(gid, obj_e.dx(slot))?;
                    }
                    if let (Some(djdp), Some(pt)) = (djdp.as_mut(), &cell.params) {
                        for (i, &gid) in pt.gids[e].iter().enumerate() {
                            djdp.sum_into_global(gid, obj_e.dx(ws.param_dof_seed_base + i))?;
                        }
                    }
                    for (p, out) in djdtheta.iter_mut().enumerate() {
                        *out += obj_e.dx(ws.param_seed_base + p);
                    }
                    *value += EvalScalar::constant(obj_e.val());
                }
            }
        }
        Ok(())
    }

    fn pointwise_objective(
        &self,
        am: &mut AssemblyManager,
        state: &SolutionState,
        value: &mut EvalScalar,
        djdu: &mut DistVector,
    ) -> Result<(), AssemblyError> {
        let var = self.response_var.clone();
        for sensor in &self.sensors {
            let b = sensor.block;
            let block_dofs = &am.dofs.blocks[b];
            let v_local = block_dofs
                .vars
                .iter()
                .position(|v| v.name == var)
                .ok_or_else(|| AssemblyError::UnknownVariable(var.clone()))?;
            let basis = block_dofs.bases[v_local];
            let vals = basis.eval(sensor.ref_pt);

            let mut u_s = EvalScalar::zero();
            for (i, &val) in vals.iter().enumerate() {
                let slot = block_dofs.offsets[v_local][i];
                let gid = block_dofs.elem_gids[sensor.elem][slot];
                let lid = am.dofs.overlapped.lid(gid).ok_or_else(|| {
                    AssemblyError::IndexMismatch(format!("gid {gid} missing from overlapped map"))
                })?;
                u_s += EvalScalar::seeded(state.u.local(lid), i) * val;
            }
            let misfit = u_s - sensor.measurement;
            let obj = misfit * misfit * sensor.weight;
            *value += EvalScalar::constant(obj.val());

            for (i, _) in vals.iter().enumerate() {
                let slot = block_dofs.offsets[v_local][i];
                let gid = block_dofs.elem_gids[sensor.elem][slot];
                djdu.sum_into_global(gid, obj.dx(i))?;
            }
        }
        Ok(())
    }
}

/// Regularization of the discretized parameter: value and gradient by
/// cell-level quadrature, optionally localized to a side set.
pub fn assemble_regularization(
    am: &AssemblyManager,
) -> Result<Option<(f64, DistVector)>, AssemblyError> {
    let Some(disc_param) = am.params.discretized.as_ref() else {
        return Ok(None);
    };
    if disc_param.regularization.is_empty() {
        return Ok(None);
    }
    let eps = disc_param.smoothing_eps;
    let mut total = 0.0;
    let mut grad = DistVector::new(disc_param.dofs.owned.clone());

    for reg in &disc_param.regularization {
        match &reg.boundary {
            None => {
                for block_cells in &am.cells {
                    for cell in block_cells {
                        let Some(pt) = &cell.params else { continue };
                        let nb = pt.basis.num_basis();
                        let tables = cell
                            .geom
                            .basis
                            .iter()
                            .find(|t| t.num_basis == nb)
                            .expect("a variable shares the parameter basis");
                        let nq = cell.geom.num_ip;
                        let dim = am.mesh.dim;

                        for e in 0..cell.num_elems() {
                            let mut reg_e = EvalScalar::zero();
                            for k in 0..nq {
                                let mut p = EvalScalar::zero();
                                let mut gp = [EvalScalar::zero(); 3];
                                for i in 0..nb {
                                    let lid = pt.index[e][i];
                                    let c = EvalScalar::seeded(disc_param.psol.local(lid), i);
                                    p += c * tables.val(e, i, k);
                                    for d in 0..dim {
                                        gp[d] += c * tables.gradv(e, i, k, d);
                                    }
                                }
                                let w = cell.geom.wts[e * nq + k];
                                reg_e += reg_integrand(reg.kind, eps, p, gp, dim) * w;
                            }
                            total += reg.weight * reg_e.val();
                            for (i, &gid) in pt.gids[e].iter().enumerate() {
                                grad.sum_into_global(gid, reg.weight * reg_e.dx(i))?;
                            }
                        }
                    }
                }
            }
            Some(sideset) => {
                let ss = am
                    .mesh
                    .side_set(sideset)
                    .map_err(|e| AssemblyError::IndexMismatch(e.to_string()))?;
                for &(b, e, s) in &ss.sides {
                    let topo = am.mesh.blocks[b].topology;
                    let basis = Basis::new(topo, disc_param.order)?;
                    let coords: Vec<[f64; 3]> = am.mesh.blocks[b].connectivity[e]
                        .iter()
                        .map(|&n| am.mesh.coords[n])
                        .collect();
                    let geom =
                        build_side_geometry(topo, &[basis], &[coords], &[s])?;
                    let tables = &geom.basis[0];
                    let nb = basis.num_basis();
                    let pgids = &disc_param.dofs.blocks[b].elem_gids[e];
                    let dim = am.mesh.dim;

                    let mut reg_e = EvalScalar::zero();
                    for k in 0..geom.num_ip {
                        let mut p = EvalScalar::zero();
                        let mut gp = [EvalScalar::zero(); 3];
                        for i in 0..nb {
                            let lid = disc_param.dofs.owned.lid(pgids[i]).ok_or_else(|| {
                                AssemblyError::IndexMismatch(
                                    "parameter gid missing from owned map".to_string(),
                                )
                            })?;
                            let c = EvalScalar::seeded(disc_param.psol.local(lid), i);
                            p += c * tables.val(0, i, k);
                            for d in 0..dim {
                                gp[d] += c * tables.gradv(0, i, k, d);
                            }
                        }
                        let w = geom.wts[k];
                        reg_e += reg_integrand(reg.kind, eps, p, gp, dim) * w;
                    }
                    total += reg.weight * reg_e.val();
                    for (i, &gid) in pgids.iter().enumerate() {
                        grad.sum_into_global(gid, reg.weight * reg_e.dx(i))?;
                    }
                }
            }
        }
    }
    Ok(Some((total, grad)))
}

fn reg_integrand(
    kind: RegKind,
    eps: f64,
    p: EvalScalar,
    gp: [EvalScalar; 3],
    dim: usize,
) -> EvalScalar {
    match kind {
        RegKind::L2 => p * p * 0.5,
        RegKind::L1 => (p * p + eps).sqrt(),
        RegKind::Tv => {
            let mut g2 = EvalScalar::constant(eps);
            for d in 0..dim {
                g2 += gp[d] * gp[d];
            }
            g2.sqrt()
        }
    }
}

/// Write the gradient as a single line of 16-digit entries (rank 0 only).
pub fn write_sensitivities(
    path: &str,
    gradient: &[f64],
    comm: &kiln_la::Comm,
) -> Result<(), SolveError> {
    if comm.rank() != 0 {
        return Ok(());
    }
    let line = gradient
        .iter()
        .map(|g| format!("{:.16e}", g))
        .collect::<Vec<_>>()
        .join(" ");
    let mut file = std::fs::File::create(path).map_err(|source| SolveError::Io {
        path: path.to_string(),
        source,
    })?;
    writeln!(file, "{}", line).map_err(|source| SolveError::Io {
        path: path.to_string(),
        source,
    })?;
    Ok(())
}
