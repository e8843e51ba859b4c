//! Cells: batches of like elements with their geometry tables, dof index
//! tables, gathers, and AD extraction/scatter.
//!
//! A cell exclusively owns its node and index arrays; the workset it binds
//! to is shared by all cells of the block. Invariant: the local index table
//! is the inverse of the global-to-local map restricted to
//! overlapping-owned indices (checked at construction).

use std::sync::Arc;

use kiln_la::{DistMatrix, DistVector};
use kiln_model::{CellTopology, Mesh};

use crate::disc::{self, Basis};
use crate::dofs::BlockDofs;
use crate::error::AssemblyError;
use crate::workset::{BasisTables, CellGeometry, SideGeometry, Workset};
use crate::{EvalScalar, MAX_DERIVS};

/// Which local solution field a gather fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherKind {
    Soln,
    SolnDot,
    Adjoint,
    AdjointDot,
    AdjointPrev,
    Param,
    Aux,
}

/// Derivative seeding applied during a gather.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeedMode {
    None,
    /// Seed slot j with unit derivative (Jacobian pass).
    Dofs,
    /// Seed slot j with the given scale (du_dot/du = alpha).
    DofsScaled(f64),
    /// Seed discretized-parameter slots after the dof and scalar slots.
    ParamDofs,
}

/// Quadrature points per axis for a basis order.
fn quad_points(order: usize) -> usize {
    order + 1
}

/// Build volume geometry tables for a batch of elements.
pub fn build_cell_geometry(
    topo: CellTopology,
    bases: &[Basis],
    coords: &[Vec<[f64; 3]>],
) -> Result<CellGeometry, AssemblyError> {
    let dim = topo.dim();
    let max_order = bases.iter().map(|b| b.order).max().unwrap_or(1);
    let rule = disc::volume_rule(topo, quad_points(max_order));
    let nq = rule.points.len();
    let ne = coords.len();

    let mut ip = vec![[0.0; 3]; ne * nq];
    let mut wts = vec![0.0; ne * nq];
    let mut h = vec![0.0; ne];

    // Reference values are shared across elements.
    let ref_vals: Vec<Vec<Vec<f64>>> = bases
        .iter()
        .map(|b| rule.points.iter().map(|&p| b.eval(p)).collect())
        .collect();
    let ref_grads: Vec<Vec<Vec<[f64; 3]>>> = bases
        .iter()
        .map(|b| rule.points.iter().map(|&p| b.eval_grad(p)).collect())
        .collect();

    let mut tables: Vec<BasisTables> = bases
        .iter()
        .map(|b| BasisTables::zeros(ne, b.num_basis(), nq))
        .collect();

    for e in 0..ne {
        let mut volume = 0.0;
        for (k, &pt) in rule.points.iter().enumerate() {
            let g = disc::eval_geometry(topo, &coords[e], pt)?;
            let w = rule.weights[k] * g.det;
            ip[e * nq + k] = g.x;
            wts[e * nq + k] = w;
            volume += w;

            for (bi, basis) in bases.iter().enumerate() {
                for i in 0..basis.num_basis() {
                    tables[bi].set(e, i, k, ref_vals[bi][k][i], w);
                    let pg = disc::physical_grad(&g, ref_grads[bi][k][i]);
                    tables[bi].set_grad(e, i, k, pg, w);
                }
            }
        }
        h[e] = volume.powf(1.0 / dim as f64);
    }

    Ok(CellGeometry {
        num_elems: ne,
        num_ip: nq,
        ip,
        wts,
        h,
        basis: tables,
    })
}

/// Build side geometry tables for a batch of (element, side) entries.
pub fn build_side_geometry(
    topo: CellTopology,
    bases: &[Basis],
    coords: &[Vec<[f64; 3]>],
    sides: &[usize],
) -> Result<SideGeometry, AssemblyError> {
    let dim = topo.dim();
    let max_order = bases.iter().map(|b| b.order).max().unwrap_or(1);
    let npts = quad_points(max_order);
    let ne = coords.len();
    let nq = disc::side_rule(topo, 0, npts).points.len();

    let mut ip = vec![[0.0; 3]; ne * nq];
    let mut wts = vec![0.0; ne * nq];
    let mut normals = vec![[0.0; 3]; ne * nq];
    let mut h = vec![0.0; ne];
    let mut tables: Vec<BasisTables> = bases
        .iter()
        .map(|b| BasisTables::zeros(ne, b.num_basis(), nq))
        .collect();

    let volume_rule = disc::volume_rule(topo, npts);

    for e in 0..ne {
        let rule = disc::side_rule(topo, sides[e], npts);

        let mut volume = 0.0;
        for (k, &pt) in volume_rule.points.iter().enumerate() {
            let g = disc::eval_geometry(topo, &coords[e], pt)?;
            volume += volume_rule.weights[k] * g.det;
        }
        h[e] = volume.powf(1.0 / dim as f64);

        for (k, &pt) in rule.points.iter().enumerate() {
            let g = disc::eval_geometry(topo, &coords[e], pt)?;
            let (measure, normal) = disc::side_measure_normal(topo, &g, sides[e]);
            let w = rule.weights[k] * measure;
            ip[e * nq + k] = g.x;
            wts[e * nq + k] = w;
            normals[e * nq + k] = normal;

            for (bi, basis) in bases.iter().enumerate() {
                let vals = basis.eval(pt);
                let grads = basis.eval_grad(pt);
                for i in 0..basis.num_basis() {
                    tables[bi].set(e, i, k, vals[i], w);
                    let pg = disc::physical_grad(&g, grads[i]);
                    tables[bi].set_grad(e, i, k, pg, w);
                }
            }
        }
    }

    Ok(SideGeometry {
        num_entries: ne,
        num_ip: nq,
        ip,
        wts,
        normals,
        h,
        basis: tables,
    })
}

/// Discretized-parameter index tables of a cell.
#[derive(Debug, Clone)]
pub struct ParamTables {
    pub basis: Basis,
    pub gids: Vec<Vec<u64>>,
    pub index: Vec<Vec<usize>>,
}

/// A batch of contiguous elements of one block.
#[derive(Debug, Clone)]
pub struct Cell {
    pub block: usize,
    /// Block-local element ids.
    pub elems: Vec<usize>,
    /// Global element ids (block offset applied).
    pub global_elems: Vec<usize>,
    pub nodes: Vec<Vec<[f64; 3]>>,
    /// e -> slot -> dof GID.
    pub gids: Vec<Vec<u64>>,
    /// e -> slot -> overlapped-map LID.
    pub index: Vec<Vec<usize>>,
    pub geom: Arc<CellGeometry>,
    pub params: Option<ParamTables>,
    /// Subgrid model id when this batch is multiscale-coupled.
    pub subgrid: Option<usize>,
}

impl Cell {
    pub fn new(
        block: usize,
        elems: Vec<usize>,
        mesh: &Mesh,
        block_dofs: &BlockDofs,
        overlapped: &kiln_la::Map,
        block_offset: usize,
        params: Option<&crate::params::DiscretizedParam>,
        extra_slots: usize,
    ) -> Result<Self, AssemblyError> {
        let topo = mesh.blocks[block].topology;
        let ndof = block_dofs.num_dofs_per_elem;
        let needed = ndof + extra_slots;
        if needed > MAX_DERIVS {
            return Err(AssemblyError::DerivativeCapacity {
                needed,
                dofs: ndof,
                extra: extra_slots,
                capacity: MAX_DERIVS,
            });
        }

        let mut nodes = Vec::with_capacity(elems.len());
        let mut gids = Vec::with_capacity(elems.len());
        let mut index = Vec::with_capacity(elems.len());
        for &e in &elems {
            let conn = &mesh.blocks[block].connectivity[e];
            nodes.push(conn.iter().map(|&n| mesh.coords[n]).collect::<Vec<_>>());
            let egids = block_dofs.elem_gids[e].clone();
            let eindex: Vec<usize> = egids
                .iter()
                .map(|&g| {
                    overlapped.lid(g).ok_or_else(|| {
                        AssemblyError::IndexMismatch(format!("gid {g} missing from overlapped map"))
                    })
                })
                .collect::<Result<_, _>>()?;
            gids.push(egids);
            index.push(eindex);
        }

        let geom = Arc::new(build_cell_geometry(topo, &block_dofs.bases, &nodes)?);

        let params = match params {
            Some(disc_param) => {
                let basis = Basis::new(topo, disc_param.order)?;
                if !block_dofs
                    .bases
                    .iter()
                    .any(|b| b.num_basis() == basis.num_basis())
                {
                    return Err(AssemblyError::IndexMismatch(
                        "discretized parameter basis must match a variable basis".to_string(),
                    ));
                }
                let pblock = &disc_param.dofs.blocks[block];
                let mut pgids = Vec::with_capacity(elems.len());
                let mut pindex = Vec::with_capacity(elems.len());
                for &e in &elems {
                    let eg = pblock.elem_gids[e].clone();
                    let ei: Vec<usize> = eg
                        .iter()
                        .map(|&g| {
                            disc_param.dofs.overlapped.lid(g).ok_or_else(|| {
                                AssemblyError::IndexMismatch(format!(
                                    "parameter gid {g} missing from overlapped map"
                                ))
                            })
                        })
                        .collect::<Result<_, _>>()?;
                    pgids.push(eg);
                    pindex.push(ei);
                }
                Some(ParamTables {
                    basis,
                    gids: pgids,
                    index: pindex,
                })
            }
            None => None,
        };

        let global_elems = elems.iter().map(|&e| block_offset + e).collect();

        Ok(Self {
            block,
            elems,
            global_elems,
            nodes,
            gids,
            index,
            geom,
            params,
            subgrid: None,
        })
    }

    pub fn num_elems(&self) -> usize {
        self.elems.len()
    }

    /// Bind this cell's geometry to the workset and zero its accumulators.
    pub fn update_workset(&self, ws: &mut Workset) {
        ws.geom = Some(self.geom.clone());
        ws.side_geom = None;
        ws.reset(self.num_elems(), self.geom.num_ip);
    }

    /// Copy entries of an overlapped global vector into the local solution
    /// fields, interpolating to the quadrature points with AD seeding.
    pub fn gather(&self, ws: &mut Workset, kind: GatherKind, vec: &DistVector, seed: SeedMode) {
        if kind == GatherKind::Param {
            self.gather_param(ws, vec, seed);
            return;
        }
        let ne = self.num_elems();
        let nq = self.geom.num_ip;
        let nvars = ws.num_vars();
        let with_grad = matches!(kind, GatherKind::Soln | GatherKind::Adjoint);

        for v in 0..nvars {
            let tables = &self.geom.basis[v];
            let nb = tables.num_basis;
            let mut field = vec![EvalScalar::zero(); ne * nq];
            let mut gradient = if with_grad {
                vec![[EvalScalar::zero(); 3]; ne * nq]
            } else {
                Vec::new()
            };

            for e in 0..ne {
                for i in 0..nb {
                    let slot = ws.offsets[v][i];
                    let raw = vec.local(self.index[e][slot]);
                    let coeff = seed_coeff(raw, slot, seed);
                    for k in 0..nq {
                        let p = e * nq + k;
                        field[p] += coeff * tables.val(e, i, k);
                        if with_grad {
                            for d in 0..3 {
                                gradient[p][d] += coeff * tables.gradv(e, i, k, d);
                            }
                        }
                    }
                }
            }

            match kind {
                GatherKind::Soln => {
                    ws.soln[v] = field;
                    ws.soln_grad[v] = gradient;
                }
                GatherKind::SolnDot => ws.soln_dot[v] = field,
                GatherKind::Adjoint => {
                    ws.adj[v] = field;
                    // Adjoint gradients share the soln_grad shape but are
                    // kept separately from the forward state.
                    let _ = gradient;
                }
                GatherKind::AdjointDot => ws.adj_dot[v] = field,
                GatherKind::AdjointPrev => ws.adj_prev[v] = field,
                GatherKind::Aux => ws.aux[v] = field,
                GatherKind::Param => unreachable!(),
            }
        }
    }

    fn gather_param(&self, ws: &mut Workset, vec: &DistVector, seed: SeedMode) {
        let Some(pt) = &self.params else {
            return;
        };
        let ne = self.num_elems();
        let nq = self.geom.num_ip;
        let nb = pt.basis.num_basis();
        // Parameter interpolation uses the matching-order variable tables
        // when available, else reference evaluation on the volume rule.
        let tables = self
            .geom
            .basis
            .iter()
            .find(|t| t.num_basis == nb)
            .expect("a variable shares the parameter basis");

        let base = ws.param_dof_seed_base;
        let mut field = vec![EvalScalar::zero(); ne * nq];
        for e in 0..ne {
            for i in 0..nb {
                let raw = vec.local(pt.index[e][i]);
                let coeff = match seed {
                    SeedMode::ParamDofs => EvalScalar::seeded(raw, base + i),
                    _ => EvalScalar::constant(raw),
                };
                for k in 0..nq {
                    field[e * nq + k] += coeff * tables.val(e, i, k);
                }
            }
        }
        if ws.param_fields.is_empty() {
            ws.param_fields.push(field);
        } else {
            ws.param_fields[0] = field;
        }
    }

    /// Scatter the residual values into the overlapped global residual.
    pub fn scatter_residual(
        &self,
        ws: &Workset,
        res: &mut DistVector,
    ) -> Result<(), AssemblyError> {
        for e in 0..self.num_elems() {
            for (slot, &gid) in self.gids[e].iter().enumerate() {
                res.sum_into_global(gid, ws.res[ws.res_index(e, slot)].val())?;
            }
        }
        Ok(())
    }

    /// Scatter the Jacobian block (derivative slots [0, num_dofs)) into the
    /// overlapped matrix, one batched row insertion per dof.
    pub fn scatter_jacobian(
        &self,
        ws: &Workset,
        mat: &mut DistMatrix,
    ) -> Result<(), AssemblyError> {
        let ndof = ws.num_dofs;
        let mut vals = vec![0.0; ndof];
        for e in 0..self.num_elems() {
            for (slot, &gid) in self.gids[e].iter().enumerate() {
                let r = ws.res[ws.res_index(e, slot)];
                for (j, v) in vals.iter_mut().enumerate() {
                    *v = r.dx(j);
                }
                mat.sum_into_global(gid, &self.gids[e], &vals)?;
            }
        }
        Ok(())
    }

    /// Extract the active scalar-parameter sensitivities (slots
    /// [num_dofs, num_dofs + num_active)) into per-parameter vectors.
    pub fn scatter_param_sens(
        &self,
        ws: &Workset,
        out: &mut [DistVector],
    ) -> Result<(), AssemblyError> {
        let base = ws.param_seed_base;
        for e in 0..self.num_elems() {
            for (slot, &gid) in self.gids[e].iter().enumerate() {
                let r = ws.res[ws.res_index(e, slot)];
                for (p, vec) in out.iter_mut().enumerate() {
                    vec.sum_into_global(gid, r.dx(base + p))?;
                }
            }
        }
        Ok(())
    }

    /// Scatter the rectangular dR/dp block (discretized-parameter slots)
    /// into a matrix over (dof rows, parameter columns).
    pub fn scatter_param_jacobian(
        &self,
        ws: &Workset,
        mat: &mut DistMatrix,
    ) -> Result<(), AssemblyError> {
        let Some(pt) = &self.params else {
            return Ok(());
        };
        let base = ws.param_dof_seed_base;
        let nb = pt.basis.num_basis();
        let mut vals = vec![0.0; nb];
        for e in 0..self.num_elems() {
            for (slot, &gid) in self.gids[e].iter().enumerate() {
                let r = ws.res[ws.res_index(e, slot)];
                for (j, v) in vals.iter_mut().enumerate() {
                    *v = r.dx(base + j);
                }
                mat.sum_into_global(gid, &pt.gids[e], &vals)?;
            }
        }
        Ok(())
    }
}

/// A batch of (element, side) entries of one block and side set.
#[derive(Debug, Clone)]
pub struct BoundaryCell {
    pub block: usize,
    pub sideset_id: usize,
    pub sideset: String,
    /// (block-local element, side) entries.
    pub entries: Vec<(usize, usize)>,
    pub gids: Vec<Vec<u64>>,
    pub index: Vec<Vec<usize>>,
    pub geom: Arc<SideGeometry>,
    /// Per (entry, variable) side tags {kind, sideset id, aux, aux}.
    pub side_info: Vec<[i32; 4]>,
    pub params: Option<ParamTables>,
}

impl BoundaryCell {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block: usize,
        sideset_id: usize,
        sideset: String,
        entries: Vec<(usize, usize)>,
        mesh: &Mesh,
        block_dofs: &BlockDofs,
        overlapped: &kiln_la::Map,
        side_info: Vec<[i32; 4]>,
        disc_param: Option<&crate::params::DiscretizedParam>,
    ) -> Result<Self, AssemblyError> {
        let topo = mesh.blocks[block].topology;
        let mut coords = Vec::with_capacity(entries.len());
        let mut sides = Vec::with_capacity(entries.len());
        let mut gids = Vec::with_capacity(entries.len());
        let mut index = Vec::with_capacity(entries.len());
        for &(e, s) in &entries {
            let conn = &mesh.blocks[block].connectivity[e];
            coords.push(conn.iter().map(|&n| mesh.coords[n]).collect::<Vec<_>>());
            sides.push(s);
            let egids = block_dofs.elem_gids[e].clone();
            let eindex: Vec<usize> = egids
                .iter()
                .map(|&g| {
                    overlapped.lid(g).ok_or_else(|| {
                        AssemblyError::IndexMismatch(format!("gid {g} missing from overlapped map"))
                    })
                })
                .collect::<Result<_, _>>()?;
            gids.push(egids);
            index.push(eindex);
        }

        let geom = Arc::new(build_side_geometry(
            topo,
            &block_dofs.bases,
            &coords,
            &sides,
        )?);

        let params = match disc_param {
            Some(dp) => {
                let basis = Basis::new(topo, dp.order)?;
                let pblock = &dp.dofs.blocks[block];
                let mut pgids = Vec::with_capacity(entries.len());
                let mut pindex = Vec::with_capacity(entries.len());
                for &(e, _) in &entries {
                    let eg = pblock.elem_gids[e].clone();
                    let ei: Vec<usize> = eg
                        .iter()
                        .map(|&g| {
                            dp.dofs.overlapped.lid(g).ok_or_else(|| {
                                AssemblyError::IndexMismatch(format!(
                                    "parameter gid {g} missing from overlapped map"
                                ))
                            })
                        })
                        .collect::<Result<_, _>>()?;
                    pgids.push(eg);
                    pindex.push(ei);
                }
                Some(ParamTables {
                    basis,
                    gids: pgids,
                    index: pindex,
                })
            }
            None => None,
        };

        Ok(Self {
            block,
            sideset_id,
            sideset,
            entries,
            gids,
            index,
            geom,
            side_info,
            params,
        })
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn update_workset(&self, ws: &mut Workset) {
        ws.geom = None;
        ws.side_geom = Some(self.geom.clone());
        ws.sideset = self.sideset.clone();
        ws.side_info = self.side_info.clone();
        ws.reset(self.num_entries(), self.geom.num_ip);
    }

    /// Side-point gather of a global field, with the same seeding rules as
    /// the volume gather.
    pub fn gather(&self, ws: &mut Workset, kind: GatherKind, vec: &DistVector, seed: SeedMode) {
        if kind == GatherKind::Param {
            self.gather_param(ws, vec, seed);
            return;
        }
        let ne = self.num_entries();
        let nq = self.geom.num_ip;
        let nvars = ws.num_vars();

        for v in 0..nvars {
            let tables = &self.geom.basis[v];
            let nb = tables.num_basis;
            let mut field = vec![EvalScalar::zero(); ne * nq];
            let mut gradient = vec![[EvalScalar::zero(); 3]; ne * nq];

            for e in 0..ne {
                for i in 0..nb {
                    let slot = ws.offsets[v][i];
                    let raw = vec.local(self.index[e][slot]);
                    let coeff = seed_coeff(raw, slot, seed);
                    for k in 0..nq {
                        let p = e * nq + k;
                        field[p] += coeff * tables.val(e, i, k);
                        for d in 0..3 {
                            gradient[p][d] += coeff * tables.gradv(e, i, k, d);
                        }
                    }
                }
            }

            match kind {
                GatherKind::Soln => {
                    ws.soln[v] = field;
                    ws.soln_grad[v] = gradient;
                }
                GatherKind::SolnDot => ws.soln_dot[v] = field,
                GatherKind::Adjoint => ws.adj[v] = field,
                GatherKind::AdjointDot => ws.adj_dot[v] = field,
                GatherKind::AdjointPrev => ws.adj_prev[v] = field,
                GatherKind::Aux => ws.aux[v] = field,
                GatherKind::Param => unreachable!(),
            }
        }
    }

    fn gather_param(&self, ws: &mut Workset, vec: &DistVector, seed: SeedMode) {
        let Some(pt) = &self.params else {
            return;
        };
        let ne = self.num_entries();
        let nq = self.geom.num_ip;
        let nb = pt.basis.num_basis();
        let tables = self
            .geom
            .basis
            .iter()
            .find(|t| t.num_basis == nb)
            .expect("a variable shares the parameter basis");

        let base = ws.param_dof_seed_base;
        let mut field = vec![EvalScalar::zero(); ne * nq];
        for e in 0..ne {
            for i in 0..nb {
                let raw = vec.local(pt.index[e][i]);
                let coeff = match seed {
                    SeedMode::ParamDofs => EvalScalar::seeded(raw, base + i),
                    _ => EvalScalar::constant(raw),
                };
                for k in 0..nq {
                    field[e * nq + k] += coeff * tables.val(e, i, k);
                }
            }
        }
        if ws.param_fields.is_empty() {
            ws.param_fields.push(field);
        } else {
            ws.param_fields[0] = field;
        }
    }

    /// Scatter the rectangular dR/dp block of the boundary terms.
    pub fn scatter_param_jacobian(
        &self,
        ws: &Workset,
        mat: &mut DistMatrix,
    ) -> Result<(), AssemblyError> {
        let Some(pt) = &self.params else {
            return Ok(());
        };
        let base = ws.param_dof_seed_base;
        let nb = pt.basis.num_basis();
        let mut vals = vec![0.0; nb];
        for e in 0..self.num_entries() {
            for (slot, &gid) in self.gids[e].iter().enumerate() {
                let r = ws.res[ws.res_index(e, slot)];
                for (j, v) in vals.iter_mut().enumerate() {
                    *v = r.dx(base + j);
                }
                mat.sum_into_global(gid, &pt.gids[e], &vals)?;
            }
        }
        Ok(())
    }

    pub fn scatter_residual(
        &self,
        ws: &Workset,
        res: &mut DistVector,
    ) -> Result<(), AssemblyError> {
        for e in 0..self.num_entries() {
            for (slot, &gid) in self.gids[e].iter().enumerate() {
                res.sum_into_global(gid, ws.res[ws.res_index(e, slot)].val())?;
            }
        }
        Ok(())
    }

    pub fn scatter_jacobian(
        &self,
        ws: &Workset,
        mat: &mut DistMatrix,
    ) -> Result<(), AssemblyError> {
        let ndof = ws.num_dofs;
        let mut vals = vec![0.0; ndof];
        for e in 0..self.num_entries() {
            for (slot, &gid) in self.gids[e].iter().enumerate() {
                let r = ws.res[ws.res_index(e, slot)];
                for (j, v) in vals.iter_mut().enumerate() {
                    *v = r.dx(j);
                }
                mat.sum_into_global(gid, &self.gids[e], &vals)?;
            }
        }
        Ok(())
    }

    pub fn scatter_param_sens(
        &self,
        ws: &Workset,
        out: &mut [DistVector],
    ) -> Result<(), AssemblyError> {
        let base = ws.param_seed_base;
        for e in 0..self.num_entries() {
            for (slot, &gid) in self.gids[e].iter().enumerate() {
                let r = ws.res[ws.res_index(e, slot)];
                for (p, vec) in out.iter_mut().enumerate() {
                    vec.sum_into_global(gid, r.dx(base + p))?;
                }
            }
        }
        Ok(())
    }
}

fn seed_coeff(raw: f64, slot: usize, seed: SeedMode) -> EvalScalar {
    match seed {
        SeedMode::None | SeedMode::ParamDofs => EvalScalar::constant(raw),
        SeedMode::Dofs => EvalScalar::seeded(raw, slot),
        SeedMode::DofsScaled(alpha) => EvalScalar::seeded_scaled(raw, slot, alpha),
    }
}
