//! Per-block assembly scratch.
//!
//! One workset exists per element block; every cell of the block resets it,
//! writes its gathered solutions into it, lets the physics modules
//! accumulate the AD residual, and is read back by the assembler. Basis and
//! geometry tables are shared through `Arc` from the owning cell.

use std::sync::Arc;

use crate::EvalScalar;

/// Basis tables for one variable over a batch of elements at a set of
/// evaluation points. `value`/`grad` are plain interpolation tables;
/// `wvalue`/`wgrad` carry the integration weight pre-multiplied for the
/// test-function side of the weak form.
#[derive(Debug, Clone)]
pub struct BasisTables {
    pub num_elems: usize,
    pub num_basis: usize,
    pub num_pts: usize,
    pub value: Vec<f64>,
    pub grad: Vec<f64>,
    pub wvalue: Vec<f64>,
    pub wgrad: Vec<f64>,
}

impl BasisTables {
    pub fn zeros(num_elems: usize, num_basis: usize, num_pts: usize) -> Self {
        let n = num_elems * num_basis * num_pts;
        Self {
            num_elems,
            num_basis,
            num_pts,
            value: vec![0.0; n],
            grad: vec![0.0; 3 * n],
            wvalue: vec![0.0; n],
            wgrad: vec![0.0; 3 * n],
        }
    }

    #[inline]
    fn idx(&self, e: usize, i: usize, k: usize) -> usize {
        (e * self.num_basis + i) * self.num_pts + k
    }

    #[inline]
    pub fn val(&self, e: usize, i: usize, k: usize) -> f64 {
        self.value[self.idx(e, i, k)]
    }

    #[inline]
    pub fn gradv(&self, e: usize, i: usize, k: usize, d: usize) -> f64 {
        self.grad[3 * self.idx(e, i, k) + d]
    }

    #[inline]
    pub fn wval(&self, e: usize, i: usize, k: usize) -> f64 {
        self.wvalue[self.idx(e, i, k)]
    }

    #[inline]
    pub fn wgradv(&self, e: usize, i: usize, k: usize, d: usize) -> f64 {
        self.wgrad[3 * self.idx(e, i, k) + d]
    }

    pub fn set(&mut self, e: usize, i: usize, k: usize, v: f64, w: f64) {
        let idx = self.idx(e, i, k);
        self.value[idx] = v;
        self.wvalue[idx] = v * w;
    }

    pub fn set_grad(&mut self, e: usize, i: usize, k: usize, g: [f64; 3], w: f64) {
        let idx = 3 * self.idx(e, i, k);
        for d in 0..3 {
            self.grad[idx + d] = g[d];
            self.wgrad[idx + d] = g[d] * w;
        }
    }
}

/// Volume geometry of a cell batch: physical quadrature points, weighted
/// measures, element sizes, and per-variable basis tables.
#[derive(Debug, Clone)]
pub struct CellGeometry {
    pub num_elems: usize,
    pub num_ip: usize,
    /// Physical coordinates, (e * num_ip + k).
    pub ip: Vec<[f64; 3]>,
    /// Quadrature weight times jacobian determinant.
    pub wts: Vec<f64>,
    /// Element size h (volume^(1/dim)).
    pub h: Vec<f64>,
    /// Per variable.
    pub basis: Vec<BasisTables>,
}

/// Side geometry of a boundary cell batch.
#[derive(Debug, Clone)]
pub struct SideGeometry {
    pub num_entries: usize,
    pub num_ip: usize,
    pub ip: Vec<[f64; 3]>,
    /// Quadrature weight times side measure.
    pub wts: Vec<f64>,
    pub normals: Vec<[f64; 3]>,
    pub h: Vec<f64>,
    pub basis: Vec<BasisTables>,
}

/// Per-block assembly scratch, reset at the start of each cell contribution.
#[derive(Debug, Clone, Default)]
pub struct Workset {
    pub block: usize,
    pub time: f64,
    pub deltat: f64,
    /// 1/dt-like factor of the time discretization (0 in steady mode).
    pub alpha: f64,
    pub is_adjoint: bool,
    pub is_final_time: bool,
    pub only_residual: bool,
    pub seed_params: bool,
    pub seed_param_dofs: bool,
    /// Nitsche symmetry parameter used when not in adjoint mode.
    pub form_param: f64,

    /// Variables of this block, in per-block index order.
    pub vars: Vec<String>,
    /// Per variable: basis index -> local dof slot.
    pub offsets: Vec<Vec<usize>>,
    pub num_dofs: usize,
    /// First derivative slot of the active scalar parameters.
    pub param_seed_base: usize,
    /// First derivative slot of the discretized parameter dofs.
    pub param_dof_seed_base: usize,

    pub num_elems: usize,
    pub num_ip: usize,

    pub geom: Option<Arc<CellGeometry>>,
    pub side_geom: Option<Arc<SideGeometry>>,
    /// Side-set name of the current boundary pass.
    pub sideset: String,
    /// Per (entry, variable) four-int side tags {kind, sideset, aux, aux}.
    pub side_info: Vec<[i32; 4]>,

    /// Gathered fields at the current evaluation points, per variable.
    pub soln: Vec<Vec<EvalScalar>>,
    pub soln_grad: Vec<Vec<[EvalScalar; 3]>>,
    pub soln_dot: Vec<Vec<EvalScalar>>,
    pub adj: Vec<Vec<EvalScalar>>,
    pub adj_dot: Vec<Vec<EvalScalar>>,
    pub adj_prev: Vec<Vec<EvalScalar>>,
    /// Auxiliary (mortar trace) fields.
    pub aux: Vec<Vec<EvalScalar>>,
    /// Discretized parameter fields at the evaluation points.
    pub param_fields: Vec<Vec<EvalScalar>>,
    /// Sacadoized scalar parameters, flattened component-wise.
    pub scalar_params: Vec<EvalScalar>,

    /// AD residual accumulator, (e * num_dofs + slot).
    pub res: Vec<EvalScalar>,
    /// AD flux accumulator at side points, (e * num_ip + k).
    pub flux: Vec<EvalScalar>,
}

impl Workset {
    pub fn new(block: usize, vars: Vec<String>, offsets: Vec<Vec<usize>>, num_dofs: usize) -> Self {
        let nvars = vars.len();
        Self {
            block,
            vars,
            offsets,
            num_dofs,
            param_seed_base: num_dofs,
            param_dof_seed_base: num_dofs,
            soln: vec![Vec::new(); nvars],
            soln_grad: vec![Vec::new(); nvars],
            soln_dot: vec![Vec::new(); nvars],
            adj: vec![Vec::new(); nvars],
            adj_dot: vec![Vec::new(); nvars],
            adj_prev: vec![Vec::new(); nvars],
            aux: vec![Vec::new(); nvars],
            ..Default::default()
        }
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn var_index(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v == name)
    }

    /// Start a fresh contribution: size and zero the residual accumulator.
    pub fn reset(&mut self, num_elems: usize, num_ip: usize) {
        self.num_elems = num_elems;
        self.num_ip = num_ip;
        self.res.clear();
        self.res
            .resize(num_elems * self.num_dofs, EvalScalar::zero());
        self.flux.clear();
        self.flux
            .resize(num_elems * num_ip * self.vars.len(), EvalScalar::zero());
    }

    #[inline]
    pub fn res_index(&self, e: usize, slot: usize) -> usize {
        e * self.num_dofs + slot
    }

    #[inline]
    pub fn flux_index(&self, e: usize, k: usize, var: usize) -> usize {
        (e * self.num_ip + k) * self.vars.len() + var
    }

    pub fn side_kind(&self, entry: usize, var: usize) -> i32 {
        self.side_info[entry * self.num_vars() + var][0]
    }
}
