//! Reference-element discretization: Gauss-Legendre quadrature, tensor
//! Lagrange (HGRAD) bases of order 1 and 2, and the geometric transforms
//! from reference to physical frame.
//!
//! Local basis ordering is tensor-lexicographic (x fastest) and matches the
//! mesh connectivity ordering, so no permutation tables are needed. Side
//! quadrature points are expressed in the volume reference frame; outward
//! normals are oriented against the fixed reference axis of the side.

use nalgebra::{Matrix3, Vector3};

use kiln_model::CellTopology;

use crate::error::AssemblyError;

/// Quadrature rule in reference coordinates.
#[derive(Debug, Clone)]
pub struct QuadRule {
    pub points: Vec<[f64; 3]>,
    pub weights: Vec<f64>,
}

/// 1-D Gauss-Legendre nodes/weights on [-1, 1].
pub fn gauss_1d(n: usize) -> (Vec<f64>, Vec<f64>) {
    match n {
        1 => (vec![0.0], vec![2.0]),
        2 => {
            let a = 1.0 / 3.0_f64.sqrt();
            (vec![-a, a], vec![1.0, 1.0])
        }
        3 => {
            let a = (3.0_f64 / 5.0).sqrt();
            (vec![-a, 0.0, a], vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0])
        }
        _ => {
            let a = 0.3399810435848563;
            let b = 0.8611363115940526;
            let wa = 0.6521451548625461;
            let wb = 0.3478548451374538;
            (vec![-b, -a, a, b], vec![wb, wa, wa, wb])
        }
    }
}

/// Tensor-product volume rule with `npts` points per axis.
pub fn volume_rule(topo: CellTopology, npts: usize) -> QuadRule {
    let dim = topo.dim();
    let (x, w) = gauss_1d(npts);
    let counts = [npts, if dim > 1 { npts } else { 1 }, if dim > 2 { npts } else { 1 }];
    let mut points = Vec::new();
    let mut weights = Vec::new();
    for kz in 0..counts[2] {
        for ky in 0..counts[1] {
            for kx in 0..counts[0] {
                points.push([
                    x[kx],
                    if dim > 1 { x[ky] } else { 0.0 },
                    if dim > 2 { x[kz] } else { 0.0 },
                ]);
                let mut wt = w[kx];
                if dim > 1 {
                    wt *= w[ky];
                }
                if dim > 2 {
                    wt *= w[kz];
                }
                weights.push(wt);
            }
        }
    }
    QuadRule { points, weights }
}

/// Side rule: the facet tensor rule embedded in the volume reference frame.
pub fn side_rule(topo: CellTopology, side: usize, npts: usize) -> QuadRule {
    let dim = topo.dim();
    let (axis, face) = topo.side_axis_face(side);
    let fixed = if face == 0 { -1.0 } else { 1.0 };

    if dim == 1 {
        return QuadRule {
            points: vec![[fixed, 0.0, 0.0]],
            weights: vec![1.0],
        };
    }

    let (x, w) = gauss_1d(npts);
    let free: Vec<usize> = (0..dim).filter(|&d| d != axis).collect();
    let mut points = Vec::new();
    let mut weights = Vec::new();
    if free.len() == 1 {
        for k in 0..npts {
            let mut p = [0.0; 3];
            p[axis] = fixed;
            p[free[0]] = x[k];
            points.push(p);
            weights.push(w[k]);
        }
    } else {
        for k1 in 0..npts {
            for k0 in 0..npts {
                let mut p = [0.0; 3];
                p[axis] = fixed;
                p[free[0]] = x[k0];
                p[free[1]] = x[k1];
                points.push(p);
                weights.push(w[k0] * w[k1]);
            }
        }
    }
    QuadRule { points, weights }
}

/// HGRAD Lagrange basis of given order on a cell topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Basis {
    pub topology: CellTopology,
    pub order: usize,
}

fn lagrange_1d(order: usize, i: usize, x: f64) -> f64 {
    match (order, i) {
        (1, 0) => 0.5 * (1.0 - x),
        (1, 1) => 0.5 * (1.0 + x),
        (2, 0) => 0.5 * x * (x - 1.0),
        (2, 1) => 1.0 - x * x,
        (2, 2) => 0.5 * x * (x + 1.0),
        _ => unreachable!("unsupported order"),
    }
}

fn lagrange_1d_deriv(order: usize, i: usize, x: f64) -> f64 {
    match (order, i) {
        (1, 0) => -0.5,
        (1, 1) => 0.5,
        (2, 0) => x - 0.5,
        (2, 1) => -2.0 * x,
        (2, 2) => x + 0.5,
        _ => unreachable!("unsupported order"),
    }
}

impl Basis {
    pub fn new(topology: CellTopology, order: usize) -> Result<Self, AssemblyError> {
        if order == 0 || order > topology.order() {
            return Err(AssemblyError::IndexMismatch(format!(
                "basis order {} not supported on {:?}",
                order, topology
            )));
        }
        Ok(Self { topology, order })
    }

    pub fn dim(&self) -> usize {
        self.topology.dim()
    }

    pub fn num_basis(&self) -> usize {
        (self.order + 1).pow(self.dim() as u32)
    }

    fn axis_index(&self, i: usize) -> [usize; 3] {
        let n = self.order + 1;
        let dim = self.dim();
        let ix = i % n;
        let iy = if dim > 1 { (i / n) % n } else { 0 };
        let iz = if dim > 2 { i / (n * n) } else { 0 };
        [ix, iy, iz]
    }

    /// Geometry-node index (in the topology's node list) of each basis
    /// function. Identity when basis order matches the topology; for an
    /// order-1 basis on a quadratic cell the corner nodes are selected.
    pub fn dof_nodes(&self) -> Vec<usize> {
        let tn = self.topology.nodes_per_axis();
        let stride = self.topology.order() / self.order;
        let dim = self.dim();
        (0..self.num_basis())
            .map(|i| {
                let [ix, iy, iz] = self.axis_index(i);
                let gx = ix * stride;
                let gy = iy * stride;
                let gz = iz * stride;
                gx + if dim > 1 { tn * gy } else { 0 }
                    + if dim > 2 { tn * tn * gz } else { 0 }
            })
            .collect()
    }

    /// Basis values at a reference point.
    pub fn eval(&self, pt: [f64; 3]) -> Vec<f64> {
        let dim = self.dim();
        (0..self.num_basis())
            .map(|i| {
                let [ix, iy, iz] = self.axis_index(i);
                let mut v = lagrange_1d(self.order, ix, pt[0]);
                if dim > 1 {
                    v *= lagrange_1d(self.order, iy, pt[1]);
                }
                if dim > 2 {
                    v *= lagrange_1d(self.order, iz, pt[2]);
                }
                v
            })
            .collect()
    }

    /// Reference-frame gradients at a reference point.
    pub fn eval_grad(&self, pt: [f64; 3]) -> Vec<[f64; 3]> {
        let dim = self.dim();
        (0..self.num_basis())
            .map(|i| {
                let [ix, iy, iz] = self.axis_index(i);
                let lx = lagrange_1d(self.order, ix, pt[0]);
                let dx = lagrange_1d_deriv(self.order, ix, pt[0]);
                let (ly, dy) = if dim > 1 {
                    (
                        lagrange_1d(self.order, iy, pt[1]),
                        lagrange_1d_deriv(self.order, iy, pt[1]),
                    )
                } else {
                    (1.0, 0.0)
                };
                let (lz, dz) = if dim > 2 {
                    (
                        lagrange_1d(self.order, iz, pt[2]),
                        lagrange_1d_deriv(self.order, iz, pt[2]),
                    )
                } else {
                    (1.0, 0.0)
                };
                [dx * ly * lz, lx * dy * lz, lx * ly * dz]
            })
            .collect()
    }
}

/// Geometry transform evaluated at one reference point of one element.
#[derive(Debug, Clone)]
pub struct GeomAtPoint {
    pub x: [f64; 3],
    /// jac[(r, d)] = dx_d / dxi_r, padded with identity beyond `dim`.
    pub jac: Matrix3<f64>,
    pub det: f64,
    pub jac_inv: Matrix3<f64>,
}

/// Evaluate the isoparametric map of an element at a reference point.
pub fn eval_geometry(
    topo: CellTopology,
    coords: &[[f64; 3]],
    pt: [f64; 3],
) -> Result<GeomAtPoint, AssemblyError> {
    let dim = topo.dim();
    let geo_basis = Basis {
        topology: topo,
        order: topo.order(),
    };
    let vals = geo_basis.eval(pt);
    let grads = geo_basis.eval_grad(pt);

    let mut x = [0.0; 3];
    let mut jac = Matrix3::identity();
    for r in 0..dim {
        for d in 0..dim {
            jac[(r, d)] = 0.0;
        }
    }
    for (n, c) in coords.iter().enumerate() {
        for d in 0..3 {
            x[d] += vals[n] * c[d];
        }
        for r in 0..dim {
            for d in 0..dim {
                jac[(r, d)] += grads[n][r] * c[d];
            }
        }
    }

    let det = match dim {
        1 => jac[(0, 0)],
        2 => jac[(0, 0)] * jac[(1, 1)] - jac[(0, 1)] * jac[(1, 0)],
        _ => jac.determinant(),
    };
    if det <= 0.0 {
        return Err(AssemblyError::IndexMismatch(format!(
            "non-positive jacobian determinant {det:.3e}"
        )));
    }
    let jac_inv = jac
        .try_inverse()
        .ok_or_else(|| AssemblyError::IndexMismatch("singular jacobian".to_string()))?;

    Ok(GeomAtPoint {
        x,
        jac,
        det,
        jac_inv,
    })
}

/// Transform a reference gradient to the physical frame: solve
/// grad_ref = J grad_phys.
pub fn physical_grad(g: &GeomAtPoint, ref_grad: [f64; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for d in 0..3 {
        let mut acc = 0.0;
        for r in 0..3 {
            acc += g.jac_inv[(d, r)] * ref_grad[r];
        }
        out[d] = acc;
    }
    out
}

/// Side measure and outward unit normal at a reference point of a side.
pub fn side_measure_normal(
    topo: CellTopology,
    g: &GeomAtPoint,
    side: usize,
) -> (f64, [f64; 3]) {
    let dim = topo.dim();
    let (axis, face) = topo.side_axis_face(side);

    let (measure, mut normal) = match dim {
        1 => (1.0, [1.0, 0.0, 0.0]),
        2 => {
            let u = 1 - axis;
            let t = [g.jac[(u, 0)], g.jac[(u, 1)]];
            let len = (t[0] * t[0] + t[1] * t[1]).sqrt();
            (len, [t[1] / len, -t[0] / len, 0.0])
        }
        _ => {
            let free: Vec<usize> = (0..3).filter(|&d| d != axis).collect();
            let t1 = Vector3::new(
                g.jac[(free[0], 0)],
                g.jac[(free[0], 1)],
                g.jac[(free[0], 2)],
            );
            let t2 = Vector3::new(
                g.jac[(free[1], 0)],
                g.jac[(free[1], 1)],
                g.jac[(free[1], 2)],
            );
            let c = t1.cross(&t2);
            let len = c.norm();
            (len, [c[0] / len, c[1] / len, c[2] / len])
        }
    };

    // Orient against the fixed reference axis: d(x)/d(xi_axis) points from
    // face 0 toward face 1.
    let d = [g.jac[(axis, 0)], g.jac[(axis, 1)], g.jac[(axis, 2)]];
    let dot = normal[0] * d[0] + normal[1] * d[1] + normal[2] * d[2];
    let want_positive = face == 1;
    if (dot > 0.0) != want_positive {
        for n in normal.iter_mut() {
            *n = -*n;
        }
    }
    (measure, normal)
}

/// Invert the isoparametric map with a short Newton iteration.
pub fn map_to_reference(
    topo: CellTopology,
    coords: &[[f64; 3]],
    x: [f64; 3],
) -> Result<[f64; 3], AssemblyError> {
    let dim = topo.dim();
    let mut xi = [0.0; 3];
    for _ in 0..30 {
        let g = eval_geometry(topo, coords, xi)?;
        let mut r = Vector3::zeros();
        for d in 0..dim {
            r[d] = x[d] - g.x[d];
        }
        if r.norm() < 1e-13 {
            break;
        }
        // dx = J^T dxi  =>  dxi = J^-T r
        let delta = g.jac.transpose().try_inverse().ok_or_else(|| {
            AssemblyError::IndexMismatch("singular jacobian in point inversion".to_string())
        })? * r;
        for d in 0..dim {
            xi[d] += delta[d];
        }
    }
    Ok(xi)
}

/// Whether a reference point lies inside the reference cell (with slack).
pub fn in_reference_cell(dim: usize, xi: [f64; 3]) -> bool {
    (0..dim).all(|d| xi[d] >= -1.0 - 1e-9 && xi[d] <= 1.0 + 1e-9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauss_rules_integrate_polynomials() {
        // 2-point rule integrates cubics exactly on [-1, 1].
        let (x, w) = gauss_1d(2);
        let int_x3: f64 = x.iter().zip(&w).map(|(xi, wi)| wi * xi.powi(3)).sum();
        let int_x2: f64 = x.iter().zip(&w).map(|(xi, wi)| wi * xi.powi(2)).sum();
        assert!(int_x3.abs() < 1e-14);
        assert!((int_x2 - 2.0 / 3.0).abs() < 1e-14);
    }

    #[test]
    fn volume_rule_weights_sum_to_reference_volume() {
        let rule = volume_rule(CellTopology::Hex8, 2);
        assert_eq!(rule.points.len(), 8);
        let total: f64 = rule.weights.iter().sum();
        assert!((total - 8.0).abs() < 1e-13);
    }

    #[test]
    fn basis_partition_of_unity() {
        for (topo, order) in [
            (CellTopology::Line2, 1),
            (CellTopology::Quad4, 1),
            (CellTopology::Quad9, 2),
            (CellTopology::Hex8, 1),
            (CellTopology::Hex27, 2),
        ] {
            let basis = Basis::new(topo, order).unwrap();
            let vals = basis.eval([0.3, -0.4, 0.7]);
            let sum: f64 = vals.iter().sum();
            assert!((sum - 1.0).abs() < 1e-13, "{:?} order {}", topo, order);
            let grads = basis.eval_grad([0.3, -0.4, 0.7]);
            for d in 0..3 {
                let gsum: f64 = grads.iter().map(|g| g[d]).sum();
                assert!(gsum.abs() < 1e-13);
            }
        }
    }

    #[test]
    fn kronecker_property_at_nodes() {
        let basis = Basis::new(CellTopology::Quad9, 2).unwrap();
        let pts = [-1.0, 0.0, 1.0];
        for (i, node) in (0..9).map(|i| (i, [pts[i % 3], pts[i / 3], 0.0])) {
            let vals = basis.eval(node);
            for (j, v) in vals.iter().enumerate() {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((v - expect).abs() < 1e-13);
            }
        }
    }

    #[test]
    fn linear_basis_on_quadratic_cell_uses_corners() {
        let basis = Basis::new(CellTopology::Quad9, 1).unwrap();
        assert_eq!(basis.dof_nodes(), vec![0, 2, 6, 8]);
        let hex = Basis::new(CellTopology::Hex27, 1).unwrap();
        assert_eq!(hex.dof_nodes()[..4], [0, 2, 6, 8]);
    }

    #[test]
    fn jacobian_of_scaled_quad() {
        // [0,2]x[0,1] single element: J = diag(1, 0.5), det = 0.5.
        let coords = [
            [0.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [2.0, 1.0, 0.0],
        ];
        let g = eval_geometry(CellTopology::Quad4, &coords, [0.0, 0.0, 0.0]).unwrap();
        assert!((g.det - 0.5).abs() < 1e-14);
        assert!((g.jac[(0, 0)] - 1.0).abs() < 1e-14);
        assert!((g.jac[(1, 1)] - 0.5).abs() < 1e-14);

        // Physical gradient of a function linear in x.
        let pg = physical_grad(&g, [1.0, 0.0, 0.0]);
        assert!((pg[0] - 1.0).abs() < 1e-14);
    }

    #[test]
    fn outward_normals_on_unit_quad() {
        let coords = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
        ];
        for (side, expect) in [
            (0, [-1.0, 0.0, 0.0]),
            (1, [1.0, 0.0, 0.0]),
            (2, [0.0, -1.0, 0.0]),
            (3, [0.0, 1.0, 0.0]),
        ] {
            let rule = side_rule(CellTopology::Quad4, side, 2);
            let g = eval_geometry(CellTopology::Quad4, &coords, rule.points[0]).unwrap();
            let (measure, normal) = side_measure_normal(CellTopology::Quad4, &g, side);
            assert!((measure - 0.5).abs() < 1e-14);
            for d in 0..3 {
                assert!((normal[d] - expect[d]).abs() < 1e-13, "side {side}");
            }
        }
    }

    #[test]
    fn point_inversion_recovers_reference_coords() {
        let coords = [
            [0.0, 0.0, 0.0],
            [2.0, 0.1, 0.0],
            [0.1, 1.0, 0.0],
            [2.2, 1.3, 0.0],
        ];
        let xi0 = [0.25, -0.5, 0.0];
        let g = eval_geometry(CellTopology::Quad4, &coords, xi0).unwrap();
        let xi = map_to_reference(CellTopology::Quad4, &coords, g.x).unwrap();
        assert!((xi[0] - xi0[0]).abs() < 1e-10);
        assert!((xi[1] - xi0[1]).abs() < 1e-10);
        assert!(in_reference_cell(2, xi));
    }
}
