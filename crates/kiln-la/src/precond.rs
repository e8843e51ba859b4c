//! Preconditioners for the Krylov solver.
//!
//! Two families, selected by configuration: a drop-tolerance incomplete LU
//! and a smoothed-aggregation multigrid with Jacobi or Chebyshev smoothing.
//! Both present the same single-apply interface to GMRES.

use nalgebra::{DVector, Dyn};
use nalgebra_sparse::CsrMatrix;
use std::ops::Bound;

use crate::csr;
use crate::error::LinearSolveError;

pub trait Preconditioner: Send + Sync {
    /// Apply M^-1 to a residual.
    fn apply(&self, r: &DVector<f64>) -> DVector<f64>;

    fn name(&self) -> &'static str;
}

pub struct Identity;

impl Preconditioner for Identity {
    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        r.clone()
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Incomplete LU with drop tolerance and per-row fill cap (ILUT).
///
/// Entries below `drop_tol` times the original row norm are discarded during
/// elimination; at most `fill_param` times the original row count survive in
/// each of the L and U parts. `drop_tol = 0` with a large `fill_param`
/// degenerates to a full (unpivoted) factorization, which is the last rung
/// of the setup cascade.
pub struct Ilu {
    /// Strictly-lower rows, sorted by column.
    l_rows: Vec<Vec<(usize, f64)>>,
    /// Upper rows including the diagonal, sorted by column.
    u_rows: Vec<Vec<(usize, f64)>>,
    u_diag: Vec<f64>,
}

impl Ilu {
    pub fn new(
        a: &CsrMatrix<f64>,
        drop_tol: f64,
        fill_param: f64,
    ) -> Result<Self, LinearSolveError> {
        assert_eq!(a.nrows(), a.ncols());
        let n = a.nrows();
        let offsets = a.row_offsets();
        let cols = a.col_indices();
        let vals = a.values();

        let mut l_rows: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
        let mut u_rows: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
        let mut u_diag = vec![0.0; n];

        for i in 0..n {
            let begin = offsets[i];
            let end = offsets[i + 1];
            let row_nnz = end - begin;
            let row_norm = vals[begin..end]
                .iter()
                .map(|v| v * v)
                .sum::<f64>()
                .sqrt();
            let tau = drop_tol * row_norm;
            let cap = ((fill_param * row_nnz as f64).ceil() as usize).max(row_nnz);

            let mut w = std::collections::BTreeMap::new();
            for k in begin..end {
                w.insert(cols[k], vals[k]);
            }

            // Eliminate below-diagonal entries in ascending column order;
            // fill created between the pivot and the diagonal is picked up
            // by the next range query.
            let mut next_k = w.range(..i).next().map(|(&k, _)| k);
            while let Some(k) = next_k {
                let lik = w.remove(&k).unwrap() / u_diag[k];
                if lik.abs() >= tau {
                    w.insert(k, lik);
                    for &(j, ujv) in &u_rows[k] {
                        if j > k {
                            *w.entry(j).or_insert(0.0) -= lik * ujv;
                        }
                    }
                    next_k = w
                        .range((Bound::Excluded(k), Bound::Excluded(i)))
                        .next()
                        .map(|(&k, _)| k);
                } else {
                    next_k = w
                        .range((Bound::Excluded(k), Bound::Excluded(i)))
                        .next()
                        .map(|(&k, _)| k);
                }
            }

            let mut l_part: Vec<(usize, f64)> = w
                .range(..i)
                .map(|(&c, &v)| (c, v))
                .filter(|(_, v)| v.abs() >= tau)
                .collect();
            let mut u_part: Vec<(usize, f64)> = w
                .range(i..)
                .map(|(&c, &v)| (c, v))
                .filter(|(c, v)| *c == i || v.abs() >= tau)
                .collect();

            keep_largest(&mut l_part, cap, None);
            keep_largest(&mut u_part, cap, Some(i));

            let diag = u_part
                .iter()
                .find(|(c, _)| *c == i)
                .map(|(_, v)| *v)
                .unwrap_or(0.0);
            if diag == 0.0 {
                return Err(LinearSolveError::ZeroPivot(i));
            }
            u_diag[i] = diag;
            l_rows.push(l_part);
            u_rows.push(u_part);
        }

        Ok(Self {
            l_rows,
            u_rows,
            u_diag,
        })
    }
}

/// Keep the `cap` largest-magnitude entries, always retaining `must_keep`.
fn keep_largest(row: &mut Vec<(usize, f64)>, cap: usize, must_keep: Option<usize>) {
    if row.len() <= cap {
        return;
    }
    row.sort_by(|a, b| b.1.abs().partial_cmp(&a.1.abs()).unwrap());
    let mut kept: Vec<(usize, f64)> = row.iter().take(cap).copied().collect();
    if let Some(c) = must_keep {
        if !kept.iter().any(|(k, _)| *k == c) {
            if let Some(&entry) = row.iter().find(|(k, _)| *k == c) {
                kept.pop();
                kept.push(entry);
            }
        }
    }
    kept.sort_unstable_by_key(|(c, _)| *c);
    *row = kept;
}

impl Preconditioner for Ilu {
    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        let n = r.len();
        // Forward: L y = r with unit diagonal.
        let mut y = DVector::zeros(n);
        for i in 0..n {
            let mut acc = r[i];
            for &(c, v) in &self.l_rows[i] {
                acc -= v * y[c];
            }
            y[i] = acc;
        }
        // Backward: U x = y.
        let mut x = DVector::zeros(n);
        for i in (0..n).rev() {
            let mut acc = y[i];
            for &(c, v) in &self.u_rows[i] {
                if c > i {
                    acc -= v * x[c];
                }
            }
            x[i] = acc / self.u_diag[i];
        }
        x
    }

    fn name(&self) -> &'static str {
        "ilu"
    }
}

/// Smoother selection for the multigrid levels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmootherKind {
    Jacobi { omega: f64, sweeps: usize },
    Chebyshev { degree: usize },
}

#[derive(Debug, Clone)]
pub struct AmgConfig {
    pub max_levels: usize,
    /// Stop coarsening when a level has at most this many rows.
    pub coarse_size: usize,
    /// Strength-of-connection threshold for aggregation.
    pub strength_threshold: f64,
    pub smoother: SmootherKind,
    /// Prolongator damping numerator; omega = damping / lambda_max.
    pub prolongator_damping: f64,
}

impl Default for AmgConfig {
    fn default() -> Self {
        Self {
            max_levels: 10,
            coarse_size: 64,
            strength_threshold: 0.02,
            smoother: SmootherKind::Chebyshev { degree: 2 },
            prolongator_damping: 4.0 / 3.0,
        }
    }
}

struct Smoother {
    kind: SmootherKind,
    inv_diag: DVector<f64>,
    lambda_max: f64,
}

impl Smoother {
    fn apply(&self, a: &CsrMatrix<f64>, b: &DVector<f64>, x: &mut DVector<f64>) {
        match self.kind {
            SmootherKind::Jacobi { omega, sweeps } => {
                for _ in 0..sweeps {
                    let mut r = b - csr::spmv(a, x);
                    r.component_mul_assign(&self.inv_diag);
                    *x += omega * r;
                }
            }
            SmootherKind::Chebyshev { degree } => {
                let lmax = self.lambda_max;
                let lmin = lmax / 30.0;
                let theta = 0.5 * (lmax + lmin);
                let delta = 0.5 * (lmax - lmin);
                let sigma = theta / delta;
                let mut rho = 1.0 / sigma;

                let r = b - csr::spmv(a, x);
                let mut d = r.component_mul(&self.inv_diag) / theta;
                *x += &d;
                for _ in 1..degree {
                    let r = b - csr::spmv(a, x);
                    let rho_new = 1.0 / (2.0 * sigma - rho);
                    let z = r.component_mul(&self.inv_diag);
                    d = rho_new * rho * d + (2.0 * rho_new / delta) * z;
                    *x += &d;
                    rho = rho_new;
                }
            }
        }
    }
}

struct Level {
    a: CsrMatrix<f64>,
    p: CsrMatrix<f64>,
    smoother: Smoother,
}

/// Smoothed-aggregation algebraic multigrid.
pub struct SmoothedAggregation {
    levels: Vec<Level>,
    coarse_lu: nalgebra::LU<f64, Dyn, Dyn>,
    coarse_n: usize,
}

impl SmoothedAggregation {
    pub fn new(a0: &CsrMatrix<f64>, config: &AmgConfig) -> Result<Self, LinearSolveError> {
        let mut a = a0.clone();
        let mut levels = Vec::new();

        while a.nrows() > config.coarse_size && levels.len() + 1 < config.max_levels {
            let agg = aggregate(&a, config.strength_threshold);
            let nagg = agg.iter().copied().max().map(|m| m + 1).unwrap_or(0);
            if nagg == 0 || nagg >= a.nrows() {
                break;
            }

            let inv_diag = inverse_diagonal(&a)?;
            let lambda_max = estimate_lambda_max(&a, &inv_diag);
            let omega = config.prolongator_damping / lambda_max;

            // Tentative piecewise-constant prolongator.
            let p_tent = csr::from_rows(
                a.nrows(),
                nagg,
                agg.iter().map(|&g| vec![(g, 1.0)]).collect(),
            );
            // P = (I - omega D^-1 A) P_tent
            let dinv_a = scale_rows(&a, &inv_diag);
            let p = add_scaled(&p_tent, &csr::spgemm(&dinv_a, &p_tent), -omega);

            let r = csr::transpose(&p);
            let ac = csr::spgemm(&r, &csr::spgemm(&a, &p));

            log::debug!(
                "amg level {}: {} -> {} rows, lambda_max {:.3e}",
                levels.len(),
                a.nrows(),
                ac.nrows(),
                lambda_max
            );

            levels.push(Level {
                a,
                p,
                smoother: Smoother {
                    kind: config.smoother,
                    inv_diag,
                    lambda_max,
                },
            });
            a = ac;
        }

        let coarse_n = a.nrows();
        let coarse_lu = csr::to_dense(&a).lu();
        Ok(Self {
            levels,
            coarse_lu,
            coarse_n,
        })
    }

    fn cycle(&self, lvl: usize, b: &DVector<f64>) -> DVector<f64> {
        if lvl == self.levels.len() {
            return self
                .coarse_lu
                .solve(b)
                .unwrap_or_else(|| DVector::zeros(self.coarse_n));
        }
        let level = &self.levels[lvl];
        let mut x = DVector::zeros(level.a.nrows());
        level.smoother.apply(&level.a, b, &mut x);

        let r = b - csr::spmv(&level.a, &x);
        let rc = csr::spmv_transpose(&level.p, &r);
        let xc = self.cycle(lvl + 1, &rc);
        x += csr::spmv(&level.p, &xc);

        level.smoother.apply(&level.a, b, &mut x);
        x
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len() + 1
    }
}

impl Preconditioner for SmoothedAggregation {
    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        self.cycle(0, r)
    }

    fn name(&self) -> &'static str {
        "smoothed-aggregation"
    }
}

fn inverse_diagonal(a: &CsrMatrix<f64>) -> Result<DVector<f64>, LinearSolveError> {
    let d = csr::diagonal(a);
    let mut inv = DVector::zeros(d.len());
    for i in 0..d.len() {
        if d[i] == 0.0 {
            return Err(LinearSolveError::ZeroPivot(i));
        }
        inv[i] = 1.0 / d[i];
    }
    Ok(inv)
}

/// Power iteration estimate of the spectral radius of D^-1 A.
fn estimate_lambda_max(a: &CsrMatrix<f64>, inv_diag: &DVector<f64>) -> f64 {
    let n = a.nrows();
    let mut v = DVector::from_element(n, 1.0 / (n as f64).sqrt());
    let mut lambda = 1.0;
    for _ in 0..10 {
        let mut w = csr::spmv(a, &v);
        w.component_mul_assign(inv_diag);
        let norm = w.norm();
        if norm == 0.0 {
            break;
        }
        lambda = norm;
        v = w / norm;
    }
    // Safety margin so the Chebyshev interval contains the spectrum.
    lambda * 1.1
}

/// Greedy aggregation over the strength graph.
fn aggregate(a: &CsrMatrix<f64>, theta: f64) -> Vec<usize> {
    let n = a.nrows();
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();
    let diag = csr::diagonal(a);

    let strong = |i: usize, k: usize| -> bool {
        let j = cols[k];
        if j == i {
            return false;
        }
        vals[k].abs() > theta * (diag[i].abs() * diag[j].abs()).sqrt()
    };

    const UNAGGREGATED: usize = usize::MAX;
    let mut agg = vec![UNAGGREGATED; n];
    let mut num_agg = 0;

    // Pass 1: root nodes whose strong neighborhood is untouched.
    for i in 0..n {
        if agg[i] != UNAGGREGATED {
            continue;
        }
        let nbrs: Vec<usize> = (offsets[i]..offsets[i + 1])
            .filter(|&k| strong(i, k))
            .map(|k| cols[k])
            .collect();
        if nbrs.iter().all(|&j| agg[j] == UNAGGREGATED) {
            agg[i] = num_agg;
            for &j in &nbrs {
                agg[j] = num_agg;
            }
            num_agg += 1;
        }
    }

    // Pass 2: attach leftovers to a strongly connected aggregate.
    for i in 0..n {
        if agg[i] != UNAGGREGATED {
            continue;
        }
        let mut best = None;
        for k in offsets[i]..offsets[i + 1] {
            if strong(i, k) && agg[cols[k]] != UNAGGREGATED {
                best = Some(agg[cols[k]]);
                break;
            }
        }
        if let Some(g) = best {
            agg[i] = g;
        }
    }

    // Pass 3: remaining isolated nodes become singletons.
    for i in 0..n {
        if agg[i] == UNAGGREGATED {
            agg[i] = num_agg;
            num_agg += 1;
        }
    }
    agg
}

/// Row-scale a CSR matrix by a vector (D^-1 A).
fn scale_rows(a: &CsrMatrix<f64>, scale: &DVector<f64>) -> CsrMatrix<f64> {
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();
    let mut rows = Vec::with_capacity(a.nrows());
    for i in 0..a.nrows() {
        let row: Vec<(usize, f64)> = (offsets[i]..offsets[i + 1])
            .map(|k| (cols[k], vals[k] * scale[i]))
            .collect();
        rows.push(row);
    }
    csr::from_rows(a.nrows(), a.ncols(), rows)
}

/// C = A + alpha B, merging sorted rows.
fn add_scaled(a: &CsrMatrix<f64>, b: &CsrMatrix<f64>, alpha: f64) -> CsrMatrix<f64> {
    assert_eq!(a.nrows(), b.nrows());
    assert_eq!(a.ncols(), b.ncols());
    let (ao, ac, av) = (a.row_offsets(), a.col_indices(), a.values());
    let (bo, bc, bv) = (b.row_offsets(), b.col_indices(), b.values());

    let mut rows = Vec::with_capacity(a.nrows());
    for i in 0..a.nrows() {
        let mut row: Vec<(usize, f64)> = Vec::new();
        let (mut ka, mut kb) = (ao[i], bo[i]);
        while ka < ao[i + 1] || kb < bo[i + 1] {
            let ca = if ka < ao[i + 1] { ac[ka] } else { usize::MAX };
            let cb = if kb < bo[i + 1] { bc[kb] } else { usize::MAX };
            if ca < cb {
                row.push((ca, av[ka]));
                ka += 1;
            } else if cb < ca {
                row.push((cb, alpha * bv[kb]));
                kb += 1;
            } else {
                row.push((ca, av[ka] + alpha * bv[kb]));
                ka += 1;
                kb += 1;
            }
        }
        rows.push(row);
    }
    csr::from_rows(a.nrows(), a.ncols(), rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1D Poisson matrix (tridiagonal 2, -1).
    fn poisson_1d(n: usize) -> CsrMatrix<f64> {
        let mut rows = Vec::with_capacity(n);
        for i in 0..n {
            let mut row = Vec::new();
            if i > 0 {
                row.push((i - 1, -1.0));
            }
            row.push((i, 2.0));
            if i + 1 < n {
                row.push((i + 1, -1.0));
            }
            rows.push(row);
        }
        csr::from_rows(n, n, rows)
    }

    #[test]
    fn ilu_zero_drop_is_exact_for_tridiagonal() {
        // No fill is dropped on a tridiagonal matrix, so LU is exact.
        let a = poisson_1d(12);
        let ilu = Ilu::new(&a, 0.0, 10.0).unwrap();
        let b = DVector::from_element(12, 1.0);
        let x = ilu.apply(&b);
        let r = &b - csr::spmv(&a, &x);
        assert!(r.norm() < 1e-12, "residual {}", r.norm());
    }

    #[test]
    fn ilu_reports_zero_pivot() {
        let a = csr::from_rows(2, 2, vec![vec![(0, 0.0)], vec![(1, 1.0)]]);
        assert!(matches!(
            Ilu::new(&a, 0.0, 10.0),
            Err(LinearSolveError::ZeroPivot(0))
        ));
    }

    #[test]
    fn amg_reduces_poisson_residual() {
        let n = 200;
        let a = poisson_1d(n);
        let amg = SmoothedAggregation::new(&a, &AmgConfig::default()).unwrap();
        assert!(amg.num_levels() >= 2);

        let b = DVector::from_element(n, 1.0);
        let x = amg.apply(&b);
        let r = &b - csr::spmv(&a, &x);
        assert!(
            r.norm() < b.norm(),
            "one V-cycle should contract the residual"
        );
    }

    #[test]
    fn jacobi_smoother_converges_on_diagonal_system() {
        let a = csr::from_rows(2, 2, vec![vec![(0, 2.0)], vec![(1, 4.0)]]);
        let sm = Smoother {
            kind: SmootherKind::Jacobi {
                omega: 1.0,
                sweeps: 5,
            },
            inv_diag: DVector::from_vec(vec![0.5, 0.25]),
            lambda_max: 1.0,
        };
        let b = DVector::from_vec(vec![2.0, 8.0]);
        let mut x = DVector::zeros(2);
        sm.apply(&a, &b, &mut x);
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn aggregation_covers_all_rows() {
        let a = poisson_1d(30);
        let agg = aggregate(&a, 0.02);
        let nagg = agg.iter().copied().max().unwrap() + 1;
        assert!(nagg >= 1 && nagg < 30);
    }
}
