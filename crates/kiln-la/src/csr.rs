//! Local CSR kernels.
//!
//! Small, allocation-explicit helpers over `nalgebra_sparse::CsrMatrix`
//! storage: matrix-vector products, transpose, sparse-sparse product, and
//! dense conversion for coarse-level direct solves.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;

/// Assemble a CSR matrix from per-row (column, value) entries. Each row must
/// be sorted by column with no duplicates.
pub fn from_rows(nrows: usize, ncols: usize, rows: Vec<Vec<(usize, f64)>>) -> CsrMatrix<f64> {
    let mut row_offsets = Vec::with_capacity(nrows + 1);
    let mut col_indices = Vec::new();
    let mut values = Vec::new();
    row_offsets.push(0);
    for row in rows {
        for (c, v) in row {
            col_indices.push(c);
            values.push(v);
        }
        row_offsets.push(col_indices.len());
    }
    CsrMatrix::try_from_csr_data(nrows, ncols, row_offsets, col_indices, values)
        .expect("valid CSR data")
}

pub fn spmv(a: &CsrMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();
    let mut y = DVector::zeros(a.nrows());
    for i in 0..a.nrows() {
        let mut acc = 0.0;
        for k in offsets[i]..offsets[i + 1] {
            acc += vals[k] * x[cols[k]];
        }
        y[i] = acc;
    }
    y
}

pub fn spmv_transpose(a: &CsrMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();
    let mut y = DVector::zeros(a.ncols());
    for i in 0..a.nrows() {
        let xi = x[i];
        if xi == 0.0 {
            continue;
        }
        for k in offsets[i]..offsets[i + 1] {
            y[cols[k]] += vals[k] * xi;
        }
    }
    y
}

pub fn transpose(a: &CsrMatrix<f64>) -> CsrMatrix<f64> {
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();

    let mut counts = vec![0usize; a.ncols()];
    for &c in cols {
        counts[c] += 1;
    }
    let mut t_offsets = Vec::with_capacity(a.ncols() + 1);
    t_offsets.push(0);
    for c in 0..a.ncols() {
        t_offsets.push(t_offsets[c] + counts[c]);
    }
    let mut cursor = t_offsets[..a.ncols()].to_vec();
    let mut t_cols = vec![0usize; a.nnz()];
    let mut t_vals = vec![0.0; a.nnz()];
    for i in 0..a.nrows() {
        for k in offsets[i]..offsets[i + 1] {
            let c = cols[k];
            let pos = cursor[c];
            t_cols[pos] = i;
            t_vals[pos] = vals[k];
            cursor[c] += 1;
        }
    }
    CsrMatrix::try_from_csr_data(a.ncols(), a.nrows(), t_offsets, t_cols, t_vals)
        .expect("valid CSR data")
}

/// C = A * B with a dense accumulator per row.
pub fn spgemm(a: &CsrMatrix<f64>, b: &CsrMatrix<f64>) -> CsrMatrix<f64> {
    assert_eq!(a.ncols(), b.nrows());
    let a_off = a.row_offsets();
    let a_cols = a.col_indices();
    let a_vals = a.values();
    let b_off = b.row_offsets();
    let b_cols = b.col_indices();
    let b_vals = b.values();

    let mut acc = vec![0.0_f64; b.ncols()];
    let mut marked: Vec<usize> = Vec::new();
    let mut rows: Vec<Vec<(usize, f64)>> = Vec::with_capacity(a.nrows());

    for i in 0..a.nrows() {
        marked.clear();
        for ka in a_off[i]..a_off[i + 1] {
            let j = a_cols[ka];
            let av = a_vals[ka];
            for kb in b_off[j]..b_off[j + 1] {
                let c = b_cols[kb];
                if acc[c] == 0.0 && !marked.contains(&c) {
                    marked.push(c);
                }
                acc[c] += av * b_vals[kb];
            }
        }
        marked.sort_unstable();
        let mut row = Vec::with_capacity(marked.len());
        for &c in &marked {
            row.push((c, acc[c]));
            acc[c] = 0.0;
        }
        rows.push(row);
    }
    from_rows(a.nrows(), b.ncols(), rows)
}

pub fn diagonal(a: &CsrMatrix<f64>) -> DVector<f64> {
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();
    let mut d = DVector::zeros(a.nrows());
    for i in 0..a.nrows() {
        for k in offsets[i]..offsets[i + 1] {
            if cols[k] == i {
                d[i] = vals[k];
            }
        }
    }
    d
}

pub fn to_dense(a: &CsrMatrix<f64>) -> DMatrix<f64> {
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();
    let mut m = DMatrix::zeros(a.nrows(), a.ncols());
    for i in 0..a.nrows() {
        for k in offsets[i]..offsets[i + 1] {
            m[(i, cols[k])] = vals[k];
        }
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CsrMatrix<f64> {
        // [[2, 0, 1], [0, 3, 0]]
        from_rows(2, 3, vec![vec![(0, 2.0), (2, 1.0)], vec![(1, 3.0)]])
    }

    #[test]
    fn spmv_matches_dense() {
        let a = sample();
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let y = spmv(&a, &x);
        assert_eq!(y.as_slice(), &[5.0, 6.0]);
    }

    #[test]
    fn transpose_round_trip() {
        let a = sample();
        let at = transpose(&a);
        assert_eq!(at.nrows(), 3);
        let x = DVector::from_vec(vec![1.0, 1.0]);
        let y = spmv(&at, &x);
        let y2 = spmv_transpose(&a, &x);
        assert_eq!(y.as_slice(), y2.as_slice());
        let back = transpose(&at);
        assert_eq!(back.values(), a.values());
        assert_eq!(back.col_indices(), a.col_indices());
    }

    #[test]
    fn spgemm_matches_dense_product() {
        let a = sample();
        let b = from_rows(
            3,
            2,
            vec![vec![(0, 1.0)], vec![(0, 1.0), (1, 1.0)], vec![(1, 2.0)]],
        );
        let c = spgemm(&a, &b);
        let dense = to_dense(&a) * to_dense(&b);
        let cd = to_dense(&c);
        assert!((dense - cd).norm() < 1e-14);
    }

    #[test]
    fn diagonal_extraction() {
        let a = from_rows(2, 2, vec![vec![(0, 4.0), (1, 1.0)], vec![(1, 5.0)]]);
        let d = diagonal(&a);
        assert_eq!(d.as_slice(), &[4.0, 5.0]);
    }
}
