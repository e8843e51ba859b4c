//! Graph-backed distributed CRS matrix.
//!
//! The graph fixes the sparsity once (per mesh); assembly then only sums
//! values into existing entries, row-batched, which keeps the Newton loop
//! allocation-free. For solving, the owned matrix is flattened into a local
//! `CsrMatrix` through a column map.

use std::sync::Arc;

use nalgebra_sparse::CsrMatrix;

use crate::csr;
use crate::error::LinearSolveError;
use crate::map::Map;
use crate::vector::DistVector;

/// Sparsity pattern: per-row sorted column GIDs over a row map.
#[derive(Debug, Clone)]
pub struct CrsGraph {
    row_map: Arc<Map>,
    cols: Vec<Vec<u64>>,
}

impl CrsGraph {
    /// Build from per-row column GID lists; columns are sorted and deduped.
    pub fn new(row_map: Arc<Map>, mut cols: Vec<Vec<u64>>) -> Self {
        assert_eq!(row_map.num_local(), cols.len());
        for row in cols.iter_mut() {
            row.sort_unstable();
            row.dedup();
        }
        Self { row_map, cols }
    }

    pub fn row_map(&self) -> &Arc<Map> {
        &self.row_map
    }

    pub fn row_cols(&self, lid: usize) -> &[u64] {
        &self.cols[lid]
    }

    pub fn nnz(&self) -> usize {
        self.cols.iter().map(|r| r.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct DistMatrix {
    graph: Arc<CrsGraph>,
    vals: Vec<Vec<f64>>,
}

impl DistMatrix {
    pub fn new(graph: Arc<CrsGraph>) -> Self {
        let vals = graph.cols.iter().map(|r| vec![0.0; r.len()]).collect();
        Self { graph, vals }
    }

    pub fn graph(&self) -> &Arc<CrsGraph> {
        &self.graph
    }

    pub fn row_map(&self) -> &Arc<Map> {
        self.graph.row_map()
    }

    pub fn put_scalar(&mut self, v: f64) {
        for row in self.vals.iter_mut() {
            row.fill(v);
        }
    }

    /// Sum a batch of entries into one row. Every column must already be in
    /// the graph.
    pub fn sum_into_global(
        &mut self,
        row_gid: u64,
        cols: &[u64],
        vals: &[f64],
    ) -> Result<(), LinearSolveError> {
        debug_assert_eq!(cols.len(), vals.len());
        let lid = self
            .graph
            .row_map
            .lid(row_gid)
            .ok_or(LinearSolveError::NotInMap(row_gid))?;
        let row_cols = &self.graph.cols[lid];
        let row_vals = &mut self.vals[lid];
        for (c, v) in cols.iter().zip(vals.iter()) {
            let pos = row_cols
                .binary_search(c)
                .map_err(|_| LinearSolveError::GraphMismatch {
                    row: row_gid,
                    col: *c,
                })?;
            row_vals[pos] += v;
        }
        Ok(())
    }

    /// Replace a row with the identity: zero everything, one on the diagonal.
    pub fn set_row_identity(&mut self, row_gid: u64) -> Result<(), LinearSolveError> {
        let lid = self
            .graph
            .row_map
            .lid(row_gid)
            .ok_or(LinearSolveError::NotInMap(row_gid))?;
        let row_cols = &self.graph.cols[lid];
        let row_vals = &mut self.vals[lid];
        row_vals.fill(0.0);
        let pos = row_cols
            .binary_search(&row_gid)
            .map_err(|_| LinearSolveError::GraphMismatch {
                row: row_gid,
                col: row_gid,
            })?;
        row_vals[pos] = 1.0;
        Ok(())
    }

    pub fn row(&self, lid: usize) -> (&[u64], &[f64]) {
        (&self.graph.cols[lid], &self.vals[lid])
    }

    pub fn row_values_mut(&mut self, lid: usize) -> &mut [f64] {
        &mut self.vals[lid]
    }

    /// Flatten into a local CSR matrix, mapping column GIDs through
    /// `domain_map` (square solves pass the row map itself).
    pub fn to_csr(&self, domain_map: &Map) -> Result<CsrMatrix<f64>, LinearSolveError> {
        let nrows = self.graph.row_map.num_local();
        let mut rows: Vec<Vec<(usize, f64)>> = Vec::with_capacity(nrows);
        for lid in 0..nrows {
            let (cols, vals) = self.row(lid);
            let mut entries = Vec::with_capacity(cols.len());
            for (c, v) in cols.iter().zip(vals.iter()) {
                let cl = domain_map
                    .lid(*c)
                    .ok_or(LinearSolveError::NotInMap(*c))?;
                entries.push((cl, *v));
            }
            entries.sort_unstable_by_key(|(c, _)| *c);
            rows.push(entries);
        }
        Ok(csr::from_rows(nrows, domain_map.num_local(), rows))
    }

    /// y = A x, with x over the domain map and y over the row map.
    pub fn apply(&self, x: &DistVector, y: &mut DistVector) {
        debug_assert!(y.map().same_as(self.graph.row_map()));
        let xmap = x.map().clone();
        for lid in 0..self.graph.row_map.num_local() {
            let (cols, vals) = self.row(lid);
            let mut acc = 0.0;
            for (c, v) in cols.iter().zip(vals.iter()) {
                acc += v * x.local(xmap.lid(*c).expect("column not in domain map"));
            }
            y.set_local(lid, acc);
        }
    }

    /// y = A^T x, with x over the row map and y over the domain map.
    pub fn apply_transpose(&self, x: &DistVector, y: &mut DistVector) {
        y.put_scalar(0.0);
        let ymap = y.map().clone();
        for lid in 0..self.graph.row_map.num_local() {
            let xv = x.local(lid);
            if xv == 0.0 {
                continue;
            }
            let (cols, vals) = self.row(lid);
            for (c, v) in cols.iter().zip(vals.iter()) {
                let yl = ymap.lid(*c).expect("column not in range map");
                y.set_local(yl, y.local(yl) + v * xv);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Comm;

    fn square_graph() -> Arc<CrsGraph> {
        let map = Arc::new(Map::contiguous(3, Comm::serial()));
        Arc::new(CrsGraph::new(
            map,
            vec![vec![0, 1], vec![0, 1, 2], vec![1, 2]],
        ))
    }

    #[test]
    fn sum_into_existing_entries() {
        let mut a = DistMatrix::new(square_graph());
        a.sum_into_global(1, &[0, 2], &[1.5, -2.0]).unwrap();
        a.sum_into_global(1, &[0], &[0.5]).unwrap();
        let (cols, vals) = a.row(1);
        assert_eq!(cols, &[0, 1, 2]);
        assert_eq!(vals, &[2.0, 0.0, -2.0]);
    }

    #[test]
    fn rejects_entry_outside_graph() {
        let mut a = DistMatrix::new(square_graph());
        let err = a.sum_into_global(0, &[2], &[1.0]).unwrap_err();
        assert!(matches!(err, LinearSolveError::GraphMismatch { .. }));
    }

    #[test]
    fn identity_row_for_dirichlet() {
        let mut a = DistMatrix::new(square_graph());
        a.sum_into_global(0, &[0, 1], &[3.0, 4.0]).unwrap();
        a.set_row_identity(0).unwrap();
        let (_, vals) = a.row(0);
        assert_eq!(vals, &[1.0, 0.0]);
    }

    #[test]
    fn matvec_and_transpose() {
        let graph = square_graph();
        let map = graph.row_map().clone();
        let mut a = DistMatrix::new(graph);
        // A = [[1, 2, 0], [0, 1, 0], [0, 0, 3]]
        a.sum_into_global(0, &[0, 1], &[1.0, 2.0]).unwrap();
        a.sum_into_global(1, &[1], &[1.0]).unwrap();
        a.sum_into_global(2, &[2], &[3.0]).unwrap();

        let mut x = DistVector::new(map.clone());
        x.set_local(0, 1.0);
        x.set_local(1, 1.0);
        x.set_local(2, 1.0);
        let mut y = DistVector::new(map.clone());
        a.apply(&x, &mut y);
        assert_eq!(y.local(0), 3.0);
        assert_eq!(y.local(1), 1.0);
        assert_eq!(y.local(2), 3.0);

        let mut yt = DistVector::new(map);
        a.apply_transpose(&x, &mut yt);
        assert_eq!(yt.local(0), 1.0);
        assert_eq!(yt.local(1), 3.0);
        assert_eq!(yt.local(2), 3.0);
    }

    #[test]
    fn csr_flatten_matches_rows() {
        let graph = square_graph();
        let map = graph.row_map().clone();
        let mut a = DistMatrix::new(graph);
        a.sum_into_global(0, &[0, 1], &[1.0, 2.0]).unwrap();
        a.sum_into_global(2, &[1, 2], &[5.0, 3.0]).unwrap();
        let csr = a.to_csr(&map).unwrap();
        assert_eq!(csr.nrows(), 3);
        assert_eq!(csr.nnz(), 7);
    }
}
