//! Export/import plans between overlapped and owned maps.
//!
//! An [`Export`] pairs every source entry whose GID exists in the target
//! map with its target slot. The pair list is ordered by ascending GID, so
//! additive combines happen in a deterministic order and results are
//! bitwise reproducible for a given partition. The reverse direction
//! (owned -> overlapped) is the import; the same plan serves both.

use crate::matrix::DistMatrix;
use crate::error::LinearSolveError;
use crate::map::Map;
use crate::vector::DistVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineMode {
    Add,
    Insert,
    /// Zero the target slots touched by the plan (used before re-export).
    Zero,
}

#[derive(Debug, Clone)]
pub struct Export {
    /// (source lid, target lid), ascending source GID.
    pairs: Vec<(usize, usize)>,
}

impl Export {
    pub fn new(source: &Map, target: &Map) -> Self {
        let mut pairs: Vec<(u64, usize, usize)> = source
            .gids()
            .iter()
            .enumerate()
            .filter_map(|(slid, &gid)| target.lid(gid).map(|tlid| (gid, slid, tlid)))
            .collect();
        pairs.sort_unstable_by_key(|(gid, _, _)| *gid);
        Self {
            pairs: pairs.into_iter().map(|(_, s, t)| (s, t)).collect(),
        }
    }

    pub fn num_entries(&self) -> usize {
        self.pairs.len()
    }

    /// Move source entries into the target (overlapped -> owned).
    pub fn apply(&self, source: &DistVector, target: &mut DistVector, mode: CombineMode) {
        match mode {
            CombineMode::Add => {
                for &(s, t) in &self.pairs {
                    let v = source.local(s);
                    target.set_local(t, target.local(t) + v);
                }
            }
            CombineMode::Insert => {
                for &(s, t) in &self.pairs {
                    target.set_local(t, source.local(s));
                }
            }
            CombineMode::Zero => {
                for &(_, t) in &self.pairs {
                    target.set_local(t, 0.0);
                }
            }
        }
    }

    /// The reverse plan: copy owned values out to the overlapped vector.
    pub fn import(&self, owned: &DistVector, overlapped: &mut DistVector) {
        for &(s, t) in &self.pairs {
            overlapped.set_local(s, owned.local(t));
        }
    }

    /// Row-wise matrix export (overlapped -> owned) with additive combine.
    pub fn apply_matrix(
        &self,
        source: &DistMatrix,
        target: &mut DistMatrix,
        mode: CombineMode,
    ) -> Result<(), LinearSolveError> {
        let target_rows = target.row_map().clone();
        for &(s, _t) in &self.pairs {
            let row_gid = source.row_map().gid(s);
            if !target_rows.contains(row_gid) {
                continue;
            }
            let (cols, vals) = source.row(s);
            let cols = cols.to_vec();
            let vals = vals.to_vec();
            match mode {
                CombineMode::Add => target.sum_into_global(row_gid, &cols, &vals)?,
                CombineMode::Insert | CombineMode::Zero => {
                    return Err(LinearSolveError::MapMismatch(
                        "matrix export supports additive combine only".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Comm;
    use crate::matrix::CrsGraph;
    use std::sync::Arc;

    #[test]
    fn vector_export_sums_shared_entries() {
        // Overlapped map holds an extra ghost gid (5) and a different order.
        let owned = Arc::new(Map::new(vec![0, 1, 2], Comm::serial()));
        let overlapped = Arc::new(Map::new(vec![2, 0, 1, 5], Comm::serial()));
        let plan = Export::new(&overlapped, &owned);
        assert_eq!(plan.num_entries(), 3);

        let mut src = DistVector::new(overlapped);
        src.sum_into_global(2, 4.0).unwrap();
        src.sum_into_global(0, 1.0).unwrap();
        src.sum_into_global(5, 9.0).unwrap(); // ghost with no owner here

        let mut dst = DistVector::new(owned);
        dst.put_scalar(1.0);
        plan.apply(&src, &mut dst, CombineMode::Add);
        assert_eq!(dst.get_global(0), Some(2.0));
        assert_eq!(dst.get_global(1), Some(1.0));
        assert_eq!(dst.get_global(2), Some(5.0));
    }

    #[test]
    fn import_copies_owned_state_to_ghosts() {
        let owned = Arc::new(Map::new(vec![0, 1, 2], Comm::serial()));
        let overlapped = Arc::new(Map::new(vec![2, 0, 1], Comm::serial()));
        let plan = Export::new(&overlapped, &owned);

        let mut o = DistVector::new(owned);
        o.replace_global(0, 10.0).unwrap();
        o.replace_global(1, 11.0).unwrap();
        o.replace_global(2, 12.0).unwrap();

        let mut g = DistVector::new(overlapped);
        plan.import(&o, &mut g);
        assert_eq!(g.get_global(2), Some(12.0));
        assert_eq!(g.get_global(0), Some(10.0));
    }

    #[test]
    fn matrix_export_adds_rows() {
        let owned = Arc::new(Map::contiguous(2, Comm::serial()));
        let overlapped = Arc::new(Map::contiguous(2, Comm::serial()));
        let graph_o = Arc::new(CrsGraph::new(owned.clone(), vec![vec![0, 1], vec![0, 1]]));
        let graph_g = Arc::new(CrsGraph::new(
            overlapped.clone(),
            vec![vec![0, 1], vec![0, 1]],
        ));
        let plan = Export::new(&overlapped, &owned);

        let mut src = DistMatrix::new(graph_g);
        src.sum_into_global(0, &[0, 1], &[1.0, 2.0]).unwrap();
        let mut dst = DistMatrix::new(graph_o);
        dst.sum_into_global(0, &[0], &[1.0]).unwrap();
        plan.apply_matrix(&src, &mut dst, CombineMode::Add).unwrap();
        let (_, vals) = dst.row(0);
        assert_eq!(vals, &[2.0, 2.0]);
    }
}
