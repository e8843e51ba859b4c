//! Index maps and the communicator.
//!
//! A [`Map`] is the list of global indices (GIDs) a rank holds, with O(1)
//! GID-to-LID lookup. Maps are built once per mesh and shared via `Arc`.
//! The [`Comm`] carries the rank/size contract and the explicit scalar
//! reductions; the single-process implementation makes every reduction the
//! identity, but call sites stay written against the reduction API.

use std::collections::HashMap;

/// Communicator handle. One process per rank; reductions are explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comm {
    rank: usize,
    size: usize,
}

impl Comm {
    /// The single-rank communicator.
    pub fn serial() -> Self {
        Self { rank: 0, size: 1 }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sum_all(&self, local: f64) -> f64 {
        local
    }

    pub fn min_all(&self, local: f64) -> f64 {
        local
    }

    pub fn max_all(&self, local: f64) -> f64 {
        local
    }

    /// Element-wise sum over ranks of a small array, in place.
    pub fn sum_all_slice(&self, _local: &mut [f64]) {}
}

impl Default for Comm {
    fn default() -> Self {
        Self::serial()
    }
}

/// List of global indices held by this rank.
#[derive(Debug, Clone)]
pub struct Map {
    gids: Vec<u64>,
    lookup: HashMap<u64, usize>,
    comm: Comm,
}

impl Map {
    pub fn new(gids: Vec<u64>, comm: Comm) -> Self {
        let lookup = gids
            .iter()
            .enumerate()
            .map(|(lid, &gid)| (gid, lid))
            .collect();
        Self { gids, lookup, comm }
    }

    /// Contiguous map over [0, n).
    pub fn contiguous(n: u64, comm: Comm) -> Self {
        Self::new((0..n).collect(), comm)
    }

    pub fn num_local(&self) -> usize {
        self.gids.len()
    }

    pub fn gid(&self, lid: usize) -> u64 {
        self.gids[lid]
    }

    pub fn lid(&self, gid: u64) -> Option<usize> {
        self.lookup.get(&gid).copied()
    }

    pub fn contains(&self, gid: u64) -> bool {
        self.lookup.contains_key(&gid)
    }

    pub fn gids(&self) -> &[u64] {
        &self.gids
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// True when the two maps hold the same GIDs in the same order.
    pub fn same_as(&self, other: &Map) -> bool {
        self.gids == other.gids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lid_lookup_round_trip() {
        let map = Map::new(vec![4, 7, 2], Comm::serial());
        assert_eq!(map.num_local(), 3);
        assert_eq!(map.gid(1), 7);
        assert_eq!(map.lid(2), Some(2));
        assert_eq!(map.lid(5), None);
    }

    #[test]
    fn contiguous_map() {
        let map = Map::contiguous(5, Comm::serial());
        assert_eq!(map.gids(), &[0, 1, 2, 3, 4]);
        assert!(map.contains(4));
        assert!(!map.contains(5));
    }

    #[test]
    fn serial_reductions_are_identity() {
        let comm = Comm::serial();
        assert_eq!(comm.sum_all(3.5), 3.5);
        assert_eq!(comm.max_all(-1.0), -1.0);
        assert_eq!(comm.size(), 1);
    }
}
