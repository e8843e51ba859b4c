//! Distributed vector over a map.

use std::sync::Arc;

use nalgebra::DVector;

use crate::error::LinearSolveError;
use crate::map::Map;

#[derive(Debug, Clone)]
pub struct DistVector {
    map: Arc<Map>,
    values: DVector<f64>,
}

impl DistVector {
    pub fn new(map: Arc<Map>) -> Self {
        let n = map.num_local();
        Self {
            map,
            values: DVector::zeros(n),
        }
    }

    pub fn from_values(map: Arc<Map>, values: DVector<f64>) -> Self {
        assert_eq!(map.num_local(), values.len());
        Self { map, values }
    }

    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.len() == 0
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut DVector<f64> {
        &mut self.values
    }

    pub fn put_scalar(&mut self, v: f64) {
        self.values.fill(v);
    }

    pub fn local(&self, lid: usize) -> f64 {
        self.values[lid]
    }

    pub fn set_local(&mut self, lid: usize, v: f64) {
        self.values[lid] = v;
    }

    pub fn get_global(&self, gid: u64) -> Option<f64> {
        self.map.lid(gid).map(|lid| self.values[lid])
    }

    pub fn sum_into_global(&mut self, gid: u64, v: f64) -> Result<(), LinearSolveError> {
        let lid = self
            .map
            .lid(gid)
            .ok_or(LinearSolveError::NotInMap(gid))?;
        self.values[lid] += v;
        Ok(())
    }

    pub fn replace_global(&mut self, gid: u64, v: f64) -> Result<(), LinearSolveError> {
        let lid = self
            .map
            .lid(gid)
            .ok_or(LinearSolveError::NotInMap(gid))?;
        self.values[lid] = v;
        Ok(())
    }

    /// self <- alpha * x + beta * self
    pub fn update(&mut self, alpha: f64, x: &DistVector, beta: f64) {
        debug_assert!(self.map.same_as(x.map()));
        for (s, xv) in self.values.iter_mut().zip(x.values.iter()) {
            *s = alpha * *xv + beta * *s;
        }
    }

    pub fn scale(&mut self, alpha: f64) {
        self.values *= alpha;
    }

    pub fn dot(&self, other: &DistVector) -> f64 {
        let local = self.values.dot(&other.values);
        self.map.comm().sum_all(local)
    }

    pub fn norm_two(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn norm_inf(&self) -> f64 {
        let local = self
            .values
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));
        self.map.comm().max_all(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Comm;

    fn make(gids: Vec<u64>) -> DistVector {
        DistVector::new(Arc::new(Map::new(gids, Comm::serial())))
    }

    #[test]
    fn global_accumulation() {
        let mut v = make(vec![10, 20, 30]);
        v.sum_into_global(20, 2.0).unwrap();
        v.sum_into_global(20, 3.0).unwrap();
        assert_eq!(v.get_global(20), Some(5.0));
        assert!(v.sum_into_global(99, 1.0).is_err());
    }

    #[test]
    fn norms_and_update() {
        let mut a = make(vec![0, 1]);
        let mut b = make(vec![0, 1]);
        a.set_local(0, 3.0);
        a.set_local(1, -4.0);
        b.put_scalar(1.0);

        assert!((a.norm_two() - 5.0).abs() < 1e-14);
        assert_eq!(a.norm_inf(), 4.0);

        // b <- 2a + b
        b.update(2.0, &a, 1.0);
        assert_eq!(b.local(0), 7.0);
        assert_eq!(b.local(1), -7.0);
    }
}
