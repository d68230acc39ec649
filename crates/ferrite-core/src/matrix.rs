//! Fixed-pattern sparse matrix for DAE Jacobians.

use std::sync::Arc;

use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::sparsity::{JacHandle, SparsityPattern};

/// Sparse matrix whose pattern is frozen at construction.
///
/// Storage is compressed-row. The pattern is shared (dQ/dx and dF/dx use the
/// same one), so only the value array is ever written after setup.
#[derive(Debug, Clone)]
pub struct DaeMatrix {
    pattern: Arc<SparsityPattern>,
    values: Vec<f64>,
}

impl DaeMatrix {
    pub fn new(pattern: Arc<SparsityPattern>) -> Self {
        let values = vec![0.0; pattern.nnz()];
        Self { pattern, values }
    }

    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }

    pub fn size(&self) -> usize {
        self.pattern.size()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn zero(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Multiply every stored value by `a`.
    pub fn scale(&mut self, a: f64) {
        self.values.iter_mut().for_each(|v| *v *= a);
    }

    /// Accumulate into the entry behind `handle`.
    #[inline]
    pub fn add(&mut self, handle: JacHandle, value: f64) {
        let slot = self.pattern.slot(handle);
        self.values[slot] += value;
    }

    /// Accumulate when the entry exists (ground-connected stamps have none).
    #[inline]
    pub fn add_opt(&mut self, handle: Option<JacHandle>, value: f64) {
        if let Some(h) = handle {
            self.add(h, value);
        }
    }

    /// Value at `(row, col)`; entries outside the pattern read as zero.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.pattern
            .position(row, col)
            .map(|slot| self.values[slot])
            .unwrap_or(0.0)
    }

    /// Overwrite an existing entry.
    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        let slot = self
            .pattern
            .position(row, col)
            .ok_or(Error::UnregisteredEntry { row, col })?;
        self.values[slot] = value;
        Ok(())
    }

    /// Iterate the stored `(col, value)` pairs of one row.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.pattern.row_range(row);
        self.pattern.col_idx()[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    /// Number of numerically nonzero entries in a row.
    pub fn nonzero_count(&self, row: usize) -> usize {
        self.row(row).filter(|&(_, v)| v != 0.0).count()
    }

    /// y = A * x
    pub fn matvec(&self, x: &[f64], y: &mut [f64]) {
        let n = self.size();
        assert_eq!(x.len(), n);
        assert_eq!(y.len(), n);

        let row_ptr = self.pattern.row_ptr();
        let col_idx = self.pattern.col_idx();
        for (i, yi) in y.iter_mut().enumerate() {
            let mut sum = 0.0;
            for k in row_ptr[i]..row_ptr[i + 1] {
                sum += self.values[k] * x[col_idx[k]];
            }
            *yi = sum;
        }
    }

    /// Returns `a * self + b * other`. Both matrices must share a pattern.
    pub fn linear_combination(&self, a: f64, b: f64, other: &DaeMatrix) -> Result<DaeMatrix> {
        if !Arc::ptr_eq(&self.pattern, &other.pattern) && self.pattern != other.pattern {
            return Err(Error::DimensionMismatch {
                expected: self.pattern.nnz(),
                actual: other.pattern.nnz(),
            });
        }
        let values = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&x, &y)| a * x + b * y)
            .collect();
        Ok(DaeMatrix {
            pattern: Arc::clone(&self.pattern),
            values,
        })
    }

    /// Overwrite with `a * x + b * y`. All three matrices must share a pattern.
    pub fn assign_combination(&mut self, a: f64, x: &DaeMatrix, b: f64, y: &DaeMatrix) -> Result<()> {
        for other in [x, y] {
            if !Arc::ptr_eq(&self.pattern, &other.pattern) && self.pattern != other.pattern {
                return Err(Error::DimensionMismatch {
                    expected: self.pattern.nnz(),
                    actual: other.pattern.nnz(),
                });
            }
        }
        for ((v, &xv), &yv) in self.values.iter_mut().zip(&x.values).zip(&y.values) {
            *v = a * xv + b * yv;
        }
        Ok(())
    }

    /// Stored entries as `(row, col, value)`, including explicit zeros.
    pub fn triplets(&self) -> Vec<(usize, usize, f64)> {
        let mut out = Vec::with_capacity(self.values.len());
        for row in 0..self.size() {
            out.extend(self.row(row).map(|(col, v)| (row, col, v)));
        }
        out
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.size(), self.size());
        for (r, c, v) in self.triplets() {
            dense[(r, c)] = v;
        }
        dense
    }

    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.size()).map(|i| self.get(i, i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparsity::SparsityBuilder;
    use crate::topology::VarId;

    fn two_by_two() -> (DaeMatrix, JacHandle, JacHandle) {
        let mut builder = SparsityBuilder::new(2);
        let h01 = builder.request(VarId::new(0), VarId::new(1)).unwrap();
        builder.ensure_diagonal();
        let h11 = builder.request(VarId::new(1), VarId::new(1)).unwrap();
        (DaeMatrix::new(Arc::new(builder.finalize())), h01, h11)
    }

    #[test]
    fn accumulate_and_read() {
        let (mut m, h01, h11) = two_by_two();
        m.add(h01, 1.5);
        m.add(h01, 0.5);
        m.add(h11, 3.0);

        assert!((m.get(0, 1) - 2.0).abs() < 1e-15);
        assert!((m.get(1, 1) - 3.0).abs() < 1e-15);
        assert_eq!(m.get(1, 0), 0.0);
        assert_eq!(m.nonzero_count(0), 1);
        assert!(m.set(1, 0, 1.0).is_err());
    }

    #[test]
    fn matvec_matches_dense() {
        let (mut m, h01, h11) = two_by_two();
        m.add(h01, 2.0);
        m.add(h11, -1.0);
        m.set(0, 0, 4.0).unwrap();

        let x = [1.0, 3.0];
        let mut y = [0.0; 2];
        m.matvec(&x, &mut y);

        let dense = m.to_dense() * nalgebra::DVector::from_column_slice(&x);
        assert!((y[0] - dense[0]).abs() < 1e-15);
        assert!((y[1] - dense[1]).abs() < 1e-15);
        assert!((y[0] - 10.0).abs() < 1e-15);
    }

    #[test]
    fn linear_combination_requires_same_pattern() {
        let (mut g, h01, _) = two_by_two();
        let mut c = DaeMatrix::new(Arc::clone(g.pattern()));
        g.add(h01, 1.0);
        c.add(h01, 2.0);

        let sum = g.linear_combination(1.0, 0.5, &c).unwrap();
        assert!((sum.get(0, 1) - 2.0).abs() < 1e-15);

        let (other, _, _) = two_by_two();
        let mut b = SparsityBuilder::new(3);
        b.ensure_diagonal();
        let foreign = DaeMatrix::new(Arc::new(b.finalize()));
        assert!(other.linear_combination(1.0, 1.0, &foreign).is_err());
    }
}
