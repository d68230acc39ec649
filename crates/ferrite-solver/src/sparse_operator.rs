//! Operator wrappers around fixed-pattern DAE matrices.

use ferrite_core::DaeMatrix;

use crate::operator::RealOperator;

/// A [`DaeMatrix`] viewed as a linear operator.
pub struct MatrixOperator<'a> {
    matrix: &'a DaeMatrix,
}

impl<'a> MatrixOperator<'a> {
    pub fn new(matrix: &'a DaeMatrix) -> Self {
        Self { matrix }
    }
}

impl RealOperator for MatrixOperator<'_> {
    fn dim(&self) -> usize {
        self.matrix.size()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        self.matrix.matvec(x, y);
    }
}

/// The Newton iteration matrix `cj * dQ/dx + dF/dx` applied without forming it.
pub struct JacobianOperator<'a> {
    dq_dx: &'a DaeMatrix,
    df_dx: &'a DaeMatrix,
    cj: f64,
}

impl<'a> JacobianOperator<'a> {
    pub fn new(dq_dx: &'a DaeMatrix, df_dx: &'a DaeMatrix, cj: f64) -> Self {
        Self { dq_dx, df_dx, cj }
    }
}

impl RealOperator for JacobianOperator<'_> {
    fn dim(&self) -> usize {
        self.df_dx.size()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        self.df_dx.matvec(x, y);
        if self.cj != 0.0 {
            let mut qx = vec![0.0; x.len()];
            self.dq_dx.matvec(x, &mut qx);
            for (yi, qi) in y.iter_mut().zip(qx) {
                *yi += self.cj * qi;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_core::{SparsityBuilder, VarId};
    use std::sync::Arc;

    #[test]
    fn jacobian_operator_matches_combination() {
        let mut b = SparsityBuilder::new(2);
        b.request(VarId::new(0), VarId::new(1)).unwrap();
        b.ensure_diagonal();
        let pattern = Arc::new(b.finalize());

        let mut q = DaeMatrix::new(Arc::clone(&pattern));
        let mut f = DaeMatrix::new(pattern);
        q.set(0, 0, 1e-3).unwrap();
        f.set(0, 0, 2.0).unwrap();
        f.set(0, 1, -1.0).unwrap();
        f.set(1, 1, 3.0).unwrap();

        let op = JacobianOperator::new(&q, &f, 100.0);
        let x = [1.0, 2.0];
        let mut y = [0.0; 2];
        op.apply(&x, &mut y);

        let combined = f.linear_combination(1.0, 100.0, &q).unwrap();
        let mut expected = [0.0; 2];
        MatrixOperator::new(&combined).apply(&x, &mut expected);

        for i in 0..2 {
            assert!((y[i] - expected[i]).abs() < 1e-14, "y[{}] = {}", i, y[i]);
        }
    }
}
