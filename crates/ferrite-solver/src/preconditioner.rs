//! Preconditioners for the GMRES path.

use ferrite_core::DaeMatrix;

/// Approximate inverse applied as `y = M^-1 x`.
pub trait RealPreconditioner: Send + Sync {
    fn apply(&self, x: &[f64], y: &mut [f64]);
}

/// Diagonal scaling by the Jacobian's own diagonal.
///
/// Branch-current rows of an MNA Jacobian usually have a zero diagonal and
/// pass through unscaled.
#[derive(Debug, Clone)]
pub struct JacobiPreconditioner {
    inv_diag: Vec<f64>,
}

impl JacobiPreconditioner {
    pub fn from_diagonal(diag: &[f64]) -> Self {
        let inv_diag = diag
            .iter()
            .map(|&d| if d == 0.0 || !d.is_finite() { 1.0 } else { d.recip() })
            .collect();
        Self { inv_diag }
    }

    pub fn from_matrix(matrix: &DaeMatrix) -> Self {
        Self::from_diagonal(&matrix.diagonal())
    }

    pub fn len(&self) -> usize {
        self.inv_diag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inv_diag.is_empty()
    }
}

impl RealPreconditioner for JacobiPreconditioner {
    fn apply(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.inv_diag.len());
        for ((yi, xi), inv) in y.iter_mut().zip(x).zip(&self.inv_diag) {
            *yi = xi * inv;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_core::SparsityBuilder;
    use std::sync::Arc;

    #[test]
    fn scales_by_the_inverse_diagonal() {
        let p = JacobiPreconditioner::from_diagonal(&[2.0, 4.0, 0.0]);
        let mut y = vec![0.0; 3];
        p.apply(&[2.0, 4.0, 7.0], &mut y);
        assert_eq!(y, vec![1.0, 1.0, 7.0]);
    }

    #[test]
    fn branch_rows_pass_through() {
        // node row with conductance 0.5, branch row with an empty diagonal
        let mut b = SparsityBuilder::new(2);
        b.ensure_diagonal();
        let mut m = DaeMatrix::new(Arc::new(b.finalize()));
        m.set(0, 0, 0.5).unwrap();
        let p = JacobiPreconditioner::from_matrix(&m);
        assert_eq!(p.len(), 2);
        let mut y = vec![0.0; 2];
        p.apply(&[1.0, 3.0], &mut y);
        assert_eq!(y, vec![2.0, 3.0]);
    }
}
