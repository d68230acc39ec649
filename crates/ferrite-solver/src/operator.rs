//! Operator trait for matrix-free products.

/// A linear operator that computes y = A * x for real (f64) vectors.
///
/// Implemented by the Jacobian matrices for GMRES and by the shifted-inverse
/// operator of the Krylov basis builder.
pub trait RealOperator: Send + Sync {
    /// Dimension of the operator (N x N).
    fn dim(&self) -> usize;

    /// Apply the operator: y = A * x.
    fn apply(&self, x: &[f64], y: &mut [f64]);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scale(f64, usize);

    impl RealOperator for Scale {
        fn dim(&self) -> usize {
            self.1
        }

        fn apply(&self, x: &[f64], y: &mut [f64]) {
            for (yi, xi) in y.iter_mut().zip(x) {
                *yi = self.0 * xi;
            }
        }
    }

    #[test]
    fn real_operator_basic() {
        let op = Scale(2.5, 3);
        let mut y = vec![0.0; 3];
        op.apply(&[1.0, 2.0, 4.0], &mut y);
        assert_eq!(op.dim(), 3);
        assert_eq!(y, vec![2.5, 5.0, 10.0]);
    }
}
