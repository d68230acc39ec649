//! Block Arnoldi basis for multi-port PRIMA.
//!
//! The basis spans `K_k((G + s0 C)^-1 C, R)` with `R = (G + s0 C)^-1 B`, one
//! block of `P` columns per Krylov power. Columns are orthonormalized by
//! modified Gram-Schmidt with one reorthogonalization pass.

use ferrite_core::DaeMatrix;
use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::linear::{DirectSolver, FaerLu};
use crate::operator::RealOperator;

/// Relative norm below which a new direction counts as linearly dependent.
const BREAKDOWN_TOL: f64 = 1e-10;

/// Applies `(G + s0 C)^-1 C` with a factorization of `G + s0 C`.
///
/// A failed solve leaves NaN in the output, which the basis builder reports.
pub struct ShiftInvertOperator<'a> {
    lu: &'a FaerLu,
    c: &'a DaeMatrix,
}

impl<'a> ShiftInvertOperator<'a> {
    pub fn new(lu: &'a FaerLu, c: &'a DaeMatrix) -> Self {
        Self { lu, c }
    }
}

impl RealOperator for ShiftInvertOperator<'_> {
    fn dim(&self) -> usize {
        self.c.size()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let mut cx = DVector::zeros(x.len());
        self.c.matvec(x, cx.as_mut_slice());
        match self.lu.solve(&cx) {
            Ok(sol) => y.copy_from_slice(sol.as_slice()),
            Err(_) => y.iter_mut().for_each(|v| *v = f64::NAN),
        }
    }
}

/// Block count and reduced order for a requested order.
///
/// The request is capped at the system size, then rounded down to a whole
/// number of port blocks. Returns `(kblock, clamped)`.
pub fn reduced_order(requested: usize, system_size: usize, num_ports: usize) -> (usize, bool) {
    if num_ports == 0 {
        return (0, false);
    }
    if requested > system_size {
        (system_size / num_ports, true)
    } else {
        (requested / num_ports, false)
    }
}

/// Orthonormal block Krylov basis.
#[derive(Debug, Clone)]
pub struct KrylovBasis {
    /// N x k, orthonormal columns.
    pub basis: DMatrix<f64>,
    /// Number of complete blocks in `basis`.
    pub blocks: usize,
    /// True when the iteration stopped early on a dependent direction.
    pub breakdown: bool,
}

/// Orthogonalize `w` against the first `count` columns of `basis`, twice.
///
/// Returns the norm of `w` after orthogonalization.
fn orthogonalize(basis: &DMatrix<f64>, count: usize, w: &mut DVector<f64>) -> f64 {
    for _ in 0..2 {
        for j in 0..count {
            let q = basis.column(j);
            let h = q.dot(w);
            w.axpy(-h, &q, 1.0);
        }
    }
    w.norm()
}

/// Build `kblock` blocks of the Krylov space of `op` seeded with the columns of `seed`.
///
/// A dependent direction ends the iteration; the basis is truncated to the
/// blocks completed before it. A dependent column in the seed block itself
/// is an error.
pub fn block_arnoldi(
    op: &dyn RealOperator,
    seed: &DMatrix<f64>,
    kblock: usize,
) -> Result<KrylovBasis> {
    let n = seed.nrows();
    let p = seed.ncols();
    if op.dim() != n {
        return Err(Error::DimensionMismatch {
            expected: op.dim(),
            actual: n,
        });
    }
    let mut basis = DMatrix::zeros(n, kblock * p);
    if kblock == 0 || p == 0 {
        return Ok(KrylovBasis {
            basis,
            blocks: 0,
            breakdown: false,
        });
    }

    for j in 0..p {
        let mut w = seed.column(j).into_owned();
        let before = w.norm();
        if !before.is_finite() {
            return Err(Error::LinearSolve {
                stage: "Krylov basis".into(),
                reason: "starting block is not finite".into(),
            });
        }
        let after = orthogonalize(&basis, j, &mut w);
        if before == 0.0 || after <= BREAKDOWN_TOL * before {
            return Err(Error::LinearSolve {
                stage: "Krylov basis".into(),
                reason: format!("starting block is rank deficient at column {}", j),
            });
        }
        basis.set_column(j, &(w / after));
    }

    let mut y = vec![0.0; n];
    for block in 1..kblock {
        for j in 0..p {
            let col = block * p + j;
            let src = basis.column(col - p).clone_owned();
            op.apply(src.as_slice(), &mut y);
            let mut w = DVector::from_column_slice(&y);
            let before = w.norm();
            if !before.is_finite() {
                return Err(Error::LinearSolve {
                    stage: "Krylov basis".into(),
                    reason: format!("operator application failed in block {}", block),
                });
            }
            let after = orthogonalize(&basis, col, &mut w);
            if before == 0.0 || after <= BREAKDOWN_TOL * before {
                warn!(
                    "Krylov breakdown in block {} of {}; reduced order truncated to {}",
                    block + 1,
                    kblock,
                    block * p
                );
                return Ok(KrylovBasis {
                    basis: basis.columns(0, block * p).into_owned(),
                    blocks: block,
                    breakdown: true,
                });
            }
            basis.set_column(col, &(w / after));
        }
    }

    Ok(KrylovBasis {
        basis,
        blocks: kblock,
        breakdown: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    struct Dense(DMatrix<f64>);

    impl RealOperator for Dense {
        fn dim(&self) -> usize {
            self.0.nrows()
        }

        fn apply(&self, x: &[f64], y: &mut [f64]) {
            let out = &self.0 * DVector::from_column_slice(x);
            y.copy_from_slice(out.as_slice());
        }
    }

    #[test]
    fn order_is_rounded_to_whole_blocks() {
        assert_eq!(reduced_order(7, 100, 2), (3, false));
        assert_eq!(reduced_order(6, 100, 3), (2, false));
        assert_eq!(reduced_order(1, 100, 2), (0, false));
    }

    #[test]
    fn order_is_clamped_only_above_system_size() {
        assert_eq!(reduced_order(10, 10, 1), (10, false));
        assert_eq!(reduced_order(11, 10, 1), (10, true));
        assert_eq!(reduced_order(11, 10, 3), (3, true));
    }

    #[test]
    fn basis_is_orthonormal() {
        let a = dmatrix![
            2.0, 1.0, 0.0, 0.0;
            1.0, 3.0, 1.0, 0.0;
            0.0, 1.0, 4.0, 1.0;
            0.0, 0.0, 1.0, 5.0
        ];
        let seed = dmatrix![1.0; 0.0; 0.0; 0.0];
        let k = block_arnoldi(&Dense(a), &seed, 3).unwrap();
        assert!(!k.breakdown);
        assert_eq!(k.basis.ncols(), 3);
        let gram = k.basis.transpose() * &k.basis;
        assert!((gram - DMatrix::identity(3, 3)).amax() < 1e-12);
    }

    #[test]
    fn invariant_subspace_truncates_to_whole_blocks() {
        // diagonal operator: the seed only excites two eigenvectors
        let a = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]));
        let seed = dmatrix![1.0; 1.0; 0.0; 0.0];
        let k = block_arnoldi(&Dense(a), &seed, 4).unwrap();
        assert!(k.breakdown);
        assert_eq!(k.blocks, 2);
        assert_eq!(k.basis.ncols(), 2);
    }

    #[test]
    fn dependent_seed_columns_are_an_error() {
        let a = DMatrix::identity(3, 3);
        let seed = dmatrix![1.0, 2.0; 0.0, 0.0; 1.0, 2.0];
        assert!(matches!(
            block_arnoldi(&Dense(a), &seed, 1),
            Err(Error::LinearSolve { .. })
        ));
    }

    #[test]
    fn multi_port_blocks_stay_orthonormal() {
        let a = DMatrix::from_fn(6, 6, |i, j| 1.0 / (1.0 + i as f64 + 2.0 * j as f64));
        let seed = dmatrix![1.0, 0.0; 0.0, 1.0; 0.5, 0.0; 0.0, 0.5; 0.0, 0.0; 1.0, 1.0];
        let k = block_arnoldi(&Dense(a), &seed, 2).unwrap();
        assert_eq!(k.basis.ncols(), 4);
        let gram = k.basis.transpose() * &k.basis;
        assert!((gram - DMatrix::identity(4, 4)).amax() < 1e-10);
    }
}
