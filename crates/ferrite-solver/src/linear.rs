//! Linear system solvers.

use faer::prelude::*;
use faer::sparse::linalg::solvers::{Lu, SymbolicLu};
use faer::sparse::{SparseColMat, Triplet};
use ferrite_core::DaeMatrix;
use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

/// Solve a linear system Ax = b using LU decomposition.
pub fn solve_dense(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    if a.nrows() != a.ncols() {
        return Err(Error::DimensionMismatch {
            expected: a.nrows(),
            actual: a.ncols(),
        });
    }
    if a.nrows() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.nrows(),
            actual: b.len(),
        });
    }

    let x = a.clone().lu().solve(b).ok_or(Error::SingularMatrix)?;
    if x.iter().any(|v| !v.is_finite()) {
        return Err(Error::SingularMatrix);
    }
    Ok(x)
}

/// Solve a sparse linear system Ax = b using sparse LU decomposition.
///
/// The matrix is constructed from triplets `(row, col, value)`. Duplicate entries
/// at the same position are summed automatically by faer.
pub fn solve_sparse(
    size: usize,
    triplets: &[(usize, usize, f64)],
    rhs: &DVector<f64>,
) -> Result<DVector<f64>> {
    if size != rhs.len() {
        return Err(Error::DimensionMismatch {
            expected: size,
            actual: rhs.len(),
        });
    }

    let faer_triplets: Vec<_> = triplets
        .iter()
        .map(|&(r, c, v)| Triplet::new(r, c, v))
        .collect();

    let sparse_mat = SparseColMat::<usize, f64>::try_new_from_triplets(size, size, &faer_triplets)
        .map_err(|_| Error::SingularMatrix)?;

    let lu = sparse_mat.sp_lu().map_err(|_| Error::SingularMatrix)?;

    let faer_rhs = Col::<f64>::from_fn(size, |i| rhs[i]);
    let faer_x = lu.solve(&faer_rhs);

    let x = DVector::from_fn(size, |i, _| faer_x[i]);
    if x.iter().any(|v| !v.is_finite()) {
        return Err(Error::SingularMatrix);
    }
    Ok(x)
}

/// Convert a fixed-pattern matrix to faer's column-major sparse format.
///
/// Explicit zeros are kept so the symbolic structure matches the pattern.
pub fn to_faer(matrix: &DaeMatrix) -> Result<SparseColMat<usize, f64>> {
    let n = matrix.size();
    let triplets: Vec<_> = matrix
        .triplets()
        .into_iter()
        .map(|(r, c, v)| Triplet::new(r, c, v))
        .collect();
    SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets).map_err(|e| {
        Error::LinearSolve {
            stage: "matrix conversion".into(),
            reason: format!("{:?}", e),
        }
    })
}

/// Pluggable direct sparse solver.
///
/// The three phases mirror a classic sparse direct package: the symbolic
/// analysis depends only on the pattern and runs once; the numeric
/// factorization runs whenever values change; `solve` may be called any
/// number of times against the latest factors.
pub trait DirectSolver: Send {
    fn symbolic_factorization(&mut self, matrix: &DaeMatrix) -> Result<()>;

    fn numeric_factorization(&mut self, matrix: &DaeMatrix) -> Result<()>;

    fn solve(&self, rhs: &DVector<f64>) -> Result<DVector<f64>>;

    /// Convenience: symbolic (if not cached) then numeric factorization.
    fn factor(&mut self, matrix: &DaeMatrix) -> Result<()> {
        if !self.has_symbolic() {
            self.symbolic_factorization(matrix)?;
        }
        self.numeric_factorization(matrix)
    }

    fn has_symbolic(&self) -> bool;
}

/// faer sparse LU with the symbolic factorization cached across numeric refactorizations.
#[derive(Default)]
pub struct FaerLu {
    symbolic: Option<SymbolicLu<usize>>,
    size: usize,
    numeric: Option<Lu<usize, f64>>,
}

impl FaerLu {
    pub fn new() -> Self {
        Self::default()
    }

    /// A solver that reuses this one's symbolic analysis but owns its own numeric factors.
    pub fn fork(&self) -> Self {
        Self {
            symbolic: self.symbolic.clone(),
            size: self.size,
            numeric: None,
        }
    }

    /// Drop the cached symbolic factorization (call when the pattern changes).
    pub fn reset(&mut self) {
        self.symbolic = None;
        self.numeric = None;
        self.size = 0;
    }
}

impl std::fmt::Debug for FaerLu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaerLu")
            .field("size", &self.size)
            .field("symbolic", &self.symbolic.is_some())
            .field("numeric", &self.numeric.is_some())
            .finish()
    }
}

impl DirectSolver for FaerLu {
    fn symbolic_factorization(&mut self, matrix: &DaeMatrix) -> Result<()> {
        let mat = to_faer(matrix)?;
        let symbolic = SymbolicLu::try_new(mat.symbolic()).map_err(|e| Error::LinearSolve {
            stage: "symbolic factorization".into(),
            reason: format!("{:?}", e),
        })?;
        self.symbolic = Some(symbolic);
        self.size = matrix.size();
        self.numeric = None;
        Ok(())
    }

    fn numeric_factorization(&mut self, matrix: &DaeMatrix) -> Result<()> {
        if matrix.size() != self.size {
            return Err(Error::DimensionMismatch {
                expected: self.size,
                actual: matrix.size(),
            });
        }
        let symbolic = self.symbolic.as_ref().ok_or_else(|| Error::LinearSolve {
            stage: "numeric factorization".into(),
            reason: "no symbolic factorization".into(),
        })?;
        let mat = to_faer(matrix)?;
        let lu = Lu::try_new_with_symbolic(symbolic.clone(), mat.as_ref()).map_err(|e| {
            Error::LinearSolve {
                stage: "numeric factorization".into(),
                reason: format!("{:?}", e),
            }
        })?;
        self.numeric = Some(lu);
        Ok(())
    }

    fn solve(&self, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        let lu = self.numeric.as_ref().ok_or_else(|| Error::LinearSolve {
            stage: "solve".into(),
            reason: "matrix not factored".into(),
        })?;
        if rhs.len() != self.size {
            return Err(Error::DimensionMismatch {
                expected: self.size,
                actual: rhs.len(),
            });
        }

        let b = Col::<f64>::from_fn(self.size, |i| rhs[i]);
        let x = lu.solve(&b);

        let out = DVector::from_fn(self.size, |i, _| x[i]);
        if out.iter().any(|v| !v.is_finite()) {
            return Err(Error::SingularMatrix);
        }
        Ok(out)
    }

    fn has_symbolic(&self) -> bool {
        self.symbolic.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ferrite_core::{SparsityBuilder, VarId};
    use nalgebra::{dmatrix, dvector};

    fn tridiagonal(n: usize, diag: f64, off: f64) -> DaeMatrix {
        let mut builder = SparsityBuilder::new(n);
        for i in 0..n {
            if i > 0 {
                builder.request(VarId::new(i), VarId::new(i - 1)).unwrap();
            }
            if i + 1 < n {
                builder.request(VarId::new(i), VarId::new(i + 1)).unwrap();
            }
        }
        builder.ensure_diagonal();
        let mut m = DaeMatrix::new(Arc::new(builder.finalize()));
        for i in 0..n {
            m.set(i, i, diag).unwrap();
            if i > 0 {
                m.set(i, i - 1, off).unwrap();
            }
            if i + 1 < n {
                m.set(i, i + 1, off).unwrap();
            }
        }
        m
    }

    #[test]
    fn test_solve_simple() {
        // 2x + y = 5
        // x + 3y = 6
        let a = dmatrix![2.0, 1.0; 1.0, 3.0];
        let b = dvector![5.0, 6.0];

        let x = solve_dense(&a, &b).unwrap();

        assert!((x[0] - 1.8).abs() < 1e-10);
        assert!((x[1] - 1.4).abs() < 1e-10);
    }

    #[test]
    fn test_solve_singular() {
        let a = dmatrix![1.0, 2.0; 2.0, 4.0];
        let b = dvector![1.0, 2.0];
        assert!(solve_dense(&a, &b).is_err());
    }

    #[test]
    fn test_solve_dimension_mismatch() {
        let a = dmatrix![1.0, 0.0; 0.0, 1.0];
        let b = dvector![1.0, 2.0, 3.0];
        assert!(matches!(
            solve_dense(&a, &b),
            Err(Error::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_sparse_matches_dense() {
        let triplets = vec![(0, 0, 4.0), (0, 1, -1.0), (1, 0, -1.0), (1, 1, 4.0), (1, 1, 0.5)];
        let b = dvector![1.0, 2.0];
        let x = solve_sparse(2, &triplets, &b).unwrap();

        let dense = dmatrix![4.0, -1.0; -1.0, 4.5];
        let expected = solve_dense(&dense, &b).unwrap();
        for i in 0..2 {
            assert!((x[i] - expected[i]).abs() < 1e-12, "x[{}] = {}", i, x[i]);
        }
    }

    #[test]
    fn test_faer_lu_reuses_symbolic() {
        let mut a = tridiagonal(20, 4.0, -1.0);
        let mut lu = FaerLu::new();
        assert!(!lu.has_symbolic());
        lu.factor(&a).unwrap();
        assert!(lu.has_symbolic());

        let b = DVector::from_element(20, 1.0);
        let x = lu.solve(&b).unwrap();
        let mut ax = vec![0.0; 20];
        a.matvec(x.as_slice(), &mut ax);
        for i in 0..20 {
            assert!((ax[i] - 1.0).abs() < 1e-10, "residual at {}: {}", i, ax[i] - 1.0);
        }

        // New values, same pattern: only numeric refactorization.
        for i in 0..20 {
            a.set(i, i, 8.0).unwrap();
        }
        lu.factor(&a).unwrap();
        let x2 = lu.solve(&b).unwrap();
        a.matvec(x2.as_slice(), &mut ax);
        for i in 0..20 {
            assert!((ax[i] - 1.0).abs() < 1e-10);
        }
        assert!((x2[0] - x[0]).abs() > 1e-3);
    }

    #[test]
    fn test_faer_lu_solve_before_factor() {
        let lu = FaerLu::new();
        assert!(lu.solve(&dvector![1.0]).is_err());
    }
}
