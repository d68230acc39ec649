//! Eigen-sparsification of a reduced system.
//!
//! With `A = Ĝ⁻¹Ĉ = Q Λ Q⁻¹` the reduced system becomes `Ĝ = I`, `Ĉ` block
//! diagonal: a 1x1 block per real eigenvalue and a `[[a, -b], [b, a]]` block
//! per conjugate pair `a ± ib`. Conjugate eigenvectors are stored as their
//! real and imaginary parts in two adjacent real columns.

use std::sync::Arc;

use faer::Mat;
use ferrite_core::{DaeMatrix, SparsityBuilder, SparsityPattern, VarId};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use num_traits::One;

use super::reduced::ReducedSystem;
use crate::error::{Error, Result};

/// Relative imaginary part below which an eigenvalue is taken as real.
const REAL_EIGEN_TOL: f64 = 1e-12;

/// Reduced system in decoupled block form.
#[derive(Debug, Clone)]
pub struct SparseReducedSystem {
    /// Identity.
    pub g: DaeMatrix,
    /// Block-diagonal eigenvalue matrix.
    pub c: DaeMatrix,
    pub b: DMatrix<f64>,
    pub l: DMatrix<f64>,
    /// Eigenvalues of `Ĝ⁻¹Ĉ` in block order; one entry per conjugate pair.
    pub eigenvalues: Vec<Complex64>,
    /// Reciprocal 1-norm condition number of `Ĝ`.
    pub rcond: f64,
}

impl SparseReducedSystem {
    pub fn order(&self) -> usize {
        self.g.size()
    }

    /// Divide `Ĝ`, `Ĉ` and `L̂` by `factor`; the transfer function is unchanged.
    pub fn scale(&mut self, factor: f64) {
        let s = 1.0 / factor;
        self.g.scale(s);
        self.c.scale(s);
        self.l *= s;
    }
}

/// One column (real eigenvalue) or two (conjugate pair) of the packed basis.
enum Mode {
    Real(f64),
    Pair(f64, f64),
}

fn one_norm(m: &DMatrix<f64>) -> f64 {
    m.column_iter()
        .map(|c| c.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Eigenvalues and right eigenvectors of `a`, one entry per packed mode.
///
/// A conjugate pair is reported once, through its member with positive
/// imaginary part.
fn eigen_modes(a: &DMatrix<f64>) -> Result<Vec<(Mode, DVector<Complex64>)>> {
    let k = a.nrows();
    let scale = a.norm().max(f64::MIN_POSITIVE);
    let dense = Mat::<f64>::from_fn(k, k, |i, j| a[(i, j)]);
    let eig = dense.eigen().map_err(|e| Error::LinearSolve {
        stage: "sparsification".into(),
        reason: format!("eigendecomposition failed: {:?}", e),
    })?;
    let u = eig.U();
    let s = eig.S().column_vector();
    let column = |j: usize| DVector::from_fn(k, |i, _| u[(i, j)]);

    let mut modes = Vec::with_capacity(k);
    let mut j = 0;
    while j < k {
        let lambda: Complex64 = s[j];
        if lambda.im.abs() <= REAL_EIGEN_TOL * lambda.norm().max(scale) {
            modes.push((Mode::Real(lambda.re), column(j)));
            j += 1;
            continue;
        }
        // conjugate partners are adjacent
        let v = if lambda.im > 0.0 {
            column(j)
        } else {
            column(j).map(|x| x.conj())
        };
        modes.push((Mode::Pair(lambda.re, lambda.im.abs()), v));
        j += 2;
    }
    Ok(modes)
}

/// Rotate `v` so its largest component is real and positive.
fn fix_phase(v: &mut DVector<Complex64>) {
    let pivot = v
        .iter()
        .copied()
        .max_by(|a, b| a.norm().total_cmp(&b.norm()))
        .unwrap_or_else(Complex64::one);
    if pivot.norm() > 0.0 {
        let phase = pivot / pivot.norm();
        v.iter_mut().for_each(|x| *x /= phase);
    }
}

fn block_pattern(modes: &[Mode], k: usize) -> Result<Arc<SparsityPattern>> {
    let mut builder = SparsityBuilder::new(k);
    let mut i = 0;
    for mode in modes {
        match mode {
            Mode::Real(_) => i += 1,
            Mode::Pair(..) => {
                builder.request(VarId::new(i), VarId::new(i + 1))?;
                builder.request(VarId::new(i + 1), VarId::new(i))?;
                i += 2;
            }
        }
    }
    builder.ensure_diagonal();
    Ok(Arc::new(builder.finalize()))
}

/// Re-express `red` in decoupled block form.
pub fn sparsify(red: &ReducedSystem) -> Result<SparseReducedSystem> {
    let k = red.order();
    let g_lu = red.g.clone().lu();
    let g_inv = g_lu.try_inverse().ok_or_else(|| Error::LinearSolve {
        stage: "sparsification".into(),
        reason: "reduced G is singular".into(),
    })?;
    let rcond = 1.0 / (one_norm(&red.g) * one_norm(&g_inv));
    if rcond < f64::EPSILON.sqrt() {
        warn!("reduced G is ill-conditioned (rcond = {:.3e})", rcond);
    } else {
        debug!("reduced G rcond = {:.3e}", rcond);
    }

    let a = &g_inv * &red.c;
    let r = &g_inv * &red.b;

    let found = eigen_modes(&a)?;
    let packed: usize = found
        .iter()
        .map(|(m, _)| match m {
            Mode::Real(_) => 1,
            Mode::Pair(..) => 2,
        })
        .sum();
    if packed != k {
        return Err(Error::LinearSolve {
            stage: "sparsification".into(),
            reason: format!("eigenvalues pack into {} columns, expected {}", packed, k),
        });
    }

    let mut q = DMatrix::<Complex64>::zeros(k, k);
    let mut modes = Vec::with_capacity(found.len());
    let mut col = 0;
    for (mode, mut v) in found {
        match mode {
            Mode::Real(_) => {
                fix_phase(&mut v);
                let v = v.map(|x| Complex64::new(x.re, 0.0));
                let norm = v.norm();
                q.set_column(col, &v.unscale(norm));
                col += 1;
            }
            Mode::Pair(..) => {
                q.set_column(col, &v);
                q.set_column(col + 1, &v.map(|x| x.conj()));
                col += 2;
            }
        }
        modes.push(mode);
    }

    let q_inv = q.try_inverse().ok_or_else(|| Error::LinearSolve {
        stage: "sparsification".into(),
        reason: "eigenvector matrix is singular".into(),
    })?;

    // Real packing of Q⁻¹: a pair contributes the real and imaginary parts of one row.
    let mut t = DMatrix::<f64>::zeros(k, k);
    let mut i = 0;
    for mode in &modes {
        match mode {
            Mode::Real(_) => {
                for j in 0..k {
                    t[(i, j)] = q_inv[(i, j)].re;
                }
                i += 1;
            }
            Mode::Pair(..) => {
                for j in 0..k {
                    t[(i, j)] = q_inv[(i, j)].re;
                    t[(i + 1, j)] = q_inv[(i, j)].im;
                }
                i += 2;
            }
        }
    }
    let t_inv = t.clone().try_inverse().ok_or_else(|| Error::LinearSolve {
        stage: "sparsification".into(),
        reason: "packed eigenvector inverse is singular".into(),
    })?;

    let pattern = block_pattern(&modes, k)?;
    let mut g = DaeMatrix::new(Arc::clone(&pattern));
    let mut c = DaeMatrix::new(pattern);
    let mut eigenvalues = Vec::with_capacity(modes.len());
    let mut i = 0;
    for mode in &modes {
        match *mode {
            Mode::Real(re) => {
                g.set(i, i, 1.0)?;
                c.set(i, i, re)?;
                eigenvalues.push(Complex64::new(re, 0.0));
                i += 1;
            }
            Mode::Pair(re, im) => {
                g.set(i, i, 1.0)?;
                g.set(i + 1, i + 1, 1.0)?;
                c.set(i, i, re)?;
                c.set(i, i + 1, -im)?;
                c.set(i + 1, i, im)?;
                c.set(i + 1, i + 1, re)?;
                eigenvalues.push(Complex64::new(re, im));
                i += 2;
            }
        }
    }

    Ok(SparseReducedSystem {
        g,
        c,
        b: &t * r,
        l: t_inv.transpose() * &red.l,
        eigenvalues,
        rcond,
    })
}
