//! Right-preconditioned restarted GMRES over a [`RealOperator`].

use nalgebra::{DMatrix, DVector};

use crate::operator::RealOperator;
use crate::preconditioner::RealPreconditioner;

use super::GmresConfig;

/// Norms below this count as zero.
const TINY: f64 = 1e-30;

/// Outcome of [`solve_gmres`].
#[derive(Debug, Clone)]
pub struct GmresResult {
    pub x: Vec<f64>,
    /// Arnoldi steps over all restarts.
    pub iterations: usize,
    /// Final `||b - Ax|| / ||b||`.
    pub residual: f64,
    pub converged: bool,
}

/// Plane rotation zeroing `b` against `a`.
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b.abs() < TINY {
        return (1.0, 0.0);
    }
    let r = a.hypot(b);
    (a / r, b / r)
}

fn apply(op: &dyn RealOperator, x: &DVector<f64>) -> DVector<f64> {
    let mut y = DVector::zeros(x.len());
    op.apply(x.as_slice(), y.as_mut_slice());
    y
}

/// Solve `A x = b` starting from zero.
///
/// With a preconditioner `M` the iteration runs on `A M^-1 y = b` and
/// returns `x = M^-1 y`, so the monitored residual is the true one.
pub fn solve_gmres(
    op: &dyn RealOperator,
    precond: Option<&dyn RealPreconditioner>,
    b: &[f64],
    config: &GmresConfig,
) -> GmresResult {
    let n = op.dim();
    debug_assert_eq!(b.len(), n);
    let b = DVector::from_column_slice(b);
    let b_norm = b.norm();
    let mut x = DVector::<f64>::zeros(n);
    if b_norm < TINY {
        return GmresResult {
            x: x.as_slice().to_vec(),
            iterations: 0,
            residual: 0.0,
            converged: true,
        };
    }

    let m = config.restart.clamp(1, n.max(1));
    let precondition = |v: &DVector<f64>| -> DVector<f64> {
        match precond {
            Some(p) => {
                let mut z = DVector::zeros(v.len());
                p.apply(v.as_slice(), z.as_mut_slice());
                z
            }
            None => v.clone(),
        }
    };

    let mut iterations = 0;
    loop {
        let r = &b - apply(op, &x);
        let beta = r.norm();
        let rel = beta / b_norm;
        if rel < config.tol || iterations >= config.max_iter {
            return GmresResult {
                x: x.as_slice().to_vec(),
                iterations,
                residual: rel,
                converged: rel < config.tol,
            };
        }

        let mut basis: Vec<DVector<f64>> = vec![r / beta];
        let mut search: Vec<DVector<f64>> = Vec::with_capacity(m);
        // column k holds the rotated k-th Hessenberg column
        let mut h = DMatrix::<f64>::zeros(m + 1, m);
        let mut rot: Vec<(f64, f64)> = Vec::with_capacity(m);
        let mut g = DVector::<f64>::zeros(m + 1);
        g[0] = beta;

        let mut k = 0;
        while k < m && iterations < config.max_iter {
            iterations += 1;
            let z = precondition(&basis[k]);
            let mut w = apply(op, &z);
            search.push(z);

            // modified Gram-Schmidt
            for (j, vj) in basis.iter().enumerate() {
                let hj = vj.dot(&w);
                h[(j, k)] = hj;
                w.axpy(-hj, vj, 1.0);
            }
            let w_norm = w.norm();
            h[(k + 1, k)] = w_norm;

            for (j, &(c, s)) in rot.iter().enumerate() {
                let (upper, lower) = (h[(j, k)], h[(j + 1, k)]);
                h[(j, k)] = c * upper + s * lower;
                h[(j + 1, k)] = c * lower - s * upper;
            }
            let (c, s) = givens(h[(k, k)], h[(k + 1, k)]);
            rot.push((c, s));
            h[(k, k)] = c * h[(k, k)] + s * h[(k + 1, k)];
            h[(k + 1, k)] = 0.0;
            g[k + 1] = -s * g[k];
            g[k] *= c;

            k += 1;
            if w_norm < TINY {
                break;
            }
            basis.push(w / w_norm);
            if g[k].abs() / b_norm < config.tol {
                break;
            }
        }

        // upper-triangular solve for the first k coefficients
        let mut y = DVector::<f64>::zeros(k);
        for i in (0..k).rev() {
            let tail: f64 = ((i + 1)..k).map(|j| h[(i, j)] * y[j]).sum();
            if h[(i, i)].abs() > TINY {
                y[i] = (g[i] - tail) / h[(i, i)];
            }
        }
        for (z, &yi) in search.iter().zip(y.iter()) {
            x.axpy(yi, z, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preconditioner::JacobiPreconditioner;

    /// Tridiagonal ladder-network conductance matrix.
    struct Ladder(DMatrix<f64>);

    impl Ladder {
        fn new(n: usize) -> Self {
            Self(DMatrix::from_fn(n, n, |i, j| {
                if i == j {
                    2.0 + i as f64 * 0.1
                } else if i.abs_diff(j) == 1 {
                    -1.0
                } else {
                    0.0
                }
            }))
        }
    }

    impl RealOperator for Ladder {
        fn dim(&self) -> usize {
            self.0.nrows()
        }

        fn apply(&self, x: &[f64], y: &mut [f64]) {
            let out = &self.0 * DVector::from_column_slice(x);
            y.copy_from_slice(out.as_slice());
        }
    }

    #[test]
    fn solves_a_ladder_without_preconditioning() {
        let op = Ladder::new(40);
        let result = solve_gmres(&op, None, &[1.0; 40], &GmresConfig::default());
        assert!(result.converged, "residual {}", result.residual);
        let ax = &op.0 * DVector::from_vec(result.x);
        assert!(ax.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn restarts_with_jacobi() {
        let op = Ladder::new(60);
        let precond = JacobiPreconditioner::from_diagonal(op.0.diagonal().as_slice());
        let config = GmresConfig {
            restart: 10,
            ..Default::default()
        };
        let b: Vec<f64> = (0..60).map(|i| (i as f64).sin()).collect();
        let result = solve_gmres(&op, Some(&precond), &b, &config);
        assert!(result.converged, "residual {}", result.residual);
        assert!(result.residual < 1e-8);
    }

    #[test]
    fn zero_rhs_returns_immediately() {
        let result = solve_gmres(&Ladder::new(5), None, &[0.0; 5], &GmresConfig::default());
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert!(result.x.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn stops_at_the_iteration_limit() {
        let config = GmresConfig {
            max_iter: 3,
            restart: 3,
            tol: 1e-14,
        };
        let result = solve_gmres(&Ladder::new(50), None, &[1.0; 50], &config);
        assert!(!result.converged);
        assert_eq!(result.iterations, 3);
    }

    #[test]
    fn rotation_zeroes_the_subdiagonal() {
        let (c, s) = givens(3.0, 4.0);
        assert!((c * 4.0 - s * 3.0).abs() < 1e-12);
        assert!((c * c + s * s - 1.0).abs() < 1e-15);
    }
}
