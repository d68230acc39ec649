//! Damped Newton-Raphson driver.

use std::sync::Arc;

use ferrite_core::DaeMatrix;
use log::{debug, trace};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::dispatch::{DispatchConfig, LinearSolverKind};
use crate::gmres::solve_gmres;
use crate::linear::{DirectSolver, FaerLu};
use crate::preconditioner::JacobiPreconditioner;
use crate::sparse_operator::MatrixOperator;

/// Weighted update norm under which an exhausted iteration counts as stalled
/// rather than diverged.
const STALL_UPDATE_NORM: f64 = 10.0;

/// Weighted update norms above this are treated as a blown-up iteration.
const MAX_UPDATE_NORM: f64 = 1e15;

/// Convergence criteria for Newton-Raphson iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceCriteria {
    /// Absolute voltage tolerance (V).
    pub v_abstol: f64,
    /// Relative tolerance on every unknown.
    pub v_reltol: f64,
    /// Absolute current tolerance (A), applied to branch unknowns.
    pub i_abstol: f64,
    /// Maximum iterations before failure.
    pub max_iterations: usize,
    /// Largest residual entry accepted on the first iteration.
    pub residual_tol: f64,
    /// Conductance added across nonlinear junctions.
    pub gmin: f64,
    /// Residual-reducing step halvings per iteration (0 disables the line search).
    pub max_backtracks: usize,
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            v_abstol: 1e-6,
            v_reltol: 1e-3,
            i_abstol: 1e-12,
            max_iterations: 50,
            residual_tol: 1e-9,
            gmin: 1e-12,
            max_backtracks: 0,
        }
    }
}

impl ConvergenceCriteria {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_backtracks(mut self, max_backtracks: usize) -> Self {
        self.max_backtracks = max_backtracks;
        self
    }
}

/// Outcome of one nonlinear solve. [`ConvergenceStatus::code`] is positive on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Converged { iterations: usize },
    TooManyIterations,
    UpdateTooBig,
    /// Iteration limit hit while the update was close to tolerance.
    Stalled,
    LinearSolveFailed,
    LoadFailed,
}

impl ConvergenceStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Converged { iterations } => iterations.max(1) as i32,
            Self::TooManyIterations => -1,
            Self::UpdateTooBig => -2,
            Self::Stalled => -3,
            Self::LinearSolveFailed => -4,
            Self::LoadFailed => -5,
        }
    }

    pub fn is_converged(self) -> bool {
        self.code() > 0
    }
}

/// A square nonlinear system `r(x) = 0` with a sparse Jacobian.
pub trait NonlinearProblem {
    fn size(&self) -> usize;

    /// Evaluate residual and Jacobian at `x`.
    ///
    /// `iteration` increases monotonically across every load of the solver's
    /// lifetime. Returns `false` when a device reports a failure.
    fn load(&mut self, x: &DVector<f64>, iteration: u64) -> bool;

    fn residual(&self) -> &DVector<f64>;

    fn jacobian(&self) -> &DaeMatrix;

    /// Whether unknown `i` is a branch current (uses `i_abstol`).
    fn is_branch(&self, _i: usize) -> bool {
        false
    }
}

/// Counters accumulated over the solver's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NewtonStats {
    /// Iterations of the most recent solve.
    pub iterations: usize,
    pub total_iterations: usize,
    pub linear_solves: usize,
    pub last_update_norm: f64,
}

/// Newton driver with a cached sparse factorization.
#[derive(Debug)]
pub struct NonlinearSolver {
    criteria: ConvergenceCriteria,
    dispatch: DispatchConfig,
    lu: FaerLu,
    pattern_key: Option<usize>,
    load_counter: u64,
    stats: NewtonStats,
}

impl NonlinearSolver {
    pub fn new(criteria: ConvergenceCriteria) -> Self {
        Self {
            criteria,
            dispatch: DispatchConfig::default(),
            lu: FaerLu::new(),
            pattern_key: None,
            load_counter: 0,
            stats: NewtonStats::default(),
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn criteria(&self) -> &ConvergenceCriteria {
        &self.criteria
    }

    pub fn dispatch(&self) -> &DispatchConfig {
        &self.dispatch
    }

    pub fn stats(&self) -> NewtonStats {
        self.stats
    }

    /// Solve `r(x) = 0` starting from `x`, leaving the last iterate in `x`.
    pub fn solve(
        &mut self,
        problem: &mut dyn NonlinearProblem,
        x: &mut DVector<f64>,
    ) -> ConvergenceStatus {
        let mut last_norm = f64::INFINITY;

        for iter in 1..=self.criteria.max_iterations {
            self.stats.iterations = iter;
            self.stats.total_iterations += 1;

            if !self.load(problem, x) {
                debug!("newton: load failed at iteration {}", iter);
                return ConvergenceStatus::LoadFailed;
            }
            let r_norm = problem.residual().amax();
            let rhs = -problem.residual();

            let dx = match self.linear_solve(problem.jacobian(), &rhs) {
                Some(dx) => dx,
                None => {
                    debug!("newton: linear solve failed at iteration {}", iter);
                    return ConvergenceStatus::LinearSolveFailed;
                }
            };

            let weights = self.update_weights(problem, x, &dx);
            let norm = ferrite_core::wrms_norm(&dx, &weights);
            self.stats.last_update_norm = norm;
            if !norm.is_finite() || norm > MAX_UPDATE_NORM {
                debug!("newton: update norm {:.3e} at iteration {}", norm, iter);
                return ConvergenceStatus::UpdateTooBig;
            }

            let alpha = if self.criteria.max_backtracks > 0 && norm > 1.0 {
                self.backtrack(problem, x, &dx, r_norm)
            } else {
                1.0
            };
            x.axpy(alpha, &dx, 1.0);

            trace!(
                "newton iter {}: |r|max = {:.3e}, |dx|wrms = {:.3e}, alpha = {}",
                iter, r_norm, norm, alpha
            );

            // The first iterate is only a guess; trust a small update alone after that.
            if norm <= 1.0 && (iter > 1 || r_norm <= self.criteria.residual_tol) {
                return ConvergenceStatus::Converged { iterations: iter };
            }
            last_norm = norm;
        }

        if last_norm <= STALL_UPDATE_NORM {
            debug!("newton: stalled with update norm {:.3e}", last_norm);
            ConvergenceStatus::Stalled
        } else {
            ConvergenceStatus::TooManyIterations
        }
    }

    /// Advance the load counter shared with callers that evaluate the
    /// problem outside [`solve`](Self::solve).
    pub fn next_iteration(&mut self) -> u64 {
        self.load_counter += 1;
        self.load_counter
    }

    fn load(&mut self, problem: &mut dyn NonlinearProblem, x: &DVector<f64>) -> bool {
        let iteration = self.next_iteration();
        problem.load(x, iteration)
    }

    fn update_weights(
        &self,
        problem: &dyn NonlinearProblem,
        x: &DVector<f64>,
        dx: &DVector<f64>,
    ) -> DVector<f64> {
        DVector::from_fn(x.len(), |i, _| {
            let abstol = if problem.is_branch(i) {
                self.criteria.i_abstol
            } else {
                self.criteria.v_abstol
            };
            let mag = x[i].abs().max((x[i] + dx[i]).abs());
            self.criteria.v_reltol * mag + abstol
        })
    }

    /// Halve the step until the residual decreases, up to `max_backtracks` times.
    fn backtrack(
        &mut self,
        problem: &mut dyn NonlinearProblem,
        x: &DVector<f64>,
        dx: &DVector<f64>,
        r_norm: f64,
    ) -> f64 {
        let mut alpha = 1.0;
        for _ in 0..self.criteria.max_backtracks {
            let trial = x + dx * alpha;
            if self.load(problem, &trial) && problem.residual().amax() < r_norm {
                return alpha;
            }
            alpha *= 0.5;
        }
        alpha
    }

    fn linear_solve(&mut self, jacobian: &DaeMatrix, rhs: &DVector<f64>) -> Option<DVector<f64>> {
        self.stats.linear_solves += 1;
        let n = jacobian.size();

        if let LinearSolverKind::Gmres { .. } = self.dispatch.select(n) {
            let op = MatrixOperator::new(jacobian);
            let precond = JacobiPreconditioner::from_matrix(jacobian);
            let result = solve_gmres(&op, Some(&precond), rhs.as_slice(), &self.dispatch.gmres);
            if !result.converged {
                debug!(
                    "gmres: no convergence after {} iterations (residual {:.3e})",
                    result.iterations, result.residual
                );
                return None;
            }
            return Some(DVector::from_vec(result.x));
        }

        let key = Arc::as_ptr(jacobian.pattern()) as usize;
        if self.pattern_key != Some(key) {
            self.lu.reset();
            self.pattern_key = Some(key);
        }
        if let Err(e) = self.lu.factor(jacobian) {
            debug!("newton: factorization failed: {}", e);
            return None;
        }
        match self.lu.solve(rhs) {
            Ok(dx) => Some(dx),
            Err(e) => {
                debug!("newton: solve failed: {}", e);
                None
            }
        }
    }
}
