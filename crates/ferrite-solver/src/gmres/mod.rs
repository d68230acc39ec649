//! Restarted GMRES for Newton systems too large to factor.

pub mod real;

pub use real::{GmresResult, solve_gmres};

use serde::{Deserialize, Serialize};

/// GMRES settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmresConfig {
    /// Arnoldi steps summed over restarts.
    pub max_iter: usize,
    /// Target relative residual.
    pub tol: f64,
    /// Krylov dimension between restarts.
    pub restart: usize,
}

impl Default for GmresConfig {
    fn default() -> Self {
        Self {
            max_iter: 500,
            tol: 1e-8,
            restart: 30,
        }
    }
}
