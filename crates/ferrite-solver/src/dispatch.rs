//! Picks the linear solver used inside each Newton iteration.
//!
//! Small circuits go through the cached sparse LU. Past a size threshold the
//! Jacobian is handed to Jacobi-preconditioned GMRES instead, unless the deck
//! pins one of the two.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::gmres::GmresConfig;

/// Unknown count at which `Auto` switches to GMRES.
pub const DEFAULT_ITERATIVE_THRESHOLD: usize = 10_000;

/// What the deck asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverDispatchStrategy {
    #[default]
    Auto,
    #[serde(alias = "lu")]
    DirectLU,
    #[serde(alias = "gmres")]
    IterativeGmres,
}

/// Solver actually used for one Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverKind {
    SparseLu,
    Gmres { restart: usize },
}

impl fmt::Display for LinearSolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverKind::SparseLu => f.write_str("sparse LU"),
            LinearSolverKind::Gmres { restart } => write!(f, "GMRES({})", restart),
        }
    }
}

/// Newton linear-solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub strategy: SolverDispatchStrategy,
    /// `Auto` uses GMRES for systems with at least this many unknowns.
    pub iterative_threshold: usize,
    pub gmres: GmresConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            strategy: SolverDispatchStrategy::Auto,
            iterative_threshold: DEFAULT_ITERATIVE_THRESHOLD,
            gmres: GmresConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn with_strategy(mut self, strategy: SolverDispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_iterative_threshold(mut self, unknowns: usize) -> Self {
        self.iterative_threshold = unknowns;
        self
    }

    /// Solver for a Jacobian with `unknowns` rows.
    pub fn select(&self, unknowns: usize) -> LinearSolverKind {
        let iterative = match self.strategy {
            SolverDispatchStrategy::DirectLU => false,
            SolverDispatchStrategy::IterativeGmres => true,
            SolverDispatchStrategy::Auto => unknowns >= self.iterative_threshold,
        };
        if iterative {
            LinearSolverKind::Gmres {
                restart: self.gmres.restart,
            }
        } else {
            LinearSolverKind::SparseLu
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_switches_at_the_threshold() {
        let config = DispatchConfig::default().with_iterative_threshold(100);
        assert_eq!(config.select(99), LinearSolverKind::SparseLu);
        assert_eq!(config.select(100), LinearSolverKind::Gmres { restart: 30 });
    }

    #[test]
    fn pinned_strategies_ignore_size() {
        let lu = DispatchConfig::default().with_strategy(SolverDispatchStrategy::DirectLU);
        assert_eq!(lu.select(1_000_000), LinearSolverKind::SparseLu);
        let gmres = DispatchConfig::default().with_strategy(SolverDispatchStrategy::IterativeGmres);
        assert!(matches!(gmres.select(3), LinearSolverKind::Gmres { .. }));
        assert_eq!(gmres.select(3).to_string(), "GMRES(30)");
    }

    #[test]
    fn deserializes_short_names() {
        let c: DispatchConfig =
            serde_json::from_str(r#"{ "strategy": "gmres", "gmres": { "restart": 12 } }"#).unwrap();
        assert_eq!(c.strategy, SolverDispatchStrategy::IterativeGmres);
        assert_eq!(c.select(1), LinearSolverKind::Gmres { restart: 12 });
        assert_eq!(c.iterative_threshold, DEFAULT_ITERATIVE_THRESHOLD);
    }
}
