//! Type definitions for time integration parameters.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Highest BDF order the history arrays are sized for.
pub const MAX_BDF_ORDER: usize = 5;

/// Highest order of the value-history Gear method.
pub const MAX_GEAR_ORDER: usize = 2;

/// Integration method used to discretize dQ/dt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMethod {
    /// No time discretization; the DC operating point.
    None,
    /// Variable-step BDF capped at order 1.
    #[serde(alias = "be", alias = "euler")]
    BackwardEuler,
    /// Variable-step, variable-order BDF (orders 1 through `max_order`).
    #[default]
    #[serde(alias = "bdf")]
    Bdf15,
    /// Variable-step Gear on value history, orders 1 and 2.
    #[serde(alias = "gear")]
    Gear12,
}

impl IntegrationMethod {
    /// Parse a method name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "dcop" => Some(Self::None),
            "be" | "euler" | "backwardeuler" | "backward_euler" => Some(Self::BackwardEuler),
            "bdf" | "bdf15" => Some(Self::Bdf15),
            "gear" | "gear12" => Some(Self::Gear12),
            _ => None,
        }
    }

    /// Largest order this method may use given the configured maximum.
    pub fn order_cap(self, max_order: usize) -> usize {
        match self {
            Self::None => 0,
            Self::BackwardEuler => 1,
            Self::Bdf15 => max_order.clamp(1, MAX_BDF_ORDER),
            Self::Gear12 => max_order.clamp(1, MAX_GEAR_ORDER),
        }
    }
}

/// Transient analysis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiaParams {
    /// Start time (s).
    pub initial_time: f64,
    /// Stop time (s).
    pub final_time: f64,
    /// Integration method used after the operating point.
    pub method: IntegrationMethod,
    /// Relative tolerance for the local error test.
    pub reltol: f64,
    /// Absolute tolerance for the local error test.
    pub abstol: f64,
    /// Upper bound on the BDF order.
    pub max_order: usize,
    /// Lower bound on the BDF order.
    pub min_order: usize,
    /// Upper bound on the first step after a (re)start.
    pub starting_time_step: Option<f64>,
    /// Maximum step; defaults to a tenth of the simulated interval.
    pub max_time_step: Option<f64>,
    /// Floor on the step below which a failed step is fatal.
    pub min_time_step: Option<f64>,
    /// Consecutive rejected attempts tolerated before the run fails.
    pub max_successive_failures: usize,
    /// Land on device breakpoints.
    pub bp_enable: bool,
    /// Breakpoints closer than this merge; defaults to twice the minimum step.
    pub bp_tol: Option<f64>,
    /// Weight every unknown by the largest solution magnitude instead of its own.
    pub new_lte: bool,
    /// Accept a stalled Newton solve once the step is near its floor.
    pub pass_nl_stall: bool,
    /// Initial-step scale applied to the distance to the next stop time.
    pub restart_step_scale: f64,
    /// Largest accepted `est_over_tol`.
    pub err_tol_acceptance: f64,
    /// Stop once time exceeds this value.
    pub exit_time: Option<f64>,
    /// Stop after this many accepted steps.
    pub exit_step: Option<usize>,
    /// Times at which the loop stops and waits for a resume.
    pub pause_times: Vec<f64>,
}

impl Default for TiaParams {
    fn default() -> Self {
        Self {
            initial_time: 0.0,
            final_time: 0.0,
            method: IntegrationMethod::Bdf15,
            reltol: 1e-3,
            abstol: 1e-6,
            max_order: MAX_BDF_ORDER,
            min_order: 1,
            starting_time_step: None,
            max_time_step: None,
            min_time_step: None,
            max_successive_failures: 20,
            bp_enable: true,
            bp_tol: None,
            new_lte: true,
            pass_nl_stall: false,
            restart_step_scale: 0.005,
            err_tol_acceptance: 1.0,
            exit_time: None,
            exit_step: None,
            pause_times: Vec::new(),
        }
    }
}

impl TiaParams {
    /// Create parameters for a specific stop time with defaults.
    pub fn for_tstop(final_time: f64) -> Self {
        Self {
            final_time,
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: IntegrationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_max_time_step(mut self, h: f64) -> Self {
        self.max_time_step = Some(h);
        self
    }

    pub fn with_starting_time_step(mut self, h: f64) -> Self {
        self.starting_time_step = Some(h);
        self
    }

    pub fn with_tolerances(mut self, reltol: f64, abstol: f64) -> Self {
        self.reltol = reltol;
        self.abstol = abstol;
        self
    }

    pub fn with_pause_time(mut self, t: f64) -> Self {
        self.pause_times.push(t);
        self
    }

    /// Maximum order after applying the method's cap.
    pub fn effective_max_order(&self) -> usize {
        self.method.order_cap(self.max_order)
    }

    /// Default maximum step when none is given.
    pub fn default_max_time_step(&self) -> f64 {
        self.max_time_step
            .unwrap_or(0.1 * (self.final_time - self.initial_time))
    }

    /// Reject parameter combinations the stepper cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.final_time > self.initial_time) {
            return Err(Error::InvalidParameter(format!(
                "final time {} must exceed initial time {}",
                self.final_time, self.initial_time
            )));
        }
        if self.reltol <= 0.0 || self.abstol <= 0.0 {
            return Err(Error::InvalidParameter(
                "reltol and abstol must be positive".into(),
            ));
        }
        if self.min_order == 0 || self.min_order > self.max_order {
            return Err(Error::InvalidParameter(format!(
                "order range {}..={} is empty",
                self.min_order, self.max_order
            )));
        }
        if let Some(h) = self.max_time_step {
            if h <= 0.0 {
                return Err(Error::InvalidParameter(format!(
                    "max time step must be positive, got {}",
                    h
                )));
            }
        }
        if self.max_successive_failures == 0 {
            return Err(Error::InvalidParameter(
                "max_successive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
