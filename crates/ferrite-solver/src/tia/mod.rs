//! Time integration: BDF and Gear methods, history storage and step-error control.
//!
//! The integrator solves `dQ(x)/dt + F(x) = 0`. Each method turns the time
//! derivative into `qpn0 + cj * (Q - qn0)` from its history, so the nonlinear
//! residual at a step is `qpn0 + cj * (Q - qn0) + F` and the Jacobian is
//! `cj * dQ/dx + dF/dx`.
//!
//! [`StepErrorControl`] owns the clock, step bounds, breakpoints and BDF
//! coefficients; a [`TimeIntegrationMethod`] owns the history arrays and is
//! handed the controller on every call.

pub mod bdf;
pub mod data_store;
pub mod gear12;
pub mod method;
pub mod params;
pub mod step_control;

use serde::{Deserialize, Serialize};

pub use bdf::Bdf;
pub use data_store::{DataStore, TwoLevelError};
pub use gear12::Gear12;
pub use method::{NoTimeIntegration, TimeIntegrationMethod, create_time_integ_method};
pub use params::{IntegrationMethod, MAX_BDF_ORDER, MAX_GEAR_ORDER, TiaParams};
pub use step_control::{BreakPointSet, StepErrorControl};

/// Step information exchanged with an enclosing solver that owns the clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeIntInfo {
    pub next_time_step: f64,
    pub next_time: f64,
    pub curr_time_step: f64,
    pub current_time: f64,
    pub current_order: usize,
    pub beginning_integration: bool,
}
