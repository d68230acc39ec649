//! The interface every integration method implements, and the DC stand-in.

use std::fmt;

use ferrite_core::{PackBuffer, SolutionSet, UnpackBuffer};
use nalgebra::DVector;

use super::bdf::Bdf;
use super::data_store::{DataStore, TwoLevelError};
use super::gear12::Gear12;
use super::params::{IntegrationMethod, TiaParams};
use super::step_control::StepErrorControl;
use crate::error::Result;

/// A discretization of `dQ/dt` driven by a [`StepErrorControl`].
///
/// Methods own their history. Step sizes, times and coefficients live in the
/// controller, which every call receives.
pub trait TimeIntegrationMethod: fmt::Debug + Send {
    fn method(&self) -> IntegrationMethod;

    fn data_store(&self) -> &DataStore;

    fn data_store_mut(&mut self) -> &mut DataStore;

    /// Seed the history from an accepted point and pick the first step.
    ///
    /// `q` and `f` must be the DAE vectors loaded at `solutions.curr_solution`.
    fn initialize(
        &mut self,
        sec: &mut StepErrorControl,
        solutions: &SolutionSet,
        q: &DVector<f64>,
        f: &DVector<f64>,
    );

    /// Seed the history like [`initialize`](Self::initialize) but keep the step
    /// chosen by an enclosing solver.
    fn set_two_level_time_info(
        &mut self,
        sec: &mut StepErrorControl,
        solutions: &SolutionSet,
        q: &DVector<f64>,
        f: &DVector<f64>,
    );

    /// Recompute coefficients for the current step size and order.
    fn update_coeffs(&mut self, sec: &mut StepErrorControl);

    /// Extrapolate the history to the next time and store it as the initial guess.
    fn obtain_predictor(&mut self, sec: &StepErrorControl, solutions: &mut SolutionSet);

    /// Predicted `dQ/dt` and state derivative; runs after [`Self::obtain_predictor`].
    fn obtain_predictor_deriv(&mut self, sec: &StepErrorControl);

    /// Coefficient multiplying `dQ/dx` in the Jacobian.
    fn cj(&self, sec: &StepErrorControl) -> f64;

    /// Time derivative of device state at the corrector.
    fn update_state_deriv(&self, sec: &StepErrorControl, state: &DVector<f64>, deriv: &mut DVector<f64>);

    /// `dQ/dt` at the corrector `q`.
    fn obtain_corrector_deriv(&self, sec: &StepErrorControl, q: &DVector<f64>, out: &mut DVector<f64>);

    /// Nonlinear residual for the DAE vectors `q` and `f`.
    fn residual(&self, sec: &StepErrorControl, q: &DVector<f64>, f: &DVector<f64>, out: &mut DVector<f64>);

    /// Local truncation error over tolerance for the last corrector.
    fn error_estimate(&self, sec: &StepErrorControl) -> f64;

    /// Undo the predictor scaling and choose a smaller step (and maybe order).
    fn reject_step(&mut self, sec: &mut StepErrorControl);

    /// Undo the predictor scaling and retry the step an enclosing solver chose.
    fn reject_step_for_two_level(&mut self, sec: &mut StepErrorControl);

    /// Advance the clock, fold the corrector into the history and pick the next step.
    fn complete_step(&mut self, sec: &mut StepErrorControl);

    /// Partial sum of the restart Q norm, for an enclosing solver.
    fn initial_q_norm(&self) -> TwoLevelError;

    /// Partial error sums for the last corrector, for an enclosing solver.
    fn two_level_error(&self, sec: &StepErrorControl) -> TwoLevelError;

    /// Solution at `t` within the last accepted step, if the history covers it.
    fn interpolate_solution(&self, sec: &StepErrorControl, t: f64) -> Option<DVector<f64>>;

    fn pack(&self, buf: &mut PackBuffer) {
        self.data_store().pack(buf);
    }

    fn unpack(&mut self, buf: &mut UnpackBuffer<'_>) -> Result<()> {
        self.data_store_mut().unpack(buf)
    }
}

/// DC operating point: no time derivative, residual is `F`.
#[derive(Debug, Clone)]
pub struct NoTimeIntegration {
    ds: DataStore,
}

impl NoTimeIntegration {
    pub fn new(ds: DataStore) -> Self {
        Self { ds }
    }
}

impl TimeIntegrationMethod for NoTimeIntegration {
    fn method(&self) -> IntegrationMethod {
        IntegrationMethod::None
    }

    fn data_store(&self) -> &DataStore {
        &self.ds
    }

    fn data_store_mut(&mut self) -> &mut DataStore {
        &mut self.ds
    }

    fn initialize(&mut self, _: &mut StepErrorControl, _: &SolutionSet, _: &DVector<f64>, _: &DVector<f64>) {}

    fn set_two_level_time_info(
        &mut self,
        _: &mut StepErrorControl,
        _: &SolutionSet,
        _: &DVector<f64>,
        _: &DVector<f64>,
    ) {
    }

    fn update_coeffs(&mut self, _: &mut StepErrorControl) {}

    fn obtain_predictor(&mut self, _: &StepErrorControl, _: &mut SolutionSet) {}

    fn obtain_predictor_deriv(&mut self, _: &StepErrorControl) {}

    fn cj(&self, _: &StepErrorControl) -> f64 {
        0.0
    }

    fn update_state_deriv(&self, _: &StepErrorControl, _: &DVector<f64>, deriv: &mut DVector<f64>) {
        deriv.fill(0.0);
    }

    fn obtain_corrector_deriv(&self, _: &StepErrorControl, _: &DVector<f64>, out: &mut DVector<f64>) {
        out.fill(0.0);
    }

    fn residual(&self, _: &StepErrorControl, _: &DVector<f64>, f: &DVector<f64>, out: &mut DVector<f64>) {
        out.copy_from(f);
    }

    fn error_estimate(&self, _: &StepErrorControl) -> f64 {
        0.0
    }

    fn reject_step(&mut self, _: &mut StepErrorControl) {}

    fn reject_step_for_two_level(&mut self, _: &mut StepErrorControl) {}

    fn complete_step(&mut self, _: &mut StepErrorControl) {}

    fn initial_q_norm(&self) -> TwoLevelError {
        TwoLevelError::default()
    }

    fn two_level_error(&self, _: &StepErrorControl) -> TwoLevelError {
        TwoLevelError {
            inner_size: self.ds.num_unknowns() as f64,
            ..Default::default()
        }
    }

    fn interpolate_solution(&self, _: &StepErrorControl, _: f64) -> Option<DVector<f64>> {
        None
    }
}

/// Build the method for `method`, sized for `solutions`.
pub fn create_time_integ_method(
    method: IntegrationMethod,
    solutions: &SolutionSet,
    params: &TiaParams,
) -> Box<dyn TimeIntegrationMethod> {
    let max_order = method.order_cap(params.max_order).max(1);
    let ds = DataStore::new(
        solutions.num_unknowns(),
        solutions.next_state.len(),
        solutions.next_store.len(),
        max_order,
    );
    match method {
        IntegrationMethod::None => Box::new(NoTimeIntegration::new(ds)),
        IntegrationMethod::BackwardEuler | IntegrationMethod::Bdf15 => Box::new(Bdf::new(ds, method)),
        IntegrationMethod::Gear12 => Box::new(Gear12::new(ds)),
    }
}
