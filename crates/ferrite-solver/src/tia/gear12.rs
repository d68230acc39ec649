//! Variable-step Gear method of orders 1 and 2.
//!
//! Unlike [`Bdf`](super::Bdf), the history holds plain values at the last
//! three accepted times: level 0 is `t_n`, level 1 is `t_{n-1}`, level 2 is
//! `t_{n-2}`. The predictor extrapolates those values and the corrector uses
//! the variable-step BDF2 (or backward Euler) weights
//!
//! ```text
//! dQ/dt ~= (alpha[0] Q + alpha[1] Q_n + alpha[2] Q_{n-1}) / h
//! ```
//!
//! which is written as `qpn0 + cj * (Q - qn0)` so the Newton problem is the
//! same as for the divided-difference BDF.

use ferrite_core::SolutionSet;
use log::trace;
use nalgebra::DVector;

use super::data_store::{DataStore, TwoLevelError};
use super::method::TimeIntegrationMethod;
use super::params::IntegrationMethod;
use super::step_control::StepErrorControl;

const H0_SAFETY: f64 = 2.0;
/// The step ratio aims at this fraction of the error tolerance.
const TOL_AIM_FAC: f64 = 0.5;
const R_FUDGE: f64 = 1e-4;
const R_MIN: f64 = 0.25;
const R_MAX: f64 = 0.9;
const R_HINCR_TEST: f64 = 2.0;
const R_HINCR: f64 = 2.0;
/// Step cut after a Newton failure.
const NEWTON_FAIL_CUT: f64 = 0.125;
/// Second order is kept only if it would grow the step by more than this.
const ORDER_TWO_MARGIN: f64 = 1.05;
/// Levels of value history the method reads.
const LEVELS: usize = 3;

/// Step ratio that brings `est_over_tol` to the aimed fraction at `order`.
fn step_ratio(est_over_tol: f64, order: usize) -> f64 {
    (TOL_AIM_FAC / (est_over_tol + R_FUDGE)).powf(1.0 / (order as f64 + 1.0))
}

/// `(alpha[0] lead + alpha[1] hist[0] + alpha[2] hist[1]) / h`.
fn weighted_derivative(sec: &StepErrorControl, lead: &DVector<f64>, hist: &[DVector<f64>]) -> DVector<f64> {
    let mut d = lead * sec.alpha[0];
    d.axpy(sec.alpha[1], &hist[0], 1.0);
    if sec.current_order >= 2 {
        d.axpy(sec.alpha[2], &hist[1], 1.0);
    }
    d / sec.current_time_step
}

#[derive(Debug, Clone)]
pub struct Gear12 {
    ds: DataStore,
}

impl Gear12 {
    pub fn new(ds: DataStore) -> Self {
        Self { ds }
    }

    /// Fill every history level with the accepted point.
    fn seed_history(&mut self, solutions: &SolutionSet, state: &DVector<f64>, q: &DVector<f64>) {
        let ds = &mut self.ds;
        let families = [
            (&mut ds.x_history, &solutions.curr_solution),
            (&mut ds.q_history, q),
            (&mut ds.s_history, state),
            (&mut ds.sto_history, &solutions.curr_store),
        ];
        for (hist, value) in families {
            for level in hist.iter_mut() {
                level.copy_from(value);
            }
        }
    }

    fn reset_counters(sec: &mut StepErrorControl) {
        let h = sec.current_time_step;
        sec.number_of_steps = 0;
        sec.current_order = 1;
        sec.used_order = 1;
        sec.psi[0] = h;
        sec.cj = 1.0 / h;
        sec.nscsco = 0;
    }

    /// Roll the step history back over the rejected attempt.
    fn restore_history(sec: &mut StepErrorControl) {
        sec.psi[0] = sec.psi[1];
        sec.psi[1] = sec.psi[2];
    }

    /// Shift every family down one level and store the corrector at level 0.
    ///
    /// The corrector is rebuilt as predictor plus Newton correction.
    fn update_history(&mut self) {
        let ds = &mut self.ds;
        let families = [
            (&mut ds.x_history, &ds.xn0, &ds.newton_correction),
            (&mut ds.q_history, &ds.qn0, &ds.q_newton_correction),
            (&mut ds.s_history, &ds.sn0, &ds.s_newton_correction),
            (&mut ds.sto_history, &ds.ston0, &ds.sto_newton_correction),
        ];
        for (hist, predicted, correction) in families {
            hist[..LEVELS].rotate_right(1);
            hist[0].copy_from(predicted);
            hist[0] += correction;
        }
    }
}

impl TimeIntegrationMethod for Gear12 {
    fn method(&self) -> IntegrationMethod {
        IntegrationMethod::Gear12
    }

    fn data_store(&self) -> &DataStore {
        &self.ds
    }

    fn data_store_mut(&mut self) -> &mut DataStore {
        &mut self.ds
    }

    fn initialize(
        &mut self,
        sec: &mut StepErrorControl,
        solutions: &SolutionSet,
        q: &DVector<f64>,
        f: &DVector<f64>,
    ) {
        self.ds.q_history[1].copy_from(f);
        self.ds.q_history[1].neg_mut();
        let h = sec.initial_step_size(self.ds.q1_history_norm(), H0_SAFETY);

        sec.current_time_step = h;
        sec.last_time_step = h;
        sec.successive_failures = 0;
        sec.step_attempt_status = true;
        sec.next_time = sec.current_time + h;

        self.seed_history(solutions, &solutions.curr_state, q);
        Self::reset_counters(sec);
        trace!("gear12 restart at t = {:.6e}, h = {:.3e}", sec.current_time, h);
    }

    fn set_two_level_time_info(
        &mut self,
        sec: &mut StepErrorControl,
        solutions: &SolutionSet,
        q: &DVector<f64>,
        _: &DVector<f64>,
    ) {
        self.seed_history(solutions, &solutions.next_state, q);
        Self::reset_counters(sec);
    }

    fn update_coeffs(&mut self, sec: &mut StepErrorControl) {
        let h = sec.current_time_step;
        sec.psi[2] = sec.psi[1];
        sec.psi[1] = sec.psi[0];
        sec.psi[0] = h;
        sec.alphas = -1.0;

        let (h1, h2) = (sec.psi[1], sec.psi[2]);
        if sec.current_order >= 2 {
            // quadratic through t_n, t_n - h1, t_n - h1 - h2
            sec.beta[2] = h / h2 * (h + h1) / (h1 + h2);
            sec.beta[1] = -h / h1 - sec.beta[2] * (h1 + h2) / h1;
            sec.beta[0] = 1.0 - sec.beta[1] - sec.beta[2];

            let a2 = -h / h1 * h / (2.0 * h + h1);
            let a1 = 1.0 - a2;
            let a0 = -a1 - a2 * (1.0 + h1 / h);
            sec.alpha[0] = -1.0 / a0;
            sec.alpha[1] = a1 / a0;
            sec.alpha[2] = a2 / a0;
            sec.ck = h / (h + h1 + h2);
        } else {
            sec.beta[0] = 1.0 + h / h1;
            sec.beta[1] = -h / h1;
            sec.beta[2] = 0.0;
            sec.alpha[0] = 1.0;
            sec.alpha[1] = -1.0;
            sec.alpha[2] = 0.0;
            sec.ck = h / (h + h1);
        }
        sec.cj = sec.alpha[0] / h;
    }

    fn obtain_predictor(&mut self, sec: &StepErrorControl, solutions: &mut SolutionSet) {
        let k = sec.current_order.min(2);
        let ds = &mut self.ds;
        ds.xn0.fill(0.0);
        ds.qn0.fill(0.0);
        for i in 0..=k {
            ds.xn0.axpy(sec.beta[i], &ds.x_history[i], 1.0);
            ds.qn0.axpy(sec.beta[i], &ds.q_history[i], 1.0);
        }
        // state and store are not extrapolated
        ds.sn0.copy_from(&ds.s_history[0]);
        ds.ston0.copy_from(&ds.sto_history[0]);
        solutions.next_solution.copy_from(&ds.xn0);
    }

    fn obtain_predictor_deriv(&mut self, sec: &StepErrorControl) {
        let qpn0 = weighted_derivative(sec, &self.ds.qn0, &self.ds.q_history);
        let spn0 = weighted_derivative(sec, &self.ds.sn0, &self.ds.s_history);
        self.ds.qpn0 = qpn0;
        self.ds.spn0 = spn0;
    }

    fn cj(&self, sec: &StepErrorControl) -> f64 {
        sec.alpha[0] / sec.current_time_step
    }

    fn update_state_deriv(&self, sec: &StepErrorControl, state: &DVector<f64>, deriv: &mut DVector<f64>) {
        let cj = self.cj(sec);
        deriv.copy_from(&self.ds.spn0);
        deriv.axpy(cj, state, 1.0);
        deriv.axpy(-cj, &self.ds.sn0, 1.0);
    }

    fn obtain_corrector_deriv(&self, sec: &StepErrorControl, q: &DVector<f64>, out: &mut DVector<f64>) {
        let cj = self.cj(sec);
        out.copy_from(&self.ds.qpn0);
        out.axpy(cj, q, 1.0);
        out.axpy(-cj, &self.ds.qn0, 1.0);
    }

    fn residual(&self, sec: &StepErrorControl, q: &DVector<f64>, f: &DVector<f64>, out: &mut DVector<f64>) {
        self.obtain_corrector_deriv(sec, q, out);
        *out += f;
    }

    fn error_estimate(&self, sec: &StepErrorControl) -> f64 {
        sec.ck * self.ds.wrms_error_norm()
    }

    fn reject_step(&mut self, sec: &mut StepErrorControl) {
        sec.last_attempted_time_step = sec.current_time_step;
        let h = sec.current_time_step;
        let mut new_step = h;

        if !sec.step_attempt_status {
            sec.initial_phase = false;
            sec.nef += 1;
            Self::restore_history(sec);

            if sec.newton_status <= 0 {
                new_step = NEWTON_FAIL_CUT * h;
                sec.current_order = sec.min_order;
            } else if sec.nef == 1 {
                let rr = step_ratio(sec.est_over_tol, sec.current_order);
                new_step = rr.clamp(R_MIN, R_MAX) * h;
            } else {
                new_step = R_MIN * h;
                sec.current_order = sec.min_order;
            }
            trace!(
                "gear12 reject: nef = {}, order = {}, h = {:.3e}",
                sec.nef, sec.current_order, new_step
            );
        }

        sec.set_time_step(new_step);
    }

    fn reject_step_for_two_level(&mut self, sec: &mut StepErrorControl) {
        Self::restore_history(sec);
        sec.set_time_step(sec.current_time_step);
    }

    fn complete_step(&mut self, sec: &mut StepErrorControl) {
        sec.number_of_steps += 1;
        sec.nef = 0;
        sec.last_time = sec.current_time;
        sec.current_time = sec.next_time;

        let h = sec.current_time_step;
        sec.last_attempted_time_step = h;
        sec.last_time_step = h;
        sec.used_order = sec.current_order;
        sec.used_step = h;

        let mut rr = step_ratio(sec.est_over_tol, sec.current_order);
        if sec.number_of_steps >= 2 && sec.max_order >= 2 && sec.current_order == 1 {
            sec.current_order = 2;
            rr = step_ratio(sec.est_over_tol, 2);
            if rr <= ORDER_TWO_MARGIN {
                sec.current_order = sec.min_order;
            }
        }
        let new_step = if rr >= R_HINCR_TEST {
            R_HINCR * h
        } else if rr <= 1.0 {
            rr.clamp(R_MIN, R_MAX) * h
        } else {
            h
        };

        self.update_history();

        if sec.current_time < sec.stop_time {
            sec.set_time_step(new_step);
        }
    }

    fn initial_q_norm(&self) -> TwoLevelError {
        TwoLevelError {
            q1_history_sum: self.ds.partial_sum_q1(),
            ..Default::default()
        }
    }

    fn two_level_error(&self, _: &StepErrorControl) -> TwoLevelError {
        TwoLevelError {
            x_error_sum: self.ds.partial_error_norm_sum(),
            q_error_sum: self.ds.partial_q_error_norm_sum(),
            inner_size: self.ds.num_unknowns() as f64,
            ..Default::default()
        }
    }

    /// Linear interpolation across the last accepted step.
    fn interpolate_solution(&self, sec: &StepErrorControl, t: f64) -> Option<DVector<f64>> {
        let tn = sec.current_time;
        let tfuzz = 100.0 * f64::EPSILON * (tn.abs() + sec.used_step);
        let delt = t - tn;
        if delt > tfuzz || delt < -(sec.used_step + tfuzz) {
            return None;
        }
        let x0 = &self.ds.x_history[0];
        if delt.abs() <= tfuzz {
            return Some(x0.clone());
        }
        let slope = (x0 - &self.ds.x_history[1]) / sec.used_step;
        Some(x0 + slope * delt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tia::params::TiaParams;
    use ferrite_core::SerialComm;
    use nalgebra::dvector;

    fn setup(x0: f64) -> (Gear12, StepErrorControl, SolutionSet) {
        let params = TiaParams::for_tstop(1.0).with_method(IntegrationMethod::Gear12);
        let mut sec = StepErrorControl::new(&params);
        sec.update_stop_time(&SerialComm);
        let max_order = IntegrationMethod::Gear12.order_cap(params.max_order);
        let gear = Gear12::new(DataStore::new(1, 0, 0, max_order));
        let mut sol = SolutionSet::new(1, 0, 0);
        sol.curr_solution[0] = x0;
        sol.next_solution[0] = x0;
        (gear, sec, sol)
    }

    fn accept_exact(gear: &mut Gear12, sec: &mut StepErrorControl, sol: &mut SolutionSet, x: f64) {
        sol.next_solution[0] = x;
        gear.ds.step_linear_combo(sol, &dvector![x]);
        sec.newton_status = 1;
        sec.est_over_tol = gear.error_estimate(sec);
        sec.step_attempt_status = true;
        gear.complete_step(sec);
        sol.rotate();
    }

    #[test]
    fn equal_steps_give_classic_bdf2() {
        let (mut gear, mut sec, _) = setup(0.0);
        let h = 0.01;
        sec.psi[0] = h;
        sec.psi[1] = h;
        sec.current_time_step = h;
        sec.current_order = 2;
        gear.update_coeffs(&mut sec);

        let expect_alpha = [1.5, -2.0, 0.5];
        let expect_beta = [3.0, -3.0, 1.0];
        for i in 0..3 {
            assert!((sec.alpha[i] - expect_alpha[i]).abs() < 1e-12, "alpha[{i}] = {}", sec.alpha[i]);
            assert!((sec.beta[i] - expect_beta[i]).abs() < 1e-12, "beta[{i}] = {}", sec.beta[i]);
        }
        assert!((sec.ck - 1.0 / 3.0).abs() < 1e-12);
        assert!((gear.cj(&sec) - 150.0).abs() < 1e-9);
    }

    #[test]
    fn quadratic_is_integrated_exactly_at_second_order() {
        // x = 1 + t^2 with dx/dt + F = 0, F = -2t
        let (mut gear, mut sec, mut sol) = setup(1.0);
        gear.initialize(&mut sec, &sol, &dvector![1.0], &dvector![0.0]);
        sec.max_time_step = 0.01;

        let mut residual = DVector::zeros(1);
        let mut checked = 0;
        for _ in 0..300 {
            if sec.finished() {
                break;
            }
            gear.update_coeffs(&mut sec);
            gear.obtain_predictor(&sec, &mut sol);
            gear.obtain_predictor_deriv(&sec);
            let t = sec.next_time;
            let exact = 1.0 + t * t;
            if sec.current_order == 2 {
                let err = (sol.next_solution[0] - exact).abs();
                assert!(err < 1e-11, "predictor error {err} at t = {t}");
                gear.residual(&sec, &dvector![exact], &dvector![-2.0 * t], &mut residual);
                assert!(residual[0].abs() < 1e-8, "residual {} at t = {t}", residual[0]);
                checked += 1;
            }
            accept_exact(&mut gear, &mut sec, &mut sol, exact);
        }
        assert!(sec.finished());
        assert!(checked > 10, "second order used for {checked} steps");
    }

    #[test]
    fn order_never_exceeds_two() {
        let (mut gear, mut sec, mut sol) = setup(0.0);
        gear.initialize(&mut sec, &sol, &dvector![0.0], &dvector![-1.0]);
        for _ in 0..10 {
            gear.update_coeffs(&mut sec);
            gear.obtain_predictor(&sec, &mut sol);
            gear.obtain_predictor_deriv(&sec);
            let t = sec.next_time;
            accept_exact(&mut gear, &mut sec, &mut sol, t);
            assert!(sec.current_order <= 2);
        }
        assert_eq!(sec.max_order, 2);
        assert_eq!(sec.current_order, 2);
    }

    #[test]
    fn newton_failure_cuts_step_by_eight_and_drops_order() {
        let (mut gear, mut sec, mut sol) = setup(0.0);
        gear.initialize(&mut sec, &sol, &dvector![0.0], &dvector![-1.0]);
        for _ in 0..3 {
            gear.update_coeffs(&mut sec);
            gear.obtain_predictor(&sec, &mut sol);
            gear.obtain_predictor_deriv(&sec);
            let t = sec.next_time;
            accept_exact(&mut gear, &mut sec, &mut sol, t);
        }
        assert_eq!(sec.current_order, 2);
        let psi_before = (sec.psi[0], sec.psi[1]);

        gear.update_coeffs(&mut sec);
        gear.obtain_predictor(&sec, &mut sol);
        let h = sec.current_time_step;
        sec.newton_status = -1;
        sec.step_attempt_status = false;
        gear.reject_step(&mut sec);

        assert!((sec.current_time_step - h / 8.0).abs() < 1e-15);
        assert_eq!(sec.current_order, 1);
        assert_eq!(sec.nef, 1);
        assert_eq!((sec.psi[0], sec.psi[1]), psi_before);
    }

    #[test]
    fn interpolates_linearly_inside_the_last_step() {
        let (mut gear, mut sec, mut sol) = setup(2.0);
        gear.initialize(&mut sec, &sol, &dvector![2.0], &dvector![0.0]);
        gear.update_coeffs(&mut sec);
        gear.obtain_predictor(&sec, &mut sol);
        let t1 = sec.next_time;
        accept_exact(&mut gear, &mut sec, &mut sol, 4.0);

        let mid = gear.interpolate_solution(&sec, 0.5 * t1).unwrap();
        assert!((mid[0] - 3.0).abs() < 1e-12);
        assert_eq!(gear.interpolate_solution(&sec, t1).unwrap()[0], 4.0);
        assert!(gear.interpolate_solution(&sec, 2.0 * t1).is_none());
        assert!(gear.interpolate_solution(&sec, -t1).is_none());
    }
}
