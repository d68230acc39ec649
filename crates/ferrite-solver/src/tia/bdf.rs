//! Variable-step, variable-order BDF in fixed-leading-coefficient form.
//!
//! The history holds modified divided differences of x, Q, state and store.
//! Coefficients follow the usual DASSL recurrences: `psi[j] = t_{n+1} - t_{n-j}`,
//! `beta` rescales the history for a changed step, `gamma` turns it into the
//! predicted derivative, and `alphas` is the fixed leading coefficient so that
//! `dQ/dt ~= qpn0 + cj * (Q - qn0)` with `cj = -alphas / h`.

use ferrite_core::SolutionSet;
use log::trace;
use nalgebra::DVector;

use super::data_store::{DataStore, TwoLevelError};
use super::method::TimeIntegrationMethod;
use super::params::IntegrationMethod;
use super::step_control::StepErrorControl;

/// Safety factor on the Q-norm based initial step.
const H0_SAFETY: f64 = 2.0;
/// Step growth per accepted step during the initial phase.
const H_PHASE0_INCR: f64 = 2.0;
const TKM1_TK_SAFETY: f64 = 2.0;
const TKP1_TK_SAFETY: f64 = 0.5;
const R_FACTOR: f64 = 1.0;
const R_SAFETY: f64 = 2.0;
const R_FUDGE: f64 = 1e-4;
/// Bounds on the step ratio after a reduction.
const R_MIN: f64 = 0.25;
const R_MAX: f64 = 0.9;
/// A proposed growth at or above this ratio is applied as `R_HINCR`; smaller
/// growth keeps the step unchanged.
const R_HINCR_TEST: f64 = 2.0;
const R_HINCR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderAction {
    Lower,
    Maintain,
    Raise,
}

/// BDF orders 1 through the controller's `max_order`. Backward Euler is this
/// method with the order capped at one.
#[derive(Debug, Clone)]
pub struct Bdf {
    ds: DataStore,
    method: IntegrationMethod,
}

impl Bdf {
    pub fn new(ds: DataStore, method: IntegrationMethod) -> Self {
        Self { ds, method }
    }

    /// Place the accepted point in history level 0 and `-h F` in level 1.
    fn seed_history(
        &mut self,
        h: f64,
        solutions: &SolutionSet,
        state: &DVector<f64>,
        q: &DVector<f64>,
        f: &DVector<f64>,
    ) {
        let ds = &mut self.ds;
        ds.x_history[0].copy_from(&solutions.curr_solution);
        ds.x_history[1].fill(0.0);
        ds.q_history[0].copy_from(q);
        ds.q_history[1].copy_from(f);
        ds.q_history[1] *= -h;
        ds.s_history[0].copy_from(state);
        ds.s_history[1].fill(0.0);
        ds.sto_history[0].copy_from(&solutions.curr_store);
        ds.sto_history[1].fill(0.0);
    }

    /// Undo the predictor's `beta` scaling and roll `psi` back one step.
    fn restore_history(&mut self, sec: &mut StepErrorControl) {
        let k = sec.current_order;
        for i in sec.nscsco..=k {
            let inv = 1.0 / sec.beta[i];
            self.ds.x_history[i] *= inv;
            self.ds.q_history[i] *= inv;
            self.ds.s_history[i] *= inv;
            self.ds.sto_history[i] *= inv;
        }
        for i in 1..=k {
            sec.psi[i - 1] = sec.psi[i] - sec.current_time_step;
        }
    }

    /// Fold the corrector into the history at the order just used.
    fn update_history(&mut self, sec: &StepErrorControl) {
        let k = sec.used_order;
        let raise = k < sec.max_order;
        let ds = &mut self.ds;
        let families = [
            (&mut ds.x_history, &ds.newton_correction),
            (&mut ds.q_history, &ds.q_newton_correction),
            (&mut ds.s_history, &ds.s_newton_correction),
            (&mut ds.sto_history, &ds.sto_newton_correction),
        ];
        for (hist, correction) in families {
            if raise {
                hist[k + 1].copy_from(correction);
            }
            hist[k] += correction;
            for j in (0..k).rev() {
                let (lo, hi) = hist.split_at_mut(j + 1);
                lo[j] += &hi[0];
            }
        }
    }

    /// Estimate errors at orders k-2..k and decide whether to drop an order.
    fn check_reduce_order(&self, sec: &mut StepErrorControl) {
        let k = sec.current_order;
        sec.ek = sec.sigma[k] * sec.est_over_tol;
        sec.tk = (k as f64 + 1.0) * sec.ek;
        sec.est = sec.ek;
        sec.new_order = k;

        if k > 1 {
            let dnorm = sec.ck * self.ds.delta_x_norm_m1(k);
            sec.ekm1 = sec.sigma[k - 1] * dnorm;
            sec.tkm1 = k as f64 * sec.ekm1;

            if k > 2 {
                let dnorm = sec.ck * self.ds.delta_x_norm_m2(k);
                sec.ekm2 = sec.sigma[k - 2] * dnorm;
                sec.tkm2 = (k as f64 - 1.0) * sec.ekm2;
                if sec.tkm1.max(sec.tkm2) <= sec.tk {
                    sec.new_order -= 1;
                    sec.est = sec.ekm1;
                }
            } else if sec.tkm1 <= TKM1_TK_SAFETY * sec.tk {
                sec.new_order -= 1;
                sec.est = sec.ekm1;
            }
        }
    }

    /// Choose the order for the next step after an accepted one.
    fn select_order(&self, sec: &mut StepErrorControl, order_diff: isize) -> OrderAction {
        let k = sec.current_order;
        let mut action = if sec.new_order + 1 == k {
            OrderAction::Lower
        } else if sec.new_order == sec.max_order {
            OrderAction::Maintain
        } else if k + 1 >= sec.nscsco || order_diff == 1 {
            OrderAction::Maintain
        } else {
            sec.tkp1 = sec.ck * self.ds.delta_x_norm_p1(k);
            sec.ekp1 = sec.tkp1 / (k as f64 + 2.0);
            if k == 1 {
                if sec.tkp1 >= TKP1_TK_SAFETY * sec.tk {
                    OrderAction::Maintain
                } else {
                    OrderAction::Raise
                }
            } else if sec.tkm1 <= sec.tk.min(sec.tkp1) {
                OrderAction::Lower
            } else if sec.tkp1 >= sec.tk {
                OrderAction::Maintain
            } else {
                OrderAction::Raise
            }
        };
        if k < sec.min_order {
            action = OrderAction::Raise;
        } else if k == sec.min_order && action == OrderAction::Lower {
            action = OrderAction::Maintain;
        }
        action
    }
}

impl TimeIntegrationMethod for Bdf {
    fn method(&self) -> IntegrationMethod {
        self.method
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
        let dnorm_q = self.ds.q1_history_norm();
        let h = sec.initial_step_size(dnorm_q, H0_SAFETY);

        sec.current_time_step = h;
        sec.last_time_step = h;
        sec.successive_failures = 0;
        sec.step_attempt_status = true;
        sec.next_time = sec.current_time + h;

        self.seed_history(h, solutions, &solutions.curr_state, q, f);

        sec.number_of_steps = 0;
        sec.current_order = 1;
        sec.used_order = 1;
        sec.psi[0] = h;
        sec.cj = 1.0 / h;
        sec.nscsco = 0;
        trace!("bdf restart at t = {:.6e}, h = {:.3e}", sec.current_time, h);
    }

    fn set_two_level_time_info(
        &mut self,
        sec: &mut StepErrorControl,
        solutions: &SolutionSet,
        q: &DVector<f64>,
        f: &DVector<f64>,
    ) {
        let h = sec.current_time_step;
        self.seed_history(h, solutions, &solutions.next_state, q, f);
        sec.number_of_steps = 0;
        sec.current_order = 1;
        sec.used_order = 1;
        sec.psi[0] = h;
        sec.cj = 1.0 / h;
        sec.nscsco = 0;
    }

    fn update_coeffs(&mut self, sec: &mut StepErrorControl) {
        let h = sec.current_time_step;
        let k = sec.current_order;
        if h != sec.used_step || k != sec.used_order {
            sec.nscsco = 0;
        }
        sec.nscsco = (sec.nscsco + 1).min(sec.used_order + 2);
        if k + 1 < sec.nscsco {
            return;
        }

        sec.beta[0] = 1.0;
        sec.alpha[0] = 1.0;
        sec.sigma[0] = 1.0;
        sec.gamma[0] = 0.0;
        let mut temp1 = h;
        for i in 1..=k {
            let temp2 = sec.psi[i - 1];
            sec.psi[i - 1] = temp1;
            sec.beta[i] = sec.beta[i - 1] * sec.psi[i - 1] / temp2;
            temp1 = temp2 + h;
            sec.alpha[i] = h / temp1;
            sec.sigma[i] = (i as f64 + 1.0) * sec.sigma[i - 1] * sec.alpha[i];
            sec.gamma[i] = sec.gamma[i - 1] + sec.alpha[i - 1] / h;
        }
        sec.psi[k] = temp1;

        sec.alphas = 0.0;
        sec.alpha0 = 0.0;
        for i in 0..k {
            sec.alphas -= 1.0 / (i as f64 + 1.0);
            sec.alpha0 -= sec.alpha[i];
        }
        sec.cj = -sec.alphas / h;
        sec.ck = (sec.alpha[k] + sec.alphas - sec.alpha0).abs().max(sec.alpha[k]);
    }

    fn obtain_predictor(&mut self, sec: &StepErrorControl, solutions: &mut SolutionSet) {
        let k = sec.current_order;
        let ds = &mut self.ds;
        for i in sec.nscsco..=k {
            ds.x_history[i] *= sec.beta[i];
            ds.q_history[i] *= sec.beta[i];
            ds.s_history[i] *= sec.beta[i];
            ds.sto_history[i] *= sec.beta[i];
        }

        ds.xn0.copy_from(&ds.x_history[0]);
        ds.qn0.copy_from(&ds.q_history[0]);
        ds.sn0.copy_from(&ds.s_history[0]);
        ds.ston0.copy_from(&ds.sto_history[0]);
        for i in 1..=k {
            ds.xn0 += &ds.x_history[i];
            ds.qn0 += &ds.q_history[i];
            ds.sn0 += &ds.s_history[i];
            ds.ston0 += &ds.sto_history[i];
        }
        solutions.next_solution.copy_from(&ds.xn0);
    }

    fn obtain_predictor_deriv(&mut self, sec: &StepErrorControl) {
        let ds = &mut self.ds;
        ds.qpn0.fill(0.0);
        ds.spn0.fill(0.0);
        for i in 1..=sec.current_order {
            ds.qpn0.axpy(sec.gamma[i], &ds.q_history[i], 1.0);
            ds.spn0.axpy(sec.gamma[i], &ds.s_history[i], 1.0);
        }
    }

    fn cj(&self, sec: &StepErrorControl) -> f64 {
        -sec.alphas / sec.current_time_step
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
        self.check_reduce_order(sec);

        sec.last_attempted_time_step = sec.current_time_step;
        let mut new_step = sec.current_time_step;

        if !sec.step_attempt_status {
            sec.initial_phase = false;
            sec.nef += 1;
            self.restore_history(sec);

            let rr = if sec.newton_status <= 0 {
                if sec.nef > 2 {
                    sec.new_order = 1;
                }
                R_MIN
            } else {
                match sec.nef {
                    1 => {
                        let exp = -1.0 / (sec.new_order as f64 + 1.0);
                        let rr = R_FACTOR * (R_SAFETY * (sec.est + R_FUDGE)).powf(exp);
                        rr.min(R_MAX).max(R_MIN)
                    }
                    2 => R_MIN,
                    _ => {
                        sec.new_order = 1;
                        R_MIN
                    }
                }
            };
            new_step = rr * sec.current_time_step;

            if sec.new_order >= sec.min_order {
                sec.current_order = sec.new_order;
            }
            if sec.number_of_steps == 0 {
                sec.psi[0] = new_step;
                self.ds.x_history[1] *= rr;
                self.ds.q_history[1] *= rr;
            }
            trace!(
                "bdf reject: nef = {}, rr = {:.3}, order = {}, h = {:.3e}",
                sec.nef, rr, sec.current_order, new_step
            );
        }

        sec.set_time_step(new_step);
    }

    fn reject_step_for_two_level(&mut self, sec: &mut StepErrorControl) {
        self.restore_history(sec);
        sec.set_time_step(sec.current_time_step);
    }

    fn complete_step(&mut self, sec: &mut StepErrorControl) {
        sec.number_of_steps += 1;
        sec.nef = 0;
        sec.last_time = sec.current_time;
        sec.current_time = sec.next_time;

        self.check_reduce_order(sec);

        sec.last_attempted_time_step = sec.current_time_step;
        sec.last_time_step = sec.current_time_step;
        let order_diff = sec.current_order as isize - sec.used_order as isize;
        sec.used_order = sec.current_order;
        sec.used_step = sec.current_time_step;
        let mut new_step = sec.current_time_step;

        if sec.new_order + 1 == sec.current_order || sec.current_order == sec.max_order {
            sec.initial_phase = false;
        }

        if sec.initial_phase {
            sec.current_order += 1;
            new_step = H_PHASE0_INCR * sec.current_time_step;
        } else {
            match self.select_order(sec, order_diff) {
                OrderAction::Raise => {
                    sec.current_order += 1;
                    sec.est = sec.ekp1;
                }
                OrderAction::Lower => {
                    sec.current_order -= 1;
                    sec.est = sec.ekm1;
                }
                OrderAction::Maintain => {}
            }
            let exp = -1.0 / (sec.current_order as f64 + 1.0);
            let rr = (R_SAFETY * (sec.est + R_FUDGE)).powf(exp);
            if rr >= R_HINCR_TEST {
                new_step = R_HINCR * sec.current_time_step;
            } else if rr <= 1.0 {
                new_step = rr.min(R_MAX).max(R_MIN) * sec.current_time_step;
            }
        }

        self.update_history(sec);

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

    fn two_level_error(&self, sec: &StepErrorControl) -> TwoLevelError {
        let k = sec.current_order;
        TwoLevelError {
            q1_history_sum: 0.0,
            x_error_sum: self.ds.partial_error_norm_sum(),
            q_error_sum: self.ds.partial_q_error_norm_sum(),
            x_error_sum_m1: self.ds.partial_sum_m1(k),
            x_error_sum_m2: self.ds.partial_sum_m2(k),
            x_error_sum_p1: self.ds.partial_sum_p1(k, sec.max_order),
            inner_size: self.ds.num_unknowns() as f64,
        }
    }

    fn interpolate_solution(&self, sec: &StepErrorControl, t: f64) -> Option<DVector<f64>> {
        let tn = sec.current_time;
        let h = sec.current_time_step;
        let tfuzz = 100.0 * f64::EPSILON * (tn + h);
        let tp = tn - sec.used_step - tfuzz;
        if (t - tp) * h < 0.0 {
            return None;
        }

        let mut x = self.ds.x_history[0].clone();
        let kord = if sec.used_order == 0 || t == tn {
            1
        } else {
            sec.used_order
        };
        let delt = t - tn;
        let mut c = 1.0;
        let mut gam = delt / sec.psi[0];
        for j in 1..=kord {
            c *= gam;
            gam = (delt + sec.psi[j - 1]) / sec.psi[j];
            x.axpy(c, &self.ds.x_history[j], 1.0);
        }
        Some(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tia::params::TiaParams;
    use ferrite_core::SerialComm;
    use nalgebra::dvector;

    fn setup(x0: f64, method: IntegrationMethod) -> (Bdf, StepErrorControl, SolutionSet) {
        let params = TiaParams::for_tstop(1.0).with_method(method);
        let mut sec = StepErrorControl::new(&params);
        sec.update_stop_time(&SerialComm);
        let max_order = method.order_cap(params.max_order);
        let bdf = Bdf::new(DataStore::new(1, 0, 0, max_order), method);
        let mut sol = SolutionSet::new(1, 0, 0);
        sol.curr_solution[0] = x0;
        sol.next_solution[0] = x0;
        (bdf, sec, sol)
    }

    /// Accept the exact solution `x(t)` (with `Q = x`) at the predicted time.
    fn accept_exact(bdf: &mut Bdf, sec: &mut StepErrorControl, sol: &mut SolutionSet, x: f64) {
        sol.next_solution[0] = x;
        bdf.ds.step_linear_combo(sol, &dvector![x]);
        sec.newton_status = 1;
        sec.est_over_tol = bdf.error_estimate(sec);
        sec.step_attempt_status = true;
        bdf.complete_step(sec);
        sol.rotate();
    }

    #[test]
    fn first_order_coefficients() {
        let (mut bdf, mut sec, sol) = setup(0.0, IntegrationMethod::Bdf15);
        bdf.initialize(&mut sec, &sol, &dvector![0.0], &dvector![0.0]);
        let h = sec.current_time_step;
        assert!((h - 0.005).abs() < 1e-15);
        bdf.update_coeffs(&mut sec);
        assert_eq!(sec.alphas, -1.0);
        assert!((bdf.cj(&sec) - 1.0 / h).abs() < 1e-9);
        assert!((sec.gamma[1] - 1.0 / h).abs() < 1e-9);
    }

    #[test]
    fn linear_solution_is_predicted_exactly() {
        // x = 1 + 3t, dx/dt + F = 0 with F = -3
        let (mut bdf, mut sec, mut sol) = setup(1.0, IntegrationMethod::Bdf15);
        let f = dvector![-3.0];
        bdf.initialize(&mut sec, &sol, &dvector![1.0], &f);
        bdf.ds.x_history[1][0] = 3.0 * sec.current_time_step;

        let mut residual = DVector::zeros(1);
        for _ in 0..40 {
            if sec.finished() {
                break;
            }
            bdf.update_coeffs(&mut sec);
            bdf.obtain_predictor(&sec, &mut sol);
            bdf.obtain_predictor_deriv(&sec);
            let t = sec.next_time;
            let exact = 1.0 + 3.0 * t;
            assert!((sol.next_solution[0] - exact).abs() < 1e-12, "t = {t}");

            bdf.residual(&sec, &dvector![exact], &f, &mut residual);
            assert!(residual[0].abs() < 1e-8, "residual {} at t = {t}", residual[0]);
            accept_exact(&mut bdf, &mut sec, &mut sol, exact);

            let mid = sec.current_time - 0.5 * sec.used_step;
            let x = bdf.interpolate_solution(&sec, mid).unwrap();
            assert!((x[0] - (1.0 + 3.0 * mid)).abs() < 1e-12);
        }
        assert!(sec.finished());
        assert_eq!(sec.current_time, 1.0);
        assert!(bdf.interpolate_solution(&sec, 1.0 - 2.0 * sec.used_step).is_none());
    }

    #[test]
    fn quadratic_is_predicted_exactly_once_order_reaches_two() {
        // x = 1 + t^2 starts flat, so the first-step history is exact
        let (mut bdf, mut sec, mut sol) = setup(1.0, IntegrationMethod::Bdf15);
        bdf.initialize(&mut sec, &sol, &dvector![1.0], &dvector![0.0]);
        sec.max_time_step = 0.01;

        let mut highest = 0;
        let mut checked = 0;
        for _ in 0..200 {
            if sec.finished() {
                break;
            }
            bdf.update_coeffs(&mut sec);
            bdf.obtain_predictor(&sec, &mut sol);
            bdf.obtain_predictor_deriv(&sec);
            let t = sec.next_time;
            let exact = 1.0 + t * t;
            if sec.current_order >= 2 {
                let err = (sol.next_solution[0] - exact).abs();
                assert!(err < 1e-11, "order {} at t = {t}: error {err}", sec.current_order);
                checked += 1;
            }
            highest = highest.max(sec.current_order);
            accept_exact(&mut bdf, &mut sec, &mut sol, exact);
        }
        assert!(highest >= 2, "order never rose above {highest}");
        assert!(checked > 10);
    }

    #[test]
    fn corrector_mismatch_raises_the_estimate() {
        let (mut bdf, mut sec, mut sol) = setup(0.0, IntegrationMethod::Bdf15);
        bdf.initialize(&mut sec, &sol, &dvector![0.0], &dvector![0.0]);
        bdf.update_coeffs(&mut sec);
        bdf.obtain_predictor(&sec, &mut sol);
        bdf.obtain_predictor_deriv(&sec);
        bdf.ds.err_wt.fill(1e-3);

        sol.next_solution[0] = 1e-3;
        bdf.ds.step_linear_combo(&sol, &dvector![1e-3]);
        // ck = 1/2 at first order
        assert!((bdf.error_estimate(&sec) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn backward_euler_stays_first_order() {
        let (mut bdf, mut sec, mut sol) = setup(0.0, IntegrationMethod::BackwardEuler);
        bdf.initialize(&mut sec, &sol, &dvector![0.0], &dvector![-1.0]);
        for _ in 0..5 {
            bdf.update_coeffs(&mut sec);
            bdf.obtain_predictor(&sec, &mut sol);
            bdf.obtain_predictor_deriv(&sec);
            let t = sec.next_time;
            accept_exact(&mut bdf, &mut sec, &mut sol, t);
            assert_eq!(sec.current_order, 1);
        }
    }

    #[test]
    fn rejection_shrinks_step_and_restores_history() {
        let (mut bdf, mut sec, mut sol) = setup(0.0, IntegrationMethod::Bdf15);
        bdf.initialize(&mut sec, &sol, &dvector![0.0], &dvector![-1.0]);
        bdf.update_coeffs(&mut sec);
        let saved = bdf.ds.x_history.clone();
        bdf.obtain_predictor(&sec, &mut sol);
        bdf.obtain_predictor_deriv(&sec);

        let h = sec.current_time_step;
        sec.newton_status = -1;
        sec.step_attempt_status = false;
        bdf.reject_step(&mut sec);
        assert!((sec.current_time_step - R_MIN * h).abs() < 1e-15);
        assert_eq!(sec.nef, 1);
        assert_eq!(sec.current_order, 1);
        // First step: level 1 is rescaled with the step.
        assert_eq!(bdf.ds.x_history[0], saved[0]);
        assert!((sec.psi[0] - sec.current_time_step).abs() < 1e-18);
    }

    #[test]
    fn two_level_error_reports_size() {
        let (mut bdf, mut sec, mut sol) = setup(0.0, IntegrationMethod::Bdf15);
        bdf.initialize(&mut sec, &sol, &dvector![0.0], &dvector![0.0]);
        bdf.update_coeffs(&mut sec);
        bdf.obtain_predictor(&sec, &mut sol);
        bdf.obtain_predictor_deriv(&sec);
        let mut deriv = DVector::zeros(0);
        bdf.update_state_deriv(&sec, &DVector::zeros(0), &mut deriv);
        assert_eq!(deriv.len(), 0);

        let err = bdf.two_level_error(&sec);
        assert_eq!(err.inner_size, 1.0);
    }
}
