//! BDF history arrays, predictors, Newton corrections and error norms.

use ferrite_core::{PackBuffer, SolutionSet, UnpackBuffer, wrms_norm, wrms_partial_sum};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Error summary an inner sub-problem hands to an enclosing two-level solve.
///
/// Every `*_sum` field is a sum of squared weighted entries over the inner
/// unknowns; the outer side adds them to its own sums before taking the root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TwoLevelError {
    pub q1_history_sum: f64,
    pub x_error_sum: f64,
    pub q_error_sum: f64,
    pub x_error_sum_m1: f64,
    pub x_error_sum_m2: f64,
    pub x_error_sum_p1: f64,
    pub inner_size: f64,
}

/// Per-unknown vectors owned by the integrator.
///
/// `x_history[i]` holds the i-th scaled modified divided difference of the
/// solution; `q_history`, `s_history` and `sto_history` do the same for Q,
/// device state and device store.
#[derive(Debug, Clone, PartialEq)]
pub struct DataStore {
    pub x_history: Vec<DVector<f64>>,
    pub q_history: Vec<DVector<f64>>,
    pub s_history: Vec<DVector<f64>>,
    pub sto_history: Vec<DVector<f64>>,

    pub err_wt: DVector<f64>,
    pub q_err_wt: DVector<f64>,

    /// Predicted solution, Q, state, store.
    pub xn0: DVector<f64>,
    pub qn0: DVector<f64>,
    pub sn0: DVector<f64>,
    pub ston0: DVector<f64>,
    /// Predicted dQ/dt and dS/dt.
    pub qpn0: DVector<f64>,
    pub spn0: DVector<f64>,

    /// Corrector minus predictor.
    pub newton_correction: DVector<f64>,
    pub q_newton_correction: DVector<f64>,
    pub s_newton_correction: DVector<f64>,
    pub sto_newton_correction: DVector<f64>,

    /// Sums reported by inner sub-problems for the current step.
    pub inner_errors: Vec<TwoLevelError>,
}

impl DataStore {
    pub fn new(num_unknowns: usize, num_states: usize, num_stores: usize, max_order: usize) -> Self {
        let hist = |n: usize| vec![DVector::zeros(n); max_order + 2];
        let z = |n: usize| DVector::<f64>::zeros(n);
        Self {
            x_history: hist(num_unknowns),
            q_history: hist(num_unknowns),
            s_history: hist(num_states),
            sto_history: hist(num_stores),
            err_wt: DVector::from_element(num_unknowns, 1.0),
            q_err_wt: DVector::from_element(num_unknowns, 1.0),
            xn0: z(num_unknowns),
            qn0: z(num_unknowns),
            sn0: z(num_states),
            ston0: z(num_stores),
            qpn0: z(num_unknowns),
            spn0: z(num_states),
            newton_correction: z(num_unknowns),
            q_newton_correction: z(num_unknowns),
            s_newton_correction: z(num_states),
            sto_newton_correction: z(num_stores),
            inner_errors: Vec::new(),
        }
    }

    pub fn num_unknowns(&self) -> usize {
        self.xn0.len()
    }

    /// Number of history levels (`max_order + 2`).
    pub fn history_len(&self) -> usize {
        self.x_history.len()
    }

    /// Clear every history level, predictor and correction.
    pub fn set_zero_history(&mut self) {
        for family in [
            &mut self.x_history,
            &mut self.q_history,
            &mut self.s_history,
            &mut self.sto_history,
        ] {
            for level in family.iter_mut() {
                level.fill(0.0);
            }
        }
        for v in [
            &mut self.xn0,
            &mut self.qn0,
            &mut self.sn0,
            &mut self.ston0,
            &mut self.qpn0,
            &mut self.spn0,
            &mut self.newton_correction,
            &mut self.q_newton_correction,
            &mut self.s_newton_correction,
            &mut self.sto_newton_correction,
        ] {
            v.fill(0.0);
        }
    }

    /// Refresh the local-error weights from the current point.
    ///
    /// `err_wt = reltol * |x| + abstol`, where `|x|` is either each unknown's
    /// magnitude or, with `new_lte`, the largest magnitude over all unknowns.
    /// `q_err_wt` always uses each entry of `q`.
    pub fn set_error_wt_vector(
        &mut self,
        curr_solution: &DVector<f64>,
        q: &DVector<f64>,
        reltol: f64,
        abstol: f64,
        new_lte: bool,
    ) {
        if new_lte {
            let max = curr_solution.amax();
            self.err_wt.fill(reltol * max + abstol);
        } else {
            self.err_wt
                .iter_mut()
                .zip(curr_solution.iter())
                .for_each(|(w, &x)| *w = reltol * x.abs() + abstol);
        }
        self.q_err_wt
            .iter_mut()
            .zip(q.iter())
            .for_each(|(w, &qi)| *w = reltol * qi.abs() + abstol);
    }

    /// Differences between the corrected and predicted point.
    ///
    /// `q` must be the Q vector loaded at the corrected solution.
    pub fn step_linear_combo(&mut self, solutions: &SolutionSet, q: &DVector<f64>) {
        self.newton_correction = &solutions.next_solution - &self.xn0;
        self.q_newton_correction = q - &self.qn0;
        self.s_newton_correction = &solutions.next_state - &self.sn0;
        self.sto_newton_correction = &solutions.next_store - &self.ston0;
    }

    /// Fold inner sums selected by `pick` into a local norm over `n` entries.
    fn combine(&self, local: f64, pick: impl Fn(&TwoLevelError) -> f64) -> f64 {
        if self.inner_errors.is_empty() {
            return local;
        }
        let n = self.num_unknowns() as f64;
        let (total_sum, total_size) = self
            .inner_errors
            .iter()
            .fold((local * local * n, n), |(sum, size), e| {
                (sum + pick(e), size + e.inner_size)
            });
        if total_size > 0.0 {
            (total_sum / total_size).sqrt()
        } else {
            0.0
        }
    }

    /// Weighted RMS norm of the Newton correction, including inner sub-problems.
    pub fn wrms_error_norm(&self) -> f64 {
        let local = wrms_norm(&self.newton_correction, &self.err_wt);
        self.combine(local, |e| e.x_error_sum)
    }

    /// Weighted RMS norm of the Q correction, including inner sub-problems.
    pub fn wrms_q_error_norm(&self) -> f64 {
        let local = wrms_norm(&self.q_newton_correction, &self.q_err_wt);
        self.combine(local, |e| e.q_error_sum)
    }

    /// `x_history[k] + newton_correction`, the order `k - 1` error vector.
    fn delta_m1(&self, order: usize) -> DVector<f64> {
        &self.x_history[order] + &self.newton_correction
    }

    /// `x_history[k] + x_history[k - 1] + newton_correction`.
    fn delta_m2(&self, order: usize) -> DVector<f64> {
        self.delta_m1(order) + &self.x_history[order - 1]
    }

    /// `newton_correction - x_history[k + 1]`.
    fn delta_p1(&self, order: usize) -> DVector<f64> {
        &self.newton_correction - &self.x_history[order + 1]
    }

    /// Norm of the error estimate at order `k - 1` (`k > 1`).
    pub fn delta_x_norm_m1(&self, order: usize) -> f64 {
        let local = wrms_norm(&self.delta_m1(order), &self.err_wt);
        self.combine(local, |e| e.x_error_sum_m1)
    }

    /// Norm of the error estimate at order `k - 2` (`k > 2`).
    pub fn delta_x_norm_m2(&self, order: usize) -> f64 {
        let local = wrms_norm(&self.delta_m2(order), &self.err_wt);
        self.combine(local, |e| e.x_error_sum_m2)
    }

    /// Norm of the error estimate at order `k + 1` (`k < max_order`).
    pub fn delta_x_norm_p1(&self, order: usize) -> f64 {
        let local = wrms_norm(&self.delta_p1(order), &self.err_wt);
        self.combine(local, |e| e.x_error_sum_p1)
    }

    /// Weighted norm of `q_history[1]`, which after a restart holds `-h * F`.
    pub fn q1_history_norm(&self) -> f64 {
        let local = wrms_norm(&self.q_history[1], &self.q_err_wt);
        self.combine(local, |e| e.q1_history_sum)
    }

    pub fn partial_error_norm_sum(&self) -> f64 {
        wrms_partial_sum(&self.newton_correction, &self.err_wt)
    }

    pub fn partial_q_error_norm_sum(&self) -> f64 {
        wrms_partial_sum(&self.q_newton_correction, &self.q_err_wt)
    }

    pub fn partial_sum_m1(&self, order: usize) -> f64 {
        if order > 1 {
            wrms_partial_sum(&self.delta_m1(order), &self.err_wt)
        } else {
            0.0
        }
    }

    pub fn partial_sum_m2(&self, order: usize) -> f64 {
        if order > 2 {
            wrms_partial_sum(&self.delta_m2(order), &self.err_wt)
        } else {
            0.0
        }
    }

    pub fn partial_sum_p1(&self, order: usize, max_order: usize) -> f64 {
        if order < max_order {
            wrms_partial_sum(&self.delta_p1(order), &self.err_wt)
        } else {
            0.0
        }
    }

    pub fn partial_sum_q1(&self) -> f64 {
        wrms_partial_sum(&self.q_history[1], &self.q_err_wt)
    }

    /// History levels and weights; predictors and corrections are rebuilt each step.
    pub fn pack(&self, buf: &mut PackBuffer) {
        buf.pack_usize(self.history_len());
        for family in [&self.x_history, &self.q_history, &self.s_history, &self.sto_history] {
            for level in family {
                buf.pack_f64_slice(level.as_slice());
            }
        }
        buf.pack_f64_slice(self.err_wt.as_slice());
        buf.pack_f64_slice(self.q_err_wt.as_slice());
    }

    pub fn unpack(&mut self, buf: &mut UnpackBuffer<'_>) -> Result<()> {
        let levels = buf.unpack_usize()?;
        if levels != self.history_len() {
            return Err(crate::error::Error::DimensionMismatch {
                expected: self.history_len(),
                actual: levels,
            });
        }
        for family in [
            &mut self.x_history,
            &mut self.q_history,
            &mut self.s_history,
            &mut self.sto_history,
        ] {
            for level in family.iter_mut() {
                unpack_into(buf, level)?;
            }
        }
        unpack_into(buf, &mut self.err_wt)?;
        unpack_into(buf, &mut self.q_err_wt)?;
        Ok(())
    }
}

/// Read a length-prefixed vector and check it matches `dst`.
pub(crate) fn unpack_into(buf: &mut UnpackBuffer<'_>, dst: &mut DVector<f64>) -> Result<()> {
    let values = buf.unpack_f64_vec()?;
    if values.len() != dst.len() {
        return Err(crate::error::Error::DimensionMismatch {
            expected: dst.len(),
            actual: values.len(),
        });
    }
    dst.copy_from_slice(&values);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn error_weights() {
        let mut ds = DataStore::new(2, 0, 0, 5);
        let x = dvector![2.0, -0.5];
        let q = dvector![1e-12, 0.0];

        ds.set_error_wt_vector(&x, &q, 1e-3, 1e-6, false);
        assert!((ds.err_wt[0] - 2.001e-3).abs() < 1e-15);
        assert!((ds.err_wt[1] - 5.01e-4).abs() < 1e-15);

        ds.set_error_wt_vector(&x, &q, 1e-3, 1e-6, true);
        assert_eq!(ds.err_wt[0], ds.err_wt[1]);
        assert!((ds.q_err_wt[1] - 1e-6).abs() < 1e-20);
    }

    #[test]
    fn partial_sums_match_norms() {
        let mut ds = DataStore::new(3, 0, 0, 5);
        ds.err_wt = dvector![1.0, 2.0, 4.0];
        ds.newton_correction = dvector![1.0, 2.0, 4.0];
        ds.x_history[3] = dvector![1.0, 0.0, -4.0];
        ds.x_history[2] = dvector![0.0, 2.0, 0.0];

        assert!((ds.partial_error_norm_sum() - 3.0).abs() < 1e-14);
        assert!((ds.wrms_error_norm() - 1.0).abs() < 1e-14);

        // delta_m1 = [2, 2, 0] / w = [2, 1, 0]
        assert!((ds.partial_sum_m1(3) - 5.0).abs() < 1e-14);
        assert_eq!(ds.partial_sum_m1(1), 0.0);
        // delta_m2 = [2, 4, 0] / w = [2, 2, 0]
        assert!((ds.partial_sum_m2(3) - 8.0).abs() < 1e-14);
        assert_eq!(ds.partial_sum_p1(5, 5), 0.0);
    }

    #[test]
    fn inner_sums_enter_the_norm() {
        let mut ds = DataStore::new(2, 0, 0, 2);
        ds.newton_correction = dvector![1.0, 1.0];
        assert!((ds.wrms_error_norm() - 1.0).abs() < 1e-14);

        ds.inner_errors.push(TwoLevelError {
            x_error_sum: 0.0,
            inner_size: 2.0,
            ..Default::default()
        });
        // (2 + 0) / (2 + 2)
        assert!((ds.wrms_error_norm() - 0.5f64.sqrt()).abs() < 1e-14);
    }

    #[test]
    fn pack_round_trip() {
        let mut ds = DataStore::new(2, 1, 1, 2);
        ds.x_history[1] = dvector![0.25, -1.0];
        ds.s_history[0][0] = 3.0;
        ds.err_wt = dvector![1e-6, 2e-6];
        let mut buf = PackBuffer::new();
        ds.pack(&mut buf);
        let bytes = buf.into_bytes();

        let mut restored = DataStore::new(2, 1, 1, 2);
        restored.unpack(&mut UnpackBuffer::new(&bytes)).unwrap();
        assert_eq!(restored.x_history, ds.x_history);
        assert_eq!(restored.s_history, ds.s_history);
        assert_eq!(restored.err_wt, ds.err_wt);

        let mut wrong = DataStore::new(2, 1, 1, 3);
        assert!(wrong.unpack(&mut UnpackBuffer::new(&bytes)).is_err());
    }
}
