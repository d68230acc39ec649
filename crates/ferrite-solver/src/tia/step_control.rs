//! Step size, order and breakpoint bookkeeping shared by every integration method.

use ferrite_core::{BreakPoint, BreakPointKind, Communicator, PackBuffer, UnpackBuffer};
use log::{debug, trace};

use super::TimeIntInfo;
use super::params::{MAX_BDF_ORDER, TiaParams};
use crate::error::{Error, Result};

/// Relative distance to the final time below which a run counts as finished.
const FINISH_FUZZ: f64 = 1e-10;

/// Multiple of machine epsilon times the current time used as the step floor.
const MIN_STEP_PRECISION_FAC: f64 = 10.0;

/// Breakpoints ordered by time. Entries closer than the breakpoint tolerance
/// count as the same point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BreakPointSet {
    points: Vec<BreakPoint>,
}

impl BreakPointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &BreakPoint> {
        self.points.iter()
    }

    /// Add a breakpoint. A simple point that coincides with an existing one is
    /// dropped; a pause point replaces the entry it coincides with.
    pub fn insert(&mut self, bp: BreakPoint, tol: f64) {
        if let Some(i) = self.points.iter().position(|p| p.coincides(bp.time, tol)) {
            if bp.kind != BreakPointKind::Simple {
                self.points[i] = bp;
            }
            return;
        }
        let at = self.points.partition_point(|p| p.time < bp.time);
        self.points.insert(at, bp);
    }

    /// The `n`-th breakpoint strictly after `t`, treating points within `tol` of
    /// `t` as not after it.
    pub fn nth_after(&self, t: f64, tol: f64, n: usize) -> Option<&BreakPoint> {
        self.points.iter().filter(|p| p.time - t > tol).nth(n)
    }

    pub fn first_after(&self, t: f64, tol: f64) -> Option<&BreakPoint> {
        self.nth_after(t, tol, 0)
    }

    /// Drop every breakpoint earlier than `t`.
    pub fn remove_before(&mut self, t: f64) {
        self.points.retain(|p| p.time >= t);
    }

    /// Drop the breakpoint coinciding with `t`, if any.
    pub fn remove_at(&mut self, t: f64, tol: f64) -> Option<BreakPoint> {
        let i = self.points.iter().position(|p| p.coincides(t, tol))?;
        Some(self.points.remove(i))
    }

    /// Collapse neighbors closer than `tol`.
    ///
    /// Two simple points keep the earlier one. Otherwise the merged point sits
    /// at the earlier time with the non-simple kind. Returns the pause points
    /// created by merging.
    pub fn merge(&mut self, tol: f64) -> Vec<BreakPoint> {
        let mut merged_pauses = Vec::new();
        let mut i = 1;
        while i < self.points.len() {
            let prev = self.points[i - 1];
            let curr = self.points[i];
            if (curr.time - prev.time).abs() < tol {
                let kind = if prev.kind != BreakPointKind::Simple {
                    prev.kind
                } else {
                    curr.kind
                };
                let bp = BreakPoint {
                    time: prev.time.min(curr.time),
                    kind,
                };
                self.points[i - 1] = bp;
                self.points.remove(i);
                if bp.is_pause() {
                    merged_pauses.push(bp);
                }
            } else {
                i += 1;
            }
        }
        merged_pauses
    }
}

/// Step-size, order and breakpoint state for a transient run.
///
/// The BDF coefficient arrays live here as well: restart records and the
/// two-level interface read and write them together with the step sizes.
#[derive(Debug, Clone)]
pub struct StepErrorControl {
    params: TiaParams,

    pub initial_time: f64,
    pub final_time: f64,
    pub last_time: f64,
    pub current_time: f64,
    pub next_time: f64,
    pub stop_time: f64,
    /// Earliest pending pause breakpoint.
    pub pause_time: Option<f64>,

    pub starting_time_step: Option<f64>,
    pub current_time_step: f64,
    pub last_attempted_time_step: f64,
    pub last_time_step: f64,
    pub min_time_step: f64,
    pub max_time_step: f64,

    pub breakpoints: BreakPointSet,
    pub bp_tol: f64,

    /// Newton status code of the last attempt; positive on convergence.
    pub newton_status: i32,
    pub newton_iterations: usize,
    pub step_attempt_status: bool,
    pub previous_call_step_successful: bool,
    pub est_over_tol: f64,

    pub step_number: usize,
    pub successive_failures: usize,
    pub beginning_integration: bool,

    // Order selection.
    pub current_order: usize,
    pub min_order: usize,
    pub max_order: usize,
    pub used_order: usize,
    pub new_order: usize,
    pub used_step: f64,
    pub number_of_steps: usize,
    /// Consecutive local error test failures on this step.
    pub nef: usize,
    /// Number of steps taken at constant step size and order.
    pub nscsco: usize,
    pub initial_phase: bool,

    // BDF coefficients, indexed by order.
    pub alpha: [f64; MAX_BDF_ORDER + 1],
    pub sigma: [f64; MAX_BDF_ORDER + 1],
    pub gamma: [f64; MAX_BDF_ORDER + 1],
    pub beta: [f64; MAX_BDF_ORDER + 1],
    pub psi: [f64; MAX_BDF_ORDER + 1],
    pub alphas: f64,
    pub alpha0: f64,
    pub cj: f64,
    pub ck: f64,

    // Local error estimates at neighboring orders.
    pub ek: f64,
    pub ekm1: f64,
    pub ekm2: f64,
    pub ekp1: f64,
    pub est: f64,
    pub tk: f64,
    pub tkm1: f64,
    pub tkm2: f64,
    pub tkp1: f64,
}

impl StepErrorControl {
    pub fn new(params: &TiaParams) -> Self {
        let mut sec = Self {
            params: params.clone(),
            initial_time: params.initial_time,
            final_time: params.final_time,
            last_time: params.initial_time,
            current_time: params.initial_time,
            next_time: params.initial_time,
            stop_time: params.initial_time,
            pause_time: None,
            starting_time_step: params.starting_time_step,
            current_time_step: 0.0,
            last_attempted_time_step: 0.0,
            last_time_step: 0.0,
            min_time_step: 0.0,
            max_time_step: 0.0,
            breakpoints: BreakPointSet::new(),
            bp_tol: 0.0,
            newton_status: -1,
            newton_iterations: 0,
            step_attempt_status: true,
            previous_call_step_successful: false,
            est_over_tol: 0.0,
            step_number: 0,
            successive_failures: 0,
            beginning_integration: true,
            current_order: 1,
            min_order: params.min_order.max(1),
            max_order: params.effective_max_order().max(1),
            used_order: 1,
            new_order: 1,
            used_step: 0.0,
            number_of_steps: 0,
            nef: 0,
            nscsco: 0,
            initial_phase: true,
            alpha: [0.0; MAX_BDF_ORDER + 1],
            sigma: [0.0; MAX_BDF_ORDER + 1],
            gamma: [0.0; MAX_BDF_ORDER + 1],
            beta: [0.0; MAX_BDF_ORDER + 1],
            psi: [0.0; MAX_BDF_ORDER + 1],
            alphas: -1.0,
            alpha0: 0.0,
            cj: 0.0,
            ck: 0.0,
            ek: 0.0,
            ekm1: 0.0,
            ekm2: 0.0,
            ekp1: 0.0,
            est: 0.0,
            tk: 0.0,
            tkm1: 0.0,
            tkm2: 0.0,
            tkp1: 0.0,
        };
        sec.min_order = sec.min_order.min(sec.max_order);
        sec.reset_all();
        sec
    }

    pub fn params(&self) -> &TiaParams {
        &self.params
    }

    /// Return to the start of the run: times, step sizes and breakpoints.
    pub fn reset_all(&mut self) {
        self.current_time = self.initial_time;
        self.last_time = self.initial_time;
        self.next_time = self.initial_time;
        self.stop_time = self.initial_time;
        let h = self.starting_time_step.unwrap_or(1e-10);
        self.current_time_step = h;
        self.last_attempted_time_step = h;
        self.last_time_step = h;
        self.newton_status = -1;
        self.successive_failures = 0;
        self.step_attempt_status = true;
        self.est_over_tol = 0.0;
        self.min_time_step = self.params.min_time_step.unwrap_or(0.0);
        self.max_time_step = self.params.default_max_time_step();
        self.refresh_bp_tol();
        self.initialize_breakpoints();
    }

    fn refresh_bp_tol(&mut self) {
        self.bp_tol = self.params.bp_tol.unwrap_or_else(|| {
            (2.0 * self.min_time_step).max((self.final_time - self.initial_time).abs() * 1e-12)
        });
    }

    /// Seed the breakpoint set with the interval ends and user pause times.
    pub fn initialize_breakpoints(&mut self) {
        self.breakpoints.clear();
        self.pause_time = None;
        self.breakpoints
            .insert(BreakPoint::simple(self.initial_time), self.bp_tol);
        let pauses: Vec<f64> = self
            .params
            .pause_times
            .iter()
            .copied()
            .filter(|&t| t > self.initial_time && t < self.final_time)
            .collect();
        for t in pauses {
            self.set_break_point(BreakPoint::pause(t));
        }
        self.set_break_point(BreakPoint::pause(self.final_time));
    }

    /// Insert one breakpoint, tracking the earliest pending pause.
    pub fn set_break_point(&mut self, bp: BreakPoint) {
        self.breakpoints.insert(bp, self.bp_tol);
        if bp.is_pause() {
            self.update_pause_time(bp);
        }
    }

    fn update_pause_time(&mut self, bp: BreakPoint) {
        self.pause_time = match self.pause_time {
            Some(p) if p >= self.current_time => Some(p.min(bp.time)),
            _ => Some(bp.time),
        };
    }

    /// Clamp `h` to the step bounds and the stop time, then set the next time.
    pub fn set_time_step(&mut self, h: f64) {
        let mut h = h.max(self.min_time_step).min(self.max_time_step);
        let mut next = self.current_time + h;
        if next > self.stop_time {
            next = self.stop_time;
            h = self.stop_time - self.current_time;
        }
        self.current_time_step = h;
        self.next_time = next;
    }

    /// First step after a (re)start.
    ///
    /// `dnorm_q` is the weighted norm of `dQ/dt = -F` at the restart point;
    /// when it is zero only the distance to the stop time limits the step.
    pub fn initial_step_size(&self, dnorm_q: f64, h0_safety: f64) -> f64 {
        let time_to_stop = (self.stop_time - self.current_time).abs();
        let scale = self.params.restart_step_scale;
        let mut h = if dnorm_q > 0.0 {
            (scale * time_to_stop).min(std::f64::consts::SQRT_2 / (h0_safety * dnorm_q))
        } else {
            scale * time_to_stop
        };
        if let Some(h0) = self.starting_time_step {
            if h0 > 0.0 {
                h = h.min(h0);
            }
        }
        if self.max_time_step > 0.0 {
            h = h.min(self.max_time_step);
        }
        if self.current_time != self.initial_time {
            h = h.min(self.last_time_step);
        }
        h
    }

    /// Move the stop time to the next breakpoint, pause or the final time.
    pub fn update_stop_time(&mut self, comm: &dyn Communicator) {
        let old_stop = self.stop_time;
        let mut stop = if self.params.bp_enable {
            let next = self
                .breakpoints
                .first_after(self.current_time, self.bp_tol)
                .copied();
            let mut stop = next.map_or(self.final_time, |bp| bp.time.min(self.final_time));
            if let Some(bp) = next {
                if bp.is_pause() {
                    self.update_pause_time(bp);
                }
            }
            if let Some(p) = self.pause_time {
                stop = stop.min(p);
            }
            if (stop - old_stop).abs() < self.bp_tol
                && self.beginning_integration
                && Some(stop) != self.pause_time
                && stop != self.final_time
            {
                if let Some(bp) = self.breakpoints.nth_after(self.current_time, self.bp_tol, 1) {
                    stop = bp.time;
                }
            }
            stop
        } else {
            self.pause_time
                .map_or(self.final_time, |p| p.min(self.final_time))
        };
        stop = comm.min_all(&[stop]).first().copied().unwrap_or(stop);
        if stop != old_stop {
            trace!("stop time {:.6e} -> {:.6e}", old_stop, stop);
        }
        self.stop_time = stop;
    }

    /// Merge device breakpoints in `(last_time, final_time)` and drop stale ones.
    pub fn update_breakpoints(&mut self, device_bps: &[BreakPoint]) {
        for bp in device_bps {
            if bp.time < self.final_time && bp.time > self.last_time {
                self.set_break_point(*bp);
            }
        }
        self.breakpoints.remove_before(self.last_time);
        self.refresh_bp_tol();
        for bp in self.breakpoints.merge(self.bp_tol) {
            self.update_pause_time(bp);
        }
    }

    /// Reset the maximum step from user input and the simulated interval.
    pub fn update_max_time_step(&mut self, comm: &dyn Communicator) {
        let h = self.params.default_max_time_step();
        self.max_time_step = comm.min_all(&[h]).first().copied().unwrap_or(h);
    }

    /// Floor the step at a few ulps of the current time.
    pub fn update_min_time_step(&mut self) {
        let floor = self.current_time * MIN_STEP_PRECISION_FAC * f64::EPSILON;
        self.min_time_step = floor.max(self.params.min_time_step.unwrap_or(0.0));
    }

    /// Decide whether the last attempt is accepted.
    ///
    /// `estimate` is only evaluated when the predictor-corrector test applies.
    pub fn evaluate_step_error(&mut self, estimate: impl FnOnce(&Self) -> f64) {
        let newton_ok = self.newton_status >= 0;
        let tested = newton_ok
            && if self.current_time == self.initial_time {
                self.step_number >= 1 && !self.beginning_integration
            } else {
                self.step_number >= 1
            };

        let mut status = newton_ok;
        if tested {
            self.est_over_tol = estimate(self);
            status = self.est_over_tol <= self.params.err_tol_acceptance;
        }
        debug!(
            "STEP STATUS: {} Newton: {}   estOverTol: {:.6e}{}",
            if status { "success" } else { "fail   " },
            self.newton_status,
            self.est_over_tol,
            if tested { "" } else { " (not used for this step)" }
        );
        self.step_attempt_status = status;
    }

    /// True once the current time reaches the final time.
    pub fn finished(&self) -> bool {
        let span = (self.final_time - self.initial_time).abs();
        self.current_time >= self.final_time
            || (self.current_time - self.final_time).abs() < FINISH_FUZZ * span
    }

    /// True when the current time sits on a pause breakpoint short of the final time.
    pub fn is_pause_time(&self) -> bool {
        match self.pause_time {
            Some(p) => p != self.final_time && p == self.current_time,
            None => false,
        }
    }

    /// Clear the pause breakpoint the run just stopped on.
    pub fn simulation_paused(&mut self) {
        self.breakpoints.remove_at(self.current_time, self.bp_tol);
        self.pause_time = None;
        let next_pause = self
            .breakpoints
            .iter()
            .find(|bp| bp.is_pause() && bp.time > self.current_time)
            .copied();
        if let Some(bp) = next_pause {
            self.update_pause_time(bp);
        }
    }

    /// Take step size and order from an enclosing solver.
    pub fn update_two_level_time_info(&mut self, info: &TimeIntInfo, comm: &dyn Communicator) {
        self.update_stop_time(comm);
        if self.previous_call_step_successful {
            self.last_time_step = self.current_time_step;
        }
        self.next_time = info.next_time;
        self.current_time_step = info.next_time_step;
        self.current_order = info.current_order.clamp(1, self.max_order);
    }

    /// Snapshot handed to an enclosing solver.
    pub fn time_int_info(&self) -> TimeIntInfo {
        TimeIntInfo {
            next_time_step: self.current_time_step,
            next_time: self.next_time,
            curr_time_step: self.last_time_step,
            current_time: self.current_time,
            current_order: self.current_order,
            beginning_integration: self.beginning_integration,
        }
    }

    /// Append step sizes, times, counters, breakpoints and BDF coefficients.
    ///
    /// The final-time pause breakpoint is implied by the run and left out.
    pub fn pack(&self, buf: &mut PackBuffer) {
        for v in [
            self.starting_time_step.unwrap_or(0.0),
            self.current_time_step,
            self.last_attempted_time_step,
            self.last_time_step,
            self.min_time_step,
            self.max_time_step,
            self.last_time,
            self.current_time,
            self.next_time,
            self.stop_time,
            self.initial_time,
            self.est_over_tol,
        ] {
            buf.pack_f64(v);
        }
        buf.pack_f64(f64::from(self.newton_status));
        buf.pack_usize(self.successive_failures);
        buf.pack_bool(self.step_attempt_status);
        buf.pack_usize(self.step_number);
        buf.pack_bool(self.beginning_integration);

        let kept: Vec<&BreakPoint> = self
            .breakpoints
            .iter()
            .filter(|bp| !(bp.is_pause() && bp.time == self.final_time))
            .collect();
        buf.pack_usize(kept.len());
        for bp in kept {
            buf.pack_f64(bp.time);
            buf.pack_bool(bp.is_pause());
        }

        for v in [
            self.alphas,
            self.alpha0,
            self.cj,
            self.ck,
            self.used_step,
            self.ek,
            self.ekm1,
            self.ekm2,
            self.ekp1,
            self.est,
            self.tk,
            self.tkm1,
            self.tkm2,
            self.tkp1,
        ] {
            buf.pack_f64(v);
        }
        for arr in [&self.alpha, &self.sigma, &self.gamma, &self.beta, &self.psi] {
            buf.pack_f64_slice(arr);
        }
        for n in [
            self.current_order,
            self.max_order,
            self.min_order,
            self.used_order,
            self.number_of_steps,
            self.nef,
            self.nscsco,
            self.new_order,
        ] {
            buf.pack_usize(n);
        }
        buf.pack_bool(self.initial_phase);
    }

    /// Restore a record written by [`pack`](Self::pack).
    ///
    /// Breakpoints already registered after the restored time are kept and the
    /// saved ones are merged in.
    pub fn unpack(&mut self, buf: &mut UnpackBuffer<'_>) -> Result<()> {
        let starting = buf.unpack_f64()?;
        self.starting_time_step = (starting > 0.0).then_some(starting);
        self.current_time_step = buf.unpack_f64()?;
        self.last_attempted_time_step = buf.unpack_f64()?;
        self.last_time_step = buf.unpack_f64()?;
        self.min_time_step = buf.unpack_f64()?;
        self.max_time_step = buf.unpack_f64()?;
        self.last_time = buf.unpack_f64()?;
        self.current_time = buf.unpack_f64()?;
        self.next_time = buf.unpack_f64()?;
        self.stop_time = buf.unpack_f64()?;
        self.initial_time = buf.unpack_f64()?;
        self.est_over_tol = buf.unpack_f64()?;
        self.newton_status = buf.unpack_f64()? as i32;
        self.successive_failures = buf.unpack_usize()?;
        self.step_attempt_status = buf.unpack_bool()?;
        self.step_number = buf.unpack_usize()?;
        self.beginning_integration = buf.unpack_bool()?;

        self.refresh_bp_tol();
        let existing: Vec<BreakPoint> = self
            .breakpoints
            .iter()
            .filter(|bp| bp.time > self.current_time)
            .copied()
            .collect();
        self.breakpoints.clear();
        self.pause_time = None;
        for bp in existing {
            self.set_break_point(bp);
        }
        let count = buf.unpack_usize()?;
        for _ in 0..count {
            let time = buf.unpack_f64()?;
            let bp = if buf.unpack_bool()? {
                BreakPoint::pause(time)
            } else {
                BreakPoint::simple(time)
            };
            if bp.time > self.current_time {
                self.set_break_point(bp);
            }
        }
        self.set_break_point(BreakPoint::pause(self.final_time));

        self.alphas = buf.unpack_f64()?;
        self.alpha0 = buf.unpack_f64()?;
        self.cj = buf.unpack_f64()?;
        self.ck = buf.unpack_f64()?;
        self.used_step = buf.unpack_f64()?;
        self.ek = buf.unpack_f64()?;
        self.ekm1 = buf.unpack_f64()?;
        self.ekm2 = buf.unpack_f64()?;
        self.ekp1 = buf.unpack_f64()?;
        self.est = buf.unpack_f64()?;
        self.tk = buf.unpack_f64()?;
        self.tkm1 = buf.unpack_f64()?;
        self.tkm2 = buf.unpack_f64()?;
        self.tkp1 = buf.unpack_f64()?;
        for arr in [
            &mut self.alpha,
            &mut self.sigma,
            &mut self.gamma,
            &mut self.beta,
            &mut self.psi,
        ] {
            let values = buf.unpack_f64_vec()?;
            if values.len() != arr.len() {
                return Err(Error::DimensionMismatch {
                    expected: arr.len(),
                    actual: values.len(),
                });
            }
            arr.copy_from_slice(&values);
        }
        self.current_order = buf.unpack_usize()?;
        self.max_order = buf.unpack_usize()?;
        self.min_order = buf.unpack_usize()?;
        self.used_order = buf.unpack_usize()?;
        self.number_of_steps = buf.unpack_usize()?;
        self.nef = buf.unpack_usize()?;
        self.nscsco = buf.unpack_usize()?;
        self.new_order = buf.unpack_usize()?;
        self.initial_phase = buf.unpack_bool()?;
        if self.max_order > MAX_BDF_ORDER || self.current_order > self.max_order {
            return Err(Error::InvalidState(format!(
                "restored order {} exceeds maximum {}",
                self.current_order, self.max_order
            )));
        }
        Ok(())
    }
}
