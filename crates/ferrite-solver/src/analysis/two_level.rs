//! Driving a transient run from an enclosing solver.
//!
//! The outer solver owns the clock. It starts the inner run with
//! [`Transient::startup_solvers`], commits the operating point with
//! [`Transient::complete_op_start_step`], then for every outer step hands
//! over a [`TimeIntInfo`], asks for a provisional step, gathers the inner
//! error sums, and finally accepts or rejects the step.

use log::{debug, info};

use super::{AnalysisState, TransientResult};
use super::transient::Transient;
use crate::error::{Error, Result};
use crate::tia::{TimeIntInfo, TwoLevelError};

impl Transient {
    fn require_state(&self, expected: AnalysisState, op: &str) -> Result<()> {
        if self.state() == expected {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{} needs {:?}, run is {:?}",
                op,
                expected,
                self.state()
            )))
        }
    }

    /// Solve the DC operating point without committing to time stepping.
    pub fn startup_solvers(&mut self) -> Result<()> {
        self.require_state(AnalysisState::DcOp, "startup_solvers")?;
        self.solve_operating_point()
    }

    /// Commit the operating point and switch to the BDF method.
    pub fn complete_op_start_step(&mut self) -> Result<()> {
        self.require_state(AnalysisState::DcOp, "complete_op_start_step")?;
        if !self.dc_solved {
            return Err(Error::InvalidState(
                "operating point has not been solved".into(),
            ));
        }
        self.begin_transient();
        Ok(())
    }

    /// Keep the latest operating-point iterate as the start of the next
    /// homotopy step.
    pub fn homotopy_step_success(&mut self) {
        let ctx = &mut self.ctx;
        ctx.solutions.set_constant_history();
        let params = ctx.load_params();
        ctx.assembler.accept_step(&params, &ctx.solutions);
        debug!("homotopy step accepted");
    }

    /// Discard the latest iterate and restart from the last accepted one.
    pub fn homotopy_step_failure(&mut self) {
        self.ctx.solutions.use_previous_as_predictor();
        self.ctx.assembler.step_failure();
        debug!("homotopy step rejected");
    }

    /// Adopt the outer solver's step size, order and time.
    ///
    /// When the outer solver is (re)starting integration the history is
    /// reseeded from the current point with the step it chose.
    pub fn start_time_step(&mut self, info: &TimeIntInfo) -> Result<()> {
        self.require_state(AnalysisState::TransientStepping, "start_time_step")?;
        let ctx = &mut self.ctx;
        ctx.sec.update_two_level_time_info(info, ctx.comm.as_ref());
        ctx.sec.beginning_integration = info.beginning_integration;
        if info.beginning_integration {
            ctx.method.set_two_level_time_info(
                &mut ctx.sec,
                &ctx.solutions,
                ctx.assembler.q(),
                ctx.assembler.f(),
            );
        }
        debug!(
            "two-level step to t = {:.6e}, h = {:.3e}, order {}",
            ctx.sec.next_time, ctx.sec.current_time_step, ctx.sec.current_order
        );
        Ok(())
    }

    /// Attempt the step set by [`start_time_step`](Self::start_time_step)
    /// without committing it.
    ///
    /// A positive `max_step` caps the step. Returns whether Newton converged
    /// and the local error test passed, and the step actually attempted.
    pub fn provisional_step(&mut self, max_step: f64) -> Result<(bool, f64)> {
        self.require_state(AnalysisState::TransientStepping, "provisional_step")?;
        let sec = &mut self.ctx.sec;
        if max_step > 0.0 && sec.current_time_step > max_step {
            sec.set_time_step(max_step);
        }
        self.attempt_step();
        let sec = &self.ctx.sec;
        Ok((sec.step_attempt_status, sec.current_time_step))
    }

    /// Commit the provisional step.
    pub fn accept_provisional_step(&mut self) -> Result<()> {
        self.require_state(AnalysisState::TransientStepping, "accept_provisional_step")?;
        self.ctx.sec.step_attempt_status = true;
        self.process_successful_step();
        Ok(())
    }

    /// Roll back the provisional step so the outer solver can retry it.
    pub fn reject_provisional_step(&mut self) -> Result<()> {
        self.require_state(AnalysisState::TransientStepping, "reject_provisional_step")?;
        let ctx = &mut self.ctx;
        ctx.assembler.step_failure();
        ctx.method.reject_step_for_two_level(&mut ctx.sec);
        ctx.sec.previous_call_step_successful = false;
        ctx.sec.step_attempt_status = false;
        self.result.stats.failed_steps += 1;
        Ok(())
    }

    /// End the run and return everything recorded so far.
    pub fn finish_solvers(&mut self) -> TransientResult {
        if self.state() != AnalysisState::Failed {
            self.ctx.state = AnalysisState::Finished;
        }
        info!(
            "two-level run finished at t = {:.6e} after {} steps",
            self.ctx.sec.current_time, self.result.stats.successful_steps
        );
        let mut result = self.result.clone();
        result.state = self.ctx.state;
        result
    }

    /// Partial sum of the restart Q norm over the inner unknowns.
    pub fn get_initial_q_norm(&self) -> TwoLevelError {
        self.ctx.method.initial_q_norm()
    }

    /// Partial error sums of the last provisional step.
    pub fn get_inner_loop_error_sums(&self) -> TwoLevelError {
        self.ctx.method.two_level_error(&self.ctx.sec)
    }

    /// Step information the outer solver can use to set up its next step.
    pub fn time_int_info(&self) -> TimeIntInfo {
        self.ctx.sec.time_int_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisContext;
    use crate::assembler::Assembler;
    use crate::newton::{ConvergenceCriteria, NonlinearSolver};
    use crate::tia::TiaParams;
    use ferrite_core::SerialComm;
    use ferrite_devices::{DeviceRegistry, DeviceSpec, Waveform};

    fn rc() -> Transient {
        let specs = vec![
            DeviceSpec::new("V1", &["in", "0"], None).with_waveform(Waveform::sin(0.0, 1.0, 100.0)),
            DeviceSpec::new("R1", &["in", "out"], Some(1e3)),
            DeviceSpec::new("C1", &["out", "0"], Some(1e-6)),
        ];
        let assembler = Assembler::from_specs(&DeviceRegistry::with_builtins(), &specs).unwrap();
        let ctx = AnalysisContext::builder()
            .assembler(assembler)
            .nonlinear_solver(NonlinearSolver::new(ConvergenceCriteria::default()))
            .communicator(SerialComm)
            .params(TiaParams::for_tstop(1e-3))
            .build()
            .unwrap();
        Transient::new(ctx).unwrap()
    }

    #[test]
    fn calls_out_of_order_are_rejected() {
        let mut tran = rc();
        assert!(matches!(
            tran.complete_op_start_step(),
            Err(Error::InvalidState(_))
        ));
        assert!(tran.provisional_step(0.0).is_err());
        tran.startup_solvers().unwrap();
        tran.complete_op_start_step().unwrap();
        assert_eq!(tran.state(), AnalysisState::TransientStepping);
        assert!(tran.startup_solvers().is_err());
    }

    #[test]
    fn outer_solver_drives_fixed_steps() {
        let mut tran = rc();
        tran.startup_solvers().unwrap();
        tran.complete_op_start_step().unwrap();

        let h = 1e-5;
        let mut t = 0.0;
        for k in 0..10 {
            let info = TimeIntInfo {
                next_time_step: h,
                next_time: t + h,
                curr_time_step: h,
                current_time: t,
                current_order: 1,
                beginning_integration: k == 0,
            };
            tran.start_time_step(&info).unwrap();
            let (ok, step) = tran.provisional_step(0.0).unwrap();
            assert!(ok, "step {} failed", k);
            assert_eq!(step, h);

            let sums = tran.get_inner_loop_error_sums();
            assert_eq!(sums.inner_size, 3.0);
            assert!(sums.x_error_sum.is_finite());

            tran.accept_provisional_step().unwrap();
            t += h;
            assert!((tran.time_int_info().current_time - t).abs() < 1e-18);
        }

        let result = tran.finish_solvers();
        assert_eq!(result.state, AnalysisState::Finished);
        assert_eq!(result.points.len(), 11);
        // the source node is algebraic; the capacitor lags behind it
        let (vin, vout) = (result.index_of("in").unwrap(), result.index_of("out").unwrap());
        let last = &result.points.last().unwrap().solution;
        let expected = (2.0 * std::f64::consts::PI * 100.0 * 1e-4).sin();
        assert!((last[vin] - expected).abs() < 1e-9);
        assert!(last[vout] > 0.0 && last[vout] < last[vin]);
    }

    #[test]
    fn rejected_provisional_step_can_be_retried() {
        let mut tran = rc();
        tran.startup_solvers().unwrap();
        tran.complete_op_start_step().unwrap();

        let info = TimeIntInfo {
            next_time_step: 1e-5,
            next_time: 1e-5,
            curr_time_step: 1e-5,
            current_time: 0.0,
            current_order: 1,
            beginning_integration: true,
        };
        tran.start_time_step(&info).unwrap();
        tran.provisional_step(0.0).unwrap();
        tran.reject_provisional_step().unwrap();
        assert_eq!(tran.result().stats.failed_steps, 1);

        let (ok, step) = tran.provisional_step(0.0).unwrap();
        assert!(ok);
        assert_eq!(step, 1e-5);
        tran.accept_provisional_step().unwrap();
        assert_eq!(tran.time_int_info().current_time, 1e-5);
    }
}
