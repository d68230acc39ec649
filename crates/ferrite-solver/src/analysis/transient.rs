//! The transient control loop.
//!
//! A run solves the DC operating point, switches to the configured BDF
//! method and then repeats one step attempt at a time:
//!
//! 1. move the stop time to the next breakpoint;
//! 2. restart the method from the accepted point if a breakpoint was just hit;
//! 3. update coefficients, predict, and run Newton on the corrector;
//! 4. test the local error and accept or reject the attempt.
//!
//! The loop ends in [`AnalysisState::Finished`], stops in
//! [`AnalysisState::Paused`] at a pause breakpoint, or fails with
//! [`Error::TimeStepTooSmall`] / [`Error::TooManyFailures`].

use ferrite_core::BreakPoint;
use log::{debug, error, info, warn};

use super::result::TransientResult;
use super::{AnalysisContext, AnalysisState};
use crate::error::{Error, Result};
use crate::newton::ConvergenceStatus;

/// Newton codes eligible for stalled-step acceptance.
const STALL_CODES: [i32; 2] = [-3, -2];

/// Accepting a stalled Newton is only allowed this close to the minimum step.
const STALL_STEP_FACTOR: f64 = 4.0;

/// A transient run over an [`AnalysisContext`].
#[derive(Debug)]
pub struct Transient {
    pub(super) ctx: AnalysisContext,
    pub(super) result: TransientResult,
    pub(super) dc_solved: bool,
}

impl Transient {
    /// Check the time-integration parameters and prepare an empty result.
    pub fn new(ctx: AnalysisContext) -> Result<Self> {
        ctx.params.validate()?;
        let names = ctx.var_names();
        Ok(Self {
            ctx,
            result: TransientResult::new(names),
            dc_solved: false,
        })
    }

    pub fn state(&self) -> AnalysisState {
        self.ctx.state
    }

    pub fn result(&self) -> &TransientResult {
        &self.result
    }

    pub fn context(&self) -> &AnalysisContext {
        &self.ctx
    }

    pub fn into_result(self) -> TransientResult {
        self.result
    }

    /// True once the final time is reached or an exit condition fired.
    pub fn simulation_complete(&self) -> bool {
        self.ctx.state == AnalysisState::Finished || self.ctx.sec.finished()
    }

    /// Run until the final time, a pause breakpoint or a fatal failure.
    ///
    /// The first call solves the DC operating point. Later calls continue a
    /// run that [`resume_simulation`](Self::resume_simulation) released.
    pub fn run(&mut self) -> Result<TransientResult> {
        match self.ctx.state {
            AnalysisState::DcOp => self.initial_point()?,
            AnalysisState::TransientStepping => {}
            AnalysisState::Paused | AnalysisState::Finished => return Ok(self.snapshot()),
            AnalysisState::Failed => {
                return Err(Error::InvalidState("transient run already failed".into()));
            }
        }

        while self.ctx.state == AnalysisState::TransientStepping {
            if self.ctx.sec.finished() {
                self.ctx.state = AnalysisState::Finished;
                break;
            }
            if let Err(e) = self.take_step() {
                self.ctx.state = AnalysisState::Failed;
                self.result.state = AnalysisState::Failed;
                error!("transient failed at t = {:.6e}: {}", self.ctx.sec.current_time, e);
                return Err(e);
            }
        }

        let stats = &self.result.stats;
        info!(
            "transient {:?} at t = {:.6e}: {} steps accepted, {} rejected, {} Newton iterations",
            self.ctx.state,
            self.ctx.sec.current_time,
            stats.successful_steps,
            stats.failed_steps,
            stats.newton_iterations
        );
        Ok(self.snapshot())
    }

    /// Continue a paused run, optionally stopping again at `pause_time`.
    pub fn resume_simulation(&mut self, pause_time: Option<f64>) -> Result<()> {
        if self.ctx.state != AnalysisState::Paused {
            return Err(Error::InvalidState(format!(
                "cannot resume from {:?}",
                self.ctx.state
            )));
        }
        if let Some(t) = pause_time {
            let sec = &mut self.ctx.sec;
            if t <= sec.current_time || t > sec.final_time {
                return Err(Error::InvalidParameter(format!(
                    "pause time {} outside ({}, {}]",
                    t, sec.current_time, sec.final_time
                )));
            }
            sec.set_break_point(BreakPoint::pause(t));
        }
        info!("resuming transient at t = {:.6e}", self.ctx.sec.current_time);
        self.ctx.state = AnalysisState::TransientStepping;
        Ok(())
    }

    fn snapshot(&self) -> TransientResult {
        let mut result = self.result.clone();
        result.state = self.ctx.state;
        result
    }

    /// DC operating point, then hand the point to the BDF method as history.
    fn initial_point(&mut self) -> Result<()> {
        info!("transient: solving DC operating point");
        self.solve_operating_point()?;
        self.begin_transient();
        Ok(())
    }

    pub(super) fn solve_operating_point(&mut self) -> Result<()> {
        self.ctx.dc_operating_point()?;
        self.result.stats.newton_iterations += self.ctx.solver.stats().iterations;
        self.dc_solved = true;
        Ok(())
    }

    /// Record the operating point and switch to the configured BDF method.
    pub(super) fn begin_transient(&mut self) {
        let ctx = &mut self.ctx;
        self.result
            .push(ctx.sec.current_time, &ctx.solutions.curr_solution);

        ctx.switch_method(ctx.params.method);
        ctx.refresh_error_weights();
        let device_bps = ctx
            .assembler
            .breakpoints(ctx.sec.initial_time, ctx.sec.final_time);
        ctx.sec.update_breakpoints(&device_bps);
        ctx.sec.beginning_integration = true;
        ctx.sec.step_attempt_status = true;
        ctx.sec.step_number = 0;
        ctx.state = AnalysisState::TransientStepping;
        info!(
            "transient: {:?} from {:.6e} to {:.6e}",
            ctx.params.method, ctx.sec.initial_time, ctx.sec.final_time
        );
    }

    /// One step attempt: predict, correct, test, then accept or reject.
    fn take_step(&mut self) -> Result<()> {
        let ctx = &mut self.ctx;
        ctx.sec.update_stop_time(ctx.comm.as_ref());

        if ctx.sec.beginning_integration && ctx.sec.step_attempt_status {
            ctx.sec.update_max_time_step(ctx.comm.as_ref());
            ctx.method.initialize(
                &mut ctx.sec,
                &ctx.solutions,
                ctx.assembler.q(),
                ctx.assembler.f(),
            );
        } else {
            let h = ctx.sec.current_time_step;
            ctx.sec.set_time_step(h);
        }

        let stall_eligible = self.attempt_step();
        let sec = &mut self.ctx.sec;
        if sec.step_attempt_status {
            self.process_successful_step();
            Ok(())
        } else if stall_eligible {
            warn!(
                "accepting step at t = {:.6e} with stalled Newton (status {}), h = {:.3e}",
                sec.next_time, sec.newton_status, sec.current_time_step
            );
            sec.step_attempt_status = true;
            self.process_successful_step();
            Ok(())
        } else {
            self.process_failed_step()
        }
    }

    /// Coefficients, predictor, Newton and the local error test at the
    /// current step size.
    ///
    /// Returns whether a failed attempt may still be accepted as a stalled
    /// Newton solve.
    pub(super) fn attempt_step(&mut self) -> bool {
        let ctx = &mut self.ctx;
        ctx.method.update_coeffs(&mut ctx.sec);
        ctx.method.obtain_predictor(&ctx.sec, &mut ctx.solutions);
        ctx.method.obtain_predictor_deriv(&ctx.sec);

        let status = ctx.nonlinear_solve();
        let iterations = ctx.solver.stats().iterations;
        self.result.stats.newton_iterations += iterations;
        ctx.sec.newton_status = status.code();
        ctx.sec.newton_iterations = iterations;

        let mut stall_eligible = ctx.params.pass_nl_stall
            && STALL_CODES.contains(&status.code())
            && ctx.sec.current_time_step < STALL_STEP_FACTOR * ctx.sec.min_time_step;

        if status.is_converged() || stall_eligible {
            if ctx.reload() {
                ctx.method
                    .data_store_mut()
                    .step_linear_combo(&ctx.solutions, ctx.assembler.q());
            } else {
                ctx.sec.newton_status = ConvergenceStatus::LoadFailed.code();
                stall_eligible = false;
            }
        }

        let method = ctx.method.as_ref();
        ctx.sec.evaluate_step_error(|sec| method.error_estimate(sec));
        stall_eligible
    }

    pub(super) fn process_successful_step(&mut self) {
        let ctx = &mut self.ctx;
        let params = ctx.load_params();
        ctx.assembler.accept_step(&params, &ctx.solutions);
        ctx.sec.previous_call_step_successful = true;

        ctx.sec.update_max_time_step(ctx.comm.as_ref());
        ctx.sec.update_min_time_step();
        let device_bps = ctx
            .assembler
            .breakpoints(ctx.sec.current_time, ctx.sec.final_time);
        ctx.sec.update_breakpoints(&device_bps);

        ctx.method.complete_step(&mut ctx.sec);
        ctx.sec.step_number += 1;
        ctx.sec.successive_failures = ctx.sec.successive_failures.saturating_sub(1);

        let sec = &mut ctx.sec;
        sec.beginning_integration = ctx.params.bp_enable
            && (sec.current_time - sec.stop_time).abs() <= sec.bp_tol
            && (sec.current_time - sec.final_time).abs() > sec.bp_tol;

        self.result.stats.record_step(sec.used_step);
        self.result
            .push(sec.current_time, &ctx.solutions.next_solution);
        debug!(
            "accepted t = {:.6e}, h = {:.3e}, order {}",
            sec.current_time, sec.used_step, sec.used_order
        );

        ctx.solutions.rotate();
        ctx.refresh_error_weights();

        if ctx.sec.is_pause_time() {
            ctx.sec.simulation_paused();
            ctx.state = AnalysisState::Paused;
            info!("transient paused at t = {:.6e}", ctx.sec.current_time);
        } else if self.exit_reached() {
            self.ctx.state = AnalysisState::Finished;
            info!("transient exit condition met at t = {:.6e}", self.ctx.sec.current_time);
        }
    }

    fn exit_reached(&self) -> bool {
        let sec = &self.ctx.sec;
        let params = &self.ctx.params;
        params.exit_time.is_some_and(|t| sec.current_time >= t)
            || params.exit_step.is_some_and(|n| sec.step_number >= n)
    }

    fn process_failed_step(&mut self) -> Result<()> {
        let ctx = &mut self.ctx;
        ctx.assembler.step_failure();
        let attempted = ctx.sec.current_time_step;
        ctx.method.reject_step(&mut ctx.sec);
        ctx.sec.previous_call_step_successful = false;
        ctx.sec.successive_failures += 1;
        self.result.stats.failed_steps += 1;
        debug!(
            "rejected step at t = {:.6e} (h = {:.3e}, Newton {}), retry with h = {:.3e}",
            ctx.sec.current_time, attempted, ctx.sec.newton_status, ctx.sec.current_time_step
        );

        if attempted <= ctx.sec.min_time_step {
            return Err(Error::TimeStepTooSmall {
                time: ctx.sec.current_time,
                step: attempted,
                min: ctx.sec.min_time_step,
            });
        }
        if ctx.sec.successive_failures >= ctx.params.max_successive_failures {
            return Err(Error::TooManyFailures {
                count: ctx.sec.successive_failures,
                time: ctx.sec.current_time,
            });
        }
        Ok(())
    }
}
