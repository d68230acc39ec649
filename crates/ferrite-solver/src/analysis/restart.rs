//! Restart records for a transient run.
//!
//! A record holds the step-error controller, the method history and the
//! accepted solution, state and store vectors. Restoring it into a run built
//! from the same circuit and parameters continues stepping exactly where
//! the dump was taken.

use ferrite_core::{PackBuffer, UnpackBuffer};
use log::info;

use super::AnalysisState;
use super::transient::Transient;
use crate::error::{Error, Result};
use crate::tia::IntegrationMethod;
use crate::tia::data_store::unpack_into;

/// Leading tag of every record.
const RESTART_MAGIC: u64 = 0x4652_5254_0001;

fn method_tag(method: IntegrationMethod) -> u64 {
    match method {
        IntegrationMethod::None => 0,
        IntegrationMethod::BackwardEuler => 1,
        IntegrationMethod::Bdf15 => 2,
        IntegrationMethod::Gear12 => 3,
    }
}

impl Transient {
    /// Serialize everything needed to continue this run.
    pub fn dump_restart_data(&self) -> Result<Vec<u8>> {
        let ctx = &self.ctx;
        match ctx.state {
            AnalysisState::TransientStepping | AnalysisState::Paused | AnalysisState::Finished => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "no restart data while {:?}",
                    other
                )));
            }
        }

        let mut buf = PackBuffer::new();
        buf.pack_u64(RESTART_MAGIC);
        buf.pack_u64(method_tag(ctx.method.method()));
        ctx.sec.pack(&mut buf);
        ctx.method.pack(&mut buf);
        let sol = &ctx.solutions;
        for v in [
            &sol.curr_solution,
            &sol.last_solution,
            &sol.curr_state,
            &sol.last_state,
            &sol.curr_store,
            &sol.last_store,
        ] {
            buf.pack_f64_slice(v.as_slice());
        }
        info!(
            "restart data at t = {:.6e}: {} bytes",
            ctx.sec.current_time,
            buf.len()
        );
        Ok(buf.into_bytes())
    }

    /// Continue from a record written by [`dump_restart_data`](Self::dump_restart_data).
    ///
    /// The DC operating point is skipped; the run resumes in
    /// [`AnalysisState::TransientStepping`] at the restored time.
    pub fn restore_restart_data(&mut self, bytes: &[u8]) -> Result<()> {
        let mut buf = UnpackBuffer::new(bytes);
        if buf.unpack_u64()? != RESTART_MAGIC {
            return Err(Error::InvalidParameter("not a restart record".into()));
        }
        let tag = buf.unpack_u64()?;
        let expected = self.ctx.params.method;
        if tag != method_tag(expected) {
            return Err(Error::InvalidParameter(format!(
                "restart record was written by a different integration method (tag {})",
                tag
            )));
        }

        let ctx = &mut self.ctx;
        ctx.switch_method(expected);
        ctx.sec.unpack(&mut buf)?;
        ctx.method.unpack(&mut buf)?;
        let sol = &mut ctx.solutions;
        for v in [
            &mut sol.curr_solution,
            &mut sol.last_solution,
            &mut sol.curr_state,
            &mut sol.last_state,
            &mut sol.curr_store,
            &mut sol.last_store,
        ] {
            unpack_into(&mut buf, v)?;
        }
        if buf.remaining() != 0 {
            return Err(Error::DimensionMismatch {
                expected: bytes.len() - buf.remaining(),
                actual: bytes.len(),
            });
        }

        sol.next_solution.copy_from(&sol.curr_solution);
        sol.next_state.copy_from(&sol.curr_state);
        sol.next_store.copy_from(&sol.curr_store);
        // Q and F at the restored point seed a restart at a breakpoint.
        let next_time = ctx.sec.next_time;
        ctx.sec.next_time = ctx.sec.current_time;
        let loaded = ctx.reload();
        ctx.sec.next_time = next_time;
        if !loaded {
            return Err(Error::InvalidState(
                "device load failed at the restored point".into(),
            ));
        }

        ctx.state = AnalysisState::TransientStepping;
        self.dc_solved = true;
        self.result.points.clear();
        let time = self.ctx.sec.current_time;
        self.result.push(time, &self.ctx.solutions.curr_solution);
        info!("restored transient state at t = {:.6e}", time);
        Ok(())
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

    fn rc(params: TiaParams) -> Transient {
        let specs = vec![
            DeviceSpec::new("V1", &["in", "0"], None)
                .with_waveform(Waveform::pulse(0.0, 1.0, 1e-4, 1e-5, 1e-5, 2e-4, 0.0)),
            DeviceSpec::new("R1", &["in", "out"], Some(1e3)),
            DeviceSpec::new("C1", &["out", "0"], Some(1e-7)),
        ];
        let assembler = Assembler::from_specs(&DeviceRegistry::with_builtins(), &specs).unwrap();
        let ctx = AnalysisContext::builder()
            .assembler(assembler)
            .nonlinear_solver(NonlinearSolver::new(ConvergenceCriteria::default()))
            .communicator(SerialComm)
            .params(params)
            .build()
            .unwrap();
        Transient::new(ctx).unwrap()
    }

    #[test]
    fn restored_run_matches_uninterrupted_run() {
        let params = TiaParams::for_tstop(1e-3).with_pause_time(2.5e-4);

        let mut first = rc(params.clone());
        let paused = first.run().unwrap();
        assert_eq!(paused.state, AnalysisState::Paused);
        let record = first.dump_restart_data().unwrap();

        first.resume_simulation(None).unwrap();
        let reference = first.run().unwrap();
        assert_eq!(reference.state, AnalysisState::Finished);

        let mut second = rc(params);
        second.restore_restart_data(&record).unwrap();
        assert_eq!(second.state(), AnalysisState::TransientStepping);
        let restored = second.run().unwrap();
        assert_eq!(restored.state, AnalysisState::Finished);

        // Same accepted points after the pause.
        let tail = &reference.points[paused.points.len()..];
        assert_eq!(restored.points.len(), tail.len() + 1);
        for (a, b) in tail.iter().zip(&restored.points[1..]) {
            assert_eq!(a.time, b.time);
            assert!((&a.solution - &b.solution).amax() < 1e-12);
        }
    }

    #[test]
    fn garbage_is_rejected() {
        let mut tran = rc(TiaParams::for_tstop(1e-3));
        assert!(tran.restore_restart_data(&[1, 2, 3]).is_err());
        let mut buf = PackBuffer::new();
        buf.pack_u64(7);
        assert!(matches!(
            tran.restore_restart_data(&buf.into_bytes()),
            Err(Error::InvalidParameter(_))
        ));
        assert!(tran.dump_restart_data().is_err());
    }
}
