//! `.STEP` reruns: the whole analysis once per swept parameter value.
//!
//! Every step gets a fresh [`AnalysisContext`] from the caller's factory, so
//! solution history, step control and device state never leak between
//! steps. The swept values are written into the new context's devices
//! before the analysis runs.

use log::{info, warn};

use super::AnalysisContext;
use super::sweep::{SweepLoop, SweepParam};
use crate::error::{Error, Result};

/// Outcome of one step.
#[derive(Debug)]
pub struct StepOutcome<T> {
    pub index: usize,
    pub values: Vec<(String, f64)>,
    pub result: Result<T>,
}

#[derive(Debug, Clone)]
pub struct StepSweep {
    sweep: SweepLoop,
}

impl StepSweep {
    pub fn new(params: Vec<SweepParam>) -> Result<Self> {
        let sweep = SweepLoop::new(params)?;
        if sweep.is_empty() {
            return Err(Error::InvalidParameter("step sweep needs at least one parameter".into()));
        }
        Ok(Self { sweep })
    }

    pub fn len(&self) -> usize {
        self.sweep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweep.is_empty()
    }

    /// Run `analysis` once per step on a context from `build`.
    ///
    /// A failing analysis is kept in its step's outcome and the sweep moves
    /// on. Errors from `build` or from setting a parameter abort.
    pub fn run<T>(
        &self,
        mut build: impl FnMut() -> Result<AnalysisContext>,
        mut analysis: impl FnMut(AnalysisContext) -> Result<T>,
    ) -> Result<Vec<StepOutcome<T>>> {
        let mut outcomes = Vec::with_capacity(self.sweep.len());
        for index in 0..self.sweep.len() {
            let mut ctx = build()?;
            let point = self.sweep.apply(index, &mut ctx.assembler)?;
            info!("step {} of {}: {:?}", index + 1, self.sweep.len(), point.values);

            let result = analysis(ctx);
            if let Err(e) = &result {
                warn!("step {} failed: {}", index + 1, e);
            }
            outcomes.push(StepOutcome {
                index,
                values: point.values,
                result,
            });
        }
        Ok(outcomes)
    }
}

/// True when every step's analysis succeeded.
pub fn all_succeeded<T>(outcomes: &[StepOutcome<T>]) -> bool {
    outcomes.iter().all(|o| o.result.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Assembler;
    use crate::newton::{ConvergenceCriteria, NonlinearSolver};
    use ferrite_core::SerialComm;
    use ferrite_devices::{DeviceRegistry, DeviceSpec};

    fn divider_ctx() -> Result<AnalysisContext> {
        let specs = vec![
            DeviceSpec::new("V1", &["in", "0"], Some(2.0)),
            DeviceSpec::new("R1", &["in", "out"], Some(1e3)),
            DeviceSpec::new("R2", &["out", "0"], Some(1e3)),
        ];
        AnalysisContext::builder()
            .assembler(Assembler::from_specs(&DeviceRegistry::with_builtins(), &specs)?)
            .nonlinear_solver(NonlinearSolver::new(ConvergenceCriteria::default()))
            .communicator(SerialComm)
            .build()
    }

    fn output_voltage(mut ctx: AnalysisContext) -> Result<f64> {
        ctx.dc_operating_point()?;
        let out = ctx.assembler().topology().lookup("out").unwrap().index();
        Ok(ctx.solutions().curr_solution[out])
    }

    #[test]
    fn each_step_sees_its_own_resistor() {
        let steps = StepSweep::new(vec![SweepParam::list("R2", vec![1e3, 3e3, 9e3])]).unwrap();
        let outcomes = steps.run(divider_ctx, output_voltage).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(all_succeeded(&outcomes));

        let want = [1.0, 1.5, 1.8];
        for (o, w) in outcomes.iter().zip(want) {
            let v = *o.result.as_ref().unwrap();
            assert!((v - w).abs() < 1e-9, "step {}: {}", o.index, v);
        }
    }

    #[test]
    fn a_failed_step_does_not_stop_the_rest() {
        let steps = StepSweep::new(vec![SweepParam::list("R2", vec![1e3, 2e3])]).unwrap();
        let mut calls = 0;
        let outcomes = steps
            .run(divider_ctx, |ctx| {
                calls += 1;
                if calls == 1 {
                    Err(Error::InvalidState("forced".into()))
                } else {
                    output_voltage(ctx)
                }
            })
            .unwrap();
        assert!(outcomes[0].result.is_err());
        assert!(outcomes[1].result.is_ok());
        assert!(!all_succeeded(&outcomes));
    }

    #[test]
    fn bad_parameter_aborts() {
        let steps = StepSweep::new(vec![SweepParam::list("R2:W", vec![1.0])]).unwrap();
        assert!(matches!(steps.run(divider_ctx, output_voltage), Err(Error::Device(_))));
    }
}
