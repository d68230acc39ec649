//! DC sweep: one operating point per combination of swept parameters.
//!
//! Each point starts Newton from the previous converged solution. When an
//! inner parameter wraps back to its first value the guess restarts from
//! zero, since the previous point is then far away in parameter space.

use log::{debug, info, warn};
use nalgebra::DVector;
use serde::Serialize;

use super::sweep::{SweepLoop, SweepParam};
use super::{AnalysisContext, AnalysisState};
use crate::error::{Error, Result};

/// One converged point of a DC sweep.
#[derive(Debug, Clone)]
pub struct DcSweepPoint {
    pub index: usize,
    /// Swept parameter values at this point.
    pub values: Vec<(String, f64)>,
    pub solution: DVector<f64>,
    pub newton_iterations: usize,
}

/// A failed point: the parameter values and the Newton status code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DcSweepFailure {
    pub index: usize,
    pub values: Vec<(String, f64)>,
    pub status: i32,
}

#[derive(Debug, Clone)]
pub struct DcSweepResult {
    /// Unknown names, indexed like the solution vectors.
    pub names: Vec<String>,
    pub points: Vec<DcSweepPoint>,
    pub failures: Vec<DcSweepFailure>,
    /// `Finished` when every point converged, otherwise `Failed`.
    pub state: AnalysisState,
}

impl DcSweepResult {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// `(value of the first swept parameter, unknown)` pairs.
    pub fn curve(&self, index: usize) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .filter_map(|p| p.values.first().map(|&(_, v)| (v, p.solution[index])))
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub struct DcSweep {
    ctx: AnalysisContext,
    sweep: SweepLoop,
}

impl DcSweep {
    pub fn new(ctx: AnalysisContext, params: Vec<SweepParam>) -> Result<Self> {
        let sweep = SweepLoop::new(params)?;
        if sweep.is_empty() {
            return Err(Error::InvalidParameter("DC sweep needs at least one parameter".into()));
        }
        Ok(Self { ctx, sweep })
    }

    pub fn len(&self) -> usize {
        self.sweep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweep.is_empty()
    }

    pub fn context(&self) -> &AnalysisContext {
        &self.ctx
    }

    /// Solve every point. Non-converged points are recorded and skipped;
    /// only a bad parameter name aborts the sweep.
    pub fn run(&mut self) -> Result<DcSweepResult> {
        let mut result = DcSweepResult {
            names: self.ctx.var_names(),
            points: Vec::with_capacity(self.sweep.len()),
            failures: Vec::new(),
            state: AnalysisState::DcOp,
        };
        info!("DC sweep over {} points", self.sweep.len());

        for index in 0..self.sweep.len() {
            let point = self.sweep.apply(index, &mut self.ctx.assembler)?;
            if point.reset {
                debug!("sweep point {} restarts from a zero guess", index);
                self.ctx.solutions = self.ctx.assembler.new_solution_set();
            }

            match self.ctx.dc_operating_point() {
                Ok(_) => {
                    result.points.push(DcSweepPoint {
                        index,
                        values: point.values,
                        solution: self.ctx.solutions.curr_solution.clone(),
                        newton_iterations: self.ctx.solver.stats().iterations,
                    });
                }
                Err(Error::DcOpFailed { status }) => {
                    warn!("DC sweep point {} {:?} did not converge", index, point.values);
                    let restart = self.ctx.solutions.curr_solution.clone();
                    self.ctx.solutions.next_solution.copy_from(&restart);
                    result.failures.push(DcSweepFailure {
                        index,
                        values: point.values,
                        status,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        result.state = if result.succeeded() {
            AnalysisState::Finished
        } else {
            AnalysisState::Failed
        };
        self.ctx.set_state(result.state);
        info!(
            "DC sweep done: {} converged, {} failed",
            result.points.len(),
            result.failures.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Assembler;
    use crate::newton::{ConvergenceCriteria, NonlinearSolver};
    use ferrite_core::SerialComm;
    use ferrite_devices::{DeviceRegistry, DeviceSpec};

    fn divider_ctx() -> AnalysisContext {
        let specs = vec![
            DeviceSpec::new("V1", &["in", "0"], Some(1.0)),
            DeviceSpec::new("R1", &["in", "out"], Some(1e3)),
            DeviceSpec::new("R2", &["out", "0"], Some(1e3)),
        ];
        AnalysisContext::builder()
            .assembler(Assembler::from_specs(&DeviceRegistry::with_builtins(), &specs).unwrap())
            .nonlinear_solver(NonlinearSolver::new(ConvergenceCriteria::default()))
            .communicator(SerialComm)
            .build()
            .unwrap()
    }

    #[test]
    fn divider_output_follows_the_source() {
        let mut sweep =
            DcSweep::new(divider_ctx(), vec![SweepParam::lin("V1", 0.0, 2.0, 0.5)]).unwrap();
        assert_eq!(sweep.len(), 5);
        let result = sweep.run().unwrap();
        assert_eq!(result.state, AnalysisState::Finished);

        let out = result.index_of("out").unwrap();
        let curve = result.curve(out);
        assert_eq!(curve.len(), 5);
        for (v, vout) in curve {
            assert!((vout - v / 2.0).abs() < 1e-9, "V1 = {}: out = {}", v, vout);
        }
        assert_eq!(sweep.context().state(), AnalysisState::Finished);
    }

    #[test]
    fn nested_resistor_list() {
        let params = vec![
            SweepParam::list("V1", vec![1.0, 3.0]),
            SweepParam::list("R2:R", vec![1e3, 3e3]),
        ];
        let result = DcSweep::new(divider_ctx(), params).unwrap().run().unwrap();
        let out = result.index_of("out").unwrap();
        let got: Vec<f64> = result.points.iter().map(|p| p.solution[out]).collect();
        let want = [0.5, 1.5, 0.75, 2.25];
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < 1e-9, "{:?}", got);
        }
        assert_eq!(result.points[2].values[1], ("R2:R".to_string(), 3e3));
    }

    #[test]
    fn unknown_device_aborts() {
        let mut sweep =
            DcSweep::new(divider_ctx(), vec![SweepParam::list("V9", vec![1.0])]).unwrap();
        assert!(matches!(sweep.run(), Err(Error::InvalidParameter(_))));
        assert!(DcSweep::new(divider_ctx(), Vec::new()).is_err());
    }
}
