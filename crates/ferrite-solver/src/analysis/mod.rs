//! Analysis control: DC operating point, transient stepping and the
//! two-level interface used by an enclosing solver.
//!
//! An [`AnalysisContext`] owns every collaborator a run needs (the
//! assembler, the Newton driver, the communicator), together with the
//! solution vectors, the step-error controller and the active integration
//! method. Nothing is global; analyses borrow the context mutably.
//!
//! # Module Structure
//!
//! - [`transient`] - the DC-then-transient control loop, pause and resume
//! - [`two_level`] - step-by-step driving from an outer solver
//! - [`dc_sweep`] - DC operating points over swept device parameters
//! - [`step`] - reruns of a whole analysis per parameter value
//! - [`sweep`] - LIN, DEC, OCT and LIST parameter loops
//! - [`restart`] - dump and restore of the integrator state
//! - [`result`] - waveforms and run statistics

pub mod dc_sweep;
pub mod restart;
pub mod result;
pub mod step;
pub mod sweep;
pub mod transient;
pub mod two_level;

use std::fmt;

use ferrite_core::{Communicator, DaeMatrix, SolutionSet, VarId};
use log::{debug, error, info};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::assembler::{Assembler, LoadParams};
use crate::error::{Error, Result};
use crate::newton::{ConvergenceStatus, NewtonStats, NonlinearProblem, NonlinearSolver};
use crate::tia::{IntegrationMethod, StepErrorControl, TiaParams, TimeIntegrationMethod, create_time_integ_method};

pub use dc_sweep::{DcSweep, DcSweepFailure, DcSweepPoint, DcSweepResult};
pub use result::{TimePoint, TransientResult, TransientStats};
pub use step::{StepOutcome, StepSweep};
pub use sweep::{SweepLoop, SweepParam, SweepPoint, SweepValues};
pub use transient::Transient;

/// Where a run is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisState {
    DcOp,
    TransientStepping,
    Paused,
    Finished,
    Failed,
}

/// Scratch the Newton problem writes into; allocated once per context.
#[derive(Debug)]
struct NewtonScratch {
    residual: DVector<f64>,
    jacobian: DaeMatrix,
}

/// Everything one analysis run owns.
pub struct AnalysisContext {
    assembler: Assembler,
    solver: NonlinearSolver,
    comm: Box<dyn Communicator>,
    params: TiaParams,
    solutions: SolutionSet,
    sec: StepErrorControl,
    method: Box<dyn TimeIntegrationMethod>,
    scratch: NewtonScratch,
    state: AnalysisState,
}

impl fmt::Debug for AnalysisContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisContext")
            .field("unknowns", &self.assembler.num_unknowns())
            .field("method", &self.method.method())
            .field("state", &self.state)
            .field("time", &self.sec.current_time)
            .finish_non_exhaustive()
    }
}

/// Collects collaborators for an [`AnalysisContext`].
///
/// ```ignore
/// let ctx = AnalysisContext::builder()
///     .assembler(assembler)
///     .nonlinear_solver(NonlinearSolver::new(ConvergenceCriteria::default()))
///     .communicator(SerialComm)
///     .params(TiaParams::for_tstop(1e-3))
///     .build()?;
/// ```
#[derive(Default)]
pub struct AnalysisContextBuilder {
    assembler: Option<Assembler>,
    solver: Option<NonlinearSolver>,
    comm: Option<Box<dyn Communicator>>,
    params: TiaParams,
}

impl AnalysisContextBuilder {
    pub fn assembler(mut self, assembler: Assembler) -> Self {
        self.assembler = Some(assembler);
        self
    }

    pub fn nonlinear_solver(mut self, solver: NonlinearSolver) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn communicator(mut self, comm: impl Communicator + 'static) -> Self {
        self.comm = Some(Box::new(comm));
        self
    }

    pub fn params(mut self, params: TiaParams) -> Self {
        self.params = params;
        self
    }

    /// Wire the collaborators together, assembler first.
    pub fn build(self) -> Result<AnalysisContext> {
        let assembler = self.assembler.ok_or(Error::MissingCollaborator("assembler"))?;
        let solver = self.solver.ok_or(Error::MissingCollaborator("nonlinear solver"))?;
        let comm = self.comm.ok_or(Error::MissingCollaborator("communicator"))?;

        let solutions = assembler.new_solution_set();
        let sec = StepErrorControl::new(&self.params);
        let method = create_time_integ_method(IntegrationMethod::None, &solutions, &self.params);
        let scratch = NewtonScratch {
            residual: DVector::zeros(assembler.num_unknowns()),
            jacobian: DaeMatrix::new(assembler.pattern().clone()),
        };
        Ok(AnalysisContext {
            assembler,
            solver,
            comm,
            params: self.params,
            solutions,
            sec,
            method,
            scratch,
            state: AnalysisState::DcOp,
        })
    }
}

/// The corrector equation of the active method as a [`NonlinearProblem`].
///
/// Each load writes the iterate into `next_solution`, assembles the DAE
/// vectors and matrices, and forms `r = qpn0 + cj (Q - qn0) + F` and
/// `J = cj dQ/dx + dF/dx`.
struct DaeProblem<'a> {
    assembler: &'a mut Assembler,
    solutions: &'a mut SolutionSet,
    method: &'a dyn TimeIntegrationMethod,
    sec: &'a StepErrorControl,
    params: LoadParams,
    residual: &'a mut DVector<f64>,
    jacobian: &'a mut DaeMatrix,
}

impl NonlinearProblem for DaeProblem<'_> {
    fn size(&self) -> usize {
        self.residual.len()
    }

    fn load(&mut self, x: &DVector<f64>, iteration: u64) -> bool {
        self.solutions.next_solution.copy_from(x);
        let params = LoadParams {
            iteration,
            ..self.params
        };
        let (method, sec) = (self.method, self.sec);
        let deriv = |s: &DVector<f64>, d: &mut DVector<f64>| method.update_state_deriv(sec, s, d);

        let mut ok = self.assembler.load_dae_vectors(&params, self.solutions, &deriv);
        ok &= self.assembler.load_dae_matrices(&params, self.solutions);

        method.residual(sec, self.assembler.q(), self.assembler.f(), self.residual);
        let cj = method.cj(sec);
        ok && self
            .jacobian
            .assign_combination(cj, self.assembler.dq_dx(), 1.0, self.assembler.df_dx())
            .is_ok()
    }

    fn residual(&self) -> &DVector<f64> {
        &*self.residual
    }

    fn jacobian(&self) -> &DaeMatrix {
        &*self.jacobian
    }

    fn is_branch(&self, i: usize) -> bool {
        self.assembler.is_branch(i)
    }
}

impl AnalysisContext {
    pub fn builder() -> AnalysisContextBuilder {
        AnalysisContextBuilder::default()
    }

    pub fn state(&self) -> AnalysisState {
        self.state
    }

    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    pub fn solutions(&self) -> &SolutionSet {
        &self.solutions
    }

    pub fn step_control(&self) -> &StepErrorControl {
        &self.sec
    }

    pub fn method(&self) -> &dyn TimeIntegrationMethod {
        self.method.as_ref()
    }

    pub fn params(&self) -> &TiaParams {
        &self.params
    }

    pub fn communicator(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    pub fn newton_stats(&self) -> NewtonStats {
        self.solver.stats()
    }

    /// Unknown names indexed like the solution vectors; unnamed unknowns
    /// become `x<index>`.
    pub fn var_names(&self) -> Vec<String> {
        (0..self.assembler.num_unknowns())
            .map(|i| {
                self.assembler
                    .var_name(VarId::new(i))
                    .map_or_else(|| format!("x{}", i), str::to_string)
            })
            .collect()
    }

    /// Used by analyses outside the transient loop to report their outcome.
    pub(crate) fn set_state(&mut self, state: AnalysisState) {
        self.state = state;
    }

    /// Load scalars for the point the next solve targets.
    fn load_params(&self) -> LoadParams {
        let gmin = self.solver.criteria().gmin;
        match self.method.method() {
            IntegrationMethod::None => LoadParams {
                time: self.sec.current_time,
                ..LoadParams::dc(gmin)
            },
            _ => LoadParams::transient(self.sec.next_time, gmin),
        }
    }

    /// Newton on the active method's corrector, starting from `next_solution`.
    ///
    /// The last iterate is left in `next_solution`.
    fn nonlinear_solve(&mut self) -> ConvergenceStatus {
        let mut x = self.solutions.next_solution.clone();
        let mut problem = DaeProblem {
            params: self.load_params(),
            assembler: &mut self.assembler,
            solutions: &mut self.solutions,
            method: self.method.as_ref(),
            sec: &self.sec,
            residual: &mut self.scratch.residual,
            jacobian: &mut self.scratch.jacobian,
        };
        let status = self.solver.solve(&mut problem, &mut x);
        self.solutions.next_solution.copy_from(&x);
        status
    }

    /// Reassemble the DAE vectors and matrices at `next_solution`.
    ///
    /// Newton leaves the loaded quantities one update behind its final
    /// iterate; error estimation and history seeding need them at the iterate.
    fn reload(&mut self) -> bool {
        let mut params = self.load_params();
        params.iteration = self.solver.next_iteration();
        let (method, sec) = (self.method.as_ref(), &self.sec);
        let deriv = |s: &DVector<f64>, d: &mut DVector<f64>| method.update_state_deriv(sec, s, d);
        let ok = self
            .assembler
            .load_dae_vectors(&params, &mut self.solutions, &deriv);
        ok & self.assembler.load_dae_matrices(&params, &self.solutions)
    }

    /// Replace the integration method, sized for the current vectors.
    fn switch_method(&mut self, method: IntegrationMethod) {
        self.method = create_time_integ_method(method, &self.solutions, &self.params);
    }

    /// Refresh the local-error weights from the accepted point.
    ///
    /// Relies on Q having been loaded at `curr_solution`.
    fn refresh_error_weights(&mut self) {
        let (reltol, abstol, new_lte) = (self.params.reltol, self.params.abstol, self.params.new_lte);
        self.method.data_store_mut().set_error_wt_vector(
            &self.solutions.curr_solution,
            self.assembler.q(),
            reltol,
            abstol,
            new_lte,
        );
    }

    /// Solve the DC operating point at the initial time.
    ///
    /// On success the point becomes constant history for every time level,
    /// devices are told it was accepted, and the DAE quantities (including
    /// `dQ/dx` and `dF/dx`) are left loaded at it. Failure is fatal.
    pub fn dc_operating_point(&mut self) -> Result<ConvergenceStatus> {
        self.switch_method(IntegrationMethod::None);
        self.state = AnalysisState::DcOp;

        let status = self.nonlinear_solve();
        let loaded = status.is_converged() && self.reload();
        if !loaded {
            let code = if status.is_converged() {
                ConvergenceStatus::LoadFailed.code()
            } else {
                status.code()
            };
            self.state = AnalysisState::Failed;
            error!("DC operating point failed (Newton status {})", code);
            return Err(Error::DcOpFailed { status: code });
        }

        self.solutions.set_constant_history();
        let params = self.load_params();
        self.assembler.accept_step(&params, &self.solutions);
        info!(
            "DC operating point converged in {} iterations",
            self.solver.stats().iterations
        );
        debug!("DC solution: {:?}", self.solutions.curr_solution.as_slice());
        Ok(status)
    }
}
