//! Multi-port PRIMA model-order reduction.
//!
//! A MOR run linearizes the circuit at its DC operating point into
//! `G = dF/dx` and `C = dQ/dx`, builds an orthonormal block Krylov basis
//! around the expansion point `s0`, and projects the system down to a dense
//! reduced model whose port transfer function matches the original near
//! `s0`. Transfer functions of either system can then be swept over
//! frequency.
//!
//! Stages run strictly in order:
//!
//! ```text
//! Init -> Reduce -> (EvalOrig) -> (EvalRed) -> Finish
//! ```
//!
//! # Module Structure
//!
//! - [`ports`] - port names to voltage-source branch rows
//! - [`krylov`] - block Arnoldi basis
//! - [`scaling`] - basis column scaling policies
//! - [`reduced`] - projection onto the basis
//! - [`sparsify`] - eigen-decoupled form of the reduced system
//! - [`sweep`] - original and reduced transfer-function sweeps

pub mod krylov;
pub mod ports;
pub mod reduced;
pub mod scaling;
pub mod sparsify;
pub mod sweep;

use std::f64::consts::PI;
use std::fmt;

use ferrite_core::DaeMatrix;
use log::{debug, error, info, warn};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisContext, AnalysisState};
use crate::error::{Error, Result};
use crate::linear::{DirectSolver, FaerLu};
use crate::newton::ConvergenceStatus;

pub use krylov::{KrylovBasis, ShiftInvertOperator, block_arnoldi, reduced_order};
pub use ports::PortMap;
pub use reduced::{ReducedSystem, project};
pub use scaling::{MAX_SCALE_TYPE, apply_scaling, scale_vector};
pub use sparsify::{SparseReducedSystem, sparsify};
pub use sweep::{
    OriginalSweep, ReducedSweep, SweepFailure, SweepOutcome, SweepSystem, SweepType,
    TransferSnapshot, frequencies,
};

/// MOR analysis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MorParams {
    /// Requested reduced order.
    pub size: usize,
    /// Port node names, in port order.
    pub ports: Vec<String>,
    /// Sweep the transfer function of the original system.
    pub comp_orig_tf: bool,
    /// Sweep the transfer function of the reduced system.
    pub comp_red_tf: bool,
    /// Sweep spacing: `LIN`, `DEC` or `OCT`.
    pub comp_type: String,
    /// Points in total (`LIN`) or per decade / octave.
    pub comp_np: usize,
    pub comp_fstart: f64,
    pub comp_fstop: f64,
    /// Expansion frequency in Hz.
    pub exp_point: f64,
    /// Basis scaling policy, 0 through 4.
    pub scale_type: u8,
    pub scale_factor: f64,
    pub scale_factor1: f64,
    /// Decouple the reduced system through its eigen-decomposition.
    pub sparsification: bool,
    /// Keep the reduced matrices in the result.
    pub save_red_sys: bool,
}

impl Default for MorParams {
    fn default() -> Self {
        Self {
            size: 0,
            ports: Vec::new(),
            comp_orig_tf: false,
            comp_red_tf: false,
            comp_type: "DEC".into(),
            comp_np: 10,
            comp_fstart: 1.0,
            comp_fstop: 1.0,
            exp_point: 0.0,
            scale_type: 0,
            scale_factor: 1.0,
            scale_factor1: 0.01,
            sparsification: false,
            save_red_sys: false,
        }
    }
}

impl MorParams {
    pub fn new(size: usize, ports: &[&str]) -> Self {
        Self {
            size,
            ports: ports.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Frequency grid for the transfer-function sweeps.
    pub fn with_sweep(mut self, kind: &str, np: usize, fstart: f64, fstop: f64) -> Self {
        self.comp_type = kind.to_string();
        self.comp_np = np;
        self.comp_fstart = fstart;
        self.comp_fstop = fstop;
        self
    }

    pub fn with_transfer_functions(mut self, original: bool, reduced: bool) -> Self {
        self.comp_orig_tf = original;
        self.comp_red_tf = reduced;
        self
    }

    pub fn with_expansion_point(mut self, freq: f64) -> Self {
        self.exp_point = freq;
        self
    }

    pub fn with_scaling(mut self, scale_type: u8, factor: f64, factor1: f64) -> Self {
        self.scale_type = scale_type;
        self.scale_factor = factor;
        self.scale_factor1 = factor1;
        self
    }

    pub fn with_sparsification(mut self, on: bool) -> Self {
        self.sparsification = on;
        self
    }

    pub fn with_saved_system(mut self, on: bool) -> Self {
        self.save_red_sys = on;
        self
    }

    fn sweeps(&self) -> bool {
        self.comp_orig_tf || self.comp_red_tf
    }

    pub fn sweep_type(&self) -> Result<SweepType> {
        self.comp_type.parse()
    }

    /// Reject parameter combinations the reduction cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::InvalidPortList("no ports given".into()));
        }
        if self.size == 0 {
            return Err(Error::InvalidParameter(
                "reduced order must be at least 1".into(),
            ));
        }
        if self.scale_type > MAX_SCALE_TYPE {
            return Err(Error::InvalidParameter(format!(
                "basis scale type {} (expected 0..={})",
                self.scale_type, MAX_SCALE_TYPE
            )));
        }
        if self.sparsification && self.scale_type > 1 {
            return Err(Error::IncompatibleScaling(self.scale_type));
        }
        if self.scale_type == 1 && self.scale_factor == 0.0 {
            return Err(Error::InvalidParameter("scale factor must be nonzero".into()));
        }
        if self.sweeps() {
            let kind = self.sweep_type()?;
            if self.comp_np == 0 {
                return Err(Error::InvalidParameter(
                    "frequency sweep needs at least one point".into(),
                ));
            }
            if kind != SweepType::Lin && !(self.comp_fstart > 0.0 && self.comp_fstop > 0.0) {
                return Err(Error::InvalidParameter(format!(
                    "{} sweep needs positive start and stop frequencies",
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// Stage of a MOR run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MorStage {
    Init,
    Reduce,
    EvalOrig,
    EvalRed,
    Finish,
}

impl fmt::Display for MorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MorStage::Init => "INIT",
            MorStage::Reduce => "REDUCE",
            MorStage::EvalOrig => "EVAL_ORIG",
            MorStage::EvalRed => "EVAL_RED",
            MorStage::Finish => "FINISH",
        };
        f.write_str(name)
    }
}

/// Everything a MOR run reports.
#[derive(Debug, Clone, Default)]
pub struct MorResult {
    /// DC operating point converged and every swept frequency solved.
    pub success: bool,
    pub ports: Vec<String>,
    /// Expansion point in rad/s.
    pub s0: f64,
    pub requested_order: usize,
    /// Realized reduced order.
    pub order: usize,
    /// The request exceeded the system size.
    pub clamped: bool,
    /// The Krylov iteration stopped early.
    pub breakdown: bool,
    pub dc_status: Option<ConvergenceStatus>,
    /// Reciprocal condition number of the reduced `G`, when sparsified.
    pub rcond: Option<f64>,
    pub orig_tf: Vec<TransferSnapshot>,
    pub red_tf: Vec<TransferSnapshot>,
    pub failures: Vec<SweepFailure>,
    /// Saved when `save_red_sys` is set.
    pub reduced: Option<ReducedSystem>,
    /// Saved when `save_red_sys` and `sparsification` are set.
    pub sparse: Option<SparseReducedSystem>,
}

/// Linearized system and port map produced by `Init`.
#[derive(Debug)]
struct MorSystem {
    ports: PortMap,
    g: DaeMatrix,
    c: DaeMatrix,
}

/// Drives one MOR run over an [`AnalysisContext`].
#[derive(Debug)]
pub struct MorAnalysis {
    ctx: AnalysisContext,
    params: MorParams,
    completed: Option<MorStage>,
    freqs: Vec<f64>,
    system: Option<MorSystem>,
    reduced: Option<ReducedSystem>,
    sparse: Option<SparseReducedSystem>,
    result: MorResult,
}

impl MorAnalysis {
    pub fn new(ctx: AnalysisContext, params: MorParams) -> Self {
        let result = MorResult {
            ports: params.ports.clone(),
            requested_order: params.size,
            ..Default::default()
        };
        Self {
            ctx,
            params,
            completed: None,
            freqs: Vec::new(),
            system: None,
            reduced: None,
            sparse: None,
            result,
        }
    }

    pub fn params(&self) -> &MorParams {
        &self.params
    }

    pub fn context(&self) -> &AnalysisContext {
        &self.ctx
    }

    /// Last stage that completed.
    pub fn completed_stage(&self) -> Option<MorStage> {
        self.completed
    }

    pub fn result(&self) -> &MorResult {
        &self.result
    }

    pub fn into_result(self) -> MorResult {
        self.result
    }

    /// Sweep frequencies chosen by `Init`.
    pub fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    pub fn reduced_system(&self) -> Option<&ReducedSystem> {
        self.reduced.as_ref()
    }

    pub fn sparse_system(&self) -> Option<&SparseReducedSystem> {
        self.sparse.as_ref()
    }

    /// Run every stage in order.
    pub fn run(&mut self) -> Result<MorResult> {
        self.init()?;
        self.reduce()?;
        if self.params.comp_orig_tf {
            self.eval_orig_transfer_function()?;
        }
        if self.params.comp_red_tf {
            self.eval_red_transfer_function()?;
        }
        self.finish()?;
        Ok(self.result.clone())
    }

    fn enter(&self, stage: MorStage) -> Result<()> {
        let ready = match stage {
            MorStage::Init => self.completed.is_none(),
            MorStage::Reduce => self.completed == Some(MorStage::Init),
            MorStage::EvalOrig => self.completed == Some(MorStage::Reduce),
            MorStage::EvalRed => matches!(
                self.completed,
                Some(MorStage::Reduce) | Some(MorStage::EvalOrig)
            ),
            MorStage::Finish => matches!(
                self.completed,
                Some(MorStage::Reduce) | Some(MorStage::EvalOrig) | Some(MorStage::EvalRed)
            ),
        };
        if ready {
            Ok(())
        } else {
            Err(Error::InvalidState(match self.completed {
                Some(done) => format!("MOR stage {} cannot follow {}", stage, done),
                None => format!("MOR stage {} needs INIT first", stage),
            }))
        }
    }

    /// Run `body` as `stage`; any error is fatal for the analysis.
    fn stage<T>(
        &mut self,
        stage: MorStage,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.enter(stage)?;
        debug!("MOR stage {}", stage);
        match body(self) {
            Ok(v) => {
                self.completed = Some(stage);
                Ok(v)
            }
            Err(e) => {
                error!("MOR {} failed: {}", stage, e);
                self.ctx.set_state(AnalysisState::Failed);
                Err(e)
            }
        }
    }

    fn system(&self) -> Result<&MorSystem> {
        self.system
            .as_ref()
            .ok_or_else(|| Error::InvalidState("MOR system not initialized".into()))
    }

    /// Solve the operating point and extract `G`, `C` and the port rows.
    pub fn init(&mut self) -> Result<()> {
        self.stage(MorStage::Init, |mor| {
            mor.params.validate()?;
            mor.result.s0 = 2.0 * PI * mor.params.exp_point;
            if mor.params.sweeps() {
                let kind = mor.params.sweep_type()?;
                let p = &mor.params;
                mor.freqs = frequencies(kind, p.comp_np, p.comp_fstart, p.comp_fstop);
                info!(
                    "{} sweep of {} points from {:.4e} to {:.4e} Hz",
                    kind,
                    mor.freqs.len(),
                    p.comp_fstart,
                    p.comp_fstop
                );
            }

            let status = mor.ctx.dc_operating_point()?;
            mor.result.dc_status = Some(status);

            let asm = mor.ctx.assembler();
            let ports = PortMap::build(
                &mor.params.ports,
                &asm.voltage_source_rows(),
                asm.topology(),
                mor.ctx.communicator(),
            )?;
            let mut g = asm.df_dx().clone();
            ports.normalize_rows(&mut g)?;
            let c = asm.dq_dx().clone();
            info!(
                "MOR system: {} unknowns, {} ports, s0 = {:.4e} rad/s",
                g.size(),
                ports.len(),
                mor.result.s0
            );
            mor.system = Some(MorSystem { ports, g, c });
            Ok(())
        })
    }

    /// Build the projection basis and the reduced system.
    pub fn reduce(&mut self) -> Result<()> {
        self.stage(MorStage::Reduce, |mor| {
            let s0 = mor.result.s0;
            let p = &mor.params;
            let sys = mor.system()?;
            let n = sys.g.size();
            let num_ports = sys.ports.len();

            let shifted = if s0 != 0.0 {
                sys.g.linear_combination(1.0, s0, &sys.c)?
            } else {
                sys.g.clone()
            };
            let mut lu = FaerLu::new();
            lu.factor(&shifted).map_err(|e| Error::LinearSolve {
                stage: "MOR expansion point factorization".into(),
                reason: e.to_string(),
            })?;

            let mut b = DMatrix::zeros(n, num_ports);
            for (j, &row) in sys.ports.rows().iter().enumerate() {
                b[(row, j)] = -1.0;
            }
            let mut r = DMatrix::zeros(n, num_ports);
            for j in 0..num_ports {
                let x = lu.solve(&b.column(j).into_owned()).map_err(|e| Error::LinearSolve {
                    stage: "MOR starting block".into(),
                    reason: e.to_string(),
                })?;
                r.set_column(j, &x);
            }

            let (kblock, clamped) = reduced_order(p.size, n, num_ports);
            if clamped {
                warn!(
                    "requested reduced order {} exceeds system size {}; using {}",
                    p.size,
                    n,
                    kblock * num_ports
                );
            }
            if kblock == 0 {
                return Err(Error::InvalidParameter(format!(
                    "reduced order {} is smaller than the {} ports",
                    p.size, num_ports
                )));
            }

            let op = ShiftInvertOperator::new(&lu, &sys.c);
            let basis = block_arnoldi(&op, &r, kblock)?;
            let w = basis.basis;
            let scales = scale_vector(&w, p.scale_type, p.scale_factor, p.scale_factor1)?;
            let v = match &scales {
                Some(s) => apply_scaling(&w, s),
                None => w.clone(),
            };
            let reduced = project(&sys.g, &sys.c, &b, &w, &v)?;
            info!(
                "reduced order {} ({} blocks of {} ports)",
                reduced.order(),
                basis.blocks,
                num_ports
            );
            debug!("reduced G: {}", reduced.g);
            debug!("reduced C: {}", reduced.c);

            let sparse = if p.sparsification {
                let unscaled = if scales.is_some() {
                    project(&sys.g, &sys.c, &b, &w, &w)?
                } else {
                    reduced.clone()
                };
                let mut sparse = sparsify(&unscaled)?;
                if p.scale_type <= 1 {
                    sparse.scale(p.scale_factor);
                }
                Some(sparse)
            } else {
                None
            };

            mor.result.order = reduced.order();
            mor.result.clamped = clamped;
            mor.result.breakdown = basis.breakdown;
            mor.result.rcond = sparse.as_ref().map(|s| s.rcond);
            if mor.params.save_red_sys {
                mor.result.reduced = Some(reduced.clone());
                mor.result.sparse = sparse.clone();
            }
            mor.reduced = Some(reduced);
            mor.sparse = sparse;
            Ok(())
        })
    }

    /// Sweep the full system's transfer function.
    pub fn eval_orig_transfer_function(&mut self) -> Result<()> {
        self.stage(MorStage::EvalOrig, |mor| {
            let outcome = {
                let sys = mor.system()?;
                let sweep = OriginalSweep::new(&sys.g, &sys.c, sys.ports.rows(), mor.result.s0)?;
                sweep.run(&mor.freqs)
            };
            info!(
                "original system: {} of {} frequencies solved",
                outcome.snapshots.len(),
                mor.freqs.len()
            );
            mor.result.orig_tf = outcome.snapshots;
            mor.result.failures.extend(outcome.failures);
            Ok(())
        })
    }

    /// Sweep the reduced system's transfer function.
    pub fn eval_red_transfer_function(&mut self) -> Result<()> {
        self.stage(MorStage::EvalRed, |mor| {
            let red = mor
                .reduced
                .as_ref()
                .ok_or_else(|| Error::InvalidState("no reduced system".into()))?;
            let outcome = ReducedSweep::new(red, mor.result.s0).run(&mor.freqs);
            info!(
                "reduced system: {} of {} frequencies solved",
                outcome.snapshots.len(),
                mor.freqs.len()
            );
            mor.result.red_tf = outcome.snapshots;
            mor.result.failures.extend(outcome.failures);
            Ok(())
        })
    }

    /// Settle the overall outcome.
    pub fn finish(&mut self) -> Result<()> {
        self.stage(MorStage::Finish, |mor| {
            let dc_ok = mor.result.dc_status.is_some_and(|s| s.is_converged());
            mor.result.success = dc_ok && mor.result.failures.is_empty();
            if mor.result.success {
                mor.ctx.set_state(AnalysisState::Finished);
                info!("MOR analysis complete");
            } else {
                mor.ctx.set_state(AnalysisState::Failed);
                warn!(
                    "MOR analysis finished with {} failed frequencies",
                    mor.result.failures.len()
                );
            }
            Ok(())
        })
    }
}
