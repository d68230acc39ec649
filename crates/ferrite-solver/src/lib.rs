//! Analysis engine for Ferrite.
//!
//! This crate drives a circuit's DAE `dQ(x)/dt + F(x) = 0` through:
//! - [`assembler`]: Q, F, dQ/dx and dF/dx from the device list
//! - [`newton`]: damped Newton with direct or GMRES linear solves
//! - [`tia`]: variable-order BDF and Gear, step-error control and breakpoints
//! - [`analysis`]: DC operating point, DC and `.STEP` sweeps, the transient
//!   loop, the two-level interface for an outer solver, and restart
//! - [`mor`]: multi-port PRIMA model-order reduction and transfer-function sweeps

pub mod analysis;
pub mod assembler;
pub mod dispatch;
pub mod error;
pub mod gmres;
pub mod linear;
pub mod mor;
pub mod newton;
pub mod operator;
pub mod preconditioner;
pub mod sparse_operator;
pub mod tia;

pub use analysis::{
    AnalysisContext, AnalysisContextBuilder, AnalysisState, DcSweep, DcSweepFailure,
    DcSweepPoint, DcSweepResult, StepOutcome, StepSweep, SweepLoop, SweepParam, SweepPoint,
    SweepValues, TimePoint, Transient, TransientResult, TransientStats,
};
pub use assembler::{Assembler, LoadParams};
pub use dispatch::{DispatchConfig, LinearSolverKind, SolverDispatchStrategy};
pub use error::{Error, Result};
pub use gmres::GmresConfig;
pub use linear::{DirectSolver, FaerLu, solve_dense, solve_sparse};
pub use mor::{MorAnalysis, MorParams, MorResult, MorStage, SweepType, TransferSnapshot};
pub use newton::{ConvergenceCriteria, ConvergenceStatus, NewtonStats, NonlinearSolver};
pub use operator::RealOperator;
pub use tia::{IntegrationMethod, StepErrorControl, TiaParams, TimeIntInfo, TwoLevelError};
