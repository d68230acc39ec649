//! Analysis runners for the operating point, DC sweeps, transient and MOR.

pub mod dc;
pub mod mor;
pub mod sweep;
pub mod transient;

pub use dc::{DcReport, run_dc_op};
pub use mor::run_mor;
pub use sweep::run_dc_sweep;
pub use transient::run_transient;

use anyhow::{Context, Result};
use ferrite_core::SerialComm;
use ferrite_devices::DeviceRegistry;
use ferrite_solver::{AnalysisContext, Assembler, NonlinearSolver, TiaParams};
use log::info;

use crate::deck::Deck;

/// Instantiate the deck's devices and wire them into an analysis context.
pub fn build_context(deck: &Deck, params: TiaParams) -> Result<AnalysisContext> {
    let assembler = Assembler::from_specs(&DeviceRegistry::with_builtins(), &deck.devices)
        .context("failed to build the circuit")?;
    info!(
        "circuit: {} devices, {} unknowns, solver {}",
        assembler.num_devices(),
        assembler.num_unknowns(),
        deck.options.dispatch.select(assembler.num_unknowns())
    );
    let solver = NonlinearSolver::new(deck.options.newton.clone())
        .with_dispatch(deck.options.dispatch.clone());
    AnalysisContext::builder()
        .assembler(assembler)
        .nonlinear_solver(solver)
        .communicator(SerialComm)
        .params(params)
        .build()
        .context("failed to set up the analysis")
}
