//! Transient analysis.

use anyhow::{Context, Result};
use ferrite_solver::{AnalysisState, TiaParams, Transient, TransientResult};
use log::info;

use super::build_context;
use crate::deck::Deck;

/// Run to the stop time. Pause points are reported and resumed through.
pub fn run_transient(deck: &Deck, params: &TiaParams) -> Result<TransientResult> {
    let ctx = build_context(deck, params.clone())?;
    let mut tran = Transient::new(ctx).context("invalid transient parameters")?;

    let mut result = tran.run().context("transient analysis failed")?;
    while result.state == AnalysisState::Paused {
        info!(
            "paused at t = {:.6e}",
            result.final_time().unwrap_or(params.initial_time)
        );
        tran.resume_simulation(None)
            .context("failed to resume the transient run")?;
        result = tran.run().context("transient analysis failed")?;
    }

    let stats = &result.stats;
    info!(
        "transient complete: {} steps accepted, {} rejected, {} Newton iterations",
        stats.successful_steps, stats.failed_steps, stats.newton_iterations
    );
    Ok(match deck.options.print_step {
        Some(step) if step > 0.0 => result.sample_at_times(step, Some(params.initial_time)),
        _ => result,
    })
}
