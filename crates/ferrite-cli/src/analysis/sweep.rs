//! DC sweep.

use anyhow::{Context, Result, bail};
use ferrite_solver::{DcSweep, DcSweepResult, SweepParam, TiaParams};
use log::warn;

use super::build_context;
use crate::deck::Deck;

/// Sweep the deck's devices. Points that fail to converge are reported and
/// left out; the run fails only if no point converged.
pub fn run_dc_sweep(deck: &Deck, params: &[SweepParam]) -> Result<DcSweepResult> {
    let ctx = build_context(deck, TiaParams::default())?;
    let mut sweep = DcSweep::new(ctx, params.to_vec()).context("invalid DC sweep")?;
    let result = sweep.run().context("DC sweep failed")?;
    if result.points.is_empty() {
        bail!("no DC sweep point converged");
    }
    for f in &result.failures {
        warn!("point {} {:?} failed with Newton status {}", f.index, f.values, f.status);
    }
    Ok(result)
}
