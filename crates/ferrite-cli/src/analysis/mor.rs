//! Model-order reduction.

use anyhow::{Context, Result};
use ferrite_solver::{MorAnalysis, MorParams, MorResult, TiaParams};
use log::{info, warn};

use super::build_context;
use crate::deck::Deck;

pub fn run_mor(deck: &Deck, params: &MorParams) -> Result<MorResult> {
    let ctx = build_context(deck, TiaParams::default())?;
    let mut mor = MorAnalysis::new(ctx, params.clone());
    let result = mor
        .run()
        .with_context(|| format!("MOR analysis failed {}", failed_at(&mor)))?;

    info!(
        "reduced {} port(s) to order {} (requested {})",
        result.ports.len(),
        result.order,
        result.requested_order
    );
    if !result.failures.is_empty() {
        warn!("{} frequency point(s) could not be solved", result.failures.len());
    }
    Ok(result)
}

fn failed_at(mor: &MorAnalysis) -> String {
    match mor.completed_stage() {
        None => "in INIT".into(),
        Some(stage) => format!("after {}", stage),
    }
}
