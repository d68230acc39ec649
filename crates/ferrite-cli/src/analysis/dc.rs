//! DC operating point.

use anyhow::{Context, Result};
use ferrite_core::VarId;
use ferrite_solver::{AnalysisContext, TiaParams};
use serde::Serialize;

use super::build_context;
use crate::deck::Deck;

/// Solved operating point, one entry per unknown.
#[derive(Debug, Clone, Serialize)]
pub struct DcReport {
    pub iterations: usize,
    pub values: Vec<DcValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DcValue {
    pub name: String,
    /// Branch currents are reported with `A`, node voltages with `V`.
    pub unit: &'static str,
    pub value: f64,
}

pub fn run_dc_op(deck: &Deck) -> Result<DcReport> {
    let mut ctx = build_context(deck, TiaParams::default())?;
    ctx.dc_operating_point()
        .context("DC operating point analysis failed")?;
    Ok(report(&ctx))
}

fn report(ctx: &AnalysisContext) -> DcReport {
    let asm = ctx.assembler();
    let solution = &ctx.solutions().curr_solution;
    let values = (0..asm.num_unknowns())
        .map(|i| DcValue {
            name: asm
                .var_name(VarId::new(i))
                .map_or_else(|| format!("x{}", i), str::to_string),
            unit: if asm.is_branch(i) { "A" } else { "V" },
            value: solution[i],
        })
        .collect();
    DcReport {
        iterations: ctx.newton_stats().iterations,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divider_operating_point() {
        let deck = Deck::parse(
            r#"{ "devices": [
                { "name": "V1", "nodes": ["in", "0"], "value": 3.0 },
                { "name": "R1", "nodes": ["in", "out"], "value": 2e3 },
                { "name": "R2", "nodes": ["out", "0"], "value": 1e3 }
            ] }"#,
        )
        .unwrap();
        let report = run_dc_op(&deck).unwrap();
        let out = report.values.iter().find(|v| v.name == "out").unwrap();
        assert!((out.value - 1.0).abs() < 1e-9);
        assert_eq!(out.unit, "V");
        assert!(report.values.iter().any(|v| v.unit == "A"));
    }
}
