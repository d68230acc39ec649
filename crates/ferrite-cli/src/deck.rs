//! JSON circuit decks.
//!
//! A deck lists the devices, the analysis to run and optional solver
//! settings:
//!
//! ```json
//! {
//!   "title": "rc step",
//!   "devices": [
//!     { "name": "V1", "nodes": ["in", "0"],
//!       "waveform": { "type": "pulse", "v1": 0, "v2": 1, "td": 1e-4, "pw": 1 } },
//!     { "name": "R1", "nodes": ["in", "out"], "value": 1e3 },
//!     { "name": "C1", "nodes": ["out", "0"], "value": 1e-6 }
//!   ],
//!   "analysis": { "type": "tran", "final_time": 3e-3 },
//!   "options": { "newton": { "max_iterations": 100 } }
//! }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use ferrite_devices::DeviceSpec;
use ferrite_solver::{ConvergenceCriteria, DispatchConfig, MorParams, SweepParam, TiaParams};
use serde::Deserialize;

/// Analysis requested by a deck.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AnalysisSpec {
    /// DC operating point only.
    #[default]
    Op,
    /// Operating points over swept device values; the first entry varies
    /// fastest.
    Dc { sweep: Vec<SweepParam> },
    Tran(TiaParams),
    Mor(MorParams),
}

impl AnalysisSpec {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Op => "op",
            Self::Dc { .. } => "dc",
            Self::Tran(_) => "tran",
            Self::Mor(_) => "mor",
        }
    }
}

/// Solver settings shared by every analysis.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Options {
    pub newton: ConvergenceCriteria,
    pub dispatch: DispatchConfig,
    /// Resample transient output on this grid instead of printing accepted steps.
    pub print_step: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Deck {
    #[serde(default)]
    pub title: Option<String>,
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub analysis: AnalysisSpec,
    #[serde(default)]
    pub options: Options,
}

impl Deck {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read deck {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in deck {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let deck: Deck = serde_json::from_str(text).context("malformed deck")?;
        if deck.devices.is_empty() {
            bail!("deck lists no devices");
        }
        Ok(deck)
    }

    /// The analysis to run, honoring a command-line override.
    ///
    /// `--op` always works; `--dc`, `--tran` and `--mor` need the matching
    /// settings in the deck.
    pub fn select(&self, requested: Option<&str>) -> Result<AnalysisSpec> {
        match requested {
            None => Ok(self.analysis.clone()),
            Some("op") => Ok(AnalysisSpec::Op),
            Some(kind) if kind == self.analysis.label() => Ok(self.analysis.clone()),
            Some(kind) => bail!(
                "--{} requested but the deck describes a '{}' analysis",
                kind,
                self.analysis.label()
            ),
        }
    }
}
