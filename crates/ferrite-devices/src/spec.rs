//! Serializable device descriptions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::waveforms::Waveform;

fn default_level() -> u32 {
    1
}

/// One device instance as read from a deck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Instance name; its first letter selects the kind unless `kind` is given.
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default = "default_level")]
    pub level: u32,
    pub nodes: Vec<String>,
    /// Primary value (resistance, capacitance, gain, DC level...).
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    /// Model or sub-type name, e.g. the gate type of a digital device.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub waveform: Option<Waveform>,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, nodes: &[&str], value: Option<f64>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            level: default_level(),
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
            value,
            params: BTreeMap::new(),
            model: None,
            waveform: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: f64) -> Self {
        self.params.insert(key.to_lowercase(), value);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = Some(waveform);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>, level: u32) -> Self {
        self.kind = Some(kind.into());
        self.level = level;
        self
    }

    /// Upper-case kind letter(s) used for registry lookup.
    pub fn kind_key(&self) -> String {
        match &self.kind {
            Some(k) => k.to_uppercase(),
            None => self
                .name
                .chars()
                .next()
                .map(|c| c.to_ascii_uppercase().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn param(&self, key: &str) -> Option<f64> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, &v)| v)
    }

    pub fn param_or(&self, key: &str, default: f64) -> f64 {
        self.param(key).unwrap_or(default)
    }

    /// The primary value, which the device cannot do without.
    pub fn require_value(&self) -> Result<f64> {
        self.value.ok_or_else(|| Error::MissingParameter {
            name: self.name.clone(),
            param: "value".to_string(),
        })
    }
}
