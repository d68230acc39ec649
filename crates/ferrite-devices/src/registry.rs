//! Device constructor lookup keyed by kind letter and model level.

use std::collections::HashMap;

use crate::controlled::{Vccs, Vcvs};
use crate::device::Device;
use crate::digital::DigitalGate;
use crate::diode::Diode;
use crate::error::{Error, Result};
use crate::passive::{Capacitor, Inductor, Resistor};
use crate::sources::{CurrentSource, VoltageSource};
use crate::spec::DeviceSpec;

/// Builds a device instance from its description.
pub type DeviceConstructor = fn(&DeviceSpec) -> Result<Box<dyn Device>>;

/// Table of constructors, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    constructors: HashMap<(String, u32), DeviceConstructor>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in model.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("R", 1, Resistor::from_spec);
        reg.register("C", 1, Capacitor::from_spec);
        reg.register("L", 1, Inductor::from_spec);
        reg.register("V", 1, VoltageSource::from_spec);
        reg.register("I", 1, CurrentSource::from_spec);
        reg.register("E", 1, Vcvs::from_spec);
        reg.register("G", 1, Vccs::from_spec);
        reg.register("D", 1, Diode::from_spec);
        reg.register("U", 1, DigitalGate::from_u_spec);
        reg.register("Y", 1, DigitalGate::from_y_spec);
        reg
    }

    /// Add or replace a constructor.
    pub fn register(&mut self, kind: &str, level: u32, ctor: DeviceConstructor) {
        self.constructors.insert((kind.to_uppercase(), level), ctor);
    }

    pub fn contains(&self, kind: &str, level: u32) -> bool {
        self.constructors.contains_key(&(kind.to_uppercase(), level))
    }

    pub fn create(&self, spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        let kind = spec.kind_key();
        let ctor = self
            .constructors
            .get(&(kind.clone(), spec.level))
            .ok_or(Error::UnknownKind {
                kind,
                level: spec.level,
            })?;
        ctor(spec)
    }

    /// Build every device of a deck, stopping at the first failure.
    pub fn create_all(&self, specs: &[DeviceSpec]) -> Result<Vec<Box<dyn Device>>> {
        specs.iter().map(|s| self.create(s)).collect()
    }
}
