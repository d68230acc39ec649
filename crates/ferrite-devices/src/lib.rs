//! Device models for Ferrite.
//!
//! Every device describes itself through the [`Device`] capability trait: it
//! registers the unknowns it touches, declares its Jacobian stamp once, and
//! then accumulates charge (Q) and current (F) contributions and their
//! Jacobians at previously registered handles.
//!
//! Provided models:
//! - Passive elements: R, C, L
//! - Independent V, I sources with DC, PULSE, SIN and PWL waveforms
//! - Controlled sources: VCVS (E), VCCS (G)
//! - Junction diode with pn-junction voltage limiting
//! - Digital gates in U-style (supply pins) and Y-style (fixed levels) form

pub mod controlled;
pub mod device;
pub mod digital;
pub mod diode;
pub mod error;
pub mod passive;
pub mod registry;
pub mod sources;
pub mod spec;
pub mod waveforms;

pub use device::{AnalysisMode, Device, LoadContext, VsourceRow};
pub use error::{Error, Result};
pub use registry::{DeviceConstructor, DeviceRegistry};
pub use spec::DeviceSpec;
pub use waveforms::Waveform;
