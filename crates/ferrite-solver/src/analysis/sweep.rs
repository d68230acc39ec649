//! Parameter sweeps shared by the DC sweep and `.STEP` drivers.
//!
//! Several parameters nest into one loop. The first parameter varies
//! fastest; each later one advances once per full pass of those before it.

use serde::{Deserialize, Serialize};

use crate::assembler::Assembler;
use crate::error::{Error, Result};

/// Values one parameter takes, in sweep order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SweepValues {
    /// `start, start + step, ...` up to and including `stop`.
    Lin { start: f64, stop: f64, step: f64 },
    /// `points` values per decade from `start`.
    Dec { start: f64, stop: f64, points: usize },
    /// `points` values per octave from `start`.
    Oct { start: f64, stop: f64, points: usize },
    List { values: Vec<f64> },
}

impl SweepValues {
    /// Number of values, or an error for a sweep that never reaches `stop`.
    pub fn count(&self) -> Result<usize> {
        match self {
            SweepValues::Lin { start, stop, step } => {
                let span = (stop - start) / step;
                if !span.is_finite() || span < 0.0 {
                    return Err(Error::InvalidParameter(format!(
                        "LIN sweep from {} to {} by {} does not terminate",
                        start, stop, step
                    )));
                }
                let mut n = span.floor();
                // one more step landing on stop within rounding
                if (stop - (start + (n + 1.0) * step)).abs() < 2.0 * f64::EPSILON {
                    n += 1.0;
                }
                Ok(n as usize + 1)
            }
            SweepValues::Dec { start, stop, points } => {
                log_count(*start, *stop, *points, (stop / start).log10())
            }
            SweepValues::Oct { start, stop, points } => {
                log_count(*start, *stop, *points, (stop / start).log2())
            }
            SweepValues::List { values } => {
                if values.is_empty() {
                    Err(Error::InvalidParameter("empty LIST sweep".into()))
                } else {
                    Ok(values.len())
                }
            }
        }
    }

    /// The `i`-th value.
    pub fn value(&self, i: usize) -> f64 {
        match self {
            SweepValues::Lin { start, step, .. } => start + i as f64 * step,
            SweepValues::Dec { start, points, .. } => start * 10f64.powf(i as f64 / *points as f64),
            SweepValues::Oct { start, points, .. } => start * 2f64.powf(i as f64 / *points as f64),
            SweepValues::List { values } => values[i],
        }
    }
}

fn log_count(start: f64, stop: f64, points: usize, units: f64) -> Result<usize> {
    if start <= 0.0 || stop <= 0.0 || points == 0 {
        return Err(Error::InvalidParameter(format!(
            "log sweep needs positive bounds and points, got {} to {} with {}",
            start, stop, points
        )));
    }
    Ok((units.abs() * points as f64 + 1.0).floor() as usize)
}

/// One swept parameter, addressed as `DEVICE` or `DEVICE:PARAM`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepParam {
    pub name: String,
    #[serde(flatten)]
    pub values: SweepValues,
}

impl SweepParam {
    pub fn new(name: impl Into<String>, values: SweepValues) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn lin(name: impl Into<String>, start: f64, stop: f64, step: f64) -> Self {
        Self::new(name, SweepValues::Lin { start, stop, step })
    }

    pub fn list(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, SweepValues::List { values })
    }
}

/// Parameter values at one iteration of a [`SweepLoop`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub index: usize,
    pub values: Vec<(String, f64)>,
    /// Some inner parameter wrapped back to its first value.
    pub reset: bool,
}

#[derive(Debug, Clone)]
struct Axis {
    param: SweepParam,
    /// Iterations per change of this parameter.
    interval: usize,
    count: usize,
}

/// Nested iteration over several [`SweepParam`]s.
#[derive(Debug, Clone)]
pub struct SweepLoop {
    axes: Vec<Axis>,
    len: usize,
}

impl SweepLoop {
    pub fn new(params: Vec<SweepParam>) -> Result<Self> {
        let mut axes = Vec::with_capacity(params.len());
        let mut interval = 1;
        for param in params {
            let count = param.values.count()?;
            axes.push(Axis {
                param,
                interval,
                count,
            });
            interval *= count;
        }
        let len = if axes.is_empty() { 0 } else { interval };
        Ok(Self { axes, len })
    }

    /// Total number of iterations.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn point(&self, index: usize) -> SweepPoint {
        let mut reset = false;
        let values = self
            .axes
            .iter()
            .map(|axis| {
                let i = (index / axis.interval) % axis.count;
                reset |= index > 0 && i == 0 && index % axis.interval == 0;
                (axis.param.name.clone(), axis.param.values.value(i))
            })
            .collect();
        SweepPoint {
            index,
            values,
            reset,
        }
    }

    /// Write the values of iteration `index` into the circuit.
    pub fn apply(&self, index: usize, assembler: &mut Assembler) -> Result<SweepPoint> {
        let point = self.point(index);
        for (name, value) in &point.values {
            assembler.set_param(name, *value)?;
        }
        Ok(point)
    }
}
