//! Result types for transient analysis.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use super::AnalysisState;

/// One accepted time point.
#[derive(Debug, Clone)]
pub struct TimePoint {
    /// Time value (s).
    pub time: f64,
    /// Solution vector at this time.
    pub solution: DVector<f64>,
}

/// Step counters for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransientStats {
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub newton_iterations: usize,
    /// Smallest accepted step (s).
    pub min_step_used: f64,
    /// Largest accepted step (s).
    pub max_step_used: f64,
}

impl Default for TransientStats {
    fn default() -> Self {
        Self {
            successful_steps: 0,
            failed_steps: 0,
            newton_iterations: 0,
            min_step_used: f64::INFINITY,
            max_step_used: 0.0,
        }
    }
}

impl TransientStats {
    pub(crate) fn record_step(&mut self, h: f64) {
        self.successful_steps += 1;
        self.min_step_used = self.min_step_used.min(h);
        self.max_step_used = self.max_step_used.max(h);
    }
}

/// Waveforms of a transient run, including the DC point at the initial time.
#[derive(Debug, Clone)]
pub struct TransientResult {
    /// All accepted timepoints, in time order.
    pub points: Vec<TimePoint>,
    /// Unknown names, indexed like the solution vectors.
    pub names: Vec<String>,
    pub stats: TransientStats,
    /// State the run stopped in.
    pub state: AnalysisState,
}

impl TransientResult {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            points: Vec::new(),
            names,
            stats: TransientStats::default(),
            state: AnalysisState::DcOp,
        }
    }

    pub(crate) fn push(&mut self, time: f64, solution: &DVector<f64>) {
        self.points.push(TimePoint {
            time,
            solution: solution.clone(),
        });
    }

    /// Index of the unknown called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// `(time, value)` pairs for one unknown.
    pub fn waveform(&self, index: usize) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .map(|tp| (tp.time, tp.solution[index]))
            .collect()
    }

    pub fn times(&self) -> Vec<f64> {
        self.points.iter().map(|tp| tp.time).collect()
    }

    pub fn final_time(&self) -> Option<f64> {
        self.points.last().map(|tp| tp.time)
    }

    /// Linear interpolation between the accepted points around `time`.
    ///
    /// Times outside the run clamp to the first or last point.
    pub fn interpolate_at(&self, time: f64) -> Option<DVector<f64>> {
        let first = self.points.first()?;
        let last = self.points.last()?;
        if time <= first.time {
            return Some(first.solution.clone());
        }
        if time >= last.time {
            return Some(last.solution.clone());
        }

        // First point strictly after `time`; the one before it brackets from below.
        let hi = self.points.partition_point(|tp| tp.time <= time);
        let (p0, p1) = (&self.points[hi - 1], &self.points[hi]);
        let span = p1.time - p0.time;
        if span <= 0.0 {
            return Some(p1.solution.clone());
        }
        let alpha = (time - p0.time) / span;
        Some(&p0.solution * (1.0 - alpha) + &p1.solution * alpha)
    }

    /// Resample at evenly spaced times from `tstart` to the last point.
    pub fn sample_at_times(&self, tstep: f64, tstart: Option<f64>) -> TransientResult {
        let tstart = tstart.unwrap_or_else(|| self.points.first().map_or(0.0, |p| p.time));
        let tstop = self.final_time().unwrap_or(tstart);

        let mut sampled = TransientResult {
            points: Vec::new(),
            names: self.names.clone(),
            stats: self.stats,
            state: self.state,
        };
        if tstep <= 0.0 {
            return sampled;
        }
        let mut k = 0usize;
        loop {
            let t = tstart + k as f64 * tstep;
            if t > tstop + tstep * 1e-3 {
                break;
            }
            if let Some(solution) = self.interpolate_at(t) {
                sampled.points.push(TimePoint { time: t, solution });
            }
            k += 1;
        }
        sampled
    }

    /// Value of one unknown at `time`, interpolated.
    pub fn value_at(&self, index: usize, time: f64) -> Option<f64> {
        self.interpolate_at(time).map(|sol| sol[index])
    }
}
