//! Discontinuity times the integrator must land on exactly.

/// What happens when the integrator reaches a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakPointKind {
    /// Land on the time and restart integration at low order.
    Simple,
    /// Land on the time, then stop and wait for a resume.
    Pause,
}

/// A time at which the solution is known or suspected to be non-smooth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakPoint {
    pub time: f64,
    pub kind: BreakPointKind,
}

impl BreakPoint {
    pub fn simple(time: f64) -> Self {
        Self {
            time,
            kind: BreakPointKind::Simple,
        }
    }

    pub fn pause(time: f64) -> Self {
        Self {
            time,
            kind: BreakPointKind::Pause,
        }
    }

    pub fn is_pause(&self) -> bool {
        self.kind == BreakPointKind::Pause
    }

    /// Whether two breakpoints are the same point within `tol`.
    pub fn coincides(&self, time: f64, tol: f64) -> bool {
        (self.time - time).abs() <= tol
    }
}
