//! Time-varying source waveforms.
//!
//! Waveforms evaluate the source value at a time and report their corner
//! times as breakpoints so the integrator never steps across a kink.

use std::f64::consts::PI;

use ferrite_core::BreakPoint;
use serde::{Deserialize, Serialize};

/// A time-varying source value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Waveform {
    /// Constant value.
    Dc { value: f64 },

    /// PULSE(V1 V2 TD TR TF PW PER); `per == 0` gives a single pulse.
    Pulse {
        v1: f64,
        v2: f64,
        #[serde(default)]
        td: f64,
        #[serde(default)]
        tr: f64,
        #[serde(default)]
        tf: f64,
        pw: f64,
        #[serde(default)]
        per: f64,
    },

    /// SIN(VO VA FREQ TD THETA PHASE), phase in degrees.
    Sin {
        vo: f64,
        va: f64,
        freq: f64,
        #[serde(default)]
        td: f64,
        #[serde(default)]
        theta: f64,
        #[serde(default)]
        phase: f64,
    },

    /// Piecewise linear through `(time, value)` points sorted by time.
    Pwl { points: Vec<(f64, f64)> },
}

impl Waveform {
    pub fn dc(value: f64) -> Self {
        Waveform::Dc { value }
    }

    pub fn pulse(v1: f64, v2: f64, td: f64, tr: f64, tf: f64, pw: f64, per: f64) -> Self {
        Waveform::Pulse {
            v1,
            v2,
            td,
            tr,
            tf,
            pw,
            per,
        }
    }

    pub fn sin(vo: f64, va: f64, freq: f64) -> Self {
        Waveform::Sin {
            vo,
            va,
            freq,
            td: 0.0,
            theta: 0.0,
            phase: 0.0,
        }
    }

    pub fn pwl(points: Vec<(f64, f64)>) -> Self {
        Waveform::Pwl { points }
    }

    /// Evaluate at `time`.
    pub fn value_at(&self, time: f64) -> f64 {
        match self {
            Waveform::Dc { value } => *value,
            Waveform::Pulse {
                v1,
                v2,
                td,
                tr,
                tf,
                pw,
                per,
            } => eval_pulse(*v1, *v2, *td, *tr, *tf, *pw, *per, time),
            Waveform::Sin {
                vo,
                va,
                freq,
                td,
                theta,
                phase,
            } => eval_sin(*vo, *va, *freq, *td, *theta, *phase, time),
            Waveform::Pwl { points } => eval_pwl(points, time),
        }
    }

    /// Value used by the DC operating point (the waveform at t = 0).
    pub fn dc_value(&self) -> f64 {
        self.value_at(0.0)
    }

    /// Corner times in `(after, until]`.
    pub fn breakpoints(&self, after: f64, until: f64, out: &mut Vec<BreakPoint>) {
        let mut push = |t: f64| {
            if t > after && t <= until {
                out.push(BreakPoint::simple(t));
            }
        };
        match self {
            Waveform::Dc { .. } => {}
            Waveform::Pulse {
                td, tr, tf, pw, per, ..
            } => {
                let corners = [0.0, *tr, tr + pw, tr + pw + tf];
                if *per > 0.0 {
                    // Skip whole periods that end before the window.
                    let first = if after > *td {
                        ((after - td) / per).floor().max(0.0) as u64
                    } else {
                        0
                    };
                    let mut k = first;
                    loop {
                        let base = td + k as f64 * per;
                        if base > until {
                            break;
                        }
                        for c in corners {
                            push(base + c);
                        }
                        k += 1;
                    }
                } else {
                    for c in corners {
                        push(td + c);
                    }
                }
            }
            Waveform::Sin { td, .. } => {
                if *td > 0.0 {
                    push(*td);
                }
            }
            Waveform::Pwl { points } => {
                for &(t, _) in points {
                    push(t);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn eval_pulse(v1: f64, v2: f64, td: f64, tr: f64, tf: f64, pw: f64, per: f64, t: f64) -> f64 {
    if t < td {
        return v1;
    }
    let t_rel = if per > 0.0 { (t - td) % per } else { t - td };

    if t_rel < tr {
        v1 + (v2 - v1) * t_rel / tr
    } else if t_rel < tr + pw {
        v2
    } else if t_rel < tr + pw + tf {
        v2 - (v2 - v1) * (t_rel - tr - pw) / tf
    } else {
        v1
    }
}

fn eval_sin(vo: f64, va: f64, freq: f64, td: f64, theta: f64, phase: f64, t: f64) -> f64 {
    let phase_rad = phase * PI / 180.0;
    if t < td {
        return vo + va * phase_rad.sin();
    }
    let t_rel = t - td;
    let damping = if theta > 0.0 {
        (-theta * t_rel).exp()
    } else {
        1.0
    };
    vo + va * damping * (2.0 * PI * freq * t_rel + phase_rad).sin()
}

fn eval_pwl(points: &[(f64, f64)], t: f64) -> f64 {
    let (Some(&(t_first, v_first)), Some(&(t_last, v_last))) = (points.first(), points.last())
    else {
        return 0.0;
    };
    if t <= t_first {
        return v_first;
    }
    if t >= t_last {
        return v_last;
    }
    for pair in points.windows(2) {
        let ((t0, v0), (t1, v1)) = (pair[0], pair[1]);
        if t >= t0 && t <= t1 {
            if t1 == t0 {
                return v1;
            }
            return v0 + (t - t0) / (t1 - t0) * (v1 - v0);
        }
    }
    v_last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_shape() {
        let w = Waveform::pulse(0.0, 5.0, 1e-3, 0.1e-3, 0.1e-3, 1e-3, 5e-3);

        assert_eq!(w.value_at(0.5e-3), 0.0);
        assert!((w.value_at(1.05e-3) - 2.5).abs() < 1e-10);
        assert!((w.value_at(1.5e-3) - 5.0).abs() < 1e-10);
        assert!((w.value_at(2.5e-3) - 0.0).abs() < 1e-10);
        // Second period
        assert!((w.value_at(6.5e-3) - 5.0).abs() < 1e-10);
        assert_eq!(w.dc_value(), 0.0);
    }

    #[test]
    fn pulse_breakpoints_cover_each_period() {
        let w = Waveform::pulse(0.0, 1.0, 1.0, 0.5, 0.5, 1.0, 4.0);
        let mut bps = Vec::new();
        w.breakpoints(0.0, 6.0, &mut bps);
        let times: Vec<f64> = bps.iter().map(|b| b.time).collect();
        assert_eq!(times, vec![1.0, 1.5, 2.5, 3.0, 5.0, 5.5]);

        bps.clear();
        w.breakpoints(5.2, 5.5, &mut bps);
        assert_eq!(bps.len(), 1);
        assert!((bps[0].time - 5.5).abs() < 1e-12);
    }

    #[test]
    fn sin_quarter_period() {
        let w = Waveform::sin(0.0, 1.0, 1000.0);
        assert!((w.value_at(0.25e-3) - 1.0).abs() < 1e-10);
        assert!((w.value_at(0.75e-3) + 1.0).abs() < 1e-10);
    }

    #[test]
    fn pwl_interpolates_and_holds() {
        let w = Waveform::pwl(vec![(0.0, 0.0), (1e-3, 5.0), (3e-3, 0.0)]);
        assert!((w.value_at(0.5e-3) - 2.5).abs() < 1e-10);
        assert!((w.value_at(2e-3) - 2.5).abs() < 1e-10);
        assert_eq!(w.value_at(5e-3), 0.0);

        let mut bps = Vec::new();
        w.breakpoints(0.0, 1.0, &mut bps);
        assert_eq!(bps.len(), 2);
    }

    #[test]
    fn waveform_from_json() {
        let w: Waveform =
            serde_json::from_str(r#"{"type":"pulse","v1":0,"v2":1,"tr":1e-9,"pw":1e-6}"#).unwrap();
        assert_eq!(w, Waveform::pulse(0.0, 1.0, 0.0, 1e-9, 0.0, 1e-6, 0.0));
    }
}
