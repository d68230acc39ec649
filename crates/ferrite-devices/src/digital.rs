//! Digital logic gates with event-scheduled analog outputs.
//!
//! A gate reads its inputs at each accepted time point. When the logic
//! output changes, a transition is scheduled: after `delay` the output ramps
//! over `rise` (or `fall`) seconds to the new level. The start and end of a
//! pending ramp are reported as breakpoints so the integrator lands on both.
//!
//! Two node layouts exist:
//! - U-style: `[dpwr, dgnd, in..., out]`; the output swings between the
//!   supply node voltages and its current is returned through them.
//! - Y-style: `[in..., out]` with fixed `vlo`/`vhi` levels referenced to ground.

use ferrite_core::{BreakPoint, DaeMatrix, JacHandle, Topology, VarId};
use nalgebra::DVector;

use crate::device::{AnalysisMode, Device, LoadContext, StampMap, add_to};
use crate::error::{Error, Result};
use crate::spec::DeviceSpec;

/// Boolean function computed by a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Inv,
    Buf,
    And,
    Nand,
    Or,
    Nor,
    Xor,
}

impl GateKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "INV" | "NOT" => Some(Self::Inv),
            "BUF" => Some(Self::Buf),
            "AND" => Some(Self::And),
            "NAND" => Some(Self::Nand),
            "OR" => Some(Self::Or),
            "NOR" => Some(Self::Nor),
            "XOR" => Some(Self::Xor),
            _ => None,
        }
    }

    /// Allowed input count range.
    fn input_range(self) -> (usize, usize) {
        match self {
            Self::Inv | Self::Buf => (1, 1),
            _ => (2, usize::MAX),
        }
    }

    pub fn eval(self, inputs: &[bool]) -> bool {
        match self {
            Self::Inv => !inputs[0],
            Self::Buf => inputs[0],
            Self::And => inputs.iter().all(|&b| b),
            Self::Nand => !inputs.iter().all(|&b| b),
            Self::Or => inputs.iter().any(|&b| b),
            Self::Nor => !inputs.iter().any(|&b| b),
            Self::Xor => inputs.iter().filter(|&&b| b).count() % 2 == 1,
        }
    }
}

/// Where the output levels come from.
#[derive(Debug, Clone, PartialEq)]
enum Rails {
    Supply {
        names: [String; 2],
        dpwr: Option<VarId>,
        dgnd: Option<VarId>,
    },
    Fixed {
        vlo: f64,
        vhi: f64,
    },
}

/// Output ramp between two fractional levels (0 = low rail, 1 = high rail).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Transition {
    t0: f64,
    t1: f64,
    s0: f64,
    s1: f64,
}

impl Transition {
    fn constant(s: f64) -> Self {
        Self {
            t0: 0.0,
            t1: 0.0,
            s0: s,
            s1: s,
        }
    }

    fn level_at(&self, t: f64) -> f64 {
        if t <= self.t0 {
            self.s0
        } else if t >= self.t1 {
            self.s1
        } else {
            self.s0 + (self.s1 - self.s0) * (t - self.t0) / (self.t1 - self.t0)
        }
    }
}

/// Timing and drive parameters shared by both layouts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateTiming {
    pub delay: f64,
    pub rise: f64,
    pub fall: f64,
    pub r_out: f64,
}

impl Default for GateTiming {
    fn default() -> Self {
        Self {
            delay: 1e-9,
            rise: 1e-9,
            fall: 1e-9,
            r_out: 100.0,
        }
    }
}

impl GateTiming {
    fn from_spec(spec: &DeviceSpec) -> Self {
        let d = Self::default();
        Self {
            delay: spec.param_or("delay", d.delay),
            rise: spec.param_or("rise", d.rise),
            fall: spec.param_or("fall", d.fall),
            r_out: spec.param_or("rout", d.r_out),
        }
    }
}

/// A digital gate.
#[derive(Debug, Clone)]
pub struct DigitalGate {
    name: String,
    kind: GateKind,
    rails: Rails,
    input_names: Vec<String>,
    output_name: String,
    inputs: Vec<Option<VarId>>,
    output: Option<VarId>,
    timing: GateTiming,
    stamp: StampMap,
    /// Output level while solving the DC operating point.
    dc_level: f64,
    transition: Transition,
    logic: bool,
}

impl DigitalGate {
    /// U-style gate: nodes `[dpwr, dgnd, in..., out]`.
    pub fn from_u_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        let kind = Self::gate_kind(spec)?;
        if spec.nodes.len() < 4 {
            return Err(Error::NodeCount {
                name: spec.name.clone(),
                expected: "at least 4 (dpwr, dgnd, inputs, output)".to_string(),
                actual: spec.nodes.len(),
            });
        }
        let n = spec.nodes.len();
        let gate = Self::assemble(
            spec,
            kind,
            Rails::Supply {
                names: [spec.nodes[0].clone(), spec.nodes[1].clone()],
                dpwr: None,
                dgnd: None,
            },
            &spec.nodes[2..n - 1],
            &spec.nodes[n - 1],
        );
        gate.validate()?;
        Ok(Box::new(gate))
    }

    /// Y-style gate: nodes `[in..., out]`, levels from `vlo`/`vhi`.
    pub fn from_y_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        let kind = Self::gate_kind(spec)?;
        if spec.nodes.len() < 2 {
            return Err(Error::NodeCount {
                name: spec.name.clone(),
                expected: "at least 2 (inputs, output)".to_string(),
                actual: spec.nodes.len(),
            });
        }
        let n = spec.nodes.len();
        let gate = Self::assemble(
            spec,
            kind,
            Rails::Fixed {
                vlo: spec.param_or("vlo", 0.0),
                vhi: spec.param_or("vhi", 1.0),
            },
            &spec.nodes[..n - 1],
            &spec.nodes[n - 1],
        );
        gate.validate()?;
        Ok(Box::new(gate))
    }

    fn gate_kind(spec: &DeviceSpec) -> Result<GateKind> {
        let model = spec.model.as_deref().unwrap_or("");
        GateKind::from_name(model).ok_or_else(|| Error::InvalidDevice {
            name: spec.name.clone(),
            reason: format!("unknown gate type '{}'", model),
        })
    }

    fn assemble(
        spec: &DeviceSpec,
        kind: GateKind,
        rails: Rails,
        inputs: &[String],
        output: &str,
    ) -> Self {
        Self {
            name: spec.name.clone(),
            kind,
            rails,
            input_names: inputs.to_vec(),
            output_name: output.to_string(),
            inputs: Vec::new(),
            output: None,
            timing: GateTiming::from_spec(spec),
            stamp: StampMap::default(),
            dc_level: 0.0,
            transition: Transition::constant(0.0),
            logic: false,
        }
    }

    /// Checks shared by both constructors.
    fn validate(&self) -> Result<()> {
        let (lo, hi) = self.kind.input_range();
        let n = self.input_names.len();
        let invalid = |reason: String| Error::InvalidDevice {
            name: self.name.clone(),
            reason,
        };
        if n < lo || n > hi {
            return Err(invalid(format!("{:?} gate cannot take {} inputs", self.kind, n)));
        }
        let t = &self.timing;
        if t.delay < 0.0 || t.rise <= 0.0 || t.fall <= 0.0 {
            return Err(invalid("delay must be >= 0 and rise/fall > 0".to_string()));
        }
        if t.r_out <= 0.0 {
            return Err(invalid("output resistance must be positive".to_string()));
        }
        if let Rails::Fixed { vlo, vhi } = self.rails {
            if vhi <= vlo {
                return Err(invalid(format!("vhi ({}) must exceed vlo ({})", vhi, vlo)));
            }
        }
        if self.input_names.iter().any(|n| *n == self.output_name) {
            return Err(invalid("output node is also an input".to_string()));
        }
        Ok(())
    }

    fn rail_ids(&self) -> (Option<VarId>, Option<VarId>) {
        match self.rails {
            Rails::Supply { dpwr, dgnd, .. } => (dgnd, dpwr),
            Rails::Fixed { .. } => (None, None),
        }
    }

    fn rail_voltages(&self, ctx: &LoadContext<'_>) -> (f64, f64) {
        match self.rails {
            Rails::Supply { dpwr, dgnd, .. } => (ctx.v(dgnd), ctx.v(dpwr)),
            Rails::Fixed { vlo, vhi } => (vlo, vhi),
        }
    }

    fn read_logic(&self, ctx: &LoadContext<'_>) -> bool {
        let (vlo, vhi) = self.rail_voltages(ctx);
        let threshold = 0.5 * (vlo + vhi);
        let levels: Vec<bool> = self.inputs.iter().map(|&id| ctx.v(id) > threshold).collect();
        self.kind.eval(&levels)
    }

    /// Fractional output level used for the point being solved.
    fn level(&self, ctx: &LoadContext<'_>) -> f64 {
        match ctx.mode {
            AnalysisMode::DcOp => self.dc_level,
            AnalysisMode::Transient => self.transition.level_at(ctx.time),
        }
    }

    /// Output current into the gate and its target voltage.
    fn output_current(&self, ctx: &LoadContext<'_>) -> (f64, f64) {
        let s = self.level(ctx);
        let (vlo, vhi) = self.rail_voltages(ctx);
        let target = vlo + s * (vhi - vlo);
        ((ctx.v(self.output) - target) / self.timing.r_out, s)
    }
}

impl Device for DigitalGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_lids(&mut self, topo: &mut Topology) -> Result<()> {
        if let Rails::Supply { names, dpwr, dgnd } = &mut self.rails {
            *dpwr = topo.node(&names[0])?;
            *dgnd = topo.node(&names[1])?;
        }
        self.inputs = self
            .input_names
            .iter()
            .map(|n| topo.node(n))
            .collect::<ferrite_core::Result<_>>()?;
        self.output = topo.node(&self.output_name)?;

        let (lo, hi) = self.rail_ids();
        let out = self.output;
        self.stamp = StampMap::new(&[
            (out, out),
            (out, lo),
            (out, hi),
            (lo, out),
            (lo, lo),
            (lo, hi),
            (hi, out),
            (hi, lo),
            (hi, hi),
        ]);
        Ok(())
    }

    fn jacobian_stamp(&self) -> Vec<(VarId, VarId)> {
        self.stamp.pairs()
    }

    fn register_jac_lids(&mut self, handles: &[JacHandle]) {
        self.stamp.assign(handles);
    }

    fn update_primary_state(&mut self, ctx: &LoadContext<'_>, _state: &mut DVector<f64>) -> bool {
        if ctx.mode == AnalysisMode::DcOp {
            self.dc_level = if self.read_logic(ctx) { 1.0 } else { 0.0 };
        }
        true
    }

    fn load_dae_q(&self, _ctx: &LoadContext<'_>, _q: &mut DVector<f64>) -> bool {
        true
    }

    fn load_dae_f(&self, ctx: &LoadContext<'_>, f: &mut DVector<f64>) -> bool {
        let (i, s) = self.output_current(ctx);
        let (lo, hi) = self.rail_ids();
        add_to(f, self.output, i);
        add_to(f, hi, -s * i);
        add_to(f, lo, -(1.0 - s) * i);
        true
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, _dq_dx: &mut DaeMatrix) -> bool {
        true
    }

    fn load_df_dx(&self, ctx: &LoadContext<'_>, df_dx: &mut DaeMatrix) -> bool {
        let s = self.level(ctx);
        let g = 1.0 / self.timing.r_out;
        // d(i)/d(out, lo, hi)
        let di = [g, -(1.0 - s) * g, -s * g];
        // Rows: out gets +di, lo gets -(1-s)di, hi gets -s di.
        let rows = [1.0, -(1.0 - s), -s];
        for (r, &row_scale) in rows.iter().enumerate() {
            for (c, &dic) in di.iter().enumerate() {
                df_dx.add_opt(self.stamp.handle(3 * r + c), row_scale * dic);
            }
        }
        true
    }

    fn accept_step(&mut self, ctx: &LoadContext<'_>) {
        let logic = self.read_logic(ctx);
        match ctx.mode {
            AnalysisMode::DcOp => {
                self.logic = logic;
                self.transition = Transition::constant(if logic { 1.0 } else { 0.0 });
            }
            AnalysisMode::Transient => {
                if logic != self.logic {
                    let start = ctx.time + self.timing.delay;
                    let ramp = if logic {
                        self.timing.rise
                    } else {
                        self.timing.fall
                    };
                    self.transition = Transition {
                        t0: start,
                        t1: start + ramp,
                        s0: self.transition.level_at(start),
                        s1: if logic { 1.0 } else { 0.0 },
                    };
                    self.logic = logic;
                    log::debug!(
                        "{}: output -> {} at t={:.6e}",
                        self.name,
                        u8::from(logic),
                        start
                    );
                }
            }
        }
    }

    fn breakpoints(&self, after: f64, until: f64, out: &mut Vec<BreakPoint>) {
        if self.transition.t1 > self.transition.t0 {
            for t in [self.transition.t0, self.transition.t1] {
                if t > after && t <= until {
                    out.push(BreakPoint::simple(t));
                }
            }
        }
    }

    fn is_nonlinear(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_truth_tables() {
        assert!(GateKind::Nand.eval(&[true, false]));
        assert!(!GateKind::Nand.eval(&[true, true]));
        assert!(GateKind::Xor.eval(&[true, false, false]));
        assert!(!GateKind::Xor.eval(&[true, true]));
        assert!(GateKind::Nor.eval(&[false, false]));
        assert!(!GateKind::Inv.eval(&[true]));
    }

    #[test]
    fn constructors_share_validation() {
        let y = DeviceSpec::new("YINV", &["a", "b", "out"], None).with_model("INV");
        assert!(DigitalGate::from_y_spec(&y).is_err(), "INV takes one input");

        let u = DeviceSpec::new("U1", &["vdd", "0", "a", "out"], None).with_model("INV");
        assert!(DigitalGate::from_u_spec(&u).is_ok());

        let bad = DeviceSpec::new("U2", &["vdd", "0", "a", "out"], None)
            .with_model("INV")
            .with_param("rise", 0.0);
        assert!(DigitalGate::from_u_spec(&bad).is_err());

        let y = DeviceSpec::new("Y1", &["a", "out"], None)
            .with_model("BUF")
            .with_param("vlo", 1.0)
            .with_param("vhi", 0.5);
        assert!(DigitalGate::from_y_spec(&y).is_err());

        let unknown = DeviceSpec::new("Y2", &["a", "out"], None).with_model("DLTCH");
        assert!(DigitalGate::from_y_spec(&unknown).is_err());
    }

    #[test]
    fn transition_is_scheduled_after_delay() {
        let spec = DeviceSpec::new("Y1", &["a", "out"], None)
            .with_model("INV")
            .with_param("delay", 1e-9)
            .with_param("rise", 2e-9)
            .with_param("vhi", 5.0);
        let mut gate = DigitalGate::from_y_spec(&spec).unwrap();
        let mut topo = Topology::new();
        gate.register_lids(&mut topo).unwrap();

        // Input high at DC: output low.
        let x = DVector::from_vec(vec![5.0, 0.0]);
        let mut ctx = LoadContext {
            mode: AnalysisMode::DcOp,
            time: 0.0,
            solution: &x,
            curr_solution: &x,
            gmin: 0.0,
            iteration: 0,
        };
        gate.accept_step(&ctx);

        // Input falls at t = 10ns: output rises from 11ns to 13ns.
        let x_low = DVector::from_vec(vec![0.0, 0.0]);
        ctx.mode = AnalysisMode::Transient;
        ctx.time = 10e-9;
        ctx.solution = &x_low;
        gate.accept_step(&ctx);

        let mut bps = Vec::new();
        gate.breakpoints(10e-9, 1.0, &mut bps);
        assert_eq!(bps.len(), 2);
        assert!((bps[0].time - 11e-9).abs() < 1e-18);
        assert!((bps[1].time - 13e-9).abs() < 1e-18);

        // Halfway through the ramp the output is driven toward 2.5 V.
        ctx.time = 12e-9;
        let mut f = DVector::zeros(2);
        gate.load_dae_f(&ctx, &mut f);
        assert!((f[1] + 2.5 / 100.0).abs() < 1e-12, "f[out] = {}", f[1]);
    }
}
