//! Junction diode with pn-junction voltage limiting.

use ferrite_core::{DaeMatrix, JacHandle, Topology, VarId};
use nalgebra::DVector;

use crate::device::{Device, LoadContext, StampMap, add_to, expect_nodes};
use crate::error::{Error, Result};
use crate::spec::DeviceSpec;

/// Thermal voltage kT/q at 300.15 K.
pub const VT_300K: f64 = 0.025_864;

/// Diode model parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiodeParams {
    /// Saturation current (A).
    pub is: f64,
    /// Emission coefficient.
    pub n: f64,
    /// Zero-bias junction capacitance (F), held constant.
    pub cj0: f64,
    /// Transit time (s).
    pub tt: f64,
}

impl Default for DiodeParams {
    fn default() -> Self {
        Self {
            is: 1e-14,
            n: 1.0,
            cj0: 0.0,
            tt: 0.0,
        }
    }
}

impl DiodeParams {
    fn nvt(&self) -> f64 {
        self.n * VT_300K
    }

    /// Voltage above which the exponential is limited.
    pub fn vcrit(&self) -> f64 {
        let nvt = self.nvt();
        nvt * (nvt / (std::f64::consts::SQRT_2 * self.is)).ln()
    }

    /// Junction current and conductance at `v`.
    pub fn evaluate(&self, v: f64) -> (f64, f64) {
        let nvt = self.nvt();
        let e = (v / nvt).min(80.0).exp();
        (self.is * (e - 1.0), self.is * e / nvt)
    }
}

/// SPICE pn-junction limiting of a Newton update from `v_old` to `v_new`.
pub fn pnjlim(v_new: f64, v_old: f64, nvt: f64, vcrit: f64) -> f64 {
    if v_new > vcrit && (v_new - v_old).abs() > 2.0 * nvt {
        if v_old > 0.0 {
            let arg = 1.0 + (v_new - v_old) / nvt;
            if arg > 0.0 {
                v_old + nvt * arg.ln()
            } else {
                vcrit
            }
        } else {
            nvt * (v_new / nvt).ln()
        }
    } else {
        v_new
    }
}

/// Junction diode between anode and cathode.
///
/// The controlling voltage is limited against the previous Newton iterate.
/// The limiting reference advances only when the iteration counter in the
/// load context changes, so repeated loads at one iterate are identical.
#[derive(Debug, Clone)]
pub struct Diode {
    name: String,
    nodes: [String; 2],
    anode: Option<VarId>,
    cathode: Option<VarId>,
    params: DiodeParams,
    stamp: StampMap,
    v_ref: f64,
    v_pending: f64,
    v_limited: f64,
    iteration: Option<u64>,
}

impl Diode {
    pub fn new(name: impl Into<String>, anode: &str, cathode: &str, params: DiodeParams) -> Self {
        Self {
            name: name.into(),
            nodes: [anode.to_string(), cathode.to_string()],
            anode: None,
            cathode: None,
            params,
            stamp: StampMap::default(),
            v_ref: 0.0,
            v_pending: 0.0,
            v_limited: 0.0,
            iteration: None,
        }
    }

    pub fn from_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        expect_nodes(&spec.name, &spec.nodes, 2)?;
        let defaults = DiodeParams::default();
        let params = DiodeParams {
            is: spec.param_or("is", defaults.is),
            n: spec.param_or("n", defaults.n),
            cj0: spec.param_or("cj0", defaults.cj0),
            tt: spec.param_or("tt", defaults.tt),
        };
        if params.is <= 0.0 || params.n <= 0.0 {
            return Err(Error::InvalidDevice {
                name: spec.name.clone(),
                reason: "IS and N must be positive".to_string(),
            });
        }
        Ok(Box::new(Self::new(
            &spec.name,
            &spec.nodes[0],
            &spec.nodes[1],
            params,
        )))
    }

    /// Linearized junction current at the actual voltage, plus conductance.
    fn linearized(&self, v: f64, gmin: f64) -> (f64, f64) {
        let (id, gd) = self.params.evaluate(self.v_limited);
        let i = id + gd * (v - self.v_limited) + gmin * v;
        (i, gd + gmin)
    }
}

impl Device for Diode {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.anode = topo.node(&self.nodes[0])?;
        self.cathode = topo.node(&self.nodes[1])?;
        let (a, k) = (self.anode, self.cathode);
        self.stamp = StampMap::new(&[(a, a), (a, k), (k, a), (k, k)]);
        Ok(())
    }

    fn jacobian_stamp(&self) -> Vec<(VarId, VarId)> {
        self.stamp.pairs()
    }

    fn register_jac_lids(&mut self, handles: &[JacHandle]) {
        self.stamp.assign(handles);
    }

    fn update_primary_state(&mut self, ctx: &LoadContext<'_>, _state: &mut DVector<f64>) -> bool {
        if self.iteration != Some(ctx.iteration) {
            if self.iteration.is_some() {
                self.v_ref = self.v_pending;
            }
            self.iteration = Some(ctx.iteration);
        }
        let v = ctx.v_diff(self.anode, self.cathode);
        self.v_limited = pnjlim(v, self.v_ref, self.params.nvt(), self.params.vcrit());
        self.v_pending = self.v_limited;
        self.v_limited.is_finite()
    }

    fn load_dae_q(&self, ctx: &LoadContext<'_>, q: &mut DVector<f64>) -> bool {
        let v = ctx.v_diff(self.anode, self.cathode);
        let (i, _) = self.linearized(v, 0.0);
        let charge = self.params.cj0 * v + self.params.tt * i;
        add_to(q, self.anode, charge);
        add_to(q, self.cathode, -charge);
        true
    }

    fn load_dae_f(&self, ctx: &LoadContext<'_>, f: &mut DVector<f64>) -> bool {
        let v = ctx.v_diff(self.anode, self.cathode);
        let (i, _) = self.linearized(v, ctx.gmin);
        add_to(f, self.anode, i);
        add_to(f, self.cathode, -i);
        i.is_finite()
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, dq_dx: &mut DaeMatrix) -> bool {
        let (_, gd) = self.params.evaluate(self.v_limited);
        let c = self.params.cj0 + self.params.tt * gd;
        let entries = [c, -c, -c, c];
        for (k, value) in entries.into_iter().enumerate() {
            dq_dx.add_opt(self.stamp.handle(k), value);
        }
        true
    }

    fn load_df_dx(&self, ctx: &LoadContext<'_>, df_dx: &mut DaeMatrix) -> bool {
        let v = ctx.v_diff(self.anode, self.cathode);
        let (_, g) = self.linearized(v, ctx.gmin);
        let entries = [g, -g, -g, g];
        for (k, value) in entries.into_iter().enumerate() {
            df_dx.add_opt(self.stamp.handle(k), value);
        }
        true
    }

    fn accept_step(&mut self, ctx: &LoadContext<'_>) {
        self.v_ref = ctx.v_diff(self.anode, self.cathode);
        self.v_pending = self.v_ref;
    }

    fn is_nonlinear(&self) -> bool {
        true
    }
}
