//! Passive elements: resistor, capacitor, inductor.

use ferrite_core::{DaeMatrix, JacHandle, StateSlot, StoreSlot, Topology, VarId};
use nalgebra::DVector;

use crate::device::{Device, LoadContext, StampMap, add_to, expect_nodes, expect_primary};
use crate::error::{Error, Result};
use crate::spec::DeviceSpec;

/// Two-terminal conductance pattern: (p,p), (p,n), (n,p), (n,n).
fn two_terminal_stamp(pos: Option<VarId>, neg: Option<VarId>) -> StampMap {
    StampMap::new(&[(pos, pos), (pos, neg), (neg, pos), (neg, neg)])
}

/// Add `g` in the two-terminal pattern starting at stamp index 0.
fn load_two_terminal(m: &mut DaeMatrix, stamp: &StampMap, g: f64) {
    m.add_opt(stamp.handle(0), g);
    m.add_opt(stamp.handle(1), -g);
    m.add_opt(stamp.handle(2), -g);
    m.add_opt(stamp.handle(3), g);
}

fn check_positive(name: &str, value: f64) -> Result<f64> {
    if !(value.is_finite() && value > 0.0) {
        return Err(Error::InvalidDevice {
            name: name.to_string(),
            reason: format!("value must be positive and finite, got {}", value),
        });
    }
    Ok(value)
}

fn positive_value(spec: &DeviceSpec) -> Result<f64> {
    check_positive(&spec.name, spec.require_value()?)
}

/// Linear resistor. Stores its lead current.
#[derive(Debug, Clone)]
pub struct Resistor {
    name: String,
    nodes: [String; 2],
    pos: Option<VarId>,
    neg: Option<VarId>,
    conductance: f64,
    store: Option<StoreSlot>,
    stamp: StampMap,
}

impl Resistor {
    pub fn new(name: impl Into<String>, pos: &str, neg: &str, resistance: f64) -> Self {
        Self {
            name: name.into(),
            nodes: [pos.to_string(), neg.to_string()],
            pos: None,
            neg: None,
            conductance: 1.0 / resistance,
            store: None,
            stamp: StampMap::default(),
        }
    }

    pub fn from_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        expect_nodes(&spec.name, &spec.nodes, 2)?;
        let r = positive_value(spec)?;
        Ok(Box::new(Self::new(&spec.name, &spec.nodes[0], &spec.nodes[1], r)))
    }
}

impl Device for Resistor {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.pos = topo.node(&self.nodes[0])?;
        self.neg = topo.node(&self.nodes[1])?;
        self.stamp = two_terminal_stamp(self.pos, self.neg);
        Ok(())
    }

    fn register_store_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.store = Some(topo.alloc_store(1)?);
        Ok(())
    }

    fn jacobian_stamp(&self) -> Vec<(VarId, VarId)> {
        self.stamp.pairs()
    }

    fn register_jac_lids(&mut self, handles: &[JacHandle]) {
        self.stamp.assign(handles);
    }

    fn update_secondary_state(
        &mut self,
        ctx: &LoadContext<'_>,
        _state_deriv: &DVector<f64>,
        store: &mut DVector<f64>,
    ) -> bool {
        if let Some(slot) = self.store {
            store[slot.at(0)] = self.conductance * ctx.v_diff(self.pos, self.neg);
        }
        true
    }

    fn set_param(&mut self, param: &str, value: f64) -> Result<()> {
        expect_primary(&self.name, "R", param)?;
        self.conductance = check_positive(&self.name, value)?.recip();
        Ok(())
    }

    fn load_dae_q(&self, _ctx: &LoadContext<'_>, _q: &mut DVector<f64>) -> bool {
        true
    }

    fn load_dae_f(&self, ctx: &LoadContext<'_>, f: &mut DVector<f64>) -> bool {
        let i = self.conductance * ctx.v_diff(self.pos, self.neg);
        add_to(f, self.pos, i);
        add_to(f, self.neg, -i);
        true
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, _dq_dx: &mut DaeMatrix) -> bool {
        true
    }

    fn load_df_dx(&self, _ctx: &LoadContext<'_>, df_dx: &mut DaeMatrix) -> bool {
        load_two_terminal(df_dx, &self.stamp, self.conductance);
        true
    }
}

/// Linear capacitor.
///
/// Its charge is kept as device state; the state derivative supplied by the
/// integrator gives the capacitor current, which is stored for output.
#[derive(Debug, Clone)]
pub struct Capacitor {
    name: String,
    nodes: [String; 2],
    pos: Option<VarId>,
    neg: Option<VarId>,
    capacitance: f64,
    state: Option<StateSlot>,
    store: Option<StoreSlot>,
    stamp: StampMap,
}

impl Capacitor {
    pub fn new(name: impl Into<String>, pos: &str, neg: &str, capacitance: f64) -> Self {
        Self {
            name: name.into(),
            nodes: [pos.to_string(), neg.to_string()],
            pos: None,
            neg: None,
            capacitance,
            state: None,
            store: None,
            stamp: StampMap::default(),
        }
    }

    pub fn from_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        expect_nodes(&spec.name, &spec.nodes, 2)?;
        let c = positive_value(spec)?;
        Ok(Box::new(Self::new(&spec.name, &spec.nodes[0], &spec.nodes[1], c)))
    }
}

impl Device for Capacitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.pos = topo.node(&self.nodes[0])?;
        self.neg = topo.node(&self.nodes[1])?;
        self.stamp = two_terminal_stamp(self.pos, self.neg);
        Ok(())
    }

    fn register_state_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.state = Some(topo.alloc_state(1)?);
        Ok(())
    }

    fn register_store_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.store = Some(topo.alloc_store(1)?);
        Ok(())
    }

    fn jacobian_stamp(&self) -> Vec<(VarId, VarId)> {
        self.stamp.pairs()
    }

    fn register_jac_lids(&mut self, handles: &[JacHandle]) {
        self.stamp.assign(handles);
    }

    fn update_primary_state(&mut self, ctx: &LoadContext<'_>, state: &mut DVector<f64>) -> bool {
        if let Some(slot) = self.state {
            state[slot.at(0)] = self.capacitance * ctx.v_diff(self.pos, self.neg);
        }
        true
    }

    fn update_secondary_state(
        &mut self,
        _ctx: &LoadContext<'_>,
        state_deriv: &DVector<f64>,
        store: &mut DVector<f64>,
    ) -> bool {
        if let (Some(state), Some(out)) = (self.state, self.store) {
            store[out.at(0)] = state_deriv[state.at(0)];
        }
        true
    }

    fn set_param(&mut self, param: &str, value: f64) -> Result<()> {
        expect_primary(&self.name, "C", param)?;
        self.capacitance = check_positive(&self.name, value)?;
        Ok(())
    }

    fn load_dae_q(&self, ctx: &LoadContext<'_>, q: &mut DVector<f64>) -> bool {
        let charge = self.capacitance * ctx.v_diff(self.pos, self.neg);
        add_to(q, self.pos, charge);
        add_to(q, self.neg, -charge);
        true
    }

    fn load_dae_f(&self, _ctx: &LoadContext<'_>, _f: &mut DVector<f64>) -> bool {
        true
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, dq_dx: &mut DaeMatrix) -> bool {
        load_two_terminal(dq_dx, &self.stamp, self.capacitance);
        true
    }

    fn load_df_dx(&self, _ctx: &LoadContext<'_>, _df_dx: &mut DaeMatrix) -> bool {
        true
    }
}

/// Linear inductor with a branch-current unknown.
///
/// Branch equation: `v(p) - v(n) - L di/dt = 0`, written as
/// `F[br] = v(p) - v(n)` and `Q[br] = -L i`.
#[derive(Debug, Clone)]
pub struct Inductor {
    name: String,
    nodes: [String; 2],
    pos: Option<VarId>,
    neg: Option<VarId>,
    branch: Option<VarId>,
    inductance: f64,
    stamp: StampMap,
}

impl Inductor {
    pub fn new(name: impl Into<String>, pos: &str, neg: &str, inductance: f64) -> Self {
        Self {
            name: name.into(),
            nodes: [pos.to_string(), neg.to_string()],
            pos: None,
            neg: None,
            branch: None,
            inductance,
            stamp: StampMap::default(),
        }
    }

    pub fn from_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        expect_nodes(&spec.name, &spec.nodes, 2)?;
        let l = positive_value(spec)?;
        Ok(Box::new(Self::new(&spec.name, &spec.nodes[0], &spec.nodes[1], l)))
    }
}

impl Device for Inductor {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.pos = topo.node(&self.nodes[0])?;
        self.neg = topo.node(&self.nodes[1])?;
        let br = Some(topo.branch(&self.name)?);
        self.branch = br;
        self.stamp = StampMap::new(&[
            (self.pos, br),
            (self.neg, br),
            (br, self.pos),
            (br, self.neg),
            (br, br),
        ]);
        Ok(())
    }

    fn jacobian_stamp(&self) -> Vec<(VarId, VarId)> {
        self.stamp.pairs()
    }

    fn register_jac_lids(&mut self, handles: &[JacHandle]) {
        self.stamp.assign(handles);
    }

    fn set_param(&mut self, param: &str, value: f64) -> Result<()> {
        expect_primary(&self.name, "L", param)?;
        self.inductance = check_positive(&self.name, value)?;
        Ok(())
    }

    fn load_dae_q(&self, ctx: &LoadContext<'_>, q: &mut DVector<f64>) -> bool {
        add_to(q, self.branch, -self.inductance * ctx.v(self.branch));
        true
    }

    fn load_dae_f(&self, ctx: &LoadContext<'_>, f: &mut DVector<f64>) -> bool {
        let i = ctx.v(self.branch);
        add_to(f, self.pos, i);
        add_to(f, self.neg, -i);
        add_to(f, self.branch, ctx.v_diff(self.pos, self.neg));
        true
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, dq_dx: &mut DaeMatrix) -> bool {
        dq_dx.add_opt(self.stamp.handle(4), -self.inductance);
        true
    }

    fn load_df_dx(&self, _ctx: &LoadContext<'_>, df_dx: &mut DaeMatrix) -> bool {
        df_dx.add_opt(self.stamp.handle(0), 1.0);
        df_dx.add_opt(self.stamp.handle(1), -1.0);
        df_dx.add_opt(self.stamp.handle(2), 1.0);
        df_dx.add_opt(self.stamp.handle(3), -1.0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AnalysisMode;
    use ferrite_core::SparsityBuilder;
    use std::sync::Arc;

    fn setup(dev: &mut dyn Device) -> (Topology, DaeMatrix) {
        let mut topo = Topology::new();
        dev.register_lids(&mut topo).unwrap();
        dev.register_state_lids(&mut topo).unwrap();
        dev.register_store_lids(&mut topo).unwrap();
        topo.finalize();
        let mut builder = SparsityBuilder::new(topo.num_unknowns());
        let handles: Vec<_> = dev
            .jacobian_stamp()
            .into_iter()
            .map(|(r, c)| builder.request(r, c).unwrap())
            .collect();
        dev.register_jac_lids(&handles);
        builder.ensure_diagonal();
        (topo, DaeMatrix::new(Arc::new(builder.finalize())))
    }

    fn ctx<'a>(x: &'a DVector<f64>) -> LoadContext<'a> {
        LoadContext {
            mode: AnalysisMode::Transient,
            time: 0.0,
            solution: x,
            curr_solution: x,
            gmin: 0.0,
            iteration: 0,
        }
    }

    #[test]
    fn resistor_to_ground() {
        let mut r = Resistor::new("R1", "a", "0", 2.0);
        let (_, mut m) = setup(&mut r);
        let x = DVector::from_vec(vec![4.0]);
        let mut f = DVector::zeros(1);
        r.load_dae_f(&ctx(&x), &mut f);
        r.load_df_dx(&ctx(&x), &mut m);
        assert!((f[0] - 2.0).abs() < 1e-15);
        assert!((m.get(0, 0) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn resistance_can_be_reset() {
        let mut r = Resistor::new("R1", "a", "0", 2.0);
        setup(&mut r);
        r.set_param("r", 4.0).unwrap();
        let x = DVector::from_vec(vec![4.0]);
        let mut f = DVector::zeros(1);
        r.load_dae_f(&ctx(&x), &mut f);
        assert!((f[0] - 1.0).abs() < 1e-15);

        assert!(r.set_param("", 0.0).is_err());
        assert!(matches!(r.set_param("C", 1.0), Err(Error::UnknownParameter { .. })));
    }

    #[test]
    fn capacitor_charge_and_state() {
        let mut c = Capacitor::new("C1", "a", "b", 1e-6);
        let (topo, mut m) = setup(&mut c);
        assert_eq!(topo.num_states(), 1);
        let x = DVector::from_vec(vec![3.0, 1.0]);
        let mut q = DVector::zeros(2);
        let mut s = DVector::zeros(1);
        c.update_primary_state(&ctx(&x), &mut s);
        c.load_dae_q(&ctx(&x), &mut q);
        c.load_dq_dx(&ctx(&x), &mut m);
        assert!((s[0] - 2e-6).abs() < 1e-18);
        assert!((q[0] - 2e-6).abs() < 1e-18);
        assert!((q[1] + 2e-6).abs() < 1e-18);
        assert!((m.get(0, 1) + 1e-6).abs() < 1e-18);
    }

    #[test]
    fn inductor_branch_equation() {
        let mut l = Inductor::new("L1", "a", "0", 1e-3);
        let (topo, mut m) = setup(&mut l);
        assert_eq!(topo.num_unknowns(), 2);
        let x = DVector::from_vec(vec![1.0, 0.5]);
        let mut f = DVector::zeros(2);
        let mut q = DVector::zeros(2);
        l.load_dae_f(&ctx(&x), &mut f);
        l.load_dae_q(&ctx(&x), &mut q);
        l.load_dq_dx(&ctx(&x), &mut m);
        assert!((f[0] - 0.5).abs() < 1e-15);
        assert!((f[1] - 1.0).abs() < 1e-15);
        assert!((q[1] + 0.5e-3).abs() < 1e-18);
        assert!((m.get(1, 1) + 1e-3).abs() < 1e-18);
    }

    #[test]
    fn negative_resistance_rejected() {
        let spec = DeviceSpec::new("R1", &["a", "0"], Some(-1.0));
        assert!(Resistor::from_spec(&spec).is_err());
    }
}
