//! Controlled sources: VCVS (E) and VCCS (G).

use ferrite_core::{DaeMatrix, JacHandle, Topology, VarId};
use nalgebra::DVector;

use crate::device::{Device, LoadContext, StampMap, add_to, expect_nodes};
use crate::error::Result;
use crate::spec::DeviceSpec;

/// Node names `[out+, out-, ctrl+, ctrl-]` resolved to unknowns.
#[derive(Debug, Clone, Default)]
struct FourTerminal {
    names: [String; 4],
    out_pos: Option<VarId>,
    out_neg: Option<VarId>,
    ctrl_pos: Option<VarId>,
    ctrl_neg: Option<VarId>,
}

impl FourTerminal {
    fn new(nodes: &[String]) -> Self {
        Self {
            names: [
                nodes[0].clone(),
                nodes[1].clone(),
                nodes[2].clone(),
                nodes[3].clone(),
            ],
            ..Default::default()
        }
    }

    fn register(&mut self, topo: &mut Topology) -> Result<()> {
        self.out_pos = topo.node(&self.names[0])?;
        self.out_neg = topo.node(&self.names[1])?;
        self.ctrl_pos = topo.node(&self.names[2])?;
        self.ctrl_neg = topo.node(&self.names[3])?;
        Ok(())
    }

    fn control_voltage(&self, ctx: &LoadContext<'_>) -> f64 {
        ctx.v_diff(self.ctrl_pos, self.ctrl_neg)
    }
}

/// Voltage-controlled voltage source.
///
/// V(out+, out-) = gain * V(ctrl+, ctrl-), with one branch-current unknown.
#[derive(Debug, Clone)]
pub struct Vcvs {
    name: String,
    terminals: FourTerminal,
    branch: Option<VarId>,
    gain: f64,
    stamp: StampMap,
}

impl Vcvs {
    pub fn from_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        expect_nodes(&spec.name, &spec.nodes, 4)?;
        Ok(Box::new(Self {
            name: spec.name.clone(),
            terminals: FourTerminal::new(&spec.nodes),
            branch: None,
            gain: spec.require_value()?,
            stamp: StampMap::default(),
        }))
    }
}

impl Device for Vcvs {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.terminals.register(topo)?;
        let br = Some(topo.branch(&self.name)?);
        self.branch = br;
        let t = &self.terminals;
        self.stamp = StampMap::new(&[
            (t.out_pos, br),
            (t.out_neg, br),
            (br, t.out_pos),
            (br, t.out_neg),
            (br, t.ctrl_pos),
            (br, t.ctrl_neg),
        ]);
        Ok(())
    }

    fn jacobian_stamp(&self) -> Vec<(VarId, VarId)> {
        self.stamp.pairs()
    }

    fn register_jac_lids(&mut self, handles: &[JacHandle]) {
        self.stamp.assign(handles);
    }

    fn load_dae_q(&self, _ctx: &LoadContext<'_>, _q: &mut DVector<f64>) -> bool {
        true
    }

    fn load_dae_f(&self, ctx: &LoadContext<'_>, f: &mut DVector<f64>) -> bool {
        let t = &self.terminals;
        let i = ctx.v(self.branch);
        add_to(f, t.out_pos, i);
        add_to(f, t.out_neg, -i);
        let vout = ctx.v_diff(t.out_pos, t.out_neg);
        add_to(f, self.branch, vout - self.gain * t.control_voltage(ctx));
        true
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, _dq_dx: &mut DaeMatrix) -> bool {
        true
    }

    fn load_df_dx(&self, _ctx: &LoadContext<'_>, df_dx: &mut DaeMatrix) -> bool {
        let entries = [1.0, -1.0, 1.0, -1.0, -self.gain, self.gain];
        for (k, value) in entries.into_iter().enumerate() {
            df_dx.add_opt(self.stamp.handle(k), value);
        }
        true
    }
}

/// Voltage-controlled current source.
///
/// A current `gm * V(ctrl+, ctrl-)` flows from out+ through the source to out-.
#[derive(Debug, Clone)]
pub struct Vccs {
    name: String,
    terminals: FourTerminal,
    gm: f64,
    stamp: StampMap,
}

impl Vccs {
    pub fn from_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        expect_nodes(&spec.name, &spec.nodes, 4)?;
        Ok(Box::new(Self {
            name: spec.name.clone(),
            terminals: FourTerminal::new(&spec.nodes),
            gm: spec.require_value()?,
            stamp: StampMap::default(),
        }))
    }
}

impl Device for Vccs {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.terminals.register(topo)?;
        let t = &self.terminals;
        self.stamp = StampMap::new(&[
            (t.out_pos, t.ctrl_pos),
            (t.out_pos, t.ctrl_neg),
            (t.out_neg, t.ctrl_pos),
            (t.out_neg, t.ctrl_neg),
        ]);
        Ok(())
    }

    fn jacobian_stamp(&self) -> Vec<(VarId, VarId)> {
        self.stamp.pairs()
    }

    fn register_jac_lids(&mut self, handles: &[JacHandle]) {
        self.stamp.assign(handles);
    }

    fn load_dae_q(&self, _ctx: &LoadContext<'_>, _q: &mut DVector<f64>) -> bool {
        true
    }

    fn load_dae_f(&self, ctx: &LoadContext<'_>, f: &mut DVector<f64>) -> bool {
        let i = self.gm * self.terminals.control_voltage(ctx);
        add_to(f, self.terminals.out_pos, i);
        add_to(f, self.terminals.out_neg, -i);
        true
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, _dq_dx: &mut DaeMatrix) -> bool {
        true
    }

    fn load_df_dx(&self, _ctx: &LoadContext<'_>, df_dx: &mut DaeMatrix) -> bool {
        let entries = [self.gm, -self.gm, -self.gm, self.gm];
        for (k, value) in entries.into_iter().enumerate() {
            df_dx.add_opt(self.stamp.handle(k), value);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AnalysisMode;

    #[test]
    fn vcvs_branch_residual() {
        let spec = DeviceSpec::new("E1", &["out", "0", "in", "0"], Some(10.0));
        let mut e = Vcvs::from_spec(&spec).unwrap();
        let mut topo = Topology::new();
        e.register_lids(&mut topo).unwrap();
        assert_eq!(topo.num_unknowns(), 3);
        assert_eq!(e.jacobian_stamp().len(), 3);

        // out = 2, in = 0.2, branch current 1e-3
        let x = DVector::from_vec(vec![2.0, 0.2, 1e-3]);
        let ctx = LoadContext {
            mode: AnalysisMode::DcOp,
            time: 0.0,
            solution: &x,
            curr_solution: &x,
            gmin: 0.0,
            iteration: 0,
        };
        let mut f = DVector::zeros(3);
        e.load_dae_f(&ctx, &mut f);
        assert!(f[2].abs() < 1e-12, "branch residual {}", f[2]);
        assert!((f[0] - 1e-3).abs() < 1e-15);
    }

    #[test]
    fn vccs_needs_four_nodes() {
        let spec = DeviceSpec::new("G1", &["out", "0"], Some(1e-3));
        assert!(Vccs::from_spec(&spec).is_err());
    }
}
