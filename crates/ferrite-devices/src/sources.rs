//! Independent voltage and current sources.

use ferrite_core::{BreakPoint, DaeMatrix, JacHandle, Topology, VarId};
use nalgebra::DVector;

use crate::device::{
    AnalysisMode, Device, LoadContext, StampMap, VsourceRow, add_to, expect_nodes, expect_primary,
};
use crate::error::{Error, Result};
use crate::spec::DeviceSpec;
use crate::waveforms::Waveform;

fn waveform_from_spec(spec: &DeviceSpec) -> Result<Waveform> {
    match (&spec.waveform, spec.value) {
        (Some(w), _) => Ok(w.clone()),
        (None, Some(v)) => Ok(Waveform::dc(v)),
        (None, None) => Err(Error::MissingParameter {
            name: spec.name.clone(),
            param: "value or waveform".to_string(),
        }),
    }
}

/// Level set by a sweep; any time dependence is dropped.
fn swept_level(name: &str, param: &str, value: f64) -> Result<Waveform> {
    expect_primary(name, "DC", param)?;
    if !value.is_finite() {
        return Err(Error::InvalidDevice {
            name: name.to_string(),
            reason: format!("source level must be finite, got {}", value),
        });
    }
    Ok(Waveform::dc(value))
}

fn source_value(waveform: &Waveform, ctx: &LoadContext<'_>) -> f64 {
    match ctx.mode {
        AnalysisMode::DcOp => waveform.dc_value(),
        AnalysisMode::Transient => waveform.value_at(ctx.time),
    }
}

/// Independent voltage source with a branch-current unknown.
///
/// `F[p] += i`, `F[n] -= i`, `F[br] = v(p) - v(n) - V(t)`.
#[derive(Debug, Clone)]
pub struct VoltageSource {
    name: String,
    nodes: [String; 2],
    pos: Option<VarId>,
    neg: Option<VarId>,
    branch: Option<VarId>,
    waveform: Waveform,
    stamp: StampMap,
}

impl VoltageSource {
    pub fn new(name: impl Into<String>, pos: &str, neg: &str, waveform: Waveform) -> Self {
        Self {
            name: name.into(),
            nodes: [pos.to_string(), neg.to_string()],
            pos: None,
            neg: None,
            branch: None,
            waveform,
            stamp: StampMap::default(),
        }
    }

    pub fn from_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        expect_nodes(&spec.name, &spec.nodes, 2)?;
        let waveform = waveform_from_spec(spec)?;
        Ok(Box::new(Self::new(
            &spec.name,
            &spec.nodes[0],
            &spec.nodes[1],
            waveform,
        )))
    }

    pub fn waveform(&self) -> &Waveform {
        &self.waveform
    }
}

impl Device for VoltageSource {
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
        self.waveform = swept_level(&self.name, param, value)?;
        Ok(())
    }

    fn load_dae_q(&self, _ctx: &LoadContext<'_>, _q: &mut DVector<f64>) -> bool {
        true
    }

    fn load_dae_f(&self, ctx: &LoadContext<'_>, f: &mut DVector<f64>) -> bool {
        let i = ctx.v(self.branch);
        add_to(f, self.pos, i);
        add_to(f, self.neg, -i);
        let v = source_value(&self.waveform, ctx);
        add_to(f, self.branch, ctx.v_diff(self.pos, self.neg) - v);
        true
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, _dq_dx: &mut DaeMatrix) -> bool {
        true
    }

    fn load_df_dx(&self, _ctx: &LoadContext<'_>, df_dx: &mut DaeMatrix) -> bool {
        df_dx.add_opt(self.stamp.handle(0), 1.0);
        df_dx.add_opt(self.stamp.handle(1), -1.0);
        df_dx.add_opt(self.stamp.handle(2), 1.0);
        df_dx.add_opt(self.stamp.handle(3), -1.0);
        true
    }

    fn breakpoints(&self, after: f64, until: f64, out: &mut Vec<BreakPoint>) {
        self.waveform.breakpoints(after, until, out);
    }

    fn voltage_source_row(&self) -> Option<VsourceRow> {
        Some(VsourceRow {
            device: self.name.clone(),
            row: self.branch?,
            pos_node: self.nodes[0].clone(),
            neg_node: self.nodes[1].clone(),
        })
    }
}

/// Independent current source; current flows from `pos` through the source to `neg`.
#[derive(Debug, Clone)]
pub struct CurrentSource {
    name: String,
    nodes: [String; 2],
    pos: Option<VarId>,
    neg: Option<VarId>,
    waveform: Waveform,
}

impl CurrentSource {
    pub fn new(name: impl Into<String>, pos: &str, neg: &str, waveform: Waveform) -> Self {
        Self {
            name: name.into(),
            nodes: [pos.to_string(), neg.to_string()],
            pos: None,
            neg: None,
            waveform,
        }
    }

    pub fn from_spec(spec: &DeviceSpec) -> Result<Box<dyn Device>> {
        expect_nodes(&spec.name, &spec.nodes, 2)?;
        let waveform = waveform_from_spec(spec)?;
        Ok(Box::new(Self::new(
            &spec.name,
            &spec.nodes[0],
            &spec.nodes[1],
            waveform,
        )))
    }
}

impl Device for CurrentSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_lids(&mut self, topo: &mut Topology) -> Result<()> {
        self.pos = topo.node(&self.nodes[0])?;
        self.neg = topo.node(&self.nodes[1])?;
        Ok(())
    }

    fn jacobian_stamp(&self) -> Vec<(VarId, VarId)> {
        Vec::new()
    }

    fn register_jac_lids(&mut self, _handles: &[JacHandle]) {}

    fn set_param(&mut self, param: &str, value: f64) -> Result<()> {
        self.waveform = swept_level(&self.name, param, value)?;
        Ok(())
    }

    fn load_dae_q(&self, _ctx: &LoadContext<'_>, _q: &mut DVector<f64>) -> bool {
        true
    }

    fn load_dae_f(&self, ctx: &LoadContext<'_>, f: &mut DVector<f64>) -> bool {
        let i = source_value(&self.waveform, ctx);
        add_to(f, self.pos, i);
        add_to(f, self.neg, -i);
        true
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, _dq_dx: &mut DaeMatrix) -> bool {
        true
    }

    fn load_df_dx(&self, _ctx: &LoadContext<'_>, _df_dx: &mut DaeMatrix) -> bool {
        true
    }

    fn breakpoints(&self, after: f64, until: f64, out: &mut Vec<BreakPoint>) {
        self.waveform.breakpoints(after, until, out);
    }
}
