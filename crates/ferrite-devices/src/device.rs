//! The device capability interface.

use ferrite_core::{BreakPoint, DaeMatrix, JacHandle, Topology, VarId};
use nalgebra::DVector;

use crate::error::{Error, Result};

/// Which analysis is loading the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    /// DC operating point: sources at their time-zero value, digital outputs settle instantly.
    DcOp,
    /// Time stepping.
    Transient,
}

/// Everything a device may read during a load.
///
/// Passed explicitly into every call; devices never consult global solver state.
#[derive(Debug, Clone, Copy)]
pub struct LoadContext<'a> {
    pub mode: AnalysisMode,
    /// Time of the point being solved.
    pub time: f64,
    /// Solution at the point being solved (the Newton iterate).
    pub solution: &'a DVector<f64>,
    /// Solution at the last accepted point.
    pub curr_solution: &'a DVector<f64>,
    /// Conductance added across nonlinear junctions.
    pub gmin: f64,
    /// Monotonic Newton iteration counter. Devices that limit their
    /// controlling voltages refresh the limiting reference only when it changes.
    pub iteration: u64,
}

impl<'a> LoadContext<'a> {
    /// Unknown value, or zero for ground.
    #[inline]
    pub fn v(&self, id: Option<VarId>) -> f64 {
        id.map(|i| self.solution[i.index()]).unwrap_or(0.0)
    }

    /// Voltage difference between two nodes.
    #[inline]
    pub fn v_diff(&self, pos: Option<VarId>, neg: Option<VarId>) -> f64 {
        self.v(pos) - self.v(neg)
    }
}

/// Branch row of an independent voltage source, used to build MOR ports.
#[derive(Debug, Clone, PartialEq)]
pub struct VsourceRow {
    pub device: String,
    pub row: VarId,
    pub pos_node: String,
    pub neg_node: String,
}

/// Uniform capability interface implemented by every device model.
///
/// Registration calls run once, in order, before any numeric work:
/// `register_lids`, `register_state_lids`, `register_store_lids`,
/// `jacobian_stamp`, `register_jac_lids`. Load calls accumulate into shared
/// vectors and matrices at the device's own entries only, and return `false`
/// when the device hits a condition that must fail the current step.
pub trait Device: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Create or look up the unknowns this device touches.
    fn register_lids(&mut self, topo: &mut Topology) -> Result<()>;

    fn register_state_lids(&mut self, _topo: &mut Topology) -> Result<()> {
        Ok(())
    }

    fn register_store_lids(&mut self, _topo: &mut Topology) -> Result<()> {
        Ok(())
    }

    /// Jacobian entries this device writes, in a fixed order.
    fn jacobian_stamp(&self) -> Vec<(VarId, VarId)>;

    /// Handles for the entries of [`Device::jacobian_stamp`], in the same order.
    fn register_jac_lids(&mut self, handles: &[JacHandle]);

    /// Recompute internal state (written to `state`) before loading.
    fn update_primary_state(&mut self, _ctx: &LoadContext<'_>, _state: &mut DVector<f64>) -> bool {
        true
    }

    /// Recompute output quantities once state derivatives are known.
    fn update_secondary_state(
        &mut self,
        _ctx: &LoadContext<'_>,
        _state_deriv: &DVector<f64>,
        _store: &mut DVector<f64>,
    ) -> bool {
        true
    }

    fn load_dae_q(&self, ctx: &LoadContext<'_>, q: &mut DVector<f64>) -> bool;

    fn load_dae_f(&self, ctx: &LoadContext<'_>, f: &mut DVector<f64>) -> bool;

    fn load_dq_dx(&self, ctx: &LoadContext<'_>, dq_dx: &mut DaeMatrix) -> bool;

    fn load_df_dx(&self, ctx: &LoadContext<'_>, df_dx: &mut DaeMatrix) -> bool;

    /// Known discontinuities in `(after, until]`.
    fn breakpoints(&self, _after: f64, _until: f64, _out: &mut Vec<BreakPoint>) {}

    /// Called once per accepted time point.
    fn accept_step(&mut self, _ctx: &LoadContext<'_>) {}

    /// Called when a step attempt is rejected.
    fn step_failure(&mut self) {}

    /// Overwrite a model parameter between analyses.
    ///
    /// An empty `param` names the device's primary value (resistance,
    /// capacitance, inductance or source level).
    fn set_param(&mut self, param: &str, _value: f64) -> Result<()> {
        Err(Error::UnknownParameter {
            name: self.name().to_string(),
            param: param.to_string(),
        })
    }

    fn voltage_source_row(&self) -> Option<VsourceRow> {
        None
    }

    fn is_nonlinear(&self) -> bool {
        false
    }
}

/// Handles for a fixed list of Jacobian entries, some of which may involve ground.
///
/// Devices list every entry they would write with ground included; only the
/// entries with two real unknowns reach the sparsity builder, and
/// [`StampMap::handle`] returns `None` for the rest.
#[derive(Debug, Clone, Default)]
pub struct StampMap {
    entries: Vec<Option<(VarId, VarId)>>,
    handles: Vec<Option<JacHandle>>,
}

impl StampMap {
    pub fn new(entries: &[(Option<VarId>, Option<VarId>)]) -> Self {
        let entries: Vec<_> = entries
            .iter()
            .map(|&(r, c)| Some((r?, c?)))
            .collect();
        let handles = vec![None; entries.len()];
        Self { entries, handles }
    }

    /// Entries that reach the sparsity builder.
    pub fn pairs(&self) -> Vec<(VarId, VarId)> {
        self.entries.iter().flatten().copied().collect()
    }

    /// Distribute handles returned for [`StampMap::pairs`].
    pub fn assign(&mut self, handles: &[JacHandle]) {
        let mut it = handles.iter();
        for (entry, slot) in self.entries.iter().zip(self.handles.iter_mut()) {
            *slot = entry.and_then(|_| it.next().copied());
        }
    }

    #[inline]
    pub fn handle(&self, k: usize) -> Option<JacHandle> {
        self.handles.get(k).copied().flatten()
    }
}

/// Add `value` to an unknown's residual entry unless it is ground.
#[inline]
pub fn add_to(v: &mut DVector<f64>, id: Option<VarId>, value: f64) {
    if let Some(i) = id {
        v[i.index()] += value;
    }
}

/// Check a device's node count.
pub fn expect_nodes(name: &str, nodes: &[String], expected: usize) -> Result<()> {
    if nodes.len() != expected {
        return Err(Error::NodeCount {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: nodes.len(),
        });
    }
    Ok(())
}

/// Check that `param` names the primary parameter `primary` of `device`.
pub fn expect_primary(device: &str, primary: &str, param: &str) -> Result<()> {
    if param.is_empty() || param.eq_ignore_ascii_case(primary) {
        Ok(())
    } else {
        Err(Error::UnknownParameter {
            name: device.to_string(),
            param: param.to_string(),
        })
    }
}
