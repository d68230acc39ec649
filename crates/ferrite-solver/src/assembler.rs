//! DAE residual and Jacobian assembly.
//!
//! The assembler owns the device list, the global topology and the four DAE
//! accumulators (Q, F, dQ/dx, dF/dx). Registration runs once in
//! [`Assembler::build`]; afterwards only numeric values change.

use std::sync::Arc;

use ferrite_core::{
    BreakPoint, DaeMatrix, SolutionSet, SparsityBuilder, SparsityPattern, Topology, VarId, VarKind,
};
use ferrite_devices::{AnalysisMode, Device, DeviceRegistry, DeviceSpec, LoadContext, VsourceRow};
use log::debug;
use nalgebra::DVector;

use crate::error::{Error, Result};
use crate::operator::RealOperator;
use crate::sparse_operator::JacobianOperator;

/// Per-load scalars that, together with the solution vectors, make up a [`LoadContext`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadParams {
    pub mode: AnalysisMode,
    pub time: f64,
    pub gmin: f64,
    pub iteration: u64,
}

impl LoadParams {
    pub fn dc(gmin: f64) -> Self {
        Self {
            mode: AnalysisMode::DcOp,
            time: 0.0,
            gmin,
            iteration: 0,
        }
    }

    pub fn transient(time: f64, gmin: f64) -> Self {
        Self {
            mode: AnalysisMode::Transient,
            time,
            gmin,
            iteration: 0,
        }
    }

    pub fn context<'a>(
        &self,
        solution: &'a DVector<f64>,
        curr_solution: &'a DVector<f64>,
    ) -> LoadContext<'a> {
        LoadContext {
            mode: self.mode,
            time: self.time,
            solution,
            curr_solution,
            gmin: self.gmin,
            iteration: self.iteration,
        }
    }
}

/// Computes `next_state_deriv` from `next_state`; supplied by the integration method.
pub type StateDerivFn<'a> = &'a dyn Fn(&DVector<f64>, &mut DVector<f64>);

/// State derivative used outside time stepping.
pub fn zero_state_deriv(_state: &DVector<f64>, deriv: &mut DVector<f64>) {
    deriv.fill(0.0);
}

#[derive(Debug)]
pub struct Assembler {
    devices: Vec<Box<dyn Device>>,
    topology: Topology,
    pattern: Arc<SparsityPattern>,
    q: DVector<f64>,
    f: DVector<f64>,
    dq_dx: DaeMatrix,
    df_dx: DaeMatrix,
}

impl Assembler {
    /// Run the registration phase and allocate the DAE accumulators.
    pub fn build(mut devices: Vec<Box<dyn Device>>) -> Result<Self> {
        let mut topology = Topology::new();

        for dev in devices.iter_mut() {
            dev.register_lids(&mut topology)?;
        }
        for dev in devices.iter_mut() {
            dev.register_state_lids(&mut topology)?;
        }
        for dev in devices.iter_mut() {
            dev.register_store_lids(&mut topology)?;
        }
        topology.finalize();

        let n = topology.num_unknowns();
        let mut builder = SparsityBuilder::new(n);
        for dev in devices.iter_mut() {
            let handles = dev
                .jacobian_stamp()
                .into_iter()
                .map(|(r, c)| builder.request(r, c))
                .collect::<ferrite_core::Result<Vec<_>>>()?;
            dev.register_jac_lids(&handles);
        }
        builder.ensure_diagonal();
        let pattern = Arc::new(builder.finalize());

        debug!(
            "assembled {} devices: {} unknowns, {} states, {} stores, {} jacobian entries",
            devices.len(),
            n,
            topology.num_states(),
            topology.num_stores(),
            pattern.nnz()
        );

        Ok(Self {
            devices,
            topology,
            dq_dx: DaeMatrix::new(Arc::clone(&pattern)),
            df_dx: DaeMatrix::new(Arc::clone(&pattern)),
            pattern,
            q: DVector::zeros(n),
            f: DVector::zeros(n),
        })
    }

    /// Instantiate devices through the registry, then [`Assembler::build`].
    pub fn from_specs(registry: &DeviceRegistry, specs: &[DeviceSpec]) -> Result<Self> {
        let devices = registry.create_all(specs)?;
        Self::build(devices)
    }

    /// A zeroed vector set sized for this topology.
    pub fn new_solution_set(&self) -> SolutionSet {
        SolutionSet::new(
            self.topology.num_unknowns(),
            self.topology.num_states(),
            self.topology.num_stores(),
        )
    }

    /// Zero Q and F, refresh device state, then accumulate Q and F at `next_solution`.
    ///
    /// Returns `false` if any device reports a failure; every device is still visited.
    pub fn load_dae_vectors(
        &mut self,
        params: &LoadParams,
        solutions: &mut SolutionSet,
        state_deriv: StateDerivFn<'_>,
    ) -> bool {
        let SolutionSet {
            next_solution,
            curr_solution,
            next_state,
            next_state_deriv,
            next_store,
            ..
        } = solutions;
        let ctx = params.context(next_solution, curr_solution);

        self.q.fill(0.0);
        self.f.fill(0.0);

        let mut ok = true;
        for dev in self.devices.iter_mut() {
            ok &= dev.update_primary_state(&ctx, next_state);
        }
        state_deriv(next_state, next_state_deriv);
        for dev in self.devices.iter_mut() {
            ok &= dev.update_secondary_state(&ctx, next_state_deriv, next_store);
        }
        for dev in self.devices.iter() {
            ok &= dev.load_dae_q(&ctx, &mut self.q);
            ok &= dev.load_dae_f(&ctx, &mut self.f);
        }
        ok
    }

    /// Zero and accumulate dQ/dx and dF/dx at `next_solution`.
    pub fn load_dae_matrices(&mut self, params: &LoadParams, solutions: &SolutionSet) -> bool {
        let ctx = params.context(&solutions.next_solution, &solutions.curr_solution);

        self.dq_dx.zero();
        self.df_dx.zero();

        let mut ok = true;
        for dev in self.devices.iter() {
            ok &= dev.load_dq_dx(&ctx, &mut self.dq_dx);
            ok &= dev.load_df_dx(&ctx, &mut self.df_dx);
        }
        ok
    }

    /// `(cj * dQ/dx + dF/dx) * x` using the last loaded matrices.
    pub fn apply_jacobian(&self, x: &DVector<f64>, cj: f64) -> DVector<f64> {
        let mut y = DVector::zeros(self.num_unknowns());
        JacobianOperator::new(&self.dq_dx, &self.df_dx, cj).apply(x.as_slice(), y.as_mut_slice());
        y
    }

    /// Device breakpoints in `(after, until]`, sorted by time.
    pub fn breakpoints(&self, after: f64, until: f64) -> Vec<BreakPoint> {
        let mut out = Vec::new();
        for dev in &self.devices {
            dev.breakpoints(after, until, &mut out);
        }
        out.sort_by(|a, b| a.time.total_cmp(&b.time));
        out
    }

    /// Notify devices that the point in `next_solution` was accepted.
    pub fn accept_step(&mut self, params: &LoadParams, solutions: &SolutionSet) {
        let ctx = params.context(&solutions.next_solution, &solutions.curr_solution);
        for dev in self.devices.iter_mut() {
            dev.accept_step(&ctx);
        }
    }

    pub fn step_failure(&mut self) {
        for dev in self.devices.iter_mut() {
            dev.step_failure();
        }
    }

    /// Set a device parameter named `DEVICE` or `DEVICE:PARAM`.
    ///
    /// The bare device name addresses its primary value. Names match
    /// without regard to case.
    pub fn set_param(&mut self, target: &str, value: f64) -> Result<()> {
        let (device, param) = target.split_once(':').unwrap_or((target, ""));
        let dev = self
            .devices
            .iter_mut()
            .find(|d| d.name().eq_ignore_ascii_case(device))
            .ok_or_else(|| Error::InvalidParameter(format!("no device named '{}'", device)))?;
        dev.set_param(param, value)?;
        debug!("{} = {:e}", target, value);
        Ok(())
    }

    /// Branch rows of every independent voltage source, in device order.
    pub fn voltage_source_rows(&self) -> Vec<VsourceRow> {
        self.devices
            .iter()
            .filter_map(|d| d.voltage_source_row())
            .collect()
    }

    pub fn has_nonlinear_devices(&self) -> bool {
        self.devices.iter().any(|d| d.is_nonlinear())
    }

    pub fn var_name(&self, id: VarId) -> Option<&str> {
        self.topology.var_name(id)
    }

    pub fn is_branch(&self, index: usize) -> bool {
        self.topology.var_kind(VarId::new(index)) == Some(VarKind::Branch)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }

    pub fn num_unknowns(&self) -> usize {
        self.topology.num_unknowns()
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn q(&self) -> &DVector<f64> {
        &self.q
    }

    pub fn f(&self) -> &DVector<f64> {
        &self.f
    }

    pub fn dq_dx(&self) -> &DaeMatrix {
        &self.dq_dx
    }

    pub fn df_dx(&self) -> &DaeMatrix {
        &self.df_dx
    }
}
