//! End-to-end transient runs through the public API.

use ferrite_core::{DaeMatrix, JacHandle, SerialComm, Topology, VarId};
use ferrite_devices::device::StampMap;
use ferrite_devices::{AnalysisMode, Device, DeviceRegistry, DeviceSpec, LoadContext, Waveform};
use ferrite_solver::{
    AnalysisContext, AnalysisState, Assembler, ConvergenceCriteria, Error, IntegrationMethod,
    NonlinearSolver, StepSweep, SweepParam, TiaParams, Transient, TransientResult,
};
use nalgebra::DVector;

fn context(assembler: Assembler, params: TiaParams) -> AnalysisContext {
    AnalysisContext::builder()
        .assembler(assembler)
        .nonlinear_solver(NonlinearSolver::new(ConvergenceCriteria::default()))
        .communicator(SerialComm)
        .params(params)
        .build()
        .unwrap()
}

fn transient(assembler: Assembler, params: TiaParams) -> Transient {
    Transient::new(context(assembler, params)).unwrap()
}

fn from_specs(specs: &[DeviceSpec]) -> Assembler {
    Assembler::from_specs(&DeviceRegistry::with_builtins(), specs).unwrap()
}

/// 1 V step at 100 us into 1 kOhm / 1 uF.
fn rc_step() -> Vec<DeviceSpec> {
    vec![
        DeviceSpec::new("V1", &["in", "0"], None)
            .with_waveform(Waveform::pulse(0.0, 1.0, 1e-4, 1e-6, 1e-6, 1.0, 0.0)),
        DeviceSpec::new("R1", &["in", "out"], Some(1e3)),
        DeviceSpec::new("C1", &["out", "0"], Some(1e-6)),
    ]
}

fn has_time(result: &TransientResult, t: f64) -> bool {
    result.points.iter().any(|p| (p.time - t).abs() <= 1e-12 * t.abs().max(1e-12))
}

#[test]
fn rc_charges_with_its_time_constant() {
    let params = TiaParams::for_tstop(3e-3).with_max_time_step(5e-5);
    let mut tran = transient(from_specs(&rc_step()), params);
    let result = tran.run().unwrap();
    assert_eq!(result.state, AnalysisState::Finished);

    let out = result.index_of("out").unwrap();
    // one time constant after the edge settles (edge midpoint at 100.5 us)
    for &tau in &[1.0, 2.0] {
        let t = 1.005e-4 + tau * 1e-3;
        let v = result.value_at(out, t).unwrap();
        let expected = 1.0 - (-tau).exp();
        assert!(
            (v - expected).abs() < 5e-3,
            "v(out) at {} tau = {}, expected {}",
            tau,
            v,
            expected
        );
    }
    assert!(result.stats.successful_steps > 10);
}

#[test]
fn bdf_and_backward_euler_agree() {
    let params = TiaParams::for_tstop(2e-3).with_max_time_step(2e-5);
    let bdf = transient(from_specs(&rc_step()), params.clone()).run().unwrap();
    let be = transient(
        from_specs(&rc_step()),
        params.with_method(IntegrationMethod::BackwardEuler),
    )
    .run()
    .unwrap();
    let out = bdf.index_of("out").unwrap();
    let a = bdf.value_at(out, 1.5e-3).unwrap();
    let b = be.value_at(out, 1.5e-3).unwrap();
    assert!((a - b).abs() < 1e-2, "bdf {} vs be {}", a, b);
}

#[test]
fn gear12_tracks_the_rc_charge_curve() {
    let params = TiaParams::for_tstop(3e-3)
        .with_max_time_step(5e-5)
        .with_method(IntegrationMethod::Gear12);
    let mut tran = transient(from_specs(&rc_step()), params);
    let result = tran.run().unwrap();
    assert_eq!(result.state, AnalysisState::Finished);
    assert_eq!(tran.context().method().method(), IntegrationMethod::Gear12);
    assert!(tran.context().step_control().used_order <= 2);

    let out = result.index_of("out").unwrap();
    for &tau in &[1.0, 2.0] {
        let t = 1.005e-4 + tau * 1e-3;
        let v = result.value_at(out, t).unwrap();
        let expected = 1.0 - (-tau).exp();
        assert!((v - expected).abs() < 5e-3, "v(out) at {} tau = {}", tau, v);
    }
}

#[test]
fn stepping_the_capacitor_slows_the_charge() {
    let params = TiaParams::for_tstop(2e-3).with_max_time_step(5e-5);
    let steps = StepSweep::new(vec![SweepParam::list("C1", vec![1e-6, 2e-6])]).unwrap();
    let outcomes = steps
        .run(
            || Ok(context(from_specs(&rc_step()), params.clone())),
            |ctx| Transient::new(ctx)?.run(),
        )
        .unwrap();
    assert_eq!(outcomes.len(), 2);

    // one millisecond after the edge: one tau, then half a tau
    let t = 1.005e-4 + 1e-3;
    for (o, tau) in outcomes.iter().zip([1.0, 0.5f64]) {
        let result = o.result.as_ref().unwrap();
        assert_eq!(result.state, AnalysisState::Finished);
        let out = result.index_of("out").unwrap();
        let v = result.value_at(out, t).unwrap();
        let expected = 1.0 - (-tau).exp();
        assert!((v - expected).abs() < 5e-3, "{:?}: v(out) = {}", o.values, v);
    }
}

#[test]
fn steps_land_on_source_and_gate_breakpoints() {
    let mut specs = rc_step();
    specs.push(
        DeviceSpec::new("Y1", &["in", "nout"], None)
            .with_model("INV")
            .with_param("delay", 1e-6)
            .with_param("rise", 2e-6)
            .with_param("fall", 2e-6),
    );
    specs.push(DeviceSpec::new("R2", &["nout", "0"], Some(1e3)));
    let mut tran = transient(from_specs(&specs), TiaParams::for_tstop(5e-4));
    let result = tran.run().unwrap();
    assert_eq!(result.state, AnalysisState::Finished);

    // pulse corners
    assert!(has_time(&result, 1e-4));
    assert!(has_time(&result, 1.01e-4));

    // the inverter's output ramp starts and ends on accepted points
    let times = result.times();
    let ramp = times.iter().any(|&t0| {
        t0 > 1e-4 && times.iter().any(|&t1| ((t1 - t0) - 2e-6).abs() < 1e-12)
    });
    assert!(ramp, "no accepted pair spans the gate transition");

    let nout = result.index_of("nout").unwrap();
    let last = result.points.last().unwrap();
    assert!(last.solution[nout].abs() < 1e-3);
}

#[test]
fn pause_and_resume_continue_the_same_run() {
    let params = TiaParams::for_tstop(1e-3).with_pause_time(4e-4);
    let mut tran = transient(from_specs(&rc_step()), params);

    let paused = tran.run().unwrap();
    assert_eq!(paused.state, AnalysisState::Paused);
    assert!(has_time(&paused, 4e-4));
    assert!(paused.final_time().unwrap() <= 4e-4 * (1.0 + 1e-12));
    assert!(!tran.simulation_complete());

    tran.resume_simulation(Some(7e-4)).unwrap();
    let again = tran.run().unwrap();
    assert_eq!(again.state, AnalysisState::Paused);
    assert!(has_time(&again, 7e-4));
    assert!(again.points.len() > paused.points.len());

    tran.resume_simulation(None).unwrap();
    let done = tran.run().unwrap();
    assert_eq!(done.state, AnalysisState::Finished);
    assert_eq!(done.final_time(), Some(1e-3));
    assert!(done.points.windows(2).all(|w| w[0].time < w[1].time));
}

/// A one-node device whose transient residual `|v| + 1` has no root.
#[derive(Debug)]
struct NoRoot {
    node: Option<VarId>,
    stamp: StampMap,
}

impl Device for NoRoot {
    fn name(&self) -> &str {
        "XBAD"
    }

    fn register_lids(&mut self, topo: &mut Topology) -> ferrite_devices::Result<()> {
        self.node = topo.node("bad")?;
        self.stamp = StampMap::new(&[(self.node, self.node)]);
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
        let v = ctx.v(self.node);
        let value = match ctx.mode {
            AnalysisMode::DcOp => v,
            AnalysisMode::Transient => v.abs() + 1.0,
        };
        if let Some(id) = self.node {
            f[id.index()] += value;
        }
        true
    }

    fn load_dq_dx(&self, _ctx: &LoadContext<'_>, _dq_dx: &mut DaeMatrix) -> bool {
        true
    }

    fn load_df_dx(&self, _ctx: &LoadContext<'_>, df_dx: &mut DaeMatrix) -> bool {
        df_dx.add_opt(self.stamp.handle(0), 1.0);
        true
    }
}

#[test]
fn non_convergent_device_fails_the_run() {
    let registry = DeviceRegistry::with_builtins();
    let mut devices = registry.create_all(&rc_step()).unwrap();
    devices.push(Box::new(NoRoot {
        node: None,
        stamp: StampMap::default(),
    }));
    let assembler = Assembler::build(devices).unwrap();
    let mut params = TiaParams::for_tstop(1e-3);
    params.max_successive_failures = 5;
    // five quarter-step cuts stay far above this floor
    params.min_time_step = Some(1e-30);
    let mut tran = transient(assembler, params);

    let err = tran.run().unwrap_err();
    match err {
        Error::TooManyFailures { count, time } => {
            assert_eq!(count, 5);
            assert_eq!(time, 0.0);
        }
        other => panic!("expected the failure counter to stop the run, got {}", other),
    }
    assert_eq!(tran.result().stats.failed_steps, 5);
    assert_eq!(tran.state(), AnalysisState::Failed);
    assert_eq!(tran.result().stats.successful_steps, 0);
    assert!(tran.run().is_err());
}
