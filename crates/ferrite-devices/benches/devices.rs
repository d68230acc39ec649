//! Benchmarks for device loads.

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ferrite_core::{DaeMatrix, SparsityBuilder, Topology};
use ferrite_devices::{AnalysisMode, DeviceRegistry, DeviceSpec, LoadContext};
use nalgebra::DVector;

fn bench_diode_load(c: &mut Criterion) {
    let reg = DeviceRegistry::with_builtins();
    let mut dev = reg
        .create(&DeviceSpec::new("D1", &["a", "b"], None).with_param("is", 1e-14))
        .unwrap();
    let mut topo = Topology::new();
    dev.register_lids(&mut topo).unwrap();
    topo.finalize();
    let mut builder = SparsityBuilder::new(topo.num_unknowns());
    let handles: Vec<_> = dev
        .jacobian_stamp()
        .into_iter()
        .map(|(r, c)| builder.request(r, c).unwrap())
        .collect();
    dev.register_jac_lids(&handles);
    let mut m = DaeMatrix::new(Arc::new(builder.finalize()));

    let x = DVector::from_vec(vec![0.7, 0.0]);
    let mut f = DVector::zeros(2);
    let mut state = DVector::zeros(0);
    let mut iteration = 0u64;

    c.bench_function("diode_load", |b| {
        b.iter(|| {
            iteration += 1;
            let ctx = LoadContext {
                mode: AnalysisMode::DcOp,
                time: 0.0,
                solution: &x,
                curr_solution: &x,
                gmin: 1e-12,
                iteration,
            };
            f.fill(0.0);
            m.zero();
            dev.update_primary_state(&ctx, &mut state);
            dev.load_dae_f(&ctx, &mut f);
            dev.load_df_dx(&ctx, black_box(&mut m));
        });
    });
}

criterion_group!(benches, bench_diode_load);
criterion_main!(benches);
