//! Benchmarks for DAE assembly and the linear solvers behind Newton.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ferrite_devices::{DeviceRegistry, DeviceSpec};
use ferrite_solver::assembler::zero_state_deriv;
use ferrite_solver::{Assembler, DirectSolver, FaerLu, LoadParams, solve_dense};
use nalgebra::DVector;

/// RC ladder driven by a DC source: `sections` resistors and capacitors.
fn rc_ladder(sections: usize) -> Assembler {
    let mut specs = vec![DeviceSpec::new("V1", &["n0", "0"], Some(1.0))];
    for i in 0..sections {
        let a = format!("n{}", i);
        let b = format!("n{}", i + 1);
        let (a, b) = (a.as_str(), b.as_str());
        specs.push(DeviceSpec::new(format!("R{}", i), &[a, b], Some(1e3)));
        specs.push(DeviceSpec::new(format!("C{}", i), &[b, "0"], Some(1e-9)));
    }
    Assembler::from_specs(&DeviceRegistry::with_builtins(), &specs).unwrap()
}

fn bench_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("assemble");

    for sections in [10, 100, 1000] {
        let mut asm = rc_ladder(sections);
        let mut solutions = asm.new_solution_set();
        let params = LoadParams::transient(1e-6, 1e-12);
        group.bench_with_input(BenchmarkId::from_parameter(sections), &sections, |b, _| {
            b.iter(|| {
                asm.load_dae_vectors(&params, &mut solutions, &zero_state_deriv);
                black_box(asm.load_dae_matrices(&params, &solutions))
            });
        });
    }

    group.finish();
}

fn bench_jacobian_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("jacobian_solve");
    let cj = 1e6;

    for sections in [10, 100, 500] {
        let mut asm = rc_ladder(sections);
        let mut solutions = asm.new_solution_set();
        let params = LoadParams::transient(0.0, 1e-12);
        asm.load_dae_vectors(&params, &mut solutions, &zero_state_deriv);
        asm.load_dae_matrices(&params, &solutions);
        let jac = asm.df_dx().linear_combination(1.0, cj, asm.dq_dx()).unwrap();
        let rhs = DVector::from_fn(jac.size(), |i, _| (i % 7) as f64 - 3.0);

        group.bench_with_input(BenchmarkId::new("faer_lu", sections), &sections, |b, _| {
            let mut lu = FaerLu::new();
            lu.symbolic_factorization(&jac).unwrap();
            b.iter(|| {
                lu.numeric_factorization(black_box(&jac)).unwrap();
                lu.solve(black_box(&rhs)).unwrap()
            });
        });

        let dense = jac.to_dense();
        group.bench_with_input(BenchmarkId::new("dense", sections), &sections, |b, _| {
            b.iter(|| solve_dense(black_box(&dense), black_box(&rhs)).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_assembly, bench_jacobian_solve);
criterion_main!(benches);
