use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pmu_dispatch::{dispatch_for, lbr::AddressWidth, CounterMeasurements, HwEvent, Microarch};

fn criterion_benchmark(c: &mut Criterion) {
    // criterion config
    let mut group = c.benchmark_group("dispatch");
    group.significance_level(0.01).sample_size(1000);

    // resolve a node and encode every event through it
    for arch in Microarch::ALL {
        let id = BenchmarkId::new("lookup_and_encode", format!("{arch:?}"));
        group.bench_function(id, |b| {
            b.iter(|| {
                let dispatch = dispatch_for(black_box(arch));
                for event in HwEvent::ALL {
                    black_box(dispatch.event_code(event));
                }
            })
        });
    }

    group.bench_function("address_mask", |b| {
        b.iter(|| {
            black_box(AddressWidth::Bits32.mask());
            black_box(AddressWidth::Bits48.mask());
        })
    });

    group.bench_function("measurements_push", |b| {
        let mut measurements = CounterMeasurements::new(1);
        let mut value = 0u64;
        b.iter(|| {
            value = value.wrapping_add(12345);
            measurements.push(0, HwEvent::Cycles, value, u64::MAX);
            black_box(&measurements);
        })
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
