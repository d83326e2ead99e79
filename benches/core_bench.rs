use criterion::{black_box, criterion_group, criterion_main, Criterion};
use loadcore::scheduler::{Allocator, Capacity, HostInfo, Registry};
use loadcore::telemetry::percentile;

fn host(name: &str) -> HostInfo {
    HostInfo {
        hostname: name.into(),
        ip: "10.0.0.1".into(),
        platform: "linux".into(),
    }
}

fn bench_percentile_p95_over_10k_samples(c: &mut Criterion) {
    let values: Vec<u64> = (0..10_000).map(|i| (i * 37) % 5_000).collect();
    c.bench_function("percentile(p95, 10k samples)", |b| {
        b.iter(|| percentile(black_box(&values), black_box(95.0)));
    });
}

fn bench_allocator_bin_pack_20_workers(c: &mut Criterion) {
    let registry = Registry::new();
    let candidates: Vec<_> = (0..20)
        .map(|i| {
            registry
                .register(
                    host(&format!("w{i}")),
                    Capacity { max_vus: 100, max_concurrent_ops: 400, max_rps: 1000 },
                )
                .unwrap()
        })
        .collect();

    c.bench_function("allocator::allocate(20 workers, 1500 VUs)", |b| {
        b.iter(|| {
            Allocator::allocate(
                black_box(&registry),
                loadcore::ids::RunId::new(),
                "steady".into(),
                black_box(1500),
                black_box(&candidates),
            )
            .unwrap()
        });
    });
}

criterion_group!(benches, bench_percentile_p95_over_10k_samples, bench_allocator_bin_pack_20_workers);
criterion_main!(benches);
