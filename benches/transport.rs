//! Benchmarks for full runs over both transports

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use distconv::prelude::*;
use distconv::{PeerWorkerHandle, WorkerConfig};
use std::time::Duration;

fn image() -> PixelGrid {
    PixelGrid::from_fn(612, 408, |x, y| [(x * 3) as u8, (y * 5) as u8, (x ^ y) as u8])
}

fn bench_group_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_run");
    let input = image();
    group.throughput(Throughput::Elements((input.width() * input.height()) as u64));

    for num_workers in [1, 2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_workers),
            num_workers,
            |b, &num_workers| {
                let config = GroupConfig::new().with_num_workers(num_workers);
                let transport = GroupTransport::launch(config).unwrap();
                let coordinator = Coordinator::new(
                    CoordinatorConfig::new().with_codec(Codec::Raw),
                    KernelRegistry::builtin(),
                );

                b.iter(|| {
                    coordinator
                        .run_named(&transport, &input, "sharpen", num_workers)
                        .unwrap()
                });

                transport.shutdown().unwrap();
            },
        );
    }

    group.finish();
}

fn bench_peer_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("peer_run");
    let input = image();

    for num_workers in [1, 4].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_workers),
            num_workers,
            |b, &num_workers| {
                let workers: Vec<PeerWorkerHandle> = (0..num_workers)
                    .map(|_| {
                        PeerWorker::bind(
                            "127.0.0.1:0".parse().unwrap(),
                            WorkerConfig::new(),
                            Duration::from_secs(5),
                        )
                        .unwrap()
                    })
                    .collect();
                let transport = PeerTransport::new(PeerConfig::new(
                    workers.iter().map(|w| w.local_addr()).collect(),
                ))
                .unwrap();
                let coordinator = Coordinator::default();

                b.iter(|| {
                    coordinator
                        .run_named(&transport, &input, "blur", num_workers)
                        .unwrap()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_group_run, bench_peer_run);
criterion_main!(benches);
