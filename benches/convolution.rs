//! Benchmarks for the kernel engine and band codecs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use distconv::convolve;
use distconv::prelude::*;

fn image(width: usize, height: usize) -> PixelGrid {
    PixelGrid::from_fn(width, height, |x, y| [(x * 3) as u8, (y * 5) as u8, (x ^ y) as u8])
}

fn bench_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("convolve_kernel");
    let registry = KernelRegistry::builtin();
    let input = image(612, 408);
    group.throughput(Throughput::Elements((612 * 408) as u64));

    for named in registry.entries() {
        group.bench_with_input(BenchmarkId::from_parameter(&named.name), named, |b, named| {
            b.iter(|| convolve::apply(black_box(&input), &named.kernel, named.multiplier).unwrap());
        });
    }

    group.finish();
}

fn bench_kernel_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("convolve_size");
    let input = image(256, 256);

    for size in [3, 5, 7, 9].iter() {
        let kernel = Kernel::from_flat(*size, vec![1.0; size * size]).unwrap();
        let multiplier = 1.0 / (size * size) as f32;
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| convolve::apply(black_box(&input), &kernel, multiplier).unwrap());
        });
    }

    group.finish();
}

fn bench_codecs(c: &mut Criterion) {
    let mut group = c.benchmark_group("band_codec");
    let band = image(612, 102);
    group.throughput(Throughput::Bytes(band.as_bytes().len() as u64));

    for codec in [Codec::Raw, Codec::Png, Codec::Jpeg { quality: 90 }].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(codec), codec, |b, codec| {
            b.iter(|| {
                let bytes = codec.encode(black_box(&band)).unwrap();
                codec.decode(&bytes).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_kernels, bench_kernel_size, bench_codecs);
criterion_main!(benches);
