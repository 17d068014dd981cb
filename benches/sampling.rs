//! Benchmarks for grid sampling and Jacobian determinants

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use grid_sampler::warp::{identity_grid, identity_map};
use grid_sampler::{
    determinant_of_jacobian, AcceleratedSampler, ExecutionContext, GridSampler, PaddingMode,
    ReferenceSampler,
};
use ndarray::{ArrayD, Axis, IxDyn};

/// A smooth volume and an identity grid nudged by a fraction of a voxel
fn inputs(size: usize) -> (ArrayD<f32>, ArrayD<f32>) {
    let image = ArrayD::from_shape_fn(IxDyn(&[1, 1, size, size, size]), |ix| {
        ((ix[2] * 100 + ix[3] * 10 + ix[4]) % 256) as f32 / 255.0
    });
    let mut grid = identity_grid::<f32>(1, &[size, size, size]);
    let nudge = 1.0 / (size - 1) as f32;
    for mut component in grid.axis_iter_mut(Axis(1)) {
        component.mapv_inplace(|g| g - nudge);
    }
    (image, grid)
}

/// `None` on CPUs without AVX2/FMA
fn accelerated() -> Option<AcceleratedSampler> {
    AcceleratedSampler::new(PaddingMode::Zeros, ExecutionContext::current()).ok()
}

fn benchmark_sample_3d_f32(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_3d_f32");
    let reference = ReferenceSampler::default();
    let fast = accelerated();

    for size in [32, 64, 128].iter() {
        let (image, grid) = inputs(*size);
        group.throughput(Throughput::Elements((*size as u64).pow(3)));

        if let Some(fast) = &fast {
            group.bench_with_input(BenchmarkId::new("accelerated", size), size, |b, _| {
                b.iter(|| black_box(fast.sample(&image.view(), &grid.view()).unwrap()))
            });
        }

        group.bench_with_input(BenchmarkId::new("reference", size), size, |b, _| {
            b.iter(|| black_box(reference.sample(&image.view(), &grid.view()).unwrap()))
        });
    }

    group.finish();
}

fn benchmark_sample_backward_3d_f32(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_backward_3d_f32");
    let reference = ReferenceSampler::default();
    let fast = accelerated();

    for size in [32, 64].iter() {
        let (image, grid) = inputs(*size);
        let grad_output = ArrayD::<f32>::ones(IxDyn(&[1, 1, *size, *size, *size]));
        group.throughput(Throughput::Elements((*size as u64).pow(3)));

        if let Some(fast) = &fast {
            group.bench_with_input(BenchmarkId::new("accelerated", size), size, |b, _| {
                b.iter(|| {
                    black_box(
                        fast.sample_backward(&image.view(), &grid.view(), &grad_output.view())
                            .unwrap(),
                    )
                })
            });
        }

        group.bench_with_input(BenchmarkId::new("reference", size), size, |b, _| {
            b.iter(|| {
                black_box(
                    reference
                        .sample_backward(&image.view(), &grid.view(), &grad_output.view())
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

fn benchmark_sample_2d_f64(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_2d_f64");
    let reference = ReferenceSampler::default();

    for size in [128, 512].iter() {
        let image = ArrayD::from_shape_fn(IxDyn(&[1, 3, *size, *size]), |ix| (ix[2] * 7 + ix[3]) as f64);
        let grid = identity_grid::<f64>(1, &[*size, *size]);
        group.throughput(Throughput::Elements((*size as u64).pow(2) * 3));

        group.bench_with_input(BenchmarkId::new("reference", size), size, |b, _| {
            b.iter(|| black_box(reference.sample(&image.view(), &grid.view()).unwrap()))
        });
    }

    group.finish();
}

fn benchmark_determinant_of_jacobian(c: &mut Criterion) {
    let mut group = c.benchmark_group("determinant_of_jacobian_3d");

    for size in [32, 64].iter() {
        let spacing = [1.0, 1.0, 1.0];
        let map = identity_map::<f32>(1, &[*size, *size, *size], &spacing).unwrap();
        group.throughput(Throughput::Elements((*size as u64).pow(3)));

        group.bench_with_input(BenchmarkId::new("map", size), size, |b, _| {
            b.iter(|| black_box(determinant_of_jacobian(&map.view(), &spacing).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_sample_3d_f32,
    benchmark_sample_backward_3d_f32,
    benchmark_sample_2d_f64,
    benchmark_determinant_of_jacobian,
);
criterion_main!(benches);
