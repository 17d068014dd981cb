//! Finite-difference checks of the analytic gradients

use grid_sampler::{sample, sample_backward, GridSampler, PaddingMode, ReferenceSampler};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const EPS: f64 = 1e-6;
const TOLERANCE: f64 = 1e-3;

struct Case {
    image: ArrayD<f64>,
    grid: ArrayD<f64>,
    weights: ArrayD<f64>,
}

fn random_case(seed: u64, in_shape: &[usize], out_shape: &[usize], coord_range: f64) -> Case {
    let mut rng = StdRng::seed_from_u64(seed);
    let (batch, channels) = (2, 2);
    let rank = in_shape.len();

    let image_shape: Vec<usize> = [&[batch, channels][..], in_shape].concat();
    let grid_shape: Vec<usize> = [&[batch, rank][..], out_shape].concat();
    let out_full: Vec<usize> = [&[batch, channels][..], out_shape].concat();

    Case {
        image: ArrayD::from_shape_fn(IxDyn(&image_shape), |_| rng.gen_range(-1.0..1.0)),
        grid: ArrayD::from_shape_fn(IxDyn(&grid_shape), |_| rng.gen_range(-coord_range..coord_range)),
        weights: ArrayD::from_shape_fn(IxDyn(&out_full), |_| rng.gen_range(-1.0..1.0)),
    }
}

/// `sum(weights * sample(image, grid))`
fn loss(sampler: &ReferenceSampler, image: &ArrayD<f64>, grid: &ArrayD<f64>, weights: &ArrayD<f64>) -> f64 {
    let output = sampler.sample(&image.view(), &grid.view()).unwrap();
    output.iter().zip(weights.iter()).map(|(o, w)| o * w).sum()
}

fn assert_close(numeric: f64, analytic: f64, what: &str, i: usize) {
    let scale = analytic.abs().max(1.0);
    assert!(
        (numeric - analytic).abs() <= TOLERANCE * scale,
        "{what}[{i}]: finite difference {numeric} vs analytic {analytic}"
    );
}

fn check(case: &Case, padding: PaddingMode) {
    let sampler = ReferenceSampler::new(padding, Default::default());
    let grads = sampler
        .sample_backward(&case.image.view(), &case.grid.view(), &case.weights.view())
        .unwrap();

    let grad_grid: Vec<f64> = grads.grad_grid.iter().copied().collect();
    for (i, &analytic) in grad_grid.iter().enumerate() {
        let mut plus = case.grid.clone();
        let mut minus = case.grid.clone();
        plus.as_slice_mut().unwrap()[i] += EPS;
        minus.as_slice_mut().unwrap()[i] -= EPS;
        let numeric = (loss(&sampler, &case.image, &plus, &case.weights)
            - loss(&sampler, &case.image, &minus, &case.weights))
            / (2.0 * EPS);
        assert_close(numeric, analytic, "grad_grid", i);
    }

    let grad_input: Vec<f64> = grads.grad_input.iter().copied().collect();
    for (i, &analytic) in grad_input.iter().enumerate() {
        let mut plus = case.image.clone();
        let mut minus = case.image.clone();
        plus.as_slice_mut().unwrap()[i] += EPS;
        minus.as_slice_mut().unwrap()[i] -= EPS;
        let numeric = (loss(&sampler, &plus, &case.grid, &case.weights)
            - loss(&sampler, &minus, &case.grid, &case.weights))
            / (2.0 * EPS);
        assert_close(numeric, analytic, "grad_input", i);
    }
}

#[test]
fn test_gradients_1d() {
    check(&random_case(1, &[7], &[9], 0.95), PaddingMode::Zeros);
}

#[test]
fn test_gradients_2d() {
    check(&random_case(2, &[4, 5], &[3, 4], 0.95), PaddingMode::Zeros);
}

#[test]
fn test_gradients_3d() {
    check(&random_case(3, &[3, 4, 5], &[2, 3, 3], 0.95), PaddingMode::Zeros);
}

#[test]
fn test_gradients_3d_border() {
    // Coordinates beyond the image exercise the clamped branch
    check(&random_case(4, &[3, 4, 3], &[2, 2, 3], 1.3), PaddingMode::Border);
}

#[test]
fn test_gradients_degenerate_axis() {
    check(&random_case(5, &[1, 6], &[3, 3], 0.95), PaddingMode::Zeros);
}

#[test]
fn test_grad_grid_zero_outside_image() {
    let image = ArrayD::from_shape_fn(IxDyn(&[1, 1, 4, 4]), |ix| (ix[2] + ix[3]) as f64);
    let grid = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1, 1]), vec![1.5, 0.0]).unwrap();
    let grad_output = ArrayD::from_elem(IxDyn(&[1, 1, 1, 1]), 1.0);

    let grads = sample_backward(&image.view(), &grid.view(), &grad_output.view()).unwrap();
    assert!(grads.grad_grid.iter().all(|&g| g == 0.0));
    assert!(grads.grad_input.iter().all(|&g| g == 0.0));
    assert_eq!(sample(&image.view(), &grid.view()).unwrap()[[0, 0, 0, 0]], 0.0);
}
