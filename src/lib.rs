//! N-dimensional bilinear/trilinear grid sampling with analytic gradients
//!
//! This crate provides the numerical core of deformable image registration:
//! resampling an image at a per-voxel coordinate field (the sampling grid),
//! back-propagating through that resampling into both the image and the grid,
//! and certifying a final deformation map through the determinant of its
//! Jacobian.
//!
//! # Features
//!
//! - **Two backends, one interface**: [`ReferenceSampler`] handles 1D, 2D and 3D
//!   with portable scalar code; [`AcceleratedSampler`] handles 3D `f32` volumes
//!   with AVX2/FMA. Both implement [`GridSampler`] and agree to `1e-5`.
//! - **Parallel execution**: uses rayon through an explicit [`ExecutionContext`]
//! - **ndarray integration**: works directly with `ndarray` dynamic-rank views
//! - **Deformation quality**: [`determinant_of_jacobian`] and the
//!   [`DeterminantReport`] statistics flag folding in a final map
//!
//! # Conventions
//!
//! Images are `(batch, channels, *spatial)`; grids are `(batch, d, *spatial_out)`
//! where component `a` holds the normalized source coordinate along spatial
//! axis `a`. Coordinate `-1` is the first voxel and `+1` the last voxel of the
//! axis. Samples falling outside the image are zero by default
//! ([`PaddingMode::Zeros`]).
//!
//! # Example
//!
//! ```rust
//! use grid_sampler::{sample, warp::identity_grid};
//! use ndarray::ArrayD;
//!
//! let image = ArrayD::<f32>::from_shape_fn(vec![1, 1, 4, 5, 6], |ix| ix[4] as f32);
//! let grid = identity_grid::<f32>(1, &[4, 5, 6]);
//!
//! let output = sample(&image.view(), &grid.view()).unwrap();
//! assert_eq!(output.shape(), image.shape());
//! ```

pub mod accelerated;
pub mod config;
pub mod error;
pub mod jacobian;
pub mod layout;
pub mod sampler;
pub mod scalar;
pub mod simd;
pub mod stats;
pub mod warp;

pub use accelerated::AcceleratedSampler;
pub use config::{build_info, Backend, BuildInfo, ExecutionContext, PaddingMode, SamplerConfig};
pub use error::{Error, Result};
pub use half::f16;
pub use jacobian::{determinant_of_jacobian, determinant_of_jacobian_in, determinant_of_jacobian_of_displacement};
pub use sampler::{create_sampler, GridSampler, SampleGradients};
pub use scalar::ReferenceSampler;
pub use stats::{nonzero_mask, DeterminantReport, DeterminantStatistics, ReportAggregate};
pub use warp::{warp_image, warp_image_backward, WarpGradients};

use ndarray::{ArrayD, ArrayViewD};

/// Trait for element types that can be sampled
///
/// All reference arithmetic is carried out in `f64`.
pub trait Interpolate: Copy + Send + Sync + Default + PartialEq + std::fmt::Debug + 'static {
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Interpolate for f32 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Interpolate for f64 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

impl Interpolate for f16 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        f16::from_f64(v)
    }
    #[inline]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
}

/// Resample `image` at `grid` with the reference backend and zero padding
///
/// # Arguments
///
/// * `image` - `(N, C, *S_in)` with 1 to 3 spatial dimensions
/// * `grid` - `(N, d, *S_out)` normalized coordinates, `d = len(S_in)`
///
/// # Returns
///
/// `(N, C, *S_out)` interpolated values
pub fn sample<T: Interpolate>(image: &ArrayViewD<'_, T>, grid: &ArrayViewD<'_, T>) -> Result<ArrayD<T>> {
    ReferenceSampler::default().sample(image, grid)
}

/// Gradients of [`sample`] with respect to the image and the grid
///
/// `grad_output` must have the shape `sample` returns for the same inputs.
pub fn sample_backward<T: Interpolate>(
    image: &ArrayViewD<'_, T>,
    grid: &ArrayViewD<'_, T>,
    grad_output: &ArrayViewD<'_, T>,
) -> Result<SampleGradients<T>> {
    ReferenceSampler::default().sample_backward(image, grid, grad_output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::ArrayD;

    #[test]
    fn test_identity_sample_f32() {
        let image = ArrayD::<f32>::from_shape_fn(vec![1, 1, 10, 10, 10], |ix| {
            (ix[2] * 100 + ix[3] * 10 + ix[4]) as f32
        });
        let grid = warp::identity_grid::<f32>(1, &[10, 10, 10]);

        let output = sample(&image.view(), &grid.view()).unwrap();

        for (o, i) in output.iter().zip(image.iter()) {
            assert_relative_eq!(*o, *i, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_identity_sample_f16() {
        let image = ArrayD::<f16>::from_shape_fn(vec![1, 2, 6, 7], |ix| {
            f16::from_f32((ix[1] * 40 + ix[2] * 7 + ix[3]) as f32 / 100.0)
        });
        let grid = warp::identity_grid::<f16>(1, &[6, 7]);

        let output = sample(&image.view(), &grid.view()).unwrap();

        for (o, i) in output.iter().zip(image.iter()) {
            assert!((o.to_f32() - i.to_f32()).abs() < 1e-2);
        }
    }

    #[test]
    fn test_sample_backward_shapes() {
        let image = ArrayD::<f64>::from_elem(vec![2, 3, 5, 4], 1.0);
        let grid = ArrayD::<f64>::zeros(vec![2, 2, 3, 6]);
        let grad_output = ArrayD::<f64>::from_elem(vec![2, 3, 3, 6], 1.0);

        let grads = sample_backward(&image.view(), &grid.view(), &grad_output.view()).unwrap();
        assert_eq!(grads.grad_input.shape(), image.shape());
        assert_eq!(grads.grad_grid.shape(), grid.shape());
    }

    #[test]
    fn test_sample_backward_rejects_bad_grad_output() {
        let image = ArrayD::<f64>::zeros(vec![1, 2, 4]);
        let grid = ArrayD::<f64>::zeros(vec![1, 1, 3]);
        let grad_output = ArrayD::<f64>::zeros(vec![1, 1, 3]);

        let err = sample_backward(&image.view(), &grid.view(), &grad_output.view()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }
}
