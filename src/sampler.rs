//! The grid-sampling interface shared by every backend

use crate::accelerated::AcceleratedSampler;
use crate::config::{Backend, PaddingMode, SamplerConfig};
use crate::error::Result;
use crate::scalar::ReferenceSampler;
use crate::Interpolate;
use ndarray::{ArrayD, ArrayViewD};

/// Adjoints produced by [`GridSampler::sample_backward`]
#[derive(Debug, Clone, PartialEq)]
pub struct SampleGradients<T> {
    /// Same shape as the image
    pub grad_input: ArrayD<T>,
    /// Same shape as the grid
    pub grad_grid: ArrayD<T>,
}

/// Linear grid sampling with analytic gradients
///
/// Implementations are pure: every call validates shapes, allocates fresh
/// outputs and keeps no state between calls beyond their configuration.
pub trait GridSampler<T: Interpolate>: Send + Sync {
    /// Which implementation this is
    fn backend(&self) -> Backend;

    /// Out-of-bounds policy
    fn padding(&self) -> PaddingMode;

    /// Resample `image` `(N, C, *S_in)` at `grid` `(N, d, *S_out)`
    fn sample(&self, image: &ArrayViewD<'_, T>, grid: &ArrayViewD<'_, T>) -> Result<ArrayD<T>>;

    /// Gradients of `sum(grad_output * sample(image, grid))`
    ///
    /// Both returned tensors start from zero and accumulate every contribution.
    fn sample_backward(
        &self,
        image: &ArrayViewD<'_, T>,
        grid: &ArrayViewD<'_, T>,
        grad_output: &ArrayViewD<'_, T>,
    ) -> Result<SampleGradients<T>>;
}

/// Construct the `f32` sampler a configuration asks for
///
/// Fails with [`crate::Error::BackendUnavailable`] when the accelerated
/// backend is requested on a CPU that cannot run it.
pub fn create_sampler(config: &SamplerConfig) -> Result<Box<dyn GridSampler<f32>>> {
    tracing::debug!(
        backend = %config.backend,
        padding = %config.padding,
        threads = ?config.num_threads,
        "creating grid sampler"
    );

    match config.backend {
        Backend::Reference => Ok(Box::new(ReferenceSampler::from_config(config)?)),
        Backend::Accelerated => Ok(Box::new(AcceleratedSampler::from_config(config)?)),
    }
}
