//! AVX2/FMA backend for 3D `f32` volumes
//!
//! Work is split into one output z-slice per task. The forward pass writes
//! disjoint output runs; the backward pass scatters into a shared
//! `grad_input` with atomic adds, so its summation order (and therefore its
//! last bits) may vary between runs. Results stay within `1e-5` of
//! [`crate::ReferenceSampler`].

use crate::config::{Backend, ExecutionContext, PaddingMode, SamplerConfig};
use crate::error::{Error, Result};
use crate::layout::{contiguous, SamplingLayout};
use crate::sampler::{GridSampler, SampleGradients};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use std::sync::atomic::{AtomicU32, Ordering};

/// Add `value` to the `f32` whose bits are stored in `cell`
#[inline]
#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
pub(crate) fn atomic_add_f32(cell: &AtomicU32, value: f32) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f32::from_bits(current) + value).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

fn unavailable(reason: &str) -> Error {
    Error::BackendUnavailable {
        backend: Backend::Accelerated,
        reason: reason.to_string(),
    }
}

fn check_cpu() -> Result<()> {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            Ok(())
        } else {
            Err(unavailable("CPU does not support AVX2 and FMA"))
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        Err(unavailable("AVX2 kernels are only built for x86_64"))
    }
}

/// Accelerated sampler for 3D `f32` volumes
///
/// Construction fails with [`Error::BackendUnavailable`] when the CPU lacks
/// AVX2/FMA; a constructed sampler never falls back to scalar code. Images of
/// any other spatial rank are rejected with [`Error::UnsupportedRank`].
#[derive(Debug, Clone)]
pub struct AcceleratedSampler {
    padding: PaddingMode,
    ctx: ExecutionContext,
}

impl AcceleratedSampler {
    pub fn new(padding: PaddingMode, ctx: ExecutionContext) -> Result<Self> {
        check_cpu()?;
        Ok(Self { padding, ctx })
    }

    pub fn from_config(config: &SamplerConfig) -> Result<Self> {
        Self::new(config.padding, config.context()?)
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    fn layout(&self, image_shape: &[usize], grid_shape: &[usize]) -> Result<SamplingLayout> {
        let layout = SamplingLayout::new(image_shape, grid_shape)?;
        if layout.rank() != 3 {
            return Err(Error::UnsupportedRank(layout.rank()));
        }
        Ok(layout)
    }
}

impl GridSampler<f32> for AcceleratedSampler {
    fn backend(&self) -> Backend {
        Backend::Accelerated
    }

    fn padding(&self) -> PaddingMode {
        self.padding
    }

    fn sample(&self, image: &ArrayViewD<'_, f32>, grid: &ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        let layout = self.layout(image.shape(), grid.shape())?;
        let image = image.as_standard_layout();
        let grid = grid.as_standard_layout();
        let image_data = contiguous(&image)?;
        let grid_data = contiguous(&grid)?;

        tracing::debug!(image = ?layout.image_shape(), grid = ?layout.grid_shape(), "accelerated forward");

        let output = self.forward(&layout, image_data, grid_data)?;
        ArrayD::from_shape_vec(IxDyn(&layout.output_shape()), output).map_err(|e| Error::shape(e.to_string()))
    }

    fn sample_backward(
        &self,
        image: &ArrayViewD<'_, f32>,
        grid: &ArrayViewD<'_, f32>,
        grad_output: &ArrayViewD<'_, f32>,
    ) -> Result<SampleGradients<f32>> {
        let layout = self.layout(image.shape(), grid.shape())?;
        layout.check_grad_output(grad_output.shape())?;

        let image = image.as_standard_layout();
        let grid = grid.as_standard_layout();
        let grad_output = grad_output.as_standard_layout();
        let image_data = contiguous(&image)?;
        let grid_data = contiguous(&grid)?;
        let grad_out_data = contiguous(&grad_output)?;

        tracing::debug!(image = ?layout.image_shape(), grid = ?layout.grid_shape(), "accelerated backward");

        let (grad_input, grad_grid) = self.backward(&layout, image_data, grid_data, grad_out_data)?;
        Ok(SampleGradients {
            grad_input: ArrayD::from_shape_vec(IxDyn(&layout.image_shape()), grad_input)
                .map_err(|e| Error::shape(e.to_string()))?,
            grad_grid: ArrayD::from_shape_vec(IxDyn(&layout.grid_shape()), grad_grid)
                .map_err(|e| Error::shape(e.to_string()))?,
        })
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

#[cfg(target_arch = "x86_64")]
impl AcceleratedSampler {
    fn volume(&self, layout: &SamplingLayout) -> crate::simd::avx2::Volume {
        crate::simd::avx2::Volume::new(
            [layout.in_shape[0], layout.in_shape[1], layout.in_shape[2]],
            layout.channels,
            layout.out_voxels(),
            self.padding == PaddingMode::Border,
        )
    }

    fn forward(&self, layout: &SamplingLayout, image: &[f32], grid: &[f32]) -> Result<Vec<f32>> {
        use crate::simd::avx2::sample_run_f32;

        let vol = self.volume(layout);
        let channels = layout.channels;
        let in_voxels = layout.in_voxels();
        let out_voxels = layout.out_voxels();
        let slab = layout.out_shape[1] * layout.out_shape[2];
        let slabs_per_plane = layout.out_shape[0];

        let mut output = vec![0.0f32; layout.batch * channels * out_voxels];

        self.ctx.for_each_chunk(&mut output, slab, |k, out| {
            let plane = k / slabs_per_plane;
            let start = (k % slabs_per_plane) * slab;
            let b = plane / channels;
            let image_plane = &image[plane * in_voxels..(plane + 1) * in_voxels];
            let grid_batch = &grid[b * 3 * out_voxels..(b + 1) * 3 * out_voxels];

            // SAFETY: AVX2 and FMA were detected when the sampler was built
            unsafe { sample_run_f32(image_plane, grid_batch, out, start, &vol) };
        });

        Ok(output)
    }

    fn backward(
        &self,
        layout: &SamplingLayout,
        image: &[f32],
        grid: &[f32],
        grad_output: &[f32],
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        use crate::simd::avx2::sample_backward_run_f32;

        let vol = self.volume(layout);
        let channels = layout.channels;
        let in_voxels = layout.in_voxels();
        let out_voxels = layout.out_voxels();
        let slab = layout.out_shape[1] * layout.out_shape[2];
        let slabs_per_plane = layout.out_shape[0];
        let batch_in = channels * in_voxels;
        let batch_out = channels * out_voxels;

        // 0.0f32 has all bits clear
        let grad_input: Vec<AtomicU32> = (0..layout.batch * batch_in).map(|_| AtomicU32::new(0)).collect();

        // Laid out (batch, z-slice, component, slice voxels) so each task owns
        // one contiguous chunk
        let mut by_slab = vec![0.0f32; layout.batch * 3 * out_voxels];

        self.ctx.for_each_chunk(&mut by_slab, 3 * slab, |k, gg| {
            let b = k / slabs_per_plane;
            let start = (k % slabs_per_plane) * slab;

            // SAFETY: AVX2 and FMA were detected when the sampler was built
            unsafe {
                sample_backward_run_f32(
                    &image[b * batch_in..(b + 1) * batch_in],
                    &grid[b * 3 * out_voxels..(b + 1) * 3 * out_voxels],
                    &grad_output[b * batch_out..(b + 1) * batch_out],
                    &grad_input[b * batch_in..(b + 1) * batch_in],
                    gg,
                    start,
                    &vol,
                )
            };
        });

        let mut grad_grid = vec![0.0f32; by_slab.len()];
        if slab > 0 {
            for (k, chunk) in by_slab.chunks(3 * slab).enumerate() {
                let b = k / slabs_per_plane;
                let start = (k % slabs_per_plane) * slab;
                for a in 0..3 {
                    let dst = (b * 3 + a) * out_voxels + start;
                    grad_grid[dst..dst + slab].copy_from_slice(&chunk[a * slab..(a + 1) * slab]);
                }
            }
        }

        let grad_input = grad_input
            .into_iter()
            .map(|cell| f32::from_bits(cell.into_inner()))
            .collect();

        Ok((grad_input, grad_grid))
    }
}

#[cfg(not(target_arch = "x86_64"))]
impl AcceleratedSampler {
    fn forward(&self, _layout: &SamplingLayout, _image: &[f32], _grid: &[f32]) -> Result<Vec<f32>> {
        Err(unavailable("AVX2 kernels are only built for x86_64"))
    }

    fn backward(
        &self,
        _layout: &SamplingLayout,
        _image: &[f32],
        _grid: &[f32],
        _grad_output: &[f32],
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        Err(unavailable("AVX2 kernels are only built for x86_64"))
    }
}
