//! Scalar (non-SIMD) N-D grid sampling
//!
//! These kernels handle every spatial rank from 1 to 3 with one code path and
//! serve as the reference the accelerated backend is tested against.

use crate::config::{Backend, ExecutionContext, PaddingMode, SamplerConfig};
use crate::error::{Error, Result};
use crate::layout::{contiguous, SamplingLayout, MAX_RANK};
use crate::sampler::{GridSampler, SampleGradients};
use crate::Interpolate;
use ndarray::{ArrayD, ArrayViewD, IxDyn};

/// Where one sample falls along one spatial axis
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisSample {
    /// Lower bracketing index
    pub lo: usize,
    /// Offset from `lo` towards `lo + 1`, in `[0, 1)`
    pub frac: f64,
    /// The continuous index was pulled back into range (border padding)
    pub clamped: bool,
}

/// Map a normalized coordinate onto an axis of `size` voxels
///
/// `-1` lands on index 0 and `+1` on index `size - 1`. Returns `None` when the
/// sample contributes nothing: outside the axis under zero padding, or NaN.
///
/// Bounds are decided on `coord` itself, so any value past `±1` is outside
/// even when rescaling would round it back onto the last index. A degenerate
/// axis reads index 0 for every finite coordinate.
#[inline]
pub(crate) fn locate(coord: f64, size: usize, padding: PaddingMode) -> Option<AxisSample> {
    if size <= 1 {
        return (size == 1 && coord.is_finite()).then_some(AxisSample::default());
    }
    if coord.is_nan() {
        return None;
    }
    let max = (size - 1) as f64;

    let (idx, clamped) = if coord < -1.0 {
        match padding {
            PaddingMode::Zeros => return None,
            PaddingMode::Border => (0.0, true),
        }
    } else if coord > 1.0 {
        match padding {
            PaddingMode::Zeros => return None,
            PaddingMode::Border => (max, true),
        }
    } else {
        // coord in [-1, 1] keeps the product in [0, max]
        ((coord + 1.0) * max * 0.5, false)
    };

    let lo = idx.floor();
    Some(AxisSample {
        lo: lo as usize,
        frac: idx - lo,
        clamped,
    })
}

/// Locate output voxel `v` along every axis
///
/// `grid` holds the `d` component planes of one batch entry, each
/// `plane_len` long.
#[inline]
fn footprint<T: Interpolate>(
    grid: &[T],
    plane_len: usize,
    v: usize,
    in_shape: &[usize],
    padding: PaddingMode,
) -> Option<[AxisSample; MAX_RANK]> {
    let mut axes = [AxisSample::default(); MAX_RANK];
    for (a, &size) in in_shape.iter().enumerate() {
        axes[a] = locate(grid[a * plane_len + v].to_f64(), size, padding)?;
    }
    Some(axes)
}

/// Visit every corner inside the image as `(flat_offset, weight)`
///
/// Corner `k` takes the high neighbour along axis `a` when bit `a` of `k` is
/// set. Corners past the last index are skipped; their weight is always zero
/// or the axis is degenerate.
#[inline]
fn for_each_corner<F: FnMut(usize, f64)>(axes: &[AxisSample], shape: &[usize], strides: &[usize], mut f: F) {
    let rank = shape.len();
    'corners: for corner in 0..(1usize << rank) {
        let mut weight = 1.0;
        let mut offset = 0;
        for a in 0..rank {
            let high = (corner >> a) & 1 == 1;
            let i = axes[a].lo + high as usize;
            if i >= shape[a] {
                continue 'corners;
            }
            weight *= if high { axes[a].frac } else { 1.0 - axes[a].frac };
            offset += i * strides[a];
        }
        f(offset, weight);
    }
}

/// Like [`for_each_corner`], but yields `d(weight)/d(index_a)` for every axis
#[inline]
fn for_each_corner_grad<F: FnMut(usize, &[f64; MAX_RANK])>(
    axes: &[AxisSample],
    shape: &[usize],
    strides: &[usize],
    mut f: F,
) {
    let rank = shape.len();
    'corners: for corner in 0..(1usize << rank) {
        let mut factors = [1.0; MAX_RANK];
        let mut signs = [0.0; MAX_RANK];
        let mut offset = 0;
        for a in 0..rank {
            let high = (corner >> a) & 1 == 1;
            let i = axes[a].lo + high as usize;
            if i >= shape[a] {
                continue 'corners;
            }
            factors[a] = if high { axes[a].frac } else { 1.0 - axes[a].frac };
            signs[a] = if high { 1.0 } else { -1.0 };
            offset += i * strides[a];
        }

        let mut dweights = [0.0; MAX_RANK];
        for (a, dw) in dweights.iter_mut().enumerate().take(rank) {
            let mut p = signs[a];
            for (k, factor) in factors.iter().enumerate().take(rank) {
                if k != a {
                    p *= factor;
                }
            }
            *dw = p;
        }
        f(offset, &dweights);
    }
}

fn into_array<T>(shape: Vec<usize>, data: Vec<T>) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| Error::shape(e.to_string()))
}

/// Forward pass: one worker per `(batch, channel)` output plane
pub fn sample_nd<T: Interpolate>(
    ctx: &ExecutionContext,
    padding: PaddingMode,
    image: &ArrayViewD<'_, T>,
    grid: &ArrayViewD<'_, T>,
) -> Result<ArrayD<T>> {
    let layout = SamplingLayout::new(image.shape(), grid.shape())?;
    let image = image.as_standard_layout();
    let grid = grid.as_standard_layout();
    let image_data = contiguous(&image)?;
    let grid_data = contiguous(&grid)?;

    let rank = layout.rank();
    let channels = layout.channels;
    let in_voxels = layout.in_voxels();
    let out_voxels = layout.out_voxels();
    let in_shape = layout.in_shape.as_slice();
    let in_strides = layout.in_strides();

    tracing::debug!(image = ?layout.image_shape(), grid = ?layout.grid_shape(), "reference forward");

    let mut output = vec![T::from_f64(0.0); layout.batch * channels * out_voxels];

    ctx.for_each_chunk(&mut output, out_voxels, |plane, out| {
        let b = plane / channels;
        let image_plane = &image_data[plane * in_voxels..(plane + 1) * in_voxels];
        let grid_batch = &grid_data[b * rank * out_voxels..(b + 1) * rank * out_voxels];

        for (v, o) in out.iter_mut().enumerate() {
            let mut acc = 0.0;
            if let Some(axes) = footprint(grid_batch, out_voxels, v, in_shape, padding) {
                for_each_corner(&axes[..rank], in_shape, in_strides, |offset, w| {
                    acc += w * image_plane[offset].to_f64();
                });
            }
            *o = T::from_f64(acc);
        }
    });

    into_array(layout.output_shape(), output)
}

/// Backward pass
///
/// `grad_input` is partitioned by `(batch, channel)` plane so each scatter
/// target has exactly one writer; results are deterministic.
pub fn sample_backward_nd<T: Interpolate>(
    ctx: &ExecutionContext,
    padding: PaddingMode,
    image: &ArrayViewD<'_, T>,
    grid: &ArrayViewD<'_, T>,
    grad_output: &ArrayViewD<'_, T>,
) -> Result<SampleGradients<T>> {
    let layout = SamplingLayout::new(image.shape(), grid.shape())?;
    layout.check_grad_output(grad_output.shape())?;

    let image = image.as_standard_layout();
    let grid = grid.as_standard_layout();
    let grad_output = grad_output.as_standard_layout();
    let image_data = contiguous(&image)?;
    let grid_data = contiguous(&grid)?;
    let grad_out_data = contiguous(&grad_output)?;

    let rank = layout.rank();
    let channels = layout.channels;
    let in_voxels = layout.in_voxels();
    let out_voxels = layout.out_voxels();
    let in_shape = layout.in_shape.as_slice();
    let in_strides = layout.in_strides();

    tracing::debug!(image = ?layout.image_shape(), grid = ?layout.grid_shape(), "reference backward");

    // grad_input: scatter-add, one owner per plane
    let mut grad_input = vec![0.0f64; layout.batch * channels * in_voxels];
    ctx.for_each_chunk(&mut grad_input, in_voxels, |plane, gi| {
        let b = plane / channels;
        let grid_batch = &grid_data[b * rank * out_voxels..(b + 1) * rank * out_voxels];
        let go_plane = &grad_out_data[plane * out_voxels..(plane + 1) * out_voxels];

        for (v, go) in go_plane.iter().enumerate() {
            let go = go.to_f64();
            if go == 0.0 {
                continue;
            }
            if let Some(axes) = footprint(grid_batch, out_voxels, v, in_shape, padding) {
                for_each_corner(&axes[..rank], in_shape, in_strides, |offset, w| {
                    gi[offset] += w * go;
                });
            }
        }
    });

    // grad_grid: every voxel owns its d components
    let half_extent: Vec<f64> = in_shape.iter().map(|&s| (s - 1) as f64 * 0.5).collect();
    let mut grad_grid = vec![T::from_f64(0.0); layout.batch * rank * out_voxels];

    for b in 0..layout.batch {
        let grid_batch = &grid_data[b * rank * out_voxels..(b + 1) * rank * out_voxels];

        let per_voxel = ctx.map_range(out_voxels, |v| {
            let mut g = [0.0f64; MAX_RANK];
            let Some(axes) = footprint(grid_batch, out_voxels, v, in_shape, padding) else {
                return g;
            };

            for c in 0..channels {
                let plane = b * channels + c;
                let go = grad_out_data[plane * out_voxels + v].to_f64();
                if go == 0.0 {
                    continue;
                }
                let image_plane = &image_data[plane * in_voxels..(plane + 1) * in_voxels];

                let mut dval = [0.0f64; MAX_RANK];
                for_each_corner_grad(&axes[..rank], in_shape, in_strides, |offset, dw| {
                    let value = image_plane[offset].to_f64();
                    for a in 0..rank {
                        dval[a] += value * dw[a];
                    }
                });
                for a in 0..rank {
                    g[a] += go * dval[a];
                }
            }

            for a in 0..rank {
                g[a] = if axes[a].clamped { 0.0 } else { g[a] * half_extent[a] };
            }
            g
        });

        for (v, g) in per_voxel.iter().enumerate() {
            for a in 0..rank {
                grad_grid[(b * rank + a) * out_voxels + v] = T::from_f64(g[a]);
            }
        }
    }

    Ok(SampleGradients {
        grad_input: into_array(layout.image_shape(), grad_input.into_iter().map(T::from_f64).collect())?,
        grad_grid: into_array(layout.grid_shape(), grad_grid)?,
    })
}

/// Portable reference backend for 1D, 2D and 3D images
#[derive(Debug, Clone, Default)]
pub struct ReferenceSampler {
    padding: PaddingMode,
    ctx: ExecutionContext,
}

impl ReferenceSampler {
    pub fn new(padding: PaddingMode, ctx: ExecutionContext) -> Self {
        Self { padding, ctx }
    }

    pub fn from_config(config: &SamplerConfig) -> Result<Self> {
        Ok(Self::new(config.padding, config.context()?))
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }
}

impl<T: Interpolate> GridSampler<T> for ReferenceSampler {
    fn backend(&self) -> Backend {
        Backend::Reference
    }

    fn padding(&self) -> PaddingMode {
        self.padding
    }

    fn sample(&self, image: &ArrayViewD<'_, T>, grid: &ArrayViewD<'_, T>) -> Result<ArrayD<T>> {
        sample_nd(&self.ctx, self.padding, image, grid)
    }

    fn sample_backward(
        &self,
        image: &ArrayViewD<'_, T>,
        grid: &ArrayViewD<'_, T>,
        grad_output: &ArrayViewD<'_, T>,
    ) -> Result<SampleGradients<T>> {
        sample_backward_nd(&self.ctx, self.padding, image, grid, grad_output)
    }
}
