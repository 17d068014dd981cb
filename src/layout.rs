//! Shape validation and stride bookkeeping shared by every backend

use crate::error::{Error, Result};
use crate::Interpolate;
use ndarray::{CowArray, IxDyn};

/// Largest spatial rank any backend supports
pub const MAX_RANK: usize = 3;

/// Validated geometry of one sampling call
///
/// Image `(N, C, *in_shape)`, grid `(N, d, *out_shape)`, output
/// `(N, C, *out_shape)`, all row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingLayout {
    pub batch: usize,
    pub channels: usize,
    pub in_shape: Vec<usize>,
    pub out_shape: Vec<usize>,
    in_strides: [usize; MAX_RANK],
}

impl SamplingLayout {
    /// Check that an image and a grid can be sampled together
    pub fn new(image_shape: &[usize], grid_shape: &[usize]) -> Result<Self> {
        if image_shape.len() < 3 {
            return Err(Error::shape(format!(
                "image must be (batch, channels, *spatial), got {image_shape:?}"
            )));
        }
        let rank = image_shape.len() - 2;
        if rank > MAX_RANK {
            return Err(Error::UnsupportedRank(rank));
        }
        if grid_shape.len() != image_shape.len() {
            return Err(Error::shape(format!(
                "grid {grid_shape:?} must have the same number of dimensions as image {image_shape:?}"
            )));
        }
        if grid_shape[0] != image_shape[0] {
            return Err(Error::shape(format!(
                "grid batch {} does not match image batch {}",
                grid_shape[0], image_shape[0]
            )));
        }
        if grid_shape[1] != rank {
            return Err(Error::shape(format!(
                "grid has {} coordinate components but the image has {rank} spatial dimensions",
                grid_shape[1]
            )));
        }

        let in_shape = image_shape[2..].to_vec();
        if let Some(axis) = in_shape.iter().position(|&s| s == 0) {
            return Err(Error::shape(format!(
                "image spatial axis {axis} is empty; nothing to interpolate from"
            )));
        }

        let mut in_strides = [0usize; MAX_RANK];
        let mut stride = 1;
        for a in (0..rank).rev() {
            in_strides[a] = stride;
            stride *= in_shape[a];
        }

        Ok(Self {
            batch: image_shape[0],
            channels: image_shape[1],
            in_shape,
            out_shape: grid_shape[2..].to_vec(),
            in_strides,
        })
    }

    /// Number of spatial dimensions `d`
    #[inline]
    pub fn rank(&self) -> usize {
        self.in_shape.len()
    }

    /// Voxels per image channel
    #[inline]
    pub fn in_voxels(&self) -> usize {
        self.in_shape.iter().product()
    }

    /// Voxels per output channel (and per grid component)
    #[inline]
    pub fn out_voxels(&self) -> usize {
        self.out_shape.iter().product()
    }

    /// Flat strides of the image spatial axes
    #[inline]
    pub fn in_strides(&self) -> &[usize] {
        &self.in_strides[..self.rank()]
    }

    pub fn image_shape(&self) -> Vec<usize> {
        [&[self.batch, self.channels][..], &self.in_shape].concat()
    }

    pub fn grid_shape(&self) -> Vec<usize> {
        [&[self.batch, self.rank()][..], &self.out_shape].concat()
    }

    pub fn output_shape(&self) -> Vec<usize> {
        [&[self.batch, self.channels][..], &self.out_shape].concat()
    }

    /// `grad_output` must have exactly the forward output shape
    pub fn check_grad_output(&self, shape: &[usize]) -> Result<()> {
        let expected = self.output_shape();
        if shape != expected.as_slice() {
            return Err(Error::shape(format!(
                "grad_output {shape:?} does not match output shape {expected:?}"
            )));
        }
        Ok(())
    }
}

/// The contiguous data behind a standard-layout array
///
/// Callers obtain the array from `ArrayViewD::as_standard_layout`, which only
/// copies when the view is not already row-major.
pub(crate) fn contiguous<'a, T: Interpolate>(array: &'a CowArray<'_, T, IxDyn>) -> Result<&'a [T]> {
    array
        .as_slice()
        .ok_or_else(|| Error::shape("array is not contiguous in standard layout"))
}

/// Validate spacing against a spatial rank
pub(crate) fn check_spacing(spacing: &[f64], rank: usize) -> Result<()> {
    if spacing.len() != rank {
        return Err(Error::shape(format!(
            "expected {rank} spacing values, got {}",
            spacing.len()
        )));
    }
    for (axis, &value) in spacing.iter().enumerate() {
        if !(value.is_finite() && value > 0.0) {
            return Err(Error::InvalidSpacing { axis, value });
        }
    }
    Ok(())
}
