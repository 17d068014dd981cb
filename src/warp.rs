//! Warping images with deformation maps in physical units
//!
//! A deformation map has shape `(N, d, *S_out)`; component `a` holds, for
//! every output voxel, the physical position along axis `a` of the source
//! image to read from. Voxel `x` of an axis with spacing `h` sits at `x * h`,
//! so the first voxel is at 0 and the last at `(S - 1) * h`.
//!
//! The map is converted to the normalized `[-1, 1]` grid that every
//! [`GridSampler`] consumes, and gradients are carried back through the same
//! affine rescaling.

use crate::error::{Error, Result};
use crate::layout::check_spacing;
use crate::sampler::GridSampler;
use crate::Interpolate;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

/// Adjoints produced by [`warp_image_backward`]
#[derive(Debug, Clone, PartialEq)]
pub struct WarpGradients<T> {
    /// Same shape as the image
    pub grad_image: ArrayD<T>,
    /// Same shape as the map, in value units per physical unit
    pub grad_map: ArrayD<T>,
}

/// Normalized coordinate of voxel `x` on an axis of `size` voxels
#[inline]
fn normalized(x: usize, size: usize) -> f64 {
    if size > 1 {
        2.0 * x as f64 / (size - 1) as f64 - 1.0
    } else {
        0.0
    }
}

/// The grid that reproduces an image of spatial shape `shape`
///
/// Shape `(batch, d, *shape)` with `g_a = 2 x_a / (S_a - 1) - 1`; degenerate
/// axes get 0.
pub fn identity_grid<T: Interpolate>(batch: usize, shape: &[usize]) -> ArrayD<T> {
    let full: Vec<usize> = [&[batch, shape.len()][..], shape].concat();
    ArrayD::from_shape_fn(IxDyn(&full), |ix| {
        let a = ix[1];
        T::from_f64(normalized(ix[2 + a], shape[a]))
    })
}

/// The identity deformation `map_a(x) = x_a * h_a`
pub fn identity_map<T: Interpolate>(batch: usize, shape: &[usize], spacing: &[f64]) -> Result<ArrayD<T>> {
    check_spacing(spacing, shape.len())?;
    let full: Vec<usize> = [&[batch, shape.len()][..], shape].concat();
    Ok(ArrayD::from_shape_fn(IxDyn(&full), |ix| {
        let a = ix[1];
        T::from_f64(ix[2 + a] as f64 * spacing[a])
    }))
}

fn check_map(map_shape: &[usize], rank: usize) -> Result<()> {
    if map_shape.len() != rank + 2 || map_shape[1] != rank {
        return Err(Error::shape(format!(
            "map {map_shape:?} must be (batch, {rank}, *spatial) for a {rank}-D source image"
        )));
    }
    Ok(())
}

/// Physical half-extent `h_a (S_a - 1) / 2` of each source axis
fn half_extents(spacing: &[f64], source_shape: &[usize]) -> Vec<f64> {
    spacing
        .iter()
        .zip(source_shape)
        .map(|(&h, &s)| (s.max(1) - 1) as f64 * h * 0.5)
        .collect()
}

/// Rescale a physical map to normalized sampling coordinates
///
/// `g_a = map_a * 2 / (h_a (S_a - 1)) - 1`, where `S` is the spatial shape of
/// the image that will be sampled. Degenerate source axes map to 0.
pub fn map_to_grid<T: Interpolate>(
    map: &ArrayViewD<'_, T>,
    spacing: &[f64],
    source_shape: &[usize],
) -> Result<ArrayD<T>> {
    check_map(map.shape(), source_shape.len())?;
    check_spacing(spacing, source_shape.len())?;
    let half = half_extents(spacing, source_shape);

    let mut grid = map.to_owned();
    for (a, mut component) in grid.axis_iter_mut(Axis(1)).enumerate() {
        let e = half[a];
        if source_shape[a] > 1 {
            component.mapv_inplace(|m| T::from_f64(m.to_f64() / e - 1.0));
        } else {
            component.fill(T::from_f64(0.0));
        }
    }
    Ok(grid)
}

fn source_shape(image_shape: &[usize]) -> Result<&[usize]> {
    if image_shape.len() < 3 {
        return Err(Error::shape(format!(
            "image must be (batch, channels, *spatial), got {image_shape:?}"
        )));
    }
    Ok(&image_shape[2..])
}

/// Warp `image` `(N, C, *S)` by a physical deformation map `(N, d, *S_out)`
pub fn warp_image<T, S>(
    sampler: &S,
    image: &ArrayViewD<'_, T>,
    map: &ArrayViewD<'_, T>,
    spacing: &[f64],
) -> Result<ArrayD<T>>
where
    T: Interpolate,
    S: GridSampler<T> + ?Sized,
{
    let grid = map_to_grid(map, spacing, source_shape(image.shape())?)?;
    sampler.sample(image, &grid.view())
}

/// Gradients of `sum(grad_output * warp_image(image, map))`
///
/// `grad_map_a = grad_grid_a * 2 / (h_a (S_a - 1))`, 0 on degenerate axes.
pub fn warp_image_backward<T, S>(
    sampler: &S,
    image: &ArrayViewD<'_, T>,
    map: &ArrayViewD<'_, T>,
    spacing: &[f64],
    grad_output: &ArrayViewD<'_, T>,
) -> Result<WarpGradients<T>>
where
    T: Interpolate,
    S: GridSampler<T> + ?Sized,
{
    let source = source_shape(image.shape())?;
    let grid = map_to_grid(map, spacing, source)?;
    let grads = sampler.sample_backward(image, &grid.view(), grad_output)?;

    let half = half_extents(spacing, source);
    let mut grad_map = grads.grad_grid;
    for (a, mut component) in grad_map.axis_iter_mut(Axis(1)).enumerate() {
        let e = half[a];
        if e > 0.0 {
            component.mapv_inplace(|g| T::from_f64(g.to_f64() / e));
        } else {
            component.fill(T::from_f64(0.0));
        }
    }

    Ok(WarpGradients {
        grad_image: grads.grad_input,
        grad_map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::ReferenceSampler;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_grid_values() {
        let grid = identity_grid::<f64>(2, &[3, 5]);
        assert_eq!(grid.shape(), &[2, 2, 3, 5]);
        assert_eq!(grid[[0, 0, 0, 4]], -1.0);
        assert_eq!(grid[[1, 0, 2, 0]], 1.0);
        assert_eq!(grid[[0, 1, 1, 2]], 0.0);
        assert_eq!(grid[[0, 1, 1, 3]], 0.5);
    }

    #[test]
    fn test_identity_grid_degenerate_axis() {
        let grid = identity_grid::<f32>(1, &[1, 4]);
        assert!(grid.index_axis(Axis(1), 0).iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_identity_map_to_grid() {
        let spacing = [0.5, 2.0, 1.5];
        let map = identity_map::<f64>(1, &[4, 3, 5], &spacing).unwrap();
        assert_eq!(map[[0, 1, 0, 2, 0]], 4.0);

        let grid = map_to_grid(&map.view(), &spacing, &[4, 3, 5]).unwrap();
        let expected = identity_grid::<f64>(1, &[4, 3, 5]);
        for (g, e) in grid.iter().zip(expected.iter()) {
            assert_relative_eq!(*g, *e, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_map_rejects_bad_inputs() {
        let map = ArrayD::<f64>::zeros(IxDyn(&[1, 2, 3, 3]));
        assert!(matches!(
            map_to_grid(&map.view(), &[1.0, 1.0, 1.0], &[3, 3, 3]),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(
            map_to_grid(&map.view(), &[1.0, -1.0], &[3, 3]),
            Err(Error::InvalidSpacing { axis: 1, .. })
        ));
    }

    #[test]
    fn test_warp_identity_reproduces_image() {
        let image = ArrayD::from_shape_fn(IxDyn(&[1, 2, 4, 6]), |ix| (ix[1] * 30 + ix[2] * 6 + ix[3]) as f64);
        let spacing = [1.5, 0.25];
        let map = identity_map::<f64>(1, &[4, 6], &spacing).unwrap();

        let warped = warp_image(&ReferenceSampler::default(), &image.view(), &map.view(), &spacing).unwrap();
        for (w, i) in warped.iter().zip(image.iter()) {
            assert_relative_eq!(*w, *i, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_warp_backward_physical_slope() {
        // Spacing 2: voxels at 0, 2, 4; reading at physical 1.0 lands halfway
        let image = ArrayD::from_shape_vec(IxDyn(&[1, 1, 3]), vec![0.0f64, 10.0, 40.0]).unwrap();
        let map = ArrayD::from_shape_vec(IxDyn(&[1, 1, 1]), vec![1.0f64]).unwrap();
        let grad_output = ArrayD::from_elem(IxDyn(&[1, 1, 1]), 1.0f64);
        let sampler = ReferenceSampler::default();

        let warped = warp_image(&sampler, &image.view(), &map.view(), &[2.0]).unwrap();
        assert_relative_eq!(warped[[0, 0, 0]], 5.0, epsilon = 1e-12);

        let grads = warp_image_backward(&sampler, &image.view(), &map.view(), &[2.0], &grad_output.view()).unwrap();
        // 10 value units over 2 physical units
        assert_relative_eq!(grads.grad_map[[0, 0, 0]], 5.0, epsilon = 1e-12);
        assert_relative_eq!(grads.grad_image[[0, 0, 0]], 0.5, epsilon = 1e-12);
        assert_relative_eq!(grads.grad_image[[0, 0, 1]], 0.5, epsilon = 1e-12);
    }
}
