//! Determinant of the Jacobian of a deformation map
//!
//! Derivatives are finite differences in physical units: central differences
//! in the interior and one-sided differences on the first and last voxel of
//! each axis. An axis of length one has no neighbours and contributes a zero
//! derivative.

use crate::config::ExecutionContext;
use crate::error::{Error, Result};
use crate::layout::{check_spacing, MAX_RANK};
use crate::Interpolate;
use ndarray::{ArrayD, ArrayViewD, IxDyn};

type Matrix = [[f64; MAX_RANK]; MAX_RANK];

/// Geometry of a `(N, d, *S)` vector field
struct Field<'a, T> {
    data: &'a [T],
    rank: usize,
    shape: [usize; MAX_RANK],
    strides: [usize; MAX_RANK],
    voxels: usize,
}

impl<'a, T: Interpolate> Field<'a, T> {
    fn new(data: &'a [T], field_shape: &[usize]) -> Result<Self> {
        if field_shape.len() < 3 {
            return Err(Error::shape(format!(
                "deformation must be (batch, d, *spatial), got {field_shape:?}"
            )));
        }
        let rank = field_shape.len() - 2;
        if rank > MAX_RANK {
            return Err(Error::UnsupportedRank(rank));
        }
        if field_shape[1] != rank {
            return Err(Error::shape(format!(
                "deformation has {} components but {rank} spatial dimensions",
                field_shape[1]
            )));
        }

        let mut shape = [1usize; MAX_RANK];
        shape[..rank].copy_from_slice(&field_shape[2..]);
        let mut strides = [0usize; MAX_RANK];
        let mut stride = 1;
        for a in (0..rank).rev() {
            strides[a] = stride;
            stride *= shape[a];
        }

        Ok(Self {
            data,
            rank,
            shape,
            strides,
            voxels: stride,
        })
    }

    /// Spatial coordinates of flat voxel `v`
    #[inline]
    fn unravel(&self, mut v: usize) -> [usize; MAX_RANK] {
        let mut x = [0usize; MAX_RANK];
        for a in 0..self.rank {
            x[a] = v / self.strides[a];
            v %= self.strides[a];
        }
        x
    }

    /// `d(component)/d(axis)` at voxel `v`, whose coordinates are `x`
    #[inline]
    fn derivative(&self, component: &[T], v: usize, x: &[usize; MAX_RANK], axis: usize, h: f64) -> f64 {
        let size = self.shape[axis];
        if size < 2 {
            return 0.0;
        }
        let stride = self.strides[axis];
        let at = |i: usize| component[i].to_f64();

        if x[axis] == 0 {
            (at(v + stride) - at(v)) / h
        } else if x[axis] == size - 1 {
            (at(v) - at(v - stride)) / h
        } else {
            (at(v + stride) - at(v - stride)) / (2.0 * h)
        }
    }

    fn jacobian(&self, b: usize, v: usize, spacing: &[f64]) -> Matrix {
        let x = self.unravel(v);
        let mut jac = [[0.0; MAX_RANK]; MAX_RANK];
        for (i, row) in jac.iter_mut().enumerate().take(self.rank) {
            let start = (b * self.rank + i) * self.voxels;
            let component = &self.data[start..start + self.voxels];
            for (j, entry) in row.iter_mut().enumerate().take(self.rank) {
                *entry = self.derivative(component, v, &x, j, spacing[j]);
            }
        }
        jac
    }
}

#[inline]
fn determinant(m: &Matrix, rank: usize) -> f64 {
    match rank {
        1 => m[0][0],
        2 => m[0][0] * m[1][1] - m[0][1] * m[1][0],
        _ => {
            m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
                + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
        }
    }
}

fn evaluate<T: Interpolate>(
    ctx: &ExecutionContext,
    field: &ArrayViewD<'_, T>,
    spacing: &[f64],
    displacement: bool,
) -> Result<ArrayD<f64>> {
    let field_shape = field.shape().to_vec();
    let standard = field.as_standard_layout();
    let data = standard
        .as_slice()
        .ok_or_else(|| Error::shape("deformation is not contiguous in standard layout"))?;

    let geometry = Field::new(data, &field_shape)?;
    check_spacing(spacing, geometry.rank)?;

    let batch = field_shape[0];
    let voxels = geometry.voxels;
    let rank = geometry.rank;

    tracing::debug!(shape = ?field_shape, displacement, "determinant of jacobian");

    let det = ctx.map_range(batch * voxels, |i| {
        let mut jac = geometry.jacobian(i / voxels, i % voxels, spacing);
        if displacement {
            for (a, row) in jac.iter_mut().enumerate().take(rank) {
                row[a] += 1.0;
            }
        }
        determinant(&jac, rank)
    });

    let folded = det.iter().filter(|&&d| d <= 0.0).count();
    if folded > 0 {
        tracing::warn!(folded, total = det.len(), "deformation folds: non-positive jacobian determinants");
    }

    let out_shape: Vec<usize> = [&[batch][..], &field_shape[2..]].concat();
    ArrayD::from_shape_vec(IxDyn(&out_shape), det).map_err(|e| Error::shape(e.to_string()))
}

/// Per-voxel determinant of the Jacobian of a deformation map
///
/// # Arguments
///
/// * `map` - `(N, d, *S)` positions in physical units, `1 <= d <= 3`
/// * `spacing` - physical voxel size along each of the `d` axes
///
/// # Returns
///
/// `(N, *S)` determinants. Values `<= 0` mark folding; they are reported
/// through `tracing` and never treated as an error.
pub fn determinant_of_jacobian<T: Interpolate>(map: &ArrayViewD<'_, T>, spacing: &[f64]) -> Result<ArrayD<f64>> {
    evaluate(&ExecutionContext::current(), map, spacing, false)
}

/// [`determinant_of_jacobian`] on an explicit execution context
pub fn determinant_of_jacobian_in<T: Interpolate>(
    ctx: &ExecutionContext,
    map: &ArrayViewD<'_, T>,
    spacing: &[f64],
) -> Result<ArrayD<f64>> {
    evaluate(ctx, map, spacing, false)
}

/// Determinant of `I + grad(u)` for a displacement field `u`
///
/// Equivalent to [`determinant_of_jacobian`] of the map `x * h + u`.
pub fn determinant_of_jacobian_of_displacement<T: Interpolate>(
    displacement: &ArrayViewD<'_, T>,
    spacing: &[f64],
) -> Result<ArrayD<f64>> {
    evaluate(&ExecutionContext::current(), displacement, spacing, true)
}
