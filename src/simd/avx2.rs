//! AVX2-optimized 3D trilinear grid sampling for f32
//!
//! Every kernel walks a contiguous run of output voxels of one batch entry,
//! eight at a time. Coordinates, validity masks and the eight corner weights
//! are computed in 256-bit registers; the corner gather is done per lane.
//!
//! Corner `k` takes the high neighbour along axis `a` when bit `a` of `k` is
//! set (bit 0 is z), matching the scalar kernels.

use std::arch::x86_64::*;
use std::sync::atomic::AtomicU32;

use crate::accelerated::atomic_add_f32;

/// Geometry shared by every kernel call of one sampling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Volume {
    /// Spatial image shape `(d, h, w)`
    pub shape: [usize; 3],
    /// Image channels per batch entry
    pub channels: usize,
    /// Voxels per grid component plane (and per output channel)
    pub plane_len: usize,
    /// Clamp coordinates into the image instead of zeroing the sample
    pub border: bool,
}

impl Volume {
    pub fn new(shape: [usize; 3], channels: usize, plane_len: usize, border: bool) -> Self {
        Self {
            shape,
            channels,
            plane_len,
            border,
        }
    }

    #[inline]
    pub fn voxels(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }
}

/// Eight samples located in the image
struct Lanes {
    lo: [[i32; 8]; 3],
    frac: [[f32; 8]; 3],
    weights: [[f32; 8]; 8],
    /// Bit `j` set when lane `j` contributes
    valid: i32,
    /// Bit `j` of entry `a` set when lane `j` was clamped along axis `a`
    clamped: [i32; 3],
}

impl Lanes {
    #[inline(always)]
    fn is_valid(&self, j: usize) -> bool {
        (self.valid >> j) & 1 == 1
    }

    #[inline(always)]
    fn is_clamped(&self, a: usize, j: usize) -> bool {
        (self.clamped[a] >> j) & 1 == 1
    }

    /// Flat offset of corner `k` for lane `j`, `None` past the last index
    #[inline(always)]
    fn corner_offset(&self, j: usize, k: usize, vol: &Volume) -> Option<usize> {
        let z = self.lo[0][j] as usize + (k & 1);
        let y = self.lo[1][j] as usize + ((k >> 1) & 1);
        let x = self.lo[2][j] as usize + ((k >> 2) & 1);
        if z >= vol.shape[0] || y >= vol.shape[1] || x >= vol.shape[2] {
            return None;
        }
        Some((z * vol.shape[1] + y) * vol.shape[2] + x)
    }

    /// `d(weight_k)/d(index_a)` for lane `j`
    #[inline(always)]
    fn corner_dweights(&self, j: usize, k: usize) -> [f32; 3] {
        let mut factors = [0.0f32; 3];
        let mut signs = [0.0f32; 3];
        for a in 0..3 {
            let f = self.frac[a][j];
            if (k >> a) & 1 == 1 {
                factors[a] = f;
                signs[a] = 1.0;
            } else {
                factors[a] = 1.0 - f;
                signs[a] = -1.0;
            }
        }
        [
            signs[0] * factors[1] * factors[2],
            signs[1] * factors[0] * factors[2],
            signs[2] * factors[0] * factors[1],
        ]
    }
}

/// Copy up to eight voxels of each grid component, padding with NaN
#[inline(always)]
fn load_coords(grid: &[f32], plane_len: usize, start: usize, n: usize) -> [[f32; 8]; 3] {
    let mut coords = [[f32::NAN; 8]; 3];
    for (a, lane) in coords.iter_mut().enumerate() {
        let base = a * plane_len + start;
        lane[..n].copy_from_slice(&grid[base..base + n]);
    }
    coords
}

#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn locate_lanes(coords: &[[f32; 8]; 3], vol: &Volume) -> Lanes {
    let zero = _mm256_setzero_ps();
    let one = _mm256_set1_ps(1.0);
    let minus_one = _mm256_set1_ps(-1.0);

    let mut lanes = Lanes {
        lo: [[0; 8]; 3],
        frac: [[0.0; 8]; 3],
        weights: [[0.0; 8]; 8],
        valid: 0,
        clamped: [0; 3],
    };

    let mut valid = _mm256_cmp_ps::<_CMP_EQ_OQ>(zero, zero);
    let mut f = [zero; 3];
    let mut g = [one; 3];

    for a in 0..3 {
        let max = (vol.shape[a] - 1) as f32;
        let vmax = _mm256_set1_ps(max);
        let half = _mm256_set1_ps(max * 0.5);

        // idx = (coord + 1) * (size - 1) / 2
        let coord = _mm256_loadu_ps(coords[a].as_ptr());
        let mut idx = _mm256_fmadd_ps(coord, half, half);

        // Bounds are decided on the coordinate, not on the rounded index
        let inside = if vol.shape[a] > 1 {
            _mm256_and_ps(
                _mm256_cmp_ps::<_CMP_GE_OQ>(coord, minus_one),
                _mm256_cmp_ps::<_CMP_LE_OQ>(coord, one),
            )
        } else {
            // Degenerate axis: every finite coordinate reads index 0
            _mm256_cmp_ps::<_CMP_ORD_Q>(idx, idx)
        };

        if vol.border {
            let ordered = _mm256_cmp_ps::<_CMP_ORD_Q>(idx, idx);
            lanes.clamped[a] = _mm256_movemask_ps(_mm256_andnot_ps(inside, ordered));
            // max_ps returns the second operand for NaN lanes
            idx = _mm256_min_ps(_mm256_max_ps(idx, zero), vmax);
            valid = _mm256_and_ps(valid, ordered);
        } else {
            // Invalid lanes are parked on index 0 so the conversion stays in range
            idx = _mm256_and_ps(idx, inside);
            valid = _mm256_and_ps(valid, inside);
        }

        let lo = _mm256_floor_ps(idx);
        let frac = _mm256_sub_ps(idx, lo);

        _mm256_storeu_si256(lanes.lo[a].as_mut_ptr() as *mut __m256i, _mm256_cvttps_epi32(lo));
        _mm256_storeu_ps(lanes.frac[a].as_mut_ptr(), frac);

        f[a] = frac;
        g[a] = _mm256_sub_ps(one, frac);
    }

    lanes.valid = _mm256_movemask_ps(valid);

    let (fz, fy, fx) = (f[0], f[1], f[2]);
    let (gz, gy, gx) = (g[0], g[1], g[2]);

    // w<z><y><x>: 1 selects the high neighbour
    let w000 = _mm256_mul_ps(_mm256_mul_ps(gz, gy), gx);
    let w100 = _mm256_mul_ps(_mm256_mul_ps(fz, gy), gx);
    let w010 = _mm256_mul_ps(_mm256_mul_ps(gz, fy), gx);
    let w110 = _mm256_mul_ps(_mm256_mul_ps(fz, fy), gx);
    let w001 = _mm256_mul_ps(_mm256_mul_ps(gz, gy), fx);
    let w101 = _mm256_mul_ps(_mm256_mul_ps(fz, gy), fx);
    let w011 = _mm256_mul_ps(_mm256_mul_ps(gz, fy), fx);
    let w111 = _mm256_mul_ps(_mm256_mul_ps(fz, fy), fx);

    _mm256_storeu_ps(lanes.weights[0].as_mut_ptr(), w000);
    _mm256_storeu_ps(lanes.weights[1].as_mut_ptr(), w100);
    _mm256_storeu_ps(lanes.weights[2].as_mut_ptr(), w010);
    _mm256_storeu_ps(lanes.weights[3].as_mut_ptr(), w110);
    _mm256_storeu_ps(lanes.weights[4].as_mut_ptr(), w001);
    _mm256_storeu_ps(lanes.weights[5].as_mut_ptr(), w101);
    _mm256_storeu_ps(lanes.weights[6].as_mut_ptr(), w011);
    _mm256_storeu_ps(lanes.weights[7].as_mut_ptr(), w111);

    lanes
}

// =============================================================================
// FORWARD
// =============================================================================

/// Trilinear sampling of one image channel over output voxels
/// `start..start + out.len()`
///
/// `grid` holds the three component planes of the batch entry, each
/// `vol.plane_len` long.
///
/// # Safety
///
/// Requires AVX2 and FMA CPU features. Caller must verify these are available.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn sample_run_f32(image: &[f32], grid: &[f32], out: &mut [f32], start: usize, vol: &Volume) {
    let mut i = 0;
    while i < out.len() {
        let n = (out.len() - i).min(8);
        let lanes = locate_lanes(&load_coords(grid, vol.plane_len, start + i, n), vol);

        let mut result = [0.0f32; 8];
        for (j, r) in result.iter_mut().enumerate().take(n) {
            if !lanes.is_valid(j) {
                continue;
            }
            let mut acc = 0.0f32;
            for k in 0..8 {
                if let Some(offset) = lanes.corner_offset(j, k, vol) {
                    acc += lanes.weights[k][j] * image[offset];
                }
            }
            *r = acc;
        }

        if n == 8 {
            _mm256_storeu_ps(out[i..].as_mut_ptr(), _mm256_loadu_ps(result.as_ptr()));
        } else {
            out[i..i + n].copy_from_slice(&result[..n]);
        }
        i += n;
    }
}

// =============================================================================
// BACKWARD
// =============================================================================

/// Gradients of one batch entry over output voxels `start..start + len`,
/// where `len = grad_grid.len() / 3`
///
/// `image`, `grad_output` and `grad_input` hold every channel of the batch
/// entry. `grad_input` is shared with other runs and updated atomically;
/// `grad_grid` receives component `a` of voxel `start + i` at `a * len + i`.
///
/// # Safety
///
/// Requires AVX2 and FMA CPU features. Caller must verify these are available.
#[target_feature(enable = "avx2", enable = "fma")]
pub unsafe fn sample_backward_run_f32(
    image: &[f32],
    grid: &[f32],
    grad_output: &[f32],
    grad_input: &[AtomicU32],
    grad_grid: &mut [f32],
    start: usize,
    vol: &Volume,
) {
    let len = grad_grid.len() / 3;
    let in_voxels = vol.voxels();
    let half_extent = [
        (vol.shape[0] - 1) as f32 * 0.5,
        (vol.shape[1] - 1) as f32 * 0.5,
        (vol.shape[2] - 1) as f32 * 0.5,
    ];

    let mut i = 0;
    while i < len {
        let n = (len - i).min(8);
        let lanes = locate_lanes(&load_coords(grid, vol.plane_len, start + i, n), vol);

        for j in 0..n {
            if !lanes.is_valid(j) {
                continue;
            }
            let v = start + i + j;

            let mut offsets = [None; 8];
            let mut dweights = [[0.0f32; 3]; 8];
            for k in 0..8 {
                offsets[k] = lanes.corner_offset(j, k, vol);
                dweights[k] = lanes.corner_dweights(j, k);
            }

            let mut g = [0.0f32; 3];
            for c in 0..vol.channels {
                let go = grad_output[c * vol.plane_len + v];
                if go == 0.0 {
                    continue;
                }
                let plane = &image[c * in_voxels..(c + 1) * in_voxels];
                let scatter = &grad_input[c * in_voxels..(c + 1) * in_voxels];

                let mut dval = [0.0f32; 3];
                for k in 0..8 {
                    let Some(offset) = offsets[k] else {
                        continue;
                    };
                    atomic_add_f32(&scatter[offset], lanes.weights[k][j] * go);
                    let value = plane[offset];
                    dval[0] += value * dweights[k][0];
                    dval[1] += value * dweights[k][1];
                    dval[2] += value * dweights[k][2];
                }
                g[0] += go * dval[0];
                g[1] += go * dval[1];
                g[2] += go * dval[2];
            }

            for a in 0..3 {
                grad_grid[a * len + i + j] = if lanes.is_clamped(a, j) {
                    0.0
                } else {
                    g[a] * half_extent[a]
                };
            }
        }
        i += n;
    }
}
