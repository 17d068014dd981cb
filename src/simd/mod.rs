//! SIMD-optimized sampling kernels

#[cfg(target_arch = "x86_64")]
pub mod avx2;
