//! Backend selection, padding policy and the execution context
//!
//! Backends are chosen explicitly by the caller. Requesting the accelerated
//! backend on a machine without AVX2/FMA is an error, never a silent fallback.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
#[cfg(feature = "parallel")]
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Which grid-sampling implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Portable N-D scalar kernels (1D, 2D and 3D)
    #[default]
    Reference,
    /// AVX2/FMA kernels for 3D volumes
    Accelerated,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Reference => "reference",
            Backend::Accelerated => "accelerated",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reference" | "cpu" | "scalar" => Ok(Backend::Reference),
            "accelerated" | "avx2" | "simd" => Ok(Backend::Accelerated),
            other => Err(Error::config(format!("unknown backend `{other}`"))),
        }
    }
}

/// What a sample outside the image contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PaddingMode {
    /// Samples whose continuous index leaves `[0, size - 1]` along any axis are zero
    #[default]
    Zeros,
    /// Continuous indices are clamped into `[0, size - 1]`
    Border,
}

impl fmt::Display for PaddingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaddingMode::Zeros => f.write_str("zeros"),
            PaddingMode::Border => f.write_str("border"),
        }
    }
}

impl FromStr for PaddingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zeros" | "zero" => Ok(PaddingMode::Zeros),
            "border" | "clamp" => Ok(PaddingMode::Border),
            other => Err(Error::config(format!("unknown padding mode `{other}`"))),
        }
    }
}

/// Sampler configuration
///
/// `num_threads = None` runs on the rayon pool of the calling thread;
/// `Some(n)` builds a dedicated pool with `n` workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplerConfig {
    pub backend: Backend,
    pub padding: PaddingMode,
    pub num_threads: Option<usize>,
}

impl SamplerConfig {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_padding(mut self, padding: PaddingMode) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Build the execution context described by this configuration
    pub fn context(&self) -> Result<ExecutionContext> {
        match self.num_threads {
            Some(n) => ExecutionContext::with_threads(n),
            None => Ok(ExecutionContext::current()),
        }
    }
}

/// Where the data-parallel kernels run
///
/// Threaded explicitly through every sampler so that no kernel depends on
/// ambient state. Without the `parallel` feature every operation runs on the
/// calling thread.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    #[cfg(feature = "parallel")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl ExecutionContext {
    /// Run on whatever rayon pool the caller is already in
    pub fn current() -> Self {
        Self::default()
    }

    /// Run on a dedicated pool with a fixed number of workers
    pub fn with_threads(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::config("thread count must be at least 1"));
        }

        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|e| Error::config(format!("failed to build thread pool: {e}")))?;
            Ok(Self {
                pool: Some(Arc::new(pool)),
            })
        }

        #[cfg(not(feature = "parallel"))]
        {
            Ok(Self::default())
        }
    }

    /// Number of workers kernels are spread over
    pub fn num_threads(&self) -> usize {
        #[cfg(feature = "parallel")]
        {
            match &self.pool {
                Some(pool) => pool.current_num_threads(),
                None => rayon::current_num_threads(),
            }
        }

        #[cfg(not(feature = "parallel"))]
        {
            1
        }
    }

    /// Run `op` inside this context
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        #[cfg(feature = "parallel")]
        {
            match &self.pool {
                Some(pool) => pool.install(op),
                None => op(),
            }
        }

        #[cfg(not(feature = "parallel"))]
        {
            op()
        }
    }

    /// Apply `f(chunk_index, chunk)` to every `chunk_len`-sized chunk of `data`
    ///
    /// Each chunk is owned by exactly one worker.
    pub(crate) fn for_each_chunk<T, F>(&self, data: &mut [T], chunk_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        if chunk_len == 0 || data.is_empty() {
            return;
        }

        #[cfg(feature = "parallel")]
        {
            self.install(|| {
                data.par_chunks_mut(chunk_len)
                    .enumerate()
                    .for_each(|(i, chunk)| f(i, chunk));
            });
        }

        #[cfg(not(feature = "parallel"))]
        {
            for (i, chunk) in data.chunks_mut(chunk_len).enumerate() {
                f(i, chunk);
            }
        }
    }

    /// Evaluate `f(i)` for `i in 0..n`, preserving order
    pub(crate) fn map_range<R, F>(&self, n: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Send + Sync,
    {
        #[cfg(feature = "parallel")]
        {
            self.install(|| (0..n).into_par_iter().map(&f).collect())
        }

        #[cfg(not(feature = "parallel"))]
        {
            (0..n).map(f).collect()
        }
    }
}

/// Build and runtime information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub avx2: bool,
    pub fma: bool,
    pub parallel: bool,
    pub num_threads: usize,
    /// Whether `Backend::Accelerated` can be constructed here
    pub accelerated_available: bool,
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "grid-sampler {}", self.version)?;
        writeln!(f, "  avx2: {}, fma: {}", self.avx2, self.fma)?;
        writeln!(f, "  parallel: {} ({} threads)", self.parallel, self.num_threads)?;
        write!(
            f,
            "  accelerated backend: {}",
            if self.accelerated_available { "available" } else { "unavailable" }
        )
    }
}

/// Report compiled features and what this CPU supports
pub fn build_info() -> BuildInfo {
    #[cfg(target_arch = "x86_64")]
    let (avx2, fma) = (
        is_x86_feature_detected!("avx2"),
        is_x86_feature_detected!("fma"),
    );
    #[cfg(not(target_arch = "x86_64"))]
    let (avx2, fma) = (false, false);

    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        avx2,
        fma,
        parallel: cfg!(feature = "parallel"),
        num_threads: ExecutionContext::current().num_threads(),
        accelerated_available: avx2 && fma,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend() {
        assert_eq!("reference".parse::<Backend>().unwrap(), Backend::Reference);
        assert_eq!("AVX2".parse::<Backend>().unwrap(), Backend::Accelerated);
        assert!(matches!(
            "cuda".parse::<Backend>(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_parse_padding() {
        assert_eq!("zeros".parse::<PaddingMode>().unwrap(), PaddingMode::Zeros);
        assert_eq!(" clamp ".parse::<PaddingMode>().unwrap(), PaddingMode::Border);
        assert!("reflect".parse::<PaddingMode>().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = SamplerConfig::new(Backend::Accelerated)
            .with_padding(PaddingMode::Border)
            .with_threads(2);
        assert_eq!(config.backend, Backend::Accelerated);
        assert_eq!(config.padding, PaddingMode::Border);
        assert_eq!(config.num_threads, Some(2));
        assert_eq!(SamplerConfig::default().backend, Backend::Reference);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(ExecutionContext::with_threads(0).is_err());
    }

    #[test]
    fn test_dedicated_pool() {
        let ctx = ExecutionContext::with_threads(2).unwrap();
        #[cfg(feature = "parallel")]
        assert_eq!(ctx.num_threads(), 2);

        let squares = ctx.map_range(5, |i| i * i);
        assert_eq!(squares, vec![0, 1, 4, 9, 16]);

        let mut data = vec![0usize; 10];
        ctx.for_each_chunk(&mut data, 3, |i, chunk| {
            for v in chunk.iter_mut() {
                *v = i;
            }
        });
        assert_eq!(data, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3]);
    }

    #[test]
    fn test_build_info() {
        let info = build_info();
        assert_eq!(info.accelerated_available, info.avx2 && info.fma);
        assert!(info.num_threads >= 1);
        assert!(info.to_string().contains("grid-sampler"));
    }
}
