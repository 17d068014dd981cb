//! Summary statistics of Jacobian-determinant fields
//!
//! A registration result is certified per pair by a [`DeterminantReport`]
//! (statistics over the whole image and over the source foreground), and
//! across a study by a [`ReportAggregate`].

use crate::error::{Error, Result};
use crate::Interpolate;
use ndarray::{ArrayD, ArrayViewD, Axis};
use std::fmt;

const HEADER: &str = "min, max, mean, median, 1p, 5p, 95p, 99p";

/// Linear interpolation between order statistics (numpy's default)
///
/// `sorted` must be non-empty and ascending.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64 / 100.0;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Ascending copy of `values`, `None` when any value is NaN
fn sorted(values: &[f64]) -> Option<Vec<f64>> {
    if values.iter().any(|v| v.is_nan()) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(sorted)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Distribution of determinant values over a set of voxels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeterminantStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p1: f64,
    pub p5: f64,
    pub p95: f64,
    pub p99: f64,
    /// Number of voxels summarized
    pub voxels: usize,
    /// Voxels with a non-positive determinant
    pub folded: usize,
}

impl DeterminantStatistics {
    pub fn from_values(values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::EmptySelection(
                "no determinant values to summarize".to_string(),
            ));
        }
        let folded = values.iter().filter(|&&d| d <= 0.0).count();
        let Some(sorted) = sorted(values) else {
            // A NaN anywhere makes every order statistic undefined
            tracing::warn!(voxels = values.len(), "determinant field contains NaN");
            return Ok(Self {
                min: f64::NAN,
                max: f64::NAN,
                mean: f64::NAN,
                median: f64::NAN,
                p1: f64::NAN,
                p5: f64::NAN,
                p95: f64::NAN,
                p99: f64::NAN,
                voxels: values.len(),
                folded,
            });
        };
        Ok(Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: mean(&sorted),
            median: percentile(&sorted, 50.0),
            p1: percentile(&sorted, 1.0),
            p5: percentile(&sorted, 5.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            voxels: sorted.len(),
            folded,
        })
    }

    /// Statistics of the voxels where `mask` is set
    pub fn from_masked(det: &ArrayViewD<'_, f64>, mask: &ArrayViewD<'_, bool>) -> Result<Self> {
        if det.shape() != mask.shape() {
            return Err(Error::shape(format!(
                "mask {:?} does not match determinant field {:?}",
                mask.shape(),
                det.shape()
            )));
        }
        let values: Vec<f64> = det
            .iter()
            .zip(mask.iter())
            .filter_map(|(&d, &keep)| keep.then_some(d))
            .collect();
        if values.is_empty() {
            return Err(Error::EmptySelection("mask selects no voxels".to_string()));
        }
        Self::from_values(&values)
    }

    /// Any voxel with a non-positive determinant
    pub fn has_folding(&self) -> bool {
        self.folded > 0
    }
}

impl fmt::Display for DeterminantStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}, {}, {}, {}",
            self.min, self.max, self.mean, self.median, self.p1, self.p5, self.p95, self.p99
        )
    }
}

/// Foreground of a `(N, C, *S)` image: voxels where channel 0 is nonzero
///
/// Returns a `(N, *S)` mask, aligned with a determinant field.
pub fn nonzero_mask<T: Interpolate>(image: &ArrayViewD<'_, T>) -> Result<ArrayD<bool>> {
    if image.ndim() < 3 || image.shape()[1] == 0 {
        return Err(Error::shape(format!(
            "image must be (batch, channels >= 1, *spatial), got {:?}",
            image.shape()
        )));
    }
    Ok(image.index_axis(Axis(1), 0).mapv(|v| v.to_f64() != 0.0))
}

/// Determinant statistics of one registration pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeterminantReport {
    /// Over the entire image
    pub all: DeterminantStatistics,
    /// Over the nonzero region of the source image
    pub nonzero: DeterminantStatistics,
}

impl DeterminantReport {
    /// Summarize `det` `(N, *S)` globally and over the foreground of
    /// `source_image` `(N, C, *S)`
    pub fn evaluate<T: Interpolate>(det: &ArrayViewD<'_, f64>, source_image: &ArrayViewD<'_, T>) -> Result<Self> {
        let mask = nonzero_mask(source_image)?;
        let all = DeterminantStatistics::from_values(&det.iter().copied().collect::<Vec<_>>())?;
        let nonzero = DeterminantStatistics::from_masked(det, &mask.view())?;

        tracing::info!(
            voxels = all.voxels,
            foreground = nonzero.voxels,
            min = all.min,
            median = all.median,
            "determinant of jacobian summary"
        );
        if all.has_folding() {
            tracing::warn!(
                folded = all.folded,
                folded_foreground = nonzero.folded,
                "deformation folds"
            );
        }

        Ok(Self { all, nonzero })
    }
}

impl fmt::Display for DeterminantReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Over the entire image:")?;
        writeln!(f, "{HEADER}")?;
        writeln!(f, "{}", self.all)?;
        writeln!(f, "Over non-zero-regions of the image:")?;
        writeln!(f, "{HEADER}")?;
        writeln!(f, "{}", self.nonzero)
    }
}

/// Spread of one per-pair statistic across pairs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSummary {
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation
    pub std: f64,
}

impl StatSummary {
    fn from_values(values: &[f64]) -> Self {
        let mean = mean(values);
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        Self {
            mean,
            median: sorted(values).map_or(f64::NAN, |s| percentile(&s, 50.0)),
            std: var.sqrt(),
        }
    }
}

/// Aggregates for one region (whole image or foreground)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionAggregate {
    pub mean: StatSummary,
    pub median: StatSummary,
    pub p1: StatSummary,
    pub p5: StatSummary,
    pub p95: StatSummary,
    pub p99: StatSummary,
}

impl RegionAggregate {
    fn from_stats(stats: &[DeterminantStatistics]) -> Self {
        let summarize = |get: fn(&DeterminantStatistics) -> f64| {
            StatSummary::from_values(&stats.iter().map(get).collect::<Vec<_>>())
        };
        Self {
            mean: summarize(|s| s.mean),
            median: summarize(|s| s.median),
            p1: summarize(|s| s.p1),
            p5: summarize(|s| s.p5),
            p95: summarize(|s| s.p95),
            p99: summarize(|s| s.p99),
        }
    }

    fn entries(&self) -> [(&'static str, &StatSummary); 6] {
        [
            ("mean", &self.mean),
            ("median", &self.median),
            ("1_perc", &self.p1),
            ("5_perc", &self.p5),
            ("95_perc", &self.p95),
            ("99_perc", &self.p99),
        ]
    }

    fn write(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, s) in self.entries() {
            writeln!(f, "Stat = {name}")?;
            writeln!(f, "mean, median, std")?;
            writeln!(f, "{}, {}, {}", s.mean, s.median, s.std)?;
        }
        Ok(())
    }
}

/// Study-level summary of many [`DeterminantReport`]s
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportAggregate {
    pub pairs: usize,
    pub all: RegionAggregate,
    pub nonzero: RegionAggregate,
}

impl ReportAggregate {
    pub fn from_reports(reports: &[DeterminantReport]) -> Result<Self> {
        if reports.is_empty() {
            return Err(Error::EmptySelection("no reports to aggregate".to_string()));
        }
        let all: Vec<_> = reports.iter().map(|r| r.all).collect();
        let nonzero: Vec<_> = reports.iter().map(|r| r.nonzero).collect();

        tracing::info!(pairs = reports.len(), "aggregating determinant reports");

        Ok(Self {
            pairs: reports.len(),
            all: RegionAggregate::from_stats(&all),
            nonzero: RegionAggregate::from_stats(&nonzero),
        })
    }
}

impl fmt::Display for ReportAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Over all the means of the entire images:")?;
        writeln!(f, "----------------------------------------\n")?;
        self.all.write(f)?;
        writeln!(f, "Over all the means of the non-zero image regions:")?;
        writeln!(f, "-------------------------------------------------\n")?;
        self.nonzero.write(f)
    }
}
