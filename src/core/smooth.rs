//! Per-pixel temporal smoothing of index stacks
//!
//! Robust locally-weighted regression (lowess) applied independently to
//! each pixel's time series and evaluated at caller-supplied query days.
//! Weights use the tricube kernel over a neighborhood scaled by
//! `span_fraction`; robustness passes down-weight outlier residuals with
//! bisquare weights. Pixels with fewer valid samples than the threshold
//! come out undefined instead of extrapolated, and a degenerate local
//! window falls back to a plain linear fit so interior query days between
//! two valid samples still interpolate.

use crate::core::indices::IndexKind;
use crate::core::stack::TileStack;
use crate::types::{FluxError, FluxResult, GridGeometry, RasterData, StackData};
use chrono::NaiveDate;
use log::info;
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, Axis};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Weight mass below this triggers the next fallback fit
const MIN_WEIGHT_MASS: f64 = 1e-9;
/// Weighted time spread below this is treated as zero
const MIN_TIME_SPREAD: f64 = 1e-9;

/// Lowess smoothing parameters
#[derive(Debug, Clone)]
pub struct SmootherParams {
    /// Neighborhood half-width as a fraction of the full time range, in (0, 1]
    pub span_fraction: f64,
    /// Robustness re-weighting passes over residuals
    pub iterations: usize,
    /// Pixels with fewer valid samples are left undefined
    pub min_valid_samples: usize,
}

impl Default for SmootherParams {
    fn default() -> Self {
        Self {
            span_fraction: 0.2,
            iterations: 3,
            min_valid_samples: 3,
        }
    }
}

impl SmootherParams {
    pub fn validate(&self) -> FluxResult<()> {
        if !(self.span_fraction > 0.0 && self.span_fraction <= 1.0) {
            return Err(FluxError::InvalidParameter(format!(
                "span_fraction must be in (0, 1], got {}",
                self.span_fraction
            )));
        }
        if self.min_valid_samples == 0 {
            return Err(FluxError::InvalidParameter(
                "min_valid_samples must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Smoothed index values on a fixed grid at fixed query days, plus the
/// per-pixel extrema consumed by phenology-dependent model terms
#[derive(Debug, Clone)]
pub struct SmoothedSeries {
    grid: GridGeometry,
    index: IndexKind,
    query_days: Vec<NaiveDate>,
    values: StackData,
    series_min: RasterData,
    series_max: RasterData,
}

impl SmoothedSeries {
    pub fn grid(&self) -> &GridGeometry {
        &self.grid
    }

    pub fn index(&self) -> IndexKind {
        self.index
    }

    pub fn query_days(&self) -> &[NaiveDate] {
        &self.query_days
    }

    pub fn values(&self) -> &StackData {
        &self.values
    }

    /// 2-D view of one query-day layer
    pub fn layer(&self, q: usize) -> ArrayView2<'_, f32> {
        self.values.index_axis(Axis(2), q)
    }

    /// 2-D view of the layer for `day`, if it was a query day
    pub fn value_at(&self, day: NaiveDate) -> Option<ArrayView2<'_, f32>> {
        self.query_days
            .binary_search(&day)
            .ok()
            .map(|q| self.layer(q))
    }

    /// Per-pixel (min, max) over all query days; NaN for undefined pixels
    pub fn extrema(&self) -> (&RasterData, &RasterData) {
        (&self.series_min, &self.series_max)
    }
}

/// Robust lowess smoother over a stack's time axis
#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    params: SmootherParams,
}

impl TemporalSmoother {
    pub fn new() -> Self {
        Self {
            params: SmootherParams::default(),
        }
    }

    pub fn with_params(params: SmootherParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SmootherParams {
        &self.params
    }

    /// Smooth every pixel of `stack` and evaluate at `query_days`
    /// (strictly increasing). The result is clipped to the index's domain
    /// range before the per-pixel extrema are taken.
    pub fn smooth(&self, stack: &TileStack, query_days: &[NaiveDate]) -> FluxResult<SmoothedSeries> {
        self.params.validate()?;
        if query_days.is_empty() {
            return Err(FluxError::InvalidParameter(
                "at least one query day is required".to_string(),
            ));
        }
        if !query_days.windows(2).all(|w| w[0] < w[1]) {
            return Err(FluxError::InvalidParameter(
                "query days must be strictly increasing".to_string(),
            ));
        }
        let (rows, cols) = stack.grid().shape();
        if stack.values().dim() != (rows, cols, stack.len()) {
            return Err(FluxError::GridMismatch(format!(
                "stack buffer {:?} disagrees with grid {}x{} and {} timestamps",
                stack.values().dim(),
                rows,
                cols,
                stack.len()
            )));
        }

        let base = match stack.timestamps().first() {
            Some(d) => *d,
            None => query_days[0],
        };
        let sample_days: Vec<f64> = stack
            .timestamps()
            .iter()
            .map(|d| (*d - base).num_days() as f64)
            .collect();
        let query_offsets: Vec<f64> = query_days
            .iter()
            .map(|d| (*d - base).num_days() as f64)
            .collect();

        let values = stack.values();
        let params = &self.params;
        let smooth_one = |p: usize| -> Vec<f32> {
            let r = p / cols;
            let c = p % cols;
            lowess_pixel(&sample_days, values.slice(s![r, c, ..]), &query_offsets, params)
        };

        let n_pixels = rows * cols;
        #[cfg(feature = "parallel")]
        let pixel_results: Vec<Vec<f32>> = (0..n_pixels).into_par_iter().map(smooth_one).collect();
        #[cfg(not(feature = "parallel"))]
        let pixel_results: Vec<Vec<f32>> = (0..n_pixels).map(smooth_one).collect();

        let n_queries = query_offsets.len();
        let mut smoothed = Array3::from_elem((rows, cols, n_queries), f32::NAN);
        for (p, series) in pixel_results.iter().enumerate() {
            let r = p / cols;
            let c = p % cols;
            for (q, &v) in series.iter().enumerate() {
                smoothed[[r, c, q]] = v;
            }
        }

        let (low, high) = stack.index().clip_range();
        smoothed.mapv_inplace(|v| if v.is_finite() { v.clamp(low, high) } else { v });

        let mut series_min = Array2::from_elem((rows, cols), f32::NAN);
        let mut series_max = Array2::from_elem((rows, cols), f32::NAN);
        for ((r, c, _q), &v) in smoothed.indexed_iter() {
            if !v.is_finite() {
                continue;
            }
            let lo = &mut series_min[[r, c]];
            if lo.is_nan() || v < *lo {
                *lo = v;
            }
            let hi = &mut series_max[[r, c]];
            if hi.is_nan() || v > *hi {
                *hi = v;
            }
        }

        let undefined = series_min.iter().filter(|v| v.is_nan()).count();
        info!(
            "Smoothed {} series: {}x{} pixels, {} samples -> {} query days, {} pixels undefined",
            stack.index(),
            rows,
            cols,
            stack.len(),
            n_queries,
            undefined
        );

        Ok(SmoothedSeries {
            grid: stack.grid().clone(),
            index: stack.index(),
            query_days: query_days.to_vec(),
            values: smoothed,
            series_min,
            series_max,
        })
    }
}

impl Default for TemporalSmoother {
    fn default() -> Self {
        Self::new()
    }
}

/// Consecutive days from `start` through `end`, inclusive
pub fn daily_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

/// Smooth one pixel's series and evaluate at the query offsets
fn lowess_pixel(
    sample_days: &[f64],
    series: ArrayView1<'_, f32>,
    queries: &[f64],
    params: &SmootherParams,
) -> Vec<f32> {
    let mut t: Vec<f64> = Vec::with_capacity(sample_days.len());
    let mut y: Vec<f64> = Vec::with_capacity(sample_days.len());
    for (i, &v) in series.iter().enumerate() {
        if v.is_finite() {
            t.push(sample_days[i]);
            y.push(v as f64);
        }
    }
    let n = t.len();
    if n < params.min_valid_samples {
        return vec![f32::NAN; queries.len()];
    }

    let range = t[n - 1] - t[0];
    let half_width = params.span_fraction * range;

    let mut robustness = vec![1.0_f64; n];
    for _ in 0..params.iterations {
        let fitted: Vec<f64> = t
            .iter()
            .map(|&x| fit_local(&t, &y, &robustness, x, half_width))
            .collect();
        let mut abs_residuals: Vec<f64> = y
            .iter()
            .zip(&fitted)
            .map(|(yi, fi)| (yi - fi).abs())
            .collect();
        let cutoff = 6.0 * median(&mut abs_residuals);
        if cutoff < 1e-12 {
            break;
        }
        let mut total = 0.0;
        for (w, (yi, fi)) in robustness.iter_mut().zip(y.iter().zip(&fitted)) {
            let u = (yi - fi).abs() / cutoff;
            *w = if u >= 1.0 {
                0.0
            } else {
                let b = 1.0 - u * u;
                b * b
            };
            total += *w;
        }
        if total < MIN_WEIGHT_MASS {
            // every sample flagged as an outlier; keep the previous pass
            robustness.iter_mut().for_each(|w| *w = 1.0);
            break;
        }
    }

    queries
        .iter()
        .map(|&x| fit_local(&t, &y, &robustness, x, half_width) as f32)
        .collect()
}

/// Locally weighted linear fit evaluated at `x`. The tricube window is
/// widened to reach the second-nearest sample; when the weight mass still
/// collapses the fit falls back to the robustness weights alone, then to
/// an unweighted line.
fn fit_local(t: &[f64], y: &[f64], robustness: &[f64], x: f64, half_width: f64) -> f64 {
    let n = t.len();
    let distances: Vec<f64> = t.iter().map(|&ti| (ti - x).abs()).collect();
    let mut sorted = distances.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let reach = sorted[(n - 1).min(1)];
    let h = half_width.max(reach * (1.0 + 1e-9)).max(1e-9);

    let weights: Vec<f64> = distances
        .iter()
        .zip(robustness)
        .map(|(&d, &r)| r * tricube(d / h))
        .collect();

    let ones = vec![1.0_f64; n];
    weighted_linear_fit(t, y, &weights, x)
        .or_else(|| weighted_linear_fit(t, y, robustness, x))
        .or_else(|| weighted_linear_fit(t, y, &ones, x))
        .unwrap_or(f64::NAN)
}

/// Weighted least-squares line through (t, y) evaluated at `x`; `None`
/// when the weight mass vanishes, the weighted mean when the time spread
/// does
fn weighted_linear_fit(t: &[f64], y: &[f64], w: &[f64], x: f64) -> Option<f64> {
    let mass: f64 = w.iter().sum();
    if mass < MIN_WEIGHT_MASS {
        return None;
    }
    let mean_t = t.iter().zip(w).map(|(ti, wi)| ti * wi).sum::<f64>() / mass;
    let mean_y = y.iter().zip(w).map(|(yi, wi)| yi * wi).sum::<f64>() / mass;
    let mut covariance = 0.0;
    let mut variance = 0.0;
    for i in 0..t.len() {
        let dt = t[i] - mean_t;
        covariance += w[i] * dt * (y[i] - mean_y);
        variance += w[i] * dt * dt;
    }
    if variance < MIN_TIME_SPREAD {
        return Some(mean_y);
    }
    Some(mean_y + covariance / variance * (x - mean_t))
}

fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        return 0.0;
    }
    let v = 1.0 - u * u * u;
    v * v * v
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}
