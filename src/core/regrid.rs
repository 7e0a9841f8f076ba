//! Spatial regridding between raster grids
//!
//! Builds reusable sparse weight mappings from a source grid onto a
//! target grid and applies them to gridded values. Continuous fields use
//! area-weighted aggregation with each target cell's weights normalized
//! to unit mass; categorical fields use single nearest-cell assignment so
//! class ids are copied, never blended. The policy is part of the weight
//! set and is enforced again at apply time.

use crate::types::{ClassData, FluxError, FluxResult, GridGeometry, RasterData, NODATA_CLASS};
use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Weighting policy, chosen explicitly at every call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegridPolicy {
    /// Area-weighted aggregation for continuous fields
    Continuous,
    /// Nearest-cell assignment for discrete class fields
    Categorical,
}

impl std::fmt::Display for RegridPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegridPolicy::Continuous => write!(f, "continuous"),
            RegridPolicy::Categorical => write!(f, "categorical"),
        }
    }
}

/// One target cell's source weights; cell indices are flattened row-major
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightRow {
    pub target: u32,
    pub sources: Vec<(u32, f32)>,
}

/// Sparse source-to-target mapping for one (source, target, policy) triple.
/// Target cells with no overlapping source cell carry no row and come out
/// undefined on apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegridWeights {
    pub source_descriptor: String,
    pub target_descriptor: String,
    pub policy: RegridPolicy,
    pub source_shape: (usize, usize),
    pub target_shape: (usize, usize),
    pub rows: Vec<WeightRow>,
}

impl RegridWeights {
    /// Fraction of target cells with source coverage
    pub fn coverage(&self) -> f64 {
        let cells = self.target_shape.0 * self.target_shape.1;
        if cells == 0 {
            return 0.0;
        }
        self.rows.len() as f64 / cells as f64
    }
}

/// Weight construction and application
pub struct Regridder;

impl Regridder {
    /// Compute weights mapping `source` onto `target` under `policy`.
    /// Both grids must share a CRS and be north-up. This is the expensive
    /// step; see `WeightCache` for reuse across runs.
    pub fn build(
        source: &GridGeometry,
        target: &GridGeometry,
        policy: RegridPolicy,
    ) -> FluxResult<RegridWeights> {
        if source.crs != target.crs {
            return Err(FluxError::GridMismatch(format!(
                "cannot regrid from {} to {}; reproject upstream",
                source.crs, target.crs
            )));
        }
        if !source.transform.is_north_up() || !target.transform.is_north_up() {
            return Err(FluxError::Processing(
                "rotated grids are not supported for regridding".to_string(),
            ));
        }

        let rows = match policy {
            RegridPolicy::Continuous => build_area_weights(source, target),
            RegridPolicy::Categorical => build_nearest_weights(source, target),
        };

        let weights = RegridWeights {
            source_descriptor: source.descriptor(),
            target_descriptor: target.descriptor(),
            policy,
            source_shape: source.shape(),
            target_shape: target.shape(),
            rows,
        };
        info!(
            "Built {} regrid weights: {}x{} -> {}x{}, {:.1}% target coverage",
            policy,
            source.rows,
            source.cols,
            target.rows,
            target.cols,
            100.0 * weights.coverage()
        );
        Ok(weights)
    }

    /// Apply continuous weights to a float field. NaN source cells are
    /// skipped and the remaining weights renormalized; a target cell with
    /// no valid source comes out NaN.
    pub fn apply(weights: &RegridWeights, source: &RasterData) -> FluxResult<RasterData> {
        if weights.policy != RegridPolicy::Continuous {
            return Err(FluxError::InvalidParameter(format!(
                "apply requires continuous weights, got {}",
                weights.policy
            )));
        }
        if source.dim() != weights.source_shape {
            return Err(FluxError::GridMismatch(format!(
                "source field {:?} does not match weight source shape {:?}",
                source.dim(),
                weights.source_shape
            )));
        }
        let (t_rows, t_cols) = weights.target_shape;
        let s_cols = weights.source_shape.1;
        let mut out = Array2::from_elem((t_rows, t_cols), f32::NAN);
        for row in &weights.rows {
            let tr = row.target as usize / t_cols;
            let tc = row.target as usize % t_cols;
            if tr >= t_rows {
                continue;
            }
            let mut acc = 0.0f64;
            let mut mass = 0.0f64;
            for &(idx, w) in &row.sources {
                let sr = idx as usize / s_cols;
                let sc = idx as usize % s_cols;
                if sr >= weights.source_shape.0 {
                    continue;
                }
                let v = source[[sr, sc]];
                if v.is_finite() {
                    acc += w as f64 * v as f64;
                    mass += w as f64;
                }
            }
            if mass > 0.0 {
                out[[tr, tc]] = (acc / mass) as f32;
            }
        }
        Ok(out)
    }

    /// Apply categorical weights to a class field. The nearest source
    /// class id is copied; uncovered target cells get `NODATA_CLASS`.
    pub fn apply_classes(weights: &RegridWeights, source: &ClassData) -> FluxResult<ClassData> {
        if weights.policy != RegridPolicy::Categorical {
            return Err(FluxError::InvalidParameter(format!(
                "apply_classes requires categorical weights, got {}",
                weights.policy
            )));
        }
        if source.dim() != weights.source_shape {
            return Err(FluxError::GridMismatch(format!(
                "source classes {:?} do not match weight source shape {:?}",
                source.dim(),
                weights.source_shape
            )));
        }
        let (t_rows, t_cols) = weights.target_shape;
        let s_cols = weights.source_shape.1;
        let mut out = Array2::from_elem((t_rows, t_cols), NODATA_CLASS);
        for row in &weights.rows {
            let tr = row.target as usize / t_cols;
            let tc = row.target as usize % t_cols;
            if tr >= t_rows {
                continue;
            }
            if let Some(&(idx, _)) = row.sources.first() {
                let sr = idx as usize / s_cols;
                let sc = idx as usize % s_cols;
                if sr < weights.source_shape.0 {
                    out[[tr, tc]] = source[[sr, sc]];
                }
            }
        }
        Ok(out)
    }
}

/// Area-of-overlap weights, normalized per target cell
fn build_area_weights(source: &GridGeometry, target: &GridGeometry) -> Vec<WeightRow> {
    let st = &source.transform;
    let tt = &target.transform;
    let mut rows = Vec::new();
    for tr in 0..target.rows {
        for tc in 0..target.cols {
            let (xa, ya) = tt.pixel_to_geo(tr as f64, tc as f64);
            let (xb, yb) = tt.pixel_to_geo(tr as f64 + 1.0, tc as f64 + 1.0);
            let (x_min, x_max) = (xa.min(xb), xa.max(xb));
            let (y_min, y_max) = (ya.min(yb), ya.max(yb));

            // fractional source-cell range covered by this target cell
            let ca = (x_min - st.top_left_x) / st.pixel_width;
            let cb = (x_max - st.top_left_x) / st.pixel_width;
            let ra = (y_max - st.top_left_y) / st.pixel_height;
            let rb = (y_min - st.top_left_y) / st.pixel_height;
            let c_start = ca.min(cb).floor().max(0.0) as usize;
            let c_end = ca.max(cb).ceil().min(source.cols as f64) as usize;
            let r_start = ra.min(rb).floor().max(0.0) as usize;
            let r_end = ra.max(rb).ceil().min(source.rows as f64) as usize;

            let mut sources = Vec::new();
            let mut total = 0.0f64;
            for sr in r_start..r_end {
                for sc in c_start..c_end {
                    let (sxa, sya) = st.pixel_to_geo(sr as f64, sc as f64);
                    let (sxb, syb) = st.pixel_to_geo(sr as f64 + 1.0, sc as f64 + 1.0);
                    let (sx_min, sx_max) = (sxa.min(sxb), sxa.max(sxb));
                    let (sy_min, sy_max) = (sya.min(syb), sya.max(syb));
                    let overlap_w = (x_max.min(sx_max) - x_min.max(sx_min)).max(0.0);
                    let overlap_h = (y_max.min(sy_max) - y_min.max(sy_min)).max(0.0);
                    let area = overlap_w * overlap_h;
                    if area > 0.0 {
                        sources.push(((sr * source.cols + sc) as u32, area));
                        total += area;
                    }
                }
            }
            if total > 0.0 {
                let normalized = sources
                    .into_iter()
                    .map(|(idx, area)| (idx, (area / total) as f32))
                    .collect();
                rows.push(WeightRow {
                    target: (tr * target.cols + tc) as u32,
                    sources: normalized,
                });
            }
        }
    }
    rows
}

/// Single nearest source cell per target cell center
fn build_nearest_weights(source: &GridGeometry, target: &GridGeometry) -> Vec<WeightRow> {
    let mut rows = Vec::new();
    for tr in 0..target.rows {
        for tc in 0..target.cols {
            let (x, y) = target.pixel_center(tr, tc);
            let Some((sr, sc)) = source.geo_to_pixel(x, y) else {
                continue;
            };
            if sr < 0.0 || sc < 0.0 {
                continue;
            }
            let (sr, sc) = (sr.floor() as usize, sc.floor() as usize);
            if sr >= source.rows || sc >= source.cols {
                continue;
            }
            rows.push(WeightRow {
                target: (tr * target.cols + tc) as u32,
                sources: vec![((sr * source.cols + sc) as u32, 1.0)],
            });
        }
    }
    rows
}
