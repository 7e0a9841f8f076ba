//! Per-hour carbon flux prediction
//!
//! Evaluates the parametric flux model pixel by pixel for one timestamp
//! at a time, combining smoothed vegetation indices, regridded land
//! cover, and aligned meteorology into GPP and NEE rasters. A pixel
//! missing any input, or whose class has no parameter entry, comes out
//! NaN; zero is a real flux value and never stands in for missing data.
//! Evaluation is pure given its resolved inputs, so independent
//! timestamps can run in any order or in parallel.

use crate::core::meteorology::{MeteorologyAligner, SSRD, TEMPERATURE_2M};
use crate::core::regrid::RegridWeights;
use crate::core::smooth::SmoothedSeries;
use crate::types::{
    ClassData, ClassParameters, FluxError, FluxParameters, FluxResult, GridGeometry, RasterData,
    NODATA_CLASS,
};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use ndarray::Array2;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Kelvin offset for converting ERA5 temperatures to deg C
const KELVIN_OFFSET: f32 = 273.15;
/// PAR fraction of total downwelling shortwave
const PAR_FRACTION: f32 = 0.505;
/// Seconds per ERA5 accumulation hour
const SECONDS_PER_HOUR: f32 = 3600.0;
/// Fraction of the per-pixel EVI range above which the growing season
/// forces full phenology
const GROWING_SEASON_FRACTION: f32 = 0.55;

/// GPP and NEE rasters for one timestamp, on the observation grid.
/// Fluxes are in umol CO2 m^-2 s^-1; NEE is respiration minus GPP, so
/// net uptake is negative.
#[derive(Debug, Clone)]
pub struct FluxGrids {
    pub gpp: RasterData,
    pub nee: RasterData,
    pub grid: GridGeometry,
    pub timestamp: DateTime<Utc>,
}

impl FluxGrids {
    /// Number of pixels with a defined flux value
    pub fn defined_count(&self) -> usize {
        self.gpp.iter().filter(|v| v.is_finite()).count()
    }
}

/// Stateless per-hour evaluator over fixed resolved inputs
pub struct FluxPredictor<'a> {
    evi: &'a SmoothedSeries,
    lswi: &'a SmoothedSeries,
    classes: &'a ClassData,
    parameters: &'a FluxParameters,
}

impl<'a> FluxPredictor<'a> {
    /// Bind the predictor to its three resolved inputs. The EVI and LSWI
    /// series must share grid and query days; the class raster must be
    /// on the same grid.
    pub fn new(
        evi: &'a SmoothedSeries,
        lswi: &'a SmoothedSeries,
        classes: &'a ClassData,
        parameters: &'a FluxParameters,
    ) -> FluxResult<Self> {
        if !evi.grid().same_grid(lswi.grid()) {
            return Err(FluxError::GridMismatch(format!(
                "EVI grid [{}] differs from LSWI grid [{}]",
                evi.grid().descriptor(),
                lswi.grid().descriptor()
            )));
        }
        if classes.dim() != evi.grid().shape() {
            return Err(FluxError::GridMismatch(format!(
                "land cover raster {:?} does not match observation grid {}x{}",
                classes.dim(),
                evi.grid().rows,
                evi.grid().cols
            )));
        }
        if evi.query_days() != lswi.query_days() {
            return Err(FluxError::InvalidParameter(
                "EVI and LSWI series cover different query days".to_string(),
            ));
        }
        Ok(Self {
            evi,
            lswi,
            classes,
            parameters,
        })
    }

    /// Evaluate one timestamp against already-aligned meteorology fields
    /// (`t2m` in K and `ssrd` in J m^-2 on the observation grid).
    pub fn predict(
        &self,
        timestamp: DateTime<Utc>,
        met: &BTreeMap<String, RasterData>,
    ) -> FluxResult<FluxGrids> {
        let day = timestamp.date_naive();
        let evi_layer = self.evi.value_at(day).ok_or_else(|| {
            FluxError::NoCoverage(format!("no smoothed evi layer for {}", day))
        })?;
        let lswi_layer = self.lswi.value_at(day).ok_or_else(|| {
            FluxError::NoCoverage(format!("no smoothed lswi layer for {}", day))
        })?;
        let t2m = met.get(TEMPERATURE_2M).ok_or_else(|| {
            FluxError::NoCoverage(format!("meteorology lacks field '{}'", TEMPERATURE_2M))
        })?;
        let ssrd = met.get(SSRD).ok_or_else(|| {
            FluxError::NoCoverage(format!("meteorology lacks field '{}'", SSRD))
        })?;
        let (rows, cols) = self.evi.grid().shape();
        if t2m.dim() != (rows, cols) || ssrd.dim() != (rows, cols) {
            return Err(FluxError::GridMismatch(format!(
                "aligned meteorology {:?}/{:?} does not match observation grid {}x{}",
                t2m.dim(),
                ssrd.dim(),
                rows,
                cols
            )));
        }

        let (evi_min, evi_max) = self.evi.extrema();
        let (_, lswi_max) = self.lswi.extrema();

        let compute = |p: usize| -> (f32, f32) {
            let r = p / cols;
            let c = p % cols;
            let class = self.classes[[r, c]];
            let evi = evi_layer[[r, c]];
            let lswi = lswi_layer[[r, c]];
            let t_kelvin = t2m[[r, c]];
            let ssrd_hour = ssrd[[r, c]];
            if class == NODATA_CLASS
                || !evi.is_finite()
                || !lswi.is_finite()
                || !t_kelvin.is_finite()
                || !ssrd_hour.is_finite()
            {
                return (f32::NAN, f32::NAN);
            }
            let Some(params) = self.parameters.get(class) else {
                return (f32::NAN, f32::NAN);
            };
            let veg = PixelVegetation {
                evi,
                lswi,
                evi_min: evi_min[[r, c]],
                evi_max: evi_max[[r, c]],
                lswi_max: lswi_max[[r, c]],
            };
            class_fluxes(params, &veg, t_kelvin - KELVIN_OFFSET, par_from_ssrd(ssrd_hour))
        };

        let n_pixels = rows * cols;
        #[cfg(feature = "parallel")]
        let fluxes: Vec<(f32, f32)> = (0..n_pixels).into_par_iter().map(compute).collect();
        #[cfg(not(feature = "parallel"))]
        let fluxes: Vec<(f32, f32)> = (0..n_pixels).map(compute).collect();

        let (gpp_vec, nee_vec): (Vec<f32>, Vec<f32>) = fluxes.into_iter().unzip();
        let gpp = Array2::from_shape_vec((rows, cols), gpp_vec)
            .map_err(|e| FluxError::Processing(format!("flux grid assembly failed: {}", e)))?;
        let nee = Array2::from_shape_vec((rows, cols), nee_vec)
            .map_err(|e| FluxError::Processing(format!("flux grid assembly failed: {}", e)))?;

        let grids = FluxGrids {
            gpp,
            nee,
            grid: self.evi.grid().clone(),
            timestamp,
        };
        debug!(
            "Fluxes for {}: {}/{} pixels defined",
            timestamp,
            grids.defined_count(),
            n_pixels
        );
        Ok(grids)
    }

    /// Resolve meteorology through the aligner and continuous weights,
    /// then evaluate one timestamp
    pub fn predict_hour(
        &self,
        timestamp: DateTime<Utc>,
        aligner: &MeteorologyAligner,
        weights: &RegridWeights,
    ) -> FluxResult<FluxGrids> {
        let met = aligner.aligned_at(timestamp, weights)?;
        self.predict(timestamp, &met)
    }

    /// Evaluate every whole hour in `[start, end)`. Each hour's output is
    /// independent, so a caller that stops consuming mid-range loses
    /// nothing already produced.
    pub fn predict_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        aligner: &MeteorologyAligner,
        weights: &RegridWeights,
    ) -> FluxResult<Vec<FluxGrids>> {
        if start >= end {
            return Err(FluxError::InvalidParameter(format!(
                "prediction range {} to {} is empty",
                start, end
            )));
        }
        let mut outputs = Vec::new();
        let mut t = start;
        while t < end {
            outputs.push(self.predict_hour(t, aligner, weights)?);
            t += Duration::hours(1);
        }
        info!(
            "Predicted fluxes for {} hourly timestamps from {} to {}",
            outputs.len(),
            start,
            end
        );
        Ok(outputs)
    }
}

/// Hourly-accumulated shortwave (J m^-2) to PAR (umol m^-2 s^-1);
/// negative accumulation noise clamps to zero, NaN passes through
fn par_from_ssrd(ssrd: f32) -> f32 {
    let par = ssrd / SECONDS_PER_HOUR / PAR_FRACTION;
    if par < 0.0 {
        0.0
    } else {
        par
    }
}

/// Smoothed vegetation state of one pixel: today's indices plus the
/// series extrema driving phenology and wetness scaling
struct PixelVegetation {
    evi: f32,
    lswi: f32,
    evi_min: f32,
    evi_max: f32,
    lswi_max: f32,
}

/// The flux model for one pixel with all inputs defined.
/// Temperatures in deg C, PAR in umol m^-2 s^-1.
fn class_fluxes(params: &ClassParameters, veg: &PixelVegetation, t: f32, par: f32) -> (f32, f32) {
    let t_scale = if t <= params.t_min || t >= params.t_max {
        0.0
    } else {
        let numerator = (t - params.t_min) * (t - params.t_max);
        let deviation = t - params.t_opt;
        let denominator = numerator - deviation * deviation;
        if denominator == 0.0 {
            0.0
        } else {
            (numerator / denominator).max(0.0)
        }
    };

    let p_scale = if params.evergreen {
        1.0
    } else {
        let threshold =
            veg.evi_min + GROWING_SEASON_FRACTION * (veg.evi_max - veg.evi_min);
        if veg.evi > threshold {
            1.0
        } else {
            0.5 * (1.0 + veg.lswi)
        }
    };

    let wet_denominator = 1.0 + veg.lswi_max;
    if wet_denominator.abs() < 1e-6 || wet_denominator.is_nan() {
        return (f32::NAN, f32::NAN);
    }
    let w_scale = (1.0 + veg.lswi) / wet_denominator;

    let gpp = params.lambda * t_scale * p_scale * w_scale * veg.evi * par
        / (1.0 + par / params.par0);
    let respiration = params.alpha * t.max(params.t_low) + params.beta;
    let nee = respiration - gpp;
    (gpp, nee)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::indices::IndexKind;
    use crate::core::regrid::{RegridPolicy, Regridder};
    use crate::core::smooth::{daily_range, SmootherParams, TemporalSmoother};
    use crate::core::stack::TileStack;
    use crate::types::{Crs, GeoTransform, RasterTile};
    use approx::assert_relative_eq;
    use chrono::{NaiveDate, TimeZone};
    use ndarray::array;

    fn obs_grid() -> GridGeometry {
        GridGeometry::new(
            Crs::Geographic,
            1,
            1,
            GeoTransform::north_up(10.0, 50.0, 0.1, -0.1),
        )
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 6, d).unwrap()
    }

    fn utc(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 6, d, h, 0, 0).unwrap()
    }

    /// Single-pixel smoothed series over June 1-9 from daily samples
    fn smoothed(index: IndexKind, values: impl Fn(u32) -> f32) -> SmoothedSeries {
        let grid = obs_grid();
        let tiles: Vec<RasterTile> = (1..=9)
            .map(|d| {
                RasterTile::from_values(grid.clone(), day(d), array![[values(d)]]).unwrap()
            })
            .collect();
        let stack = TileStack::merge(index, tiles).unwrap();
        TemporalSmoother::with_params(SmootherParams {
            span_fraction: 0.3,
            iterations: 2,
            min_valid_samples: 3,
        })
        .smooth(&stack, &daily_range(day(1), day(9)))
        .unwrap()
    }

    fn met_fields(t2m_kelvin: f32, ssrd: f32) -> BTreeMap<String, RasterData> {
        let mut met = BTreeMap::new();
        met.insert(TEMPERATURE_2M.to_string(), array![[t2m_kelvin]]);
        met.insert(SSRD.to_string(), array![[ssrd]]);
        met
    }

    fn defaults() -> FluxParameters {
        FluxParameters::mid_latitude_defaults()
    }

    fn veg(evi: f32, lswi: f32, evi_min: f32, evi_max: f32, lswi_max: f32) -> PixelVegetation {
        PixelVegetation {
            evi,
            lswi,
            evi_min,
            evi_max,
            lswi_max,
        }
    }

    #[test]
    fn test_class_fluxes_reference_values() {
        let params = defaults();
        let p = params.get(2).unwrap();
        // growing-season deciduous pixel at optimum temperature
        let (gpp, nee) = class_fluxes(p, &veg(0.5, 0.2, 0.2, 0.6, 0.2), 20.0, 1000.0);
        // t_scale = 1, p_scale = 1 (evi 0.5 > 0.2 + 0.55*0.4), w_scale = 1
        let expected_gpp = 0.208 * 0.5 * 1000.0 / (1.0 + 1000.0 / 254.0);
        let expected_resp = 0.271 * 20.0 + 0.25;
        assert_relative_eq!(gpp, expected_gpp, epsilon = 1e-3);
        assert_relative_eq!(nee, expected_resp - expected_gpp, epsilon = 1e-3);
        assert!(nee < 0.0);
    }

    #[test]
    fn test_dormant_pixel_uses_wetness_phenology() {
        let params = defaults();
        let p = params.get(2).unwrap();
        // evi below the growing-season threshold scales by (1 + lswi) / 2
        let (gpp_dormant, _) = class_fluxes(p, &veg(0.25, 0.2, 0.2, 0.6, 0.2), 20.0, 1000.0);
        let (gpp_grown, _) = class_fluxes(p, &veg(0.25, 0.2, 0.2, 0.25, 0.2), 20.0, 1000.0);
        // same inputs except phenology state
        let ratio = gpp_dormant / gpp_grown;
        assert_relative_eq!(ratio, 0.5 * (1.0 + 0.2), epsilon = 1e-4);
    }

    #[test]
    fn test_evergreen_ignores_phenology() {
        let params = defaults();
        let evergreen = params.get(1).unwrap();
        let (low_evi, _) = class_fluxes(evergreen, &veg(0.21, 0.2, 0.2, 0.6, 0.2), 20.0, 1000.0);
        let (high_evi, _) = class_fluxes(evergreen, &veg(0.42, 0.2, 0.2, 0.6, 0.2), 20.0, 1000.0);
        // gpp scales linearly with evi alone; p_scale stays 1
        assert_relative_eq!(high_evi / low_evi, 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_cold_pixel_has_zero_gpp_but_respires() {
        let params = defaults();
        let p = params.get(2).unwrap();
        let (gpp, nee) = class_fluxes(p, &veg(0.5, 0.2, 0.2, 0.6, 0.2), -5.0, 1000.0);
        assert_eq!(gpp, 0.0);
        // respiration temperature floors at t_low = 0
        assert_relative_eq!(nee, 0.25, epsilon = 1e-5);
    }

    #[test]
    fn test_night_is_respiration_only() {
        let params = defaults();
        let p = params.get(2).unwrap();
        let (gpp, nee) = class_fluxes(p, &veg(0.5, 0.2, 0.2, 0.6, 0.2), 15.0, 0.0);
        assert_eq!(gpp, 0.0);
        assert_relative_eq!(nee, 0.271 * 15.0 + 0.25, epsilon = 1e-4);
        assert!(nee > 0.0);
    }

    #[test]
    fn test_hot_pixel_has_zero_gpp() {
        let params = defaults();
        let p = params.get(2).unwrap();
        let (gpp, _) = class_fluxes(p, &veg(0.5, 0.2, 0.2, 0.6, 0.2), 45.0, 1000.0);
        assert_eq!(gpp, 0.0);
    }

    #[test]
    fn test_predict_matches_kernel() {
        let evi = smoothed(IndexKind::Evi, |d| 0.15 + 0.05 * d as f32);
        let lswi = smoothed(IndexKind::Lswi, |_| 0.2);
        let classes = array![[2_u16]];
        let params = defaults();
        let predictor = FluxPredictor::new(&evi, &lswi, &classes, &params).unwrap();

        let ssrd = PAR_FRACTION * SECONDS_PER_HOUR * 1000.0; // par == 1000
        let grids = predictor
            .predict(utc(7, 12), &met_fields(293.15, ssrd))
            .unwrap();

        let evi_7 = evi.value_at(day(7)).unwrap()[[0, 0]];
        let lswi_7 = lswi.value_at(day(7)).unwrap()[[0, 0]];
        let (evi_min, evi_max) = evi.extrema();
        let (_, lswi_max) = lswi.extrema();
        let (expected_gpp, expected_nee) = class_fluxes(
            params.get(2).unwrap(),
            &veg(
                evi_7,
                lswi_7,
                evi_min[[0, 0]],
                evi_max[[0, 0]],
                lswi_max[[0, 0]],
            ),
            20.0,
            1000.0,
        );
        assert_relative_eq!(grids.gpp[[0, 0]], expected_gpp, epsilon = 1e-4);
        assert_relative_eq!(grids.nee[[0, 0]], expected_nee, epsilon = 1e-4);
        assert_eq!(grids.defined_count(), 1);
        assert_eq!(grids.timestamp, utc(7, 12));
    }

    #[test]
    fn test_unknown_class_is_undefined_not_zero() {
        let evi = smoothed(IndexKind::Evi, |d| 0.15 + 0.05 * d as f32);
        let lswi = smoothed(IndexKind::Lswi, |_| 0.2);
        let classes = array![[99_u16]]; // no parameter entry
        let params = defaults();
        let predictor = FluxPredictor::new(&evi, &lswi, &classes, &params).unwrap();
        let grids = predictor
            .predict(utc(7, 12), &met_fields(293.15, 1.8e6))
            .unwrap();
        assert!(grids.gpp[[0, 0]].is_nan());
        assert!(grids.nee[[0, 0]].is_nan());
        assert_eq!(grids.defined_count(), 0);
    }

    #[test]
    fn test_nodata_class_is_undefined() {
        let evi = smoothed(IndexKind::Evi, |d| 0.15 + 0.05 * d as f32);
        let lswi = smoothed(IndexKind::Lswi, |_| 0.2);
        let classes = array![[NODATA_CLASS]];
        let params = defaults();
        let predictor = FluxPredictor::new(&evi, &lswi, &classes, &params).unwrap();
        let grids = predictor
            .predict(utc(7, 12), &met_fields(293.15, 1.8e6))
            .unwrap();
        assert!(grids.gpp[[0, 0]].is_nan());
    }

    #[test]
    fn test_undefined_meteorology_propagates() {
        let evi = smoothed(IndexKind::Evi, |d| 0.15 + 0.05 * d as f32);
        let lswi = smoothed(IndexKind::Lswi, |_| 0.2);
        let classes = array![[2_u16]];
        let params = defaults();
        let predictor = FluxPredictor::new(&evi, &lswi, &classes, &params).unwrap();
        let grids = predictor
            .predict(utc(7, 12), &met_fields(f32::NAN, 1.8e6))
            .unwrap();
        assert!(grids.gpp[[0, 0]].is_nan());
        assert!(grids.nee[[0, 0]].is_nan());
    }

    #[test]
    fn test_day_outside_series_is_no_coverage() {
        let evi = smoothed(IndexKind::Evi, |d| 0.15 + 0.05 * d as f32);
        let lswi = smoothed(IndexKind::Lswi, |_| 0.2);
        let classes = array![[2_u16]];
        let params = defaults();
        let predictor = FluxPredictor::new(&evi, &lswi, &classes, &params).unwrap();
        let result = predictor.predict(utc(25, 12), &met_fields(293.15, 1.8e6));
        assert!(matches!(result, Err(FluxError::NoCoverage(_))));
    }

    #[test]
    fn test_missing_met_field_is_no_coverage() {
        let evi = smoothed(IndexKind::Evi, |d| 0.15 + 0.05 * d as f32);
        let lswi = smoothed(IndexKind::Lswi, |_| 0.2);
        let classes = array![[2_u16]];
        let params = defaults();
        let predictor = FluxPredictor::new(&evi, &lswi, &classes, &params).unwrap();
        let mut met = met_fields(293.15, 1.8e6);
        met.remove(SSRD);
        assert!(matches!(
            predictor.predict(utc(7, 12), &met),
            Err(FluxError::NoCoverage(_))
        ));
    }

    #[test]
    fn test_mismatched_series_are_rejected() {
        let evi = smoothed(IndexKind::Evi, |d| 0.15 + 0.05 * d as f32);
        let lswi = smoothed(IndexKind::Lswi, |_| 0.2);
        let classes_wrong = array![[2_u16, 3]];
        let params = defaults();
        assert!(matches!(
            FluxPredictor::new(&evi, &lswi, &classes_wrong, &params),
            Err(FluxError::GridMismatch(_))
        ));
    }

    #[test]
    fn test_predict_range_produces_hourly_grids() {
        let evi = smoothed(IndexKind::Evi, |d| 0.15 + 0.05 * d as f32);
        let lswi = smoothed(IndexKind::Lswi, |_| 0.2);
        let classes = array![[2_u16]];
        let params = defaults();
        let predictor = FluxPredictor::new(&evi, &lswi, &classes, &params).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert(TEMPERATURE_2M.to_string(), array![[293.15_f32]]);
        fields.insert(SSRD.to_string(), array![[1.8e6_f32]]);
        let record =
            crate::core::meteorology::MeteorologyField::monthly(obs_grid(), 2020, 6, fields)
                .unwrap();
        let aligner = MeteorologyAligner::load(vec![record]).unwrap();
        let weights =
            Regridder::build(aligner.grid(), &obs_grid(), RegridPolicy::Continuous).unwrap();

        let grids = predictor
            .predict_range(utc(7, 10), utc(7, 13), &aligner, &weights)
            .unwrap();
        assert_eq!(grids.len(), 3);
        assert_eq!(grids[0].timestamp, utc(7, 10));
        assert_eq!(grids[2].timestamp, utc(7, 12));
        for g in &grids {
            assert!(g.gpp[[0, 0]].is_finite());
        }
        // reruns are bit-identical
        let again = predictor
            .predict_range(utc(7, 10), utc(7, 13), &aligner, &weights)
            .unwrap();
        assert_eq!(again[1].gpp, grids[1].gpp);
        assert_eq!(again[1].nee, grids[1].nee);
    }

    #[test]
    fn test_par_conversion() {
        assert_relative_eq!(
            par_from_ssrd(PAR_FRACTION * SECONDS_PER_HOUR * 500.0),
            500.0,
            epsilon = 1e-3
        );
        assert_eq!(par_from_ssrd(-10.0), 0.0);
        assert!(par_from_ssrd(f32::NAN).is_nan());
    }
}
