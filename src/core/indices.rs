//! Vegetation index computation from named reflectance bands
//!
//! Produces the per-pixel index rasters that feed temporal stacking and
//! smoothing: EVI (three-band), EVI2 (two-band, for sensors without a blue
//! band), and LSWI. Input bands are surface reflectances in [0, 1]; any
//! non-finite band sample, masked pixel, or vanishing denominator yields
//! NaN in the output.

use crate::types::{FluxError, FluxResult, GridGeometry, MaskData, RasterData, RasterTile};
use chrono::NaiveDate;
use ndarray::Zip;
use serde::{Deserialize, Serialize};

/// Gain factor shared by both EVI formulations
const G: f32 = 2.5;
/// Canopy background adjustment
const L: f32 = 1.0;
/// Aerosol resistance coefficient for the red band
const C1: f32 = 6.0;
/// Aerosol resistance coefficient for the blue band
const C2: f32 = 7.5;
/// Red coefficient of the two-band EVI2 formulation
const EVI2_RED: f32 = 2.4;
/// Denominators with smaller magnitude are treated as undefined
const MIN_DENOMINATOR: f32 = 1e-6;

/// Named vegetation index with its domain clip range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Enhanced vegetation index (requires a blue band)
    Evi,
    /// Two-band enhanced vegetation index
    Evi2,
    /// Land surface water index
    Lswi,
}

impl IndexKind {
    /// Valid value range the smoothed series is clipped to
    pub fn clip_range(&self) -> (f32, f32) {
        match self {
            IndexKind::Evi | IndexKind::Evi2 => (0.0, 1.0),
            IndexKind::Lswi => (-1.0, 1.0),
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKind::Evi => write!(f, "evi"),
            IndexKind::Evi2 => write!(f, "evi2"),
            IndexKind::Lswi => write!(f, "lswi"),
        }
    }
}

/// Reflectance band layers for one acquisition. `blue` is optional;
/// sensor families without a blue band compute EVI2 instead of EVI.
#[derive(Debug, Clone)]
pub struct ReflectanceBands {
    pub nir: RasterData,
    pub red: RasterData,
    pub blue: Option<RasterData>,
    pub swir: RasterData,
    pub mask: MaskData,
}

impl ReflectanceBands {
    pub fn new(
        nir: RasterData,
        red: RasterData,
        blue: Option<RasterData>,
        swir: RasterData,
        mask: MaskData,
    ) -> FluxResult<Self> {
        let dim = nir.dim();
        let blue_ok = blue.as_ref().map(|b| b.dim() == dim).unwrap_or(true);
        if red.dim() != dim || swir.dim() != dim || mask.dim() != dim || !blue_ok {
            return Err(FluxError::GridMismatch(format!(
                "band shapes disagree: nir {:?}, red {:?}, swir {:?}, mask {:?}",
                dim,
                red.dim(),
                swir.dim(),
                mask.dim()
            )));
        }
        Ok(Self {
            nir,
            red,
            blue,
            swir,
            mask,
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.nir.dim()
    }
}

/// Compute the requested index raster; NaN where undefined
pub fn compute_index(kind: IndexKind, bands: &ReflectanceBands) -> FluxResult<RasterData> {
    match kind {
        IndexKind::Evi => {
            let blue = bands.blue.as_ref().ok_or_else(|| {
                FluxError::InvalidParameter(
                    "EVI requires a blue band; use Evi2 for sensors without one".to_string(),
                )
            })?;
            let kernel = |&nir: &f32, &red: &f32, &blue: &f32, &valid: &bool| -> f32 {
                if !valid {
                    return f32::NAN;
                }
                let denominator = nir + C1 * red - C2 * blue + L;
                if denominator.abs() < MIN_DENOMINATOR {
                    return f32::NAN;
                }
                G * (nir - red) / denominator
            };
            let zip = Zip::from(&bands.nir)
                .and(&bands.red)
                .and(blue)
                .and(&bands.mask);
            #[cfg(feature = "parallel")]
            let values = zip.par_map_collect(kernel);
            #[cfg(not(feature = "parallel"))]
            let values = zip.map_collect(kernel);
            Ok(values)
        }
        IndexKind::Evi2 => {
            let kernel = |&nir: &f32, &red: &f32, &valid: &bool| -> f32 {
                if !valid {
                    return f32::NAN;
                }
                let denominator = nir + EVI2_RED * red + L;
                if denominator.abs() < MIN_DENOMINATOR {
                    return f32::NAN;
                }
                G * (nir - red) / denominator
            };
            let zip = Zip::from(&bands.nir).and(&bands.red).and(&bands.mask);
            #[cfg(feature = "parallel")]
            let values = zip.par_map_collect(kernel);
            #[cfg(not(feature = "parallel"))]
            let values = zip.map_collect(kernel);
            Ok(values)
        }
        IndexKind::Lswi => {
            let kernel = |&nir: &f32, &swir: &f32, &valid: &bool| -> f32 {
                if !valid {
                    return f32::NAN;
                }
                let denominator = nir + swir;
                if denominator.abs() < MIN_DENOMINATOR {
                    return f32::NAN;
                }
                (nir - swir) / denominator
            };
            let zip = Zip::from(&bands.nir).and(&bands.swir).and(&bands.mask);
            #[cfg(feature = "parallel")]
            let values = zip.par_map_collect(kernel);
            #[cfg(not(feature = "parallel"))]
            let values = zip.map_collect(kernel);
            Ok(values)
        }
    }
}

/// Compute one index and wrap it as a timestamped tile on `grid`
pub fn index_tile(
    kind: IndexKind,
    grid: GridGeometry,
    timestamp: NaiveDate,
    bands: &ReflectanceBands,
) -> FluxResult<RasterTile> {
    if bands.dim() != grid.shape() {
        return Err(FluxError::GridMismatch(format!(
            "bands {:?} do not match grid {}x{}",
            bands.dim(),
            grid.rows,
            grid.cols
        )));
    }
    let values = compute_index(kind, bands)?;
    RasterTile::from_values(grid, timestamp, values)
}
