use chrono::NaiveDate;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Real-valued raster samples (row x col)
pub type RasterData = Array2<f32>;

/// Per-pixel validity mask (row x col)
pub type MaskData = Array2<bool>;

/// Time-stacked raster samples (row x col x time)
pub type StackData = Array3<f32>;

/// Discrete land-cover class raster (row x col)
pub type ClassData = Array2<u16>;

/// Sentinel for land-cover cells with no class assigned
pub const NODATA_CLASS: u16 = u16::MAX;

/// Coordinate reference system enumeration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crs {
    /// Geographic coordinates (longitude, latitude, WGS84)
    Geographic,
    /// Projected coordinates (e.g., UTM)
    Projected { epsg: u32 },
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Crs::Geographic => write!(f, "EPSG:4326"),
            Crs::Projected { epsg } => write!(f, "EPSG:{}", epsg),
        }
    }
}

/// Geospatial bounding box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, max_lon: f64, min_lat: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
        }
    }

    /// True when the two boxes share any area (touching edges count)
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_lon < other.min_lon
            || other.max_lon < self.min_lon
            || self.max_lat < other.min_lat
            || other.max_lat < self.min_lat)
    }

    /// Smallest box containing both inputs
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_lon: self.min_lon.min(other.min_lon),
            max_lon: self.max_lon.max(other.max_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }

    /// Box expanded (or shrunk) about its center by `factor`
    pub fn scaled(&self, factor: f64) -> BoundingBox {
        let center_lon = 0.5 * (self.min_lon + self.max_lon);
        let center_lat = 0.5 * (self.min_lat + self.max_lat);
        let half_width = 0.5 * (self.max_lon - self.min_lon) * factor;
        let half_height = 0.5 * (self.max_lat - self.min_lat) * factor;
        BoundingBox {
            min_lon: center_lon - half_width,
            max_lon: center_lon + half_width,
            min_lat: center_lat - half_height,
            max_lat: center_lat + half_height,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with zero rotation terms.
    /// `pixel_height` is negative when y decreases with increasing row.
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height,
        }
    }

    /// Map fractional pixel coordinates to geographic (x, y)
    pub fn pixel_to_geo(&self, row: f64, col: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    /// Map geographic (x, y) to fractional (row, col); `None` for a
    /// degenerate transform
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det.abs() < 1e-15 {
            return None;
        }
        let dx = x - self.top_left_x;
        let dy = y - self.top_left_y;
        let col = (self.pixel_height * dx - self.rotation_x * dy) / det;
        let row = (self.pixel_width * dy - self.rotation_y * dx) / det;
        Some((row, col))
    }

    pub fn is_north_up(&self) -> bool {
        self.rotation_x.abs() < 1e-12 && self.rotation_y.abs() < 1e-12
    }

    pub fn approx_eq(&self, other: &GeoTransform, tol: f64) -> bool {
        (self.top_left_x - other.top_left_x).abs() < tol
            && (self.pixel_width - other.pixel_width).abs() < tol
            && (self.rotation_x - other.rotation_x).abs() < tol
            && (self.top_left_y - other.top_left_y).abs() < tol
            && (self.rotation_y - other.rotation_y).abs() < tol
            && (self.pixel_height - other.pixel_height).abs() < tol
    }
}

/// Spatial grid descriptor shared by every raster on one grid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridGeometry {
    pub crs: Crs,
    pub rows: usize,
    pub cols: usize,
    pub transform: GeoTransform,
}

impl GridGeometry {
    pub fn new(crs: Crs, rows: usize, cols: usize, transform: GeoTransform) -> Self {
        Self {
            crs,
            rows,
            cols,
            transform,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Geographic extent covered by the full raster
    pub fn bounding_box(&self) -> BoundingBox {
        let corners = [
            self.transform.pixel_to_geo(0.0, 0.0),
            self.transform.pixel_to_geo(0.0, self.cols as f64),
            self.transform.pixel_to_geo(self.rows as f64, 0.0),
            self.transform.pixel_to_geo(self.rows as f64, self.cols as f64),
        ];
        let mut bbox = BoundingBox::new(f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for (x, y) in corners {
            bbox.min_lon = bbox.min_lon.min(x);
            bbox.max_lon = bbox.max_lon.max(x);
            bbox.min_lat = bbox.min_lat.min(y);
            bbox.max_lat = bbox.max_lat.max(y);
        }
        bbox
    }

    /// True when two grids have identical dimensions, CRS, and transform
    pub fn same_grid(&self, other: &GridGeometry) -> bool {
        self.rows == other.rows
            && self.cols == other.cols
            && self.crs == other.crs
            && self.transform.approx_eq(&other.transform, 1e-9)
    }

    /// Geographic coordinates of a pixel center
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.transform.pixel_to_geo(row as f64 + 0.5, col as f64 + 0.5)
    }

    /// Fractional (row, col) of a geographic point
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        self.transform.geo_to_pixel(x, y)
    }

    /// Canonical string form used to identify a grid in caches
    pub fn descriptor(&self) -> String {
        let t = &self.transform;
        format!(
            "{};{}x{};{:.12e},{:.12e},{:.12e},{:.12e},{:.12e},{:.12e}",
            self.crs,
            self.rows,
            self.cols,
            t.top_left_x,
            t.pixel_width,
            t.rotation_x,
            t.top_left_y,
            t.rotation_y,
            t.pixel_height
        )
    }
}

/// One timestamped vegetation-index raster on a shared grid.
/// Invalid samples are stored as NaN and carry a `false` mask entry.
#[derive(Debug, Clone)]
pub struct RasterTile {
    pub grid: GridGeometry,
    pub timestamp: NaiveDate,
    pub values: RasterData,
    pub mask: MaskData,
}

impl RasterTile {
    /// Build a tile from values and an explicit validity mask. Masked-out
    /// samples become NaN; non-finite samples are masked out.
    pub fn new(
        grid: GridGeometry,
        timestamp: NaiveDate,
        mut values: RasterData,
        mut mask: MaskData,
    ) -> FluxResult<Self> {
        if values.dim() != grid.shape() || mask.dim() != grid.shape() {
            return Err(FluxError::GridMismatch(format!(
                "tile data {:?} / mask {:?} do not match grid {}x{}",
                values.dim(),
                mask.dim(),
                grid.rows,
                grid.cols
            )));
        }
        ndarray::Zip::from(&mut values)
            .and(&mut mask)
            .for_each(|v, m| {
                if !*m {
                    *v = f32::NAN;
                } else if !v.is_finite() {
                    *m = false;
                    *v = f32::NAN;
                }
            });
        Ok(Self {
            grid,
            timestamp,
            values,
            mask,
        })
    }

    /// Build a tile whose mask is derived from sample finiteness
    pub fn from_values(
        grid: GridGeometry,
        timestamp: NaiveDate,
        values: RasterData,
    ) -> FluxResult<Self> {
        let mask = values.mapv(|v| v.is_finite());
        Self::new(grid, timestamp, values, mask)
    }

    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }
}

/// One land-cover tile of discrete class ids
#[derive(Debug, Clone)]
pub struct LandCoverGrid {
    pub grid: GridGeometry,
    pub classes: ClassData,
}

impl LandCoverGrid {
    pub fn new(grid: GridGeometry, classes: ClassData) -> FluxResult<Self> {
        if classes.dim() != grid.shape() {
            return Err(FluxError::GridMismatch(format!(
                "land cover data {:?} does not match grid {}x{}",
                classes.dim(),
                grid.rows,
                grid.cols
            )));
        }
        Ok(Self { grid, classes })
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.grid.bounding_box()
    }

    /// Sorted distinct class ids present in the tile
    pub fn class_set(&self) -> Vec<u16> {
        let set: BTreeSet<u16> = self
            .classes
            .iter()
            .copied()
            .filter(|c| *c != NODATA_CLASS)
            .collect();
        set.into_iter().collect()
    }
}

/// Fitted flux-model coefficients for one land-cover class.
/// Temperatures in deg C; PAR quantities in umol m^-2 s^-1; fluxes in
/// umol CO2 m^-2 s^-1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassParameters {
    pub lambda: f32, // maximum light-use efficiency
    pub par0: f32,   // half-saturation PAR
    pub alpha: f32,  // respiration slope per deg C
    pub beta: f32,   // respiration intercept
    pub t_min: f32,
    pub t_opt: f32,
    pub t_max: f32,
    pub t_low: f32, // respiration temperature floor
    pub evergreen: bool,
}

impl ClassParameters {
    pub fn validate(&self) -> FluxResult<()> {
        if !(self.t_min < self.t_opt && self.t_opt < self.t_max) {
            return Err(FluxError::InvalidParameter(format!(
                "temperature range must satisfy t_min < t_opt < t_max, got {} / {} / {}",
                self.t_min, self.t_opt, self.t_max
            )));
        }
        if !(self.par0 > 0.0) {
            return Err(FluxError::InvalidParameter(format!(
                "par0 must be positive, got {}",
                self.par0
            )));
        }
        Ok(())
    }
}

/// Default class parameters for mid-latitude domains. Regional fits vary;
/// production runs should load a fitted table instead. Class numbering:
/// 1 evergreen forest, 2 deciduous forest, 3 mixed forest, 4 shrubland,
/// 5 savanna, 6 cropland, 7 grassland, 8 wetland.
pub static DEFAULT_CLASS_PARAMETERS: LazyLock<BTreeMap<u16, ClassParameters>> =
    LazyLock::new(|| {
        let entries = [
            (1, 0.226, 275.0, 0.288, 0.49, 0.0, 20.0, 40.0, 2.0, true),
            (2, 0.208, 254.0, 0.271, 0.25, 0.0, 20.0, 40.0, 0.0, false),
            (3, 0.217, 264.0, 0.280, 0.37, 0.0, 20.0, 40.0, 0.0, false),
            (4, 0.123, 629.0, 0.122, 0.43, 2.0, 20.0, 40.0, 0.0, false),
            (5, 0.121, 579.0, 0.091, 0.42, 2.0, 20.0, 40.0, 0.0, false),
            (6, 0.089, 1132.0, 0.124, 0.49, 5.0, 22.0, 40.0, 0.0, false),
            (7, 0.115, 542.0, 0.028, 0.72, 2.0, 18.0, 40.0, 0.0, false),
            (8, 0.190, 506.0, 0.081, 0.51, 0.0, 20.0, 40.0, 0.0, false),
        ];
        entries
            .into_iter()
            .map(
                |(id, lambda, par0, alpha, beta, t_min, t_opt, t_max, t_low, evergreen)| {
                    (
                        id,
                        ClassParameters {
                            lambda,
                            par0,
                            alpha,
                            beta,
                            t_min,
                            t_opt,
                            t_max,
                            t_low,
                            evergreen,
                        },
                    )
                },
            )
            .collect()
    });

/// Per-class parameter table, consumed read-only during prediction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FluxParameters {
    classes: BTreeMap<u16, ClassParameters>,
}

impl FluxParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from per-class entries, validating each
    pub fn from_classes(classes: BTreeMap<u16, ClassParameters>) -> FluxResult<Self> {
        for (class, params) in &classes {
            params.validate().map_err(|e| {
                FluxError::InvalidParameter(format!("class {}: {}", class, e))
            })?;
        }
        Ok(Self { classes })
    }

    /// Built-in mid-latitude defaults for the standard eight classes
    pub fn mid_latitude_defaults() -> Self {
        Self {
            classes: DEFAULT_CLASS_PARAMETERS.clone(),
        }
    }

    pub fn insert(&mut self, class: u16, params: ClassParameters) -> FluxResult<()> {
        params.validate()?;
        self.classes.insert(class, params);
        Ok(())
    }

    pub fn get(&self, class: u16) -> Option<&ClassParameters> {
        self.classes.get(&class)
    }

    pub fn class_ids(&self) -> Vec<u16> {
        self.classes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Error types for flux processing
#[derive(Debug, thiserror::Error)]
pub enum FluxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Grid mismatch: {0}")]
    GridMismatch(String),

    #[error("No coverage: {0}")]
    NoCoverage(String),

    #[error("Insufficient samples: {0}")]
    InsufficientSamples(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

/// Result type for flux operations
pub type FluxResult<T> = Result<T, FluxError>;
