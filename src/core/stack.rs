//! Temporal assembly of vegetation-index tiles
//!
//! Collects per-acquisition index tiles sharing one spatial grid into a
//! single (row, col, time) buffer with a strictly increasing timestamp
//! vector. Tiles acquired on the same day are combined pixel-wise with
//! valid samples taking precedence over invalid ones.

use crate::core::indices::{index_tile, IndexKind, ReflectanceBands};
use crate::types::{FluxError, FluxResult, GridGeometry, RasterData, RasterTile, StackData};
use chrono::NaiveDate;
use log::{debug, info};
use ndarray::{s, Array2, Array3, ArrayView2, Axis, Zip};

/// Time-ordered stack of one vegetation index on a shared grid
#[derive(Debug, Clone)]
pub struct TileStack {
    grid: GridGeometry,
    index: IndexKind,
    timestamps: Vec<NaiveDate>,
    values: StackData,
}

impl TileStack {
    /// Merge an unordered collection of tiles into a time-ordered stack.
    ///
    /// Tiles are sorted by acquisition day. Tiles sharing a day are
    /// combined pixel-wise: a later observation overwrites an earlier one
    /// only where the later sample is valid. All tiles must share the
    /// first tile's grid.
    pub fn merge(index: IndexKind, mut tiles: Vec<RasterTile>) -> FluxResult<Self> {
        if tiles.is_empty() {
            return Err(FluxError::InvalidParameter(
                "merge requires at least one tile".to_string(),
            ));
        }
        let grid = tiles[0].grid.clone();
        for (i, tile) in tiles.iter().enumerate() {
            if !tile.grid.same_grid(&grid) {
                return Err(FluxError::GridMismatch(format!(
                    "tile {} ({}) on grid [{}] does not match stack grid [{}]",
                    i,
                    tile.timestamp,
                    tile.grid.descriptor(),
                    grid.descriptor()
                )));
            }
        }
        let n_input = tiles.len();

        // Stable sort keeps input order within a day, so the later tile in
        // input order wins wherever both samples are valid.
        tiles.sort_by_key(|t| t.timestamp);

        let mut timestamps: Vec<NaiveDate> = Vec::new();
        let mut layers: Vec<RasterData> = Vec::new();
        let mut merged_days = 0usize;
        for tile in tiles {
            if timestamps.last() == Some(&tile.timestamp) {
                if let Some(layer) = layers.last_mut() {
                    Zip::from(layer.view_mut())
                        .and(&tile.values)
                        .and(&tile.mask)
                        .for_each(|acc, &v, &valid| {
                            if valid {
                                *acc = v;
                            }
                        });
                    merged_days += 1;
                }
            } else {
                timestamps.push(tile.timestamp);
                layers.push(tile.values);
            }
        }

        let (rows, cols) = grid.shape();
        let mut values = Array3::from_elem((rows, cols, timestamps.len()), f32::NAN);
        for (t, layer) in layers.iter().enumerate() {
            values.slice_mut(s![.., .., t]).assign(layer);
        }

        info!(
            "Merged {} tiles into {} timestamps on a {}x{} grid ({} same-day merges)",
            n_input,
            timestamps.len(),
            rows,
            cols,
            merged_days
        );

        Ok(Self {
            grid,
            index,
            timestamps,
            values,
        })
    }

    /// Compute one index from per-day reflectance bands and merge the
    /// resulting tiles in a single step
    pub fn from_bands(
        index: IndexKind,
        grid: &GridGeometry,
        acquisitions: Vec<(NaiveDate, ReflectanceBands)>,
    ) -> FluxResult<Self> {
        let tiles = acquisitions
            .into_iter()
            .map(|(day, bands)| index_tile(index, grid.clone(), day, &bands))
            .collect::<FluxResult<Vec<_>>>()?;
        Self::merge(index, tiles)
    }

    /// Clamp all valid samples into [low, high]; invalid samples stay NaN
    pub fn clip(&mut self, low: f32, high: f32) -> FluxResult<()> {
        if !(low <= high) {
            return Err(FluxError::InvalidParameter(format!(
                "clip range [{}, {}] is empty",
                low, high
            )));
        }
        self.values.mapv_inplace(|v| {
            if v.is_finite() {
                v.clamp(low, high)
            } else {
                v
            }
        });
        debug!("Clipped {} stack to [{}, {}]", self.index, low, high);
        Ok(())
    }

    /// Clamp to the index's own domain range (EVI to [0, 1], LSWI to [-1, 1])
    pub fn clip_to_index_range(&mut self) {
        let (low, high) = self.index.clip_range();
        self.values.mapv_inplace(|v| {
            if v.is_finite() {
                v.clamp(low, high)
            } else {
                v
            }
        });
    }

    /// Per-pixel (min, max) over the time axis, ignoring invalid samples.
    /// A pixel with zero valid samples yields NaN for both.
    pub fn extrema(&self) -> (RasterData, RasterData) {
        let (rows, cols) = self.grid.shape();
        let mut min = Array2::from_elem((rows, cols), f32::NAN);
        let mut max = Array2::from_elem((rows, cols), f32::NAN);
        for ((r, c, _t), &v) in self.values.indexed_iter() {
            if !v.is_finite() {
                continue;
            }
            let lo = &mut min[[r, c]];
            if lo.is_nan() || v < *lo {
                *lo = v;
            }
            let hi = &mut max[[r, c]];
            if hi.is_nan() || v > *hi {
                *hi = v;
            }
        }
        (min, max)
    }

    /// Number of valid samples per pixel
    pub fn valid_counts(&self) -> Array2<u32> {
        self.values
            .map_axis(Axis(2), |series| {
                series.iter().filter(|v| v.is_finite()).count() as u32
            })
    }

    pub fn grid(&self) -> &GridGeometry {
        &self.grid
    }

    pub fn index(&self) -> IndexKind {
        self.index
    }

    pub fn timestamps(&self) -> &[NaiveDate] {
        &self.timestamps
    }

    pub fn values(&self) -> &StackData {
        &self.values
    }

    /// Number of distinct timestamps in the stack
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// 2-D view of one time layer
    pub fn layer(&self, t: usize) -> ArrayView2<'_, f32> {
        self.values.index_axis(Axis(2), t)
    }

    /// 2-D view of the layer acquired on `day`, if present
    pub fn day_layer(&self, day: NaiveDate) -> Option<ArrayView2<'_, f32>> {
        self.timestamps
            .binary_search(&day)
            .ok()
            .map(|t| self.layer(t))
    }
}
