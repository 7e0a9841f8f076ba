//! Land-cover tile mosaicking
//!
//! Folds an ordered sequence of discrete land-cover tiles into a single
//! mosaic raster. Tiles disjoint from the footprint of interest are
//! rejected up front; accepted tiles extend the mosaic to the union
//! extent, with earlier-merged pixels keeping precedence over later
//! overlapping ones. Class ids are categorical throughout: resampling is
//! nearest-neighbor, never interpolation.

use crate::types::{
    BoundingBox, ClassData, FluxError, FluxResult, GeoTransform, GridGeometry, LandCoverGrid,
    NODATA_CLASS,
};
use log::{debug, info, warn};
use ndarray::{s, Array2};
use std::collections::BTreeSet;

/// Cell-offset alignment tolerance, in fractions of a pixel
const ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// Mosaic of land-cover class ids built from one or more tiles
#[derive(Debug, Clone)]
pub struct LandCoverMosaic {
    grid: GridGeometry,
    classes: ClassData,
}

impl LandCoverMosaic {
    /// Seed a mosaic from its first tile. The tile's grid becomes the
    /// initial mosaic grid; later tiles extend it.
    pub fn new(first: LandCoverGrid) -> FluxResult<Self> {
        if !first.grid.transform.is_north_up() {
            return Err(FluxError::Processing(
                "rotated land-cover grids are not supported".to_string(),
            ));
        }
        Ok(Self {
            grid: first.grid,
            classes: first.classes,
        })
    }

    /// Bounding-box intersection test between a tile and a target footprint
    pub fn overlaps(tile_bounds: &BoundingBox, target_bounds: &BoundingBox) -> bool {
        tile_bounds.intersects(target_bounds)
    }

    /// Fold a sequence of tiles into a mosaic, in order. Tiles disjoint
    /// from `target` are skipped; the first accepted tile seeds the
    /// mosaic. Fails with `NoCoverage` when nothing overlaps the target.
    pub fn from_tiles(
        tiles: Vec<LandCoverGrid>,
        target: &BoundingBox,
        reproject: bool,
    ) -> FluxResult<Self> {
        let n_input = tiles.len();
        let mut mosaic: Option<LandCoverMosaic> = None;
        let mut accepted = 0usize;
        for tile in tiles {
            if !Self::overlaps(&tile.bounding_box(), target) {
                warn!(
                    "Skipping land cover tile {:?}: disjoint from target footprint {:?}",
                    tile.bounding_box(),
                    target
                );
                continue;
            }
            match mosaic.as_mut() {
                Some(m) => {
                    if m.add_tile(&tile, reproject)? {
                        accepted += 1;
                    }
                }
                None => {
                    mosaic = Some(Self::new(tile)?);
                    accepted += 1;
                }
            }
        }
        info!(
            "Mosaicked {} of {} land cover tiles over target footprint",
            accepted, n_input
        );
        mosaic.ok_or_else(|| {
            FluxError::NoCoverage("no land cover tile overlaps the target footprint".to_string())
        })
    }

    /// Insert one tile. Returns `Ok(false)` (and leaves the mosaic
    /// untouched) when the tile's bounds are disjoint from the mosaic's
    /// current footprint. With `reproject == false` the tile must share
    /// the mosaic's cell lattice; with `reproject == true` it is resampled
    /// onto the current mosaic grid by nearest-neighbor first. Existing
    /// mosaic pixels keep precedence in either case.
    pub fn add_tile(&mut self, tile: &LandCoverGrid, reproject: bool) -> FluxResult<bool> {
        if !Self::overlaps(&tile.bounding_box(), &self.bounding_box()) {
            warn!(
                "Rejecting land cover tile {:?}: disjoint from mosaic footprint {:?}",
                tile.bounding_box(),
                self.bounding_box()
            );
            return Ok(false);
        }
        if !tile.grid.transform.is_north_up() {
            return Err(FluxError::Processing(
                "rotated land-cover grids are not supported".to_string(),
            ));
        }
        if tile.grid.crs != self.grid.crs {
            return Err(FluxError::GridMismatch(format!(
                "tile CRS {} does not match mosaic CRS {}; reproject tiles upstream",
                tile.grid.crs, self.grid.crs
            )));
        }

        if reproject {
            self.fold_resampled(tile);
        } else {
            self.check_alignment(tile)?;
            self.fold_aligned(tile);
        }
        Ok(true)
    }

    /// Restrict the mosaic to `bounds` expanded about its center by
    /// `buffer_factor`. Pixels outside the window are dropped.
    pub fn crop(&mut self, bounds: &BoundingBox, buffer_factor: f64) -> FluxResult<()> {
        if !(buffer_factor > 0.0) {
            return Err(FluxError::InvalidParameter(format!(
                "buffer factor must be positive, got {}",
                buffer_factor
            )));
        }
        let target = bounds.scaled(buffer_factor);
        if !target.intersects(&self.bounding_box()) {
            return Err(FluxError::NoCoverage(format!(
                "crop region {:?} lies outside the mosaic extent {:?}",
                target,
                self.bounding_box()
            )));
        }

        let t = &self.grid.transform;
        let col0 = ((target.min_lon - t.top_left_x) / t.pixel_width).floor().max(0.0) as usize;
        let col1 = ((target.max_lon - t.top_left_x) / t.pixel_width)
            .ceil()
            .min(self.grid.cols as f64) as usize;
        let row0 = ((target.max_lat - t.top_left_y) / t.pixel_height).floor().max(0.0) as usize;
        let row1 = ((target.min_lat - t.top_left_y) / t.pixel_height)
            .ceil()
            .min(self.grid.rows as f64) as usize;
        if row0 >= row1 || col0 >= col1 {
            return Err(FluxError::NoCoverage(format!(
                "crop region {:?} covers no whole mosaic cell",
                target
            )));
        }

        let window = self.classes.slice(s![row0..row1, col0..col1]).to_owned();
        let (new_x, new_y) = t.pixel_to_geo(row0 as f64, col0 as f64);
        let new_transform = GeoTransform::north_up(new_x, new_y, t.pixel_width, t.pixel_height);
        debug!(
            "Cropped mosaic from {}x{} to {}x{} (rows {}..{}, cols {}..{})",
            self.grid.rows,
            self.grid.cols,
            row1 - row0,
            col1 - col0,
            row0,
            row1,
            col0,
            col1
        );
        self.grid = GridGeometry::new(
            self.grid.crs.clone(),
            row1 - row0,
            col1 - col0,
            new_transform,
        );
        self.classes = window;
        Ok(())
    }

    /// Sorted distinct class ids present in the mosaic
    pub fn class_set(&self) -> Vec<u16> {
        let set: BTreeSet<u16> = self
            .classes
            .iter()
            .copied()
            .filter(|c| *c != NODATA_CLASS)
            .collect();
        set.into_iter().collect()
    }

    pub fn grid(&self) -> &GridGeometry {
        &self.grid
    }

    pub fn classes(&self) -> &ClassData {
        &self.classes
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.grid.bounding_box()
    }

    /// Number of cells carrying a class id
    pub fn assigned_count(&self) -> usize {
        self.classes.iter().filter(|c| **c != NODATA_CLASS).count()
    }

    /// Tile must share pixel size and sit on the mosaic's cell lattice
    fn check_alignment(&self, tile: &LandCoverGrid) -> FluxResult<()> {
        let m = &self.grid.transform;
        let t = &tile.grid.transform;
        if (m.pixel_width - t.pixel_width).abs() > ALIGNMENT_TOLERANCE * m.pixel_width.abs()
            || (m.pixel_height - t.pixel_height).abs()
                > ALIGNMENT_TOLERANCE * m.pixel_height.abs()
        {
            return Err(FluxError::GridMismatch(format!(
                "tile pixel size ({}, {}) does not match mosaic ({}, {}); pass reproject=true",
                t.pixel_width, t.pixel_height, m.pixel_width, m.pixel_height
            )));
        }
        let col_offset = (t.top_left_x - m.top_left_x) / m.pixel_width;
        let row_offset = (t.top_left_y - m.top_left_y) / m.pixel_height;
        if (col_offset - col_offset.round()).abs() > ALIGNMENT_TOLERANCE
            || (row_offset - row_offset.round()).abs() > ALIGNMENT_TOLERANCE
        {
            return Err(FluxError::GridMismatch(format!(
                "tile origin is offset ({:.6}, {:.6}) cells from the mosaic lattice; pass reproject=true",
                row_offset, col_offset
            )));
        }
        Ok(())
    }

    /// Union-extent fold for a lattice-aligned tile. A fresh buffer is
    /// allocated; mosaic pixels are copied first and tile pixels fill
    /// only cells still unset.
    fn fold_aligned(&mut self, tile: &LandCoverGrid) {
        let m = &self.grid.transform;
        let t = &tile.grid.transform;
        let pw = m.pixel_width;
        let ph = m.pixel_height;

        let left = m.top_left_x.min(t.top_left_x);
        let top = m.top_left_y.max(t.top_left_y);
        let right = (m.top_left_x + self.grid.cols as f64 * pw)
            .max(t.top_left_x + tile.grid.cols as f64 * pw);
        let bottom = (m.top_left_y + self.grid.rows as f64 * ph)
            .min(t.top_left_y + tile.grid.rows as f64 * ph);
        let cols = ((right - left) / pw).round() as usize;
        let rows = ((bottom - top) / ph).round() as usize;

        let mosaic_row0 = ((m.top_left_y - top) / ph).round() as usize;
        let mosaic_col0 = ((m.top_left_x - left) / pw).round() as usize;
        let tile_row0 = ((t.top_left_y - top) / ph).round() as usize;
        let tile_col0 = ((t.top_left_x - left) / pw).round() as usize;

        let mut buffer = Array2::from_elem((rows, cols), NODATA_CLASS);
        for ((r, c), &class) in self.classes.indexed_iter() {
            if class != NODATA_CLASS {
                buffer[[r + mosaic_row0, c + mosaic_col0]] = class;
            }
        }
        let mut filled = 0usize;
        for ((r, c), &class) in tile.classes.indexed_iter() {
            if class == NODATA_CLASS {
                continue;
            }
            let cell = &mut buffer[[r + tile_row0, c + tile_col0]];
            if *cell == NODATA_CLASS {
                *cell = class;
                filled += 1;
            }
        }
        debug!(
            "Folded aligned tile into mosaic: extent now {}x{}, {} cells filled",
            rows, cols, filled
        );

        self.grid = GridGeometry::new(
            self.grid.crs.clone(),
            rows,
            cols,
            GeoTransform::north_up(left, top, pw, ph),
        );
        self.classes = buffer;
    }

    /// Nearest-neighbor fold onto the current mosaic grid. Only cells
    /// still unset receive tile classes; the extent does not grow.
    fn fold_resampled(&mut self, tile: &LandCoverGrid) {
        let (rows, cols) = self.grid.shape();
        let mut filled = 0usize;
        for r in 0..rows {
            for c in 0..cols {
                if self.classes[[r, c]] != NODATA_CLASS {
                    continue;
                }
                let (x, y) = self.grid.pixel_center(r, c);
                let Some((tr, tc)) = tile.grid.geo_to_pixel(x, y) else {
                    continue;
                };
                if tr < 0.0 || tc < 0.0 {
                    continue;
                }
                let (tr, tc) = (tr.floor() as usize, tc.floor() as usize);
                if tr >= tile.grid.rows || tc >= tile.grid.cols {
                    continue;
                }
                let class = tile.classes[[tr, tc]];
                if class != NODATA_CLASS {
                    self.classes[[r, c]] = class;
                    filled += 1;
                }
            }
        }
        debug!("Resampled tile into mosaic: {} cells filled", filled);
    }
}
