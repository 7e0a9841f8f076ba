//! carbonflux: A Fast, Modular VPRM Carbon Flux Processor
//!
//! This library turns satellite vegetation indices, mosaicked land-cover
//! maps, and hourly reanalysis meteorology into gridded GPP and NEE
//! estimates using the VPRM parametric flux model.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, ClassParameters, Crs, FluxError, FluxParameters, FluxResult, GeoTransform,
    GridGeometry, LandCoverGrid, RasterTile, NODATA_CLASS,
};

pub use io::WeightCache;
