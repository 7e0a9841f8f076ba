//! Core flux processing modules

pub mod indices;
pub mod stack;
pub mod smooth;
pub mod landcover;
pub mod regrid;
pub mod meteorology;
pub mod predict;

// Re-export main types
pub use indices::{compute_index, index_tile, IndexKind, ReflectanceBands};
pub use stack::TileStack;
pub use smooth::{daily_range, SmoothedSeries, SmootherParams, TemporalSmoother};
pub use landcover::LandCoverMosaic;
pub use regrid::{RegridPolicy, RegridWeights, Regridder, WeightRow};
pub use meteorology::{MeteorologyAligner, MeteorologyField, SSRD, TEMPERATURE_2M};
pub use predict::{FluxGrids, FluxPredictor};
