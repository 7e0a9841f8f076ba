//! I/O modules for persisted processing artifacts

pub mod weight_cache;

pub use weight_cache::WeightCache;
