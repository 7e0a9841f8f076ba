//! Persistent cache for regridding weights
//!
//! Weight construction is the expensive step of regridding, so built
//! weight sets are kept in two tiers: an in-process map shared across
//! threads, and JSON files under a caller-chosen directory that survive
//! restarts. Entries are addressed by a checksum over both grid
//! descriptors and the policy, so any change to either grid, or asking
//! for the other policy, yields a separate entry instead of a stale hit.

use crate::core::regrid::{RegridPolicy, RegridWeights, Regridder};
use crate::types::{FluxError, FluxResult, GridGeometry};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Two-tier weight store keyed by (source grid, target grid, policy)
pub struct WeightCache {
    cache_dir: PathBuf,
    memory: Mutex<HashMap<u32, Arc<RegridWeights>>>,
    build_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl WeightCache {
    /// Open a cache rooted at `cache_dir`, creating the directory if
    /// needed
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> FluxResult<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            memory: Mutex::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Checksum over everything that determines the weights
    fn cache_key(source: &GridGeometry, target: &GridGeometry, policy: RegridPolicy) -> u32 {
        let canonical = format!(
            "{}|{}|{}",
            source.descriptor(),
            target.descriptor(),
            policy
        );
        crc32fast::hash(canonical.as_bytes())
    }

    fn cache_path(
        &self,
        source: &GridGeometry,
        target: &GridGeometry,
        policy: RegridPolicy,
        key: u32,
    ) -> PathBuf {
        self.cache_dir.join(format!(
            "regrid_{}_{}x{}_to_{}x{}_{:08x}.json",
            policy, source.rows, source.cols, target.rows, target.cols, key
        ))
    }

    /// Look up weights without building. Checks the in-process tier
    /// first, then disk; a disk entry that fails to parse or does not
    /// match the requested grids is treated as a miss.
    pub fn get(
        &self,
        source: &GridGeometry,
        target: &GridGeometry,
        policy: RegridPolicy,
    ) -> FluxResult<Option<Arc<RegridWeights>>> {
        let key = Self::cache_key(source, target, policy);
        if let Some(weights) = lock(&self.memory)?.get(&key) {
            debug!("Regrid weights {:08x} served from memory", key);
            return Ok(Some(Arc::clone(weights)));
        }
        self.load_from_disk(source, target, policy, key)
    }

    fn load_from_disk(
        &self,
        source: &GridGeometry,
        target: &GridGeometry,
        policy: RegridPolicy,
        key: u32,
    ) -> FluxResult<Option<Arc<RegridWeights>>> {
        let path = self.cache_path(source, target, policy, key);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let weights: RegridWeights = match serde_json::from_str(&text) {
            Ok(weights) => weights,
            Err(e) => {
                warn!(
                    "Ignoring unreadable weight cache file {}: {}",
                    path.display(),
                    e
                );
                return Ok(None);
            }
        };
        if weights.source_descriptor != source.descriptor()
            || weights.target_descriptor != target.descriptor()
            || weights.policy != policy
        {
            warn!(
                "Weight cache file {} does not match the requested grids, rebuilding",
                path.display()
            );
            return Ok(None);
        }
        info!("Using cached regrid weights: {}", path.display());
        let weights = Arc::new(weights);
        lock(&self.memory)?.insert(key, Arc::clone(&weights));
        Ok(Some(weights))
    }

    /// Persist a built weight set for later runs
    pub fn put(
        &self,
        source: &GridGeometry,
        target: &GridGeometry,
        weights: &RegridWeights,
    ) -> FluxResult<PathBuf> {
        let key = Self::cache_key(source, target, weights.policy);
        let path = self.cache_path(source, target, weights.policy, key);
        let text = serde_json::to_string(weights)
            .map_err(|e| FluxError::Cache(format!("weight serialization failed: {}", e)))?;
        fs::write(&path, text)?;
        debug!("Cached regrid weights: {}", path.display());
        Ok(path)
    }

    /// Return cached weights, or build and persist them. Concurrent
    /// callers asking for the same triple build at most once; the rest
    /// block until the first build lands and then share it. A failed
    /// disk write is logged but does not fail the call, since the built
    /// weights are valid either way.
    pub fn get_or_build(
        &self,
        source: &GridGeometry,
        target: &GridGeometry,
        policy: RegridPolicy,
    ) -> FluxResult<Arc<RegridWeights>> {
        if let Some(weights) = self.get(source, target, policy)? {
            return Ok(weights);
        }
        let key = Self::cache_key(source, target, policy);
        let build_lock = Arc::clone(
            lock(&self.build_locks)?
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _guard = build_lock
            .lock()
            .map_err(|_| FluxError::Cache("weight build lock poisoned".to_string()))?;
        // another caller may have finished the build while we waited
        if let Some(weights) = self.get(source, target, policy)? {
            return Ok(weights);
        }
        info!(
            "Regrid weight cache miss for {} {}x{} -> {}x{}",
            policy, source.rows, source.cols, target.rows, target.cols
        );
        let weights = Arc::new(Regridder::build(source, target, policy)?);
        // memory first so concurrent readers never race the file write
        lock(&self.memory)?.insert(key, Arc::clone(&weights));
        if let Err(e) = self.put(source, target, &weights) {
            warn!("Failed to persist regrid weights: {}", e);
        }
        Ok(weights)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> FluxResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| FluxError::Cache("weight cache lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Crs, GeoTransform};

    fn grid(rows: usize, cols: usize, pixel: f64) -> GridGeometry {
        GridGeometry::new(
            Crs::Geographic,
            rows,
            cols,
            GeoTransform::north_up(10.0, 50.0, pixel, -pixel),
        )
    }

    #[test]
    fn test_miss_builds_then_hit_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WeightCache::new(dir.path()).unwrap();
        let source = grid(4, 4, 0.1);
        let target = grid(2, 2, 0.2);

        assert!(cache
            .get(&source, &target, RegridPolicy::Continuous)
            .unwrap()
            .is_none());
        let built = cache
            .get_or_build(&source, &target, RegridPolicy::Continuous)
            .unwrap();
        let again = cache
            .get_or_build(&source, &target, RegridPolicy::Continuous)
            .unwrap();
        assert!(Arc::ptr_eq(&built, &again));
    }

    #[test]
    fn test_disk_entry_survives_new_cache_instance() {
        let dir = tempfile::tempdir().unwrap();
        let source = grid(4, 4, 0.1);
        let target = grid(2, 2, 0.2);

        let first = WeightCache::new(dir.path()).unwrap();
        let built = first
            .get_or_build(&source, &target, RegridPolicy::Continuous)
            .unwrap();

        // fresh instance, same directory: served from disk, not rebuilt
        let second = WeightCache::new(dir.path()).unwrap();
        let loaded = second
            .get(&source, &target, RegridPolicy::Continuous)
            .unwrap()
            .expect("disk entry should hit");
        assert_eq!(loaded.rows.len(), built.rows.len());
        assert_eq!(loaded.source_descriptor, built.source_descriptor);
    }

    #[test]
    fn test_policies_have_distinct_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WeightCache::new(dir.path()).unwrap();
        let source = grid(4, 4, 0.1);
        let target = grid(2, 2, 0.2);

        let continuous = cache
            .get_or_build(&source, &target, RegridPolicy::Continuous)
            .unwrap();
        let categorical = cache
            .get_or_build(&source, &target, RegridPolicy::Categorical)
            .unwrap();
        assert_eq!(continuous.policy, RegridPolicy::Continuous);
        assert_eq!(categorical.policy, RegridPolicy::Categorical);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_corrupt_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WeightCache::new(dir.path()).unwrap();
        let source = grid(4, 4, 0.1);
        let target = grid(2, 2, 0.2);

        let key = WeightCache::cache_key(&source, &target, RegridPolicy::Continuous);
        let path = cache.cache_path(&source, &target, RegridPolicy::Continuous, key);
        fs::write(&path, "not json").unwrap();

        assert!(cache
            .get(&source, &target, RegridPolicy::Continuous)
            .unwrap()
            .is_none());
        // get_or_build recovers by rebuilding over the corrupt entry
        let rebuilt = cache
            .get_or_build(&source, &target, RegridPolicy::Continuous)
            .unwrap();
        assert!(!rebuilt.rows.is_empty());
    }

    #[test]
    fn test_different_grids_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WeightCache::new(dir.path()).unwrap();
        let target = grid(2, 2, 0.2);

        let a = cache
            .get_or_build(&grid(4, 4, 0.1), &target, RegridPolicy::Continuous)
            .unwrap();
        let b = cache
            .get_or_build(&grid(8, 8, 0.05), &target, RegridPolicy::Continuous)
            .unwrap();
        assert_ne!(a.source_descriptor, b.source_descriptor);
        assert_ne!(a.source_shape, b.source_shape);
    }

    #[test]
    fn test_concurrent_requests_build_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(WeightCache::new(dir.path()).unwrap());
        let source = grid(16, 16, 0.025);
        let target = grid(4, 4, 0.1);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let source = source.clone();
                let target = target.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_build(&source, &target, RegridPolicy::Continuous)
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // a single build means every caller shares one allocation
        for w in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], w));
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
