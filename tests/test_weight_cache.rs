use carbonflux::core::regrid::{RegridPolicy, Regridder};
use carbonflux::io::WeightCache;
use carbonflux::types::{Crs, GeoTransform, GridGeometry};
use ndarray::Array2;
use std::sync::Arc;

fn grid(rows: usize, cols: usize, pixel: f64) -> GridGeometry {
    GridGeometry::new(
        Crs::Geographic,
        rows,
        cols,
        GeoTransform::north_up(10.0, 50.0, pixel, -pixel),
    )
}

#[test]
fn test_cached_weights_reproduce_direct_build() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("=== Weight cache vs direct build ===");

    let source = grid(6, 6, 0.1);
    let target = grid(3, 3, 0.2);
    let field = Array2::from_shape_fn((6, 6), |(r, c)| (r * 6 + c) as f32 * 0.1);

    let direct = Regridder::build(&source, &target, RegridPolicy::Continuous).expect("direct");
    let dir = tempfile::tempdir().expect("temp dir");
    let cache = WeightCache::new(dir.path()).expect("cache");
    let cached = cache
        .get_or_build(&source, &target, RegridPolicy::Continuous)
        .expect("cached build");

    let from_direct = Regridder::apply(&direct, &field).expect("direct apply");
    let from_cached = Regridder::apply(&cached, &field).expect("cached apply");
    assert_eq!(from_direct, from_cached);
    println!("Cache-built weights match a direct build");
}

#[test]
fn test_second_run_reuses_persisted_weights() {
    let _ = env_logger::builder().is_test(true).try_init();

    let source = grid(6, 6, 0.1);
    let target = grid(3, 3, 0.2);
    let dir = tempfile::tempdir().expect("temp dir");

    // first run builds and persists
    let weights_first = {
        let cache = WeightCache::new(dir.path()).expect("cache");
        cache
            .get_or_build(&source, &target, RegridPolicy::Continuous)
            .expect("first build")
    };
    let files_after_first = std::fs::read_dir(dir.path()).expect("read dir").count();
    assert_eq!(files_after_first, 1);

    // second run starts cold in memory and must hit the disk entry
    let cache = WeightCache::new(dir.path()).expect("cache reopened");
    let loaded = cache
        .get(&source, &target, RegridPolicy::Continuous)
        .expect("lookup")
        .expect("persisted weights should hit");
    assert_eq!(loaded.rows.len(), weights_first.rows.len());
    assert_eq!(loaded.target_shape, (3, 3));

    // and the file count is unchanged
    assert_eq!(
        std::fs::read_dir(dir.path()).expect("read dir").count(),
        files_after_first
    );
}

#[test]
fn test_each_grid_pair_and_policy_gets_own_entry() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().expect("temp dir");
    let cache = WeightCache::new(dir.path()).expect("cache");
    let target = grid(3, 3, 0.2);

    cache
        .get_or_build(&grid(6, 6, 0.1), &target, RegridPolicy::Continuous)
        .expect("continuous 6x6");
    cache
        .get_or_build(&grid(6, 6, 0.1), &target, RegridPolicy::Categorical)
        .expect("categorical 6x6");
    cache
        .get_or_build(&grid(12, 12, 0.05), &target, RegridPolicy::Continuous)
        .expect("continuous 12x12");

    assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 3);
}

#[test]
fn test_corrupt_cache_entry_is_rebuilt() {
    let _ = env_logger::builder().is_test(true).try_init();

    let source = grid(6, 6, 0.1);
    let target = grid(3, 3, 0.2);
    let dir = tempfile::tempdir().expect("temp dir");

    {
        let cache = WeightCache::new(dir.path()).expect("cache");
        cache
            .get_or_build(&source, &target, RegridPolicy::Continuous)
            .expect("seed build");
    }
    // truncate the single persisted entry
    let entry = std::fs::read_dir(dir.path())
        .expect("read dir")
        .next()
        .expect("one entry")
        .expect("entry");
    std::fs::write(entry.path(), "{\"broken\":").expect("corrupt file");

    let cache = WeightCache::new(dir.path()).expect("cache reopened");
    assert!(
        cache
            .get(&source, &target, RegridPolicy::Continuous)
            .expect("lookup")
            .is_none(),
        "a corrupt entry is a miss, not an error"
    );
    let rebuilt = cache
        .get_or_build(&source, &target, RegridPolicy::Continuous)
        .expect("rebuild");
    assert!(!rebuilt.rows.is_empty());

    // the rebuilt entry must be readable again
    let cache = WeightCache::new(dir.path()).expect("cache reopened again");
    assert!(cache
        .get(&source, &target, RegridPolicy::Continuous)
        .expect("lookup")
        .is_some());
}

#[test]
fn test_many_threads_share_one_build() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().expect("temp dir");
    let cache = Arc::new(WeightCache::new(dir.path()).expect("cache"));
    let source = grid(20, 20, 0.05);
    let target = grid(5, 5, 0.2);

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let source = source.clone();
            let target = target.clone();
            std::thread::spawn(move || {
                cache
                    .get_or_build(&source, &target, RegridPolicy::Continuous)
                    .expect("build")
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().expect("join")).collect();

    for w in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], w), "all threads share one build");
    }
    assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 1);
}
