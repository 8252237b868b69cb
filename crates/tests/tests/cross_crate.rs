//! Cross-crate integration and E2E tests
//!
//! These tests drive the full catalog lifecycle the way the CLI does:
//! build a store on disk, publish it through a [`CatalogHandle`], query it,
//! and rebuild while queries keep running.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::{ImageFormat, Rgb, RgbImage};
use lookalike_index::{
    CatalogBuilder, CatalogHandle, DEFAULT_THRESHOLD, ExtractorConfig, ExtractorKind,
    FeatureStore, ModelLoadError, SharedExtractor, SimilarityEngine, StoreError,
};
use tempfile::tempdir;

fn write_solid(dir: &Path, name: &str, rgb: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(32, 32, Rgb(rgb))
        .save_with_format(&path, ImageFormat::Png)
        .expect("Failed to write test image");
    path
}

fn histogram() -> SharedExtractor {
    ExtractorConfig::new(ExtractorKind::Histogram)
        .build()
        .expect("Histogram extractor should build")
}

fn file_name(identifier: &str) -> &str {
    Path::new(identifier)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(identifier)
}

/// E2E Test: build to disk, load through the handle, query, print as JSON
#[tokio::test]
async fn test_e2e_build_load_query() {
    let data = tempdir().expect("Failed to create data dir");
    let out = tempdir().expect("Failed to create output dir");
    let store_path = out.path().join("histogram.store.jsonl");

    write_solid(data.path(), "sunset.png", [240, 90, 20]);
    write_solid(data.path(), "ocean.png", [20, 80, 230]);
    write_solid(data.path(), "forest.png", [30, 150, 40]);
    let query = write_solid(out.path(), "query.png", [240, 90, 20]);

    let extractor = histogram();
    CatalogBuilder::new(Arc::clone(&extractor))
        .rebuild(data.path(), &store_path)
        .expect("Build should succeed");

    let handle = CatalogHandle::load(&store_path).expect("Should load built store");
    let snapshot = handle.get();
    assert_eq!(snapshot.len(), 3);

    let results = SimilarityEngine::new(extractor)
        .query(&query, &snapshot, DEFAULT_THRESHOLD)
        .expect("Query should succeed");
    assert_eq!(results.len(), 1);
    assert_eq!(file_name(&results[0].identifier), "sunset.png");

    let json = serde_json::to_value(&results).expect("Results should serialize");
    assert_eq!(json[0]["identifier"], results[0].identifier);
    assert!(json[0]["score"].as_f64().unwrap() > 0.99);
}

/// E2E Test: the store file is replaced in place and nothing else is left behind
#[tokio::test]
async fn test_e2e_rebuild_replaces_store_file() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    let store_path = out.path().join("catalog.jsonl");
    write_solid(data.path(), "a.png", [200, 10, 10]);

    let handle = Arc::new(CatalogHandle::new(FeatureStore::new("hsv-histogram-8x8x8", 512)));
    let builder = Arc::new(CatalogBuilder::new(histogram()));

    handle
        .rebuild(
            Arc::clone(&builder),
            data.path().to_path_buf(),
            store_path.clone(),
        )
        .await
        .expect("First rebuild should succeed");
    assert_eq!(FeatureStore::read_header(&store_path).unwrap().entry_count, 1);

    write_solid(data.path(), "b.png", [10, 200, 10]);
    let summary = handle
        .rebuild(builder, data.path().to_path_buf(), store_path.clone())
        .await
        .expect("Second rebuild should succeed");

    assert_eq!(summary.previous_entries, 1);
    assert_eq!(summary.stats.entries_added, 2);
    let header = FeatureStore::read_header(&store_path).unwrap();
    assert_eq!(header.entry_count, 2);
    assert_eq!(header.extractor_id, "hsv-histogram-8x8x8");

    let leftovers: Vec<_> = fs::read_dir(out.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("catalog.jsonl")]);
}

/// E2E Test: queries running during a rebuild see the old or the new store,
/// never a partial one
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_e2e_queries_during_rebuild() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    let store_path = out.path().join("catalog.jsonl");
    for i in 0..4u8 {
        write_solid(data.path(), &format!("old_{}.png", i), [200, 20 + i * 10, 20]);
    }

    let extractor = histogram();
    let builder = Arc::new(CatalogBuilder::new(Arc::clone(&extractor)));
    let initial = builder.rebuild(data.path(), &store_path).unwrap();
    let handle = Arc::new(CatalogHandle::new(initial.store));

    for i in 0..12u8 {
        write_solid(data.path(), &format!("new_{}.png", i), [20, 20 + i * 10, 200]);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let handle = Arc::clone(&handle);
        let stop = Arc::clone(&stop);
        let engine = SimilarityEngine::new(Arc::clone(&extractor));
        let query = data.path().join("old_0.png");
        std::thread::spawn(move || {
            let mut sizes = Vec::new();
            while !stop.load(Ordering::Acquire) {
                let snapshot = handle.get();
                let results = engine
                    .query(&query, &snapshot, -1.0)
                    .expect("Query should succeed during rebuild");
                // Threshold -1 keeps every entry of the snapshot.
                assert_eq!(results.len(), snapshot.len());
                sizes.push(snapshot.len());
            }
            sizes
        })
    };

    let summary = handle
        .rebuild(builder, data.path().to_path_buf(), store_path)
        .await
        .expect("Rebuild should succeed");
    stop.store(true, Ordering::Release);
    let sizes = reader.join().expect("Reader thread should not panic");

    assert_eq!(summary.previous_entries, 4);
    assert_eq!(handle.get().len(), 16);
    assert!(sizes.iter().all(|&n| n == 4 || n == 16));
}

/// E2E Test: a damaged store file is refused rather than served
#[test]
fn test_e2e_corrupt_store_is_rejected() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    let store_path = out.path().join("catalog.jsonl");
    write_solid(data.path(), "a.png", [1, 2, 3]);
    write_solid(data.path(), "b.png", [4, 5, 6]);

    CatalogBuilder::new(histogram())
        .rebuild(data.path(), &store_path)
        .unwrap();

    // Drop the last entry line so the header count no longer matches.
    let content = fs::read_to_string(&store_path).unwrap();
    let mut lines: Vec<&str> = content.lines().collect();
    lines.pop();
    fs::write(&store_path, lines.join("\n")).unwrap();

    assert!(matches!(
        CatalogHandle::load(&store_path),
        Err(StoreError::Corrupt(_))
    ));
    assert!(matches!(
        CatalogHandle::load(&out.path().join("missing.jsonl")),
        Err(StoreError::NotFound(_))
    ));
}

/// E2E Test: selecting the embedding extractor without weights fails at startup
#[test]
fn test_e2e_embedding_requires_weights() {
    let kind: ExtractorKind = "resnet50".parse().unwrap();
    let result = ExtractorConfig::new(kind).build();
    assert!(matches!(result, Err(ModelLoadError::MissingWeights)));

    let result = ExtractorConfig::new(kind)
        .with_weights("/nonexistent/resnet50.safetensors")
        .build();
    assert!(matches!(result, Err(ModelLoadError::WeightsNotFound(_))));
}
