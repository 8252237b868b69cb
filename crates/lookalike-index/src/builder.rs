//! Catalog builder for constructing feature stores from image directories.
//!
//! This module walks a directory tree, runs the configured extractor on every
//! regular file and collects the results into a [`FeatureStore`]. A file that
//! fails to extract is recorded and skipped; it never aborts the batch.

use std::path::{Path, PathBuf};
use std::time::Instant;

use ignore::WalkBuilder;

use crate::extract::{ExtractionError, SharedExtractor};
use crate::store::{FeatureStore, StoreError};

/// Error type for catalog building operations.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Catalog root is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Statistics from a build operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Number of regular files visited.
    pub files_seen: usize,
    /// Number of entries written to the store.
    pub entries_added: usize,
    /// Number of files that failed extraction.
    pub failures: usize,
    /// Directory entries the walker could not read.
    pub walk_errors: usize,
    /// Wall-clock build time in milliseconds.
    pub elapsed_ms: u64,
}

/// A file that could not be added to the catalog.
#[derive(Debug)]
pub struct BuildFailure {
    pub identifier: String,
    pub error: ExtractionError,
}

/// Result of a catalog build: the store assembled from every file that
/// extracted cleanly, plus the files that did not.
#[derive(Debug)]
pub struct BuildReport {
    pub store: FeatureStore,
    pub failures: Vec<BuildFailure>,
    pub stats: BuildStats,
}

impl BuildReport {
    /// Number of entries in the built store.
    pub fn success_count(&self) -> usize {
        self.store.len()
    }
}

/// Walks image directories and extracts a feature store.
pub struct CatalogBuilder {
    extractor: SharedExtractor,
}

impl CatalogBuilder {
    /// Create a builder that uses `extractor` for every file.
    pub fn new(extractor: SharedExtractor) -> Self {
        Self { extractor }
    }

    pub fn extractor(&self) -> &SharedExtractor {
        &self.extractor
    }

    /// Extract every regular file under `root` into a new in-memory store.
    ///
    /// Hidden files are included, ignore files are not consulted and
    /// symlinks are not followed. Traversal is sorted by file name so two
    /// builds over the same tree visit files in the same order.
    pub fn build_directory(&self, root: &Path) -> Result<BuildReport> {
        if !root.is_dir() {
            return Err(BuildError::NotADirectory(root.to_path_buf()));
        }

        let start = Instant::now();
        let mut store = FeatureStore::for_extractor(self.extractor.as_ref());
        let mut failures = Vec::new();
        let mut stats = BuildStats::default();

        tracing::info!(
            "Building catalog from {} with {}",
            root.display(),
            self.extractor.id()
        );

        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping unreadable directory entry: {}", e);
                    stats.walk_errors += 1;
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }

            stats.files_seen += 1;
            let path = entry.path();
            let identifier = path.to_string_lossy().to_string();

            match self.extractor.extract(path) {
                Ok(vector) => {
                    tracing::debug!("Extracted {}", identifier);
                    store.insert(identifier, vector)?;
                }
                Err(error) => {
                    tracing::warn!("Error processing {}: {}", identifier, error);
                    failures.push(BuildFailure { identifier, error });
                }
            }
        }

        stats.entries_added = store.len();
        stats.failures = failures.len();
        stats.elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            "Built {} entries from {} files ({} failed) in {}ms",
            stats.entries_added,
            stats.files_seen,
            stats.failures,
            stats.elapsed_ms
        );

        Ok(BuildReport {
            store,
            failures,
            stats,
        })
    }

    /// Build from `root` and persist the store to `store_path`.
    ///
    /// The file is replaced atomically, and only after the whole tree has
    /// been processed.
    pub fn rebuild(&self, root: &Path, store_path: &Path) -> Result<BuildReport> {
        let report = self.build_directory(root)?;
        report.store.save(store_path)?;
        Ok(report)
    }
}
