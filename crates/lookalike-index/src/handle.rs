//! Process-wide handle to the current feature store.
//!
//! Queries take a snapshot with [`CatalogHandle::get`] and keep using it for
//! their whole duration; a rebuild publishes a new store with
//! [`CatalogHandle::swap`]. A reader therefore sees either the entire old
//! store or the entire new one, never a mix.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::task::JoinHandle;

use crate::builder::{BuildError, BuildFailure, BuildStats, CatalogBuilder};
use crate::store::{self, FeatureStore};

/// Error type for background rebuilds.
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("A catalog rebuild is already running")]
    InProgress,
    #[error("Background rebuild needs a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error("Rebuild failed: {0}")]
    Build(#[from] BuildError),
    #[error("Rebuild task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What a completed rebuild published.
#[derive(Debug)]
pub struct RebuildSummary {
    pub stats: BuildStats,
    pub failures: Vec<BuildFailure>,
    /// Entry count of the store that was replaced.
    pub previous_entries: usize,
}

/// Shared handle to the catalog handle itself.
pub type SharedCatalog = Arc<CatalogHandle>;

/// Holds the current store and serializes rebuilds.
pub struct CatalogHandle {
    current: RwLock<Arc<FeatureStore>>,
    rebuilding: AtomicBool,
}

impl CatalogHandle {
    pub fn new(store: FeatureStore) -> Self {
        Self {
            current: RwLock::new(Arc::new(store)),
            rebuilding: AtomicBool::new(false),
        }
    }

    /// Load the store at `path`. A missing or corrupt file is an error; the
    /// caller must not serve queries without a store.
    pub fn load(path: &Path) -> store::Result<Self> {
        Ok(Self::new(FeatureStore::load(path)?))
    }

    /// Snapshot of the current store.
    ///
    /// The lock is held only long enough to clone the `Arc`.
    pub fn get(&self) -> Arc<FeatureStore> {
        // The guarded value is a single Arc, so a poisoned lock still holds
        // a complete store.
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish `store` and return the one it replaced.
    pub fn swap(&self, store: FeatureStore) -> Arc<FeatureStore> {
        let next = Arc::new(store);
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    /// Rebuild the catalog on tokio's blocking pool and publish the result.
    ///
    /// Queries keep running against the current store meanwhile. The new
    /// store is persisted to `store_path` before it is swapped in; if the
    /// build fails the current store stays published. Only one rebuild runs
    /// at a time. Called outside a tokio runtime it returns
    /// [`RebuildError::NoRuntime`] without touching the rebuilding flag.
    pub fn spawn_rebuild(
        self: &Arc<Self>,
        builder: Arc<CatalogBuilder>,
        root: PathBuf,
        store_path: PathBuf,
    ) -> Result<JoinHandle<Result<RebuildSummary, BuildError>>, RebuildError> {
        let runtime = tokio::runtime::Handle::try_current()?;
        if self
            .rebuilding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RebuildError::InProgress);
        }

        let handle = Arc::clone(self);
        tracing::info!(
            "Starting background rebuild of {} -> {}",
            root.display(),
            store_path.display()
        );

        Ok(runtime.spawn_blocking(move || {
            let _guard = RebuildGuard(&handle.rebuilding);

            let report = builder.rebuild(&root, &store_path).inspect_err(|e| {
                tracing::error!("Background rebuild failed: {}", e);
            })?;

            let previous = handle.swap(report.store);
            tracing::info!(
                "Published rebuilt catalog: {} entries (was {})",
                report.stats.entries_added,
                previous.len()
            );

            Ok(RebuildSummary {
                stats: report.stats,
                failures: report.failures,
                previous_entries: previous.len(),
            })
        }))
    }

    /// [`spawn_rebuild`](Self::spawn_rebuild) and wait for it.
    pub async fn rebuild(
        self: &Arc<Self>,
        builder: Arc<CatalogBuilder>,
        root: PathBuf,
        store_path: PathBuf,
    ) -> Result<RebuildSummary, RebuildError> {
        let task = self.spawn_rebuild(builder, root, store_path)?;
        Ok(task.await??)
    }
}

/// Clears the rebuilding flag when the rebuild task ends, even on panic.
struct RebuildGuard<'a>(&'a AtomicBool);

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
