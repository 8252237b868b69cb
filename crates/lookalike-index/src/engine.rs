//! Similarity search over a feature store.
//!
//! A query is a full linear scan: the query vector is compared against every
//! entry with cosine similarity, entries below the threshold are dropped and
//! the rest are ranked best-first. Cost is O(N * D) per query.

use std::cmp::Ordering;
use std::path::Path;

use serde::Serialize;

use crate::extract::{ExtractionError, SharedExtractor};
use crate::store::FeatureStore;
use crate::vector::FeatureVector;

/// Minimum similarity for a match unless the caller says otherwise.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Error type for similarity queries.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Failed to extract query image: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Query vector has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Store was built by '{store}' but the query used '{extractor}'")]
    ExtractorMismatch { store: String, extractor: String },
}

pub type Result<T> = std::result::Result<T, QueryError>;

/// One ranked match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityResult {
    pub identifier: String,
    pub score: f32,
}

/// Runs queries with the extractor that built the catalog.
pub struct SimilarityEngine {
    extractor: SharedExtractor,
}

impl SimilarityEngine {
    pub fn new(extractor: SharedExtractor) -> Self {
        Self { extractor }
    }

    pub fn extractor(&self) -> &SharedExtractor {
        &self.extractor
    }

    /// Rank every entry of `store` against the image at `query_path`.
    ///
    /// Fails if the image cannot be extracted, if the query vector's
    /// dimension differs from the store's, or if the dimensions agree but the
    /// store was built by a different extractor. An empty store, or one with
    /// no entry at or above `threshold`, yields an empty result.
    pub fn query(
        &self,
        query_path: &Path,
        store: &FeatureStore,
        threshold: f32,
    ) -> Result<Vec<SimilarityResult>> {
        let vector = self.extractor.extract(query_path)?;

        if store.is_empty() {
            return Ok(Vec::new());
        }
        check_dimension(&vector, store)?;
        if store.extractor_id() != self.extractor.id() {
            return Err(QueryError::ExtractorMismatch {
                store: store.extractor_id().to_string(),
                extractor: self.extractor.id().to_string(),
            });
        }

        let results = rank_unchecked(&vector, store, threshold);
        tracing::debug!(
            "Query {} matched {} of {} entries at threshold {}",
            query_path.display(),
            results.len(),
            store.len(),
            threshold
        );
        Ok(results)
    }
}

/// Rank `store` against a precomputed query vector.
///
/// Only the dimension is checked; the vector carries no extractor identity.
pub fn rank(
    query: &FeatureVector,
    store: &FeatureStore,
    threshold: f32,
) -> Result<Vec<SimilarityResult>> {
    if store.is_empty() {
        return Ok(Vec::new());
    }
    check_dimension(query, store)?;
    Ok(rank_unchecked(query, store, threshold))
}

fn check_dimension(query: &FeatureVector, store: &FeatureStore) -> Result<()> {
    if query.dimension() != store.dimension() {
        return Err(QueryError::DimensionMismatch {
            expected: store.dimension(),
            actual: query.dimension(),
        });
    }
    Ok(())
}

fn rank_unchecked(
    query: &FeatureVector,
    store: &FeatureStore,
    threshold: f32,
) -> Vec<SimilarityResult> {
    let mut results: Vec<SimilarityResult> = store
        .iter()
        .filter_map(|(id, vector)| {
            let score = query.cosine_similarity(vector);
            // Inclusive threshold.
            (score >= threshold).then(|| SimilarityResult {
                identifier: id.to_string(),
                score,
            })
        })
        .collect();

    results.sort_by(compare_results);
    results
}

/// Score descending, then identifier ascending.
fn compare_results(a: &SimilarityResult, b: &SimilarityResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.identifier.cmp(&b.identifier))
}
