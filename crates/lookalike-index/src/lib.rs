//! lookalike-index: Image similarity search infrastructure
//!
//! This crate provides the core search functionality for lookalike:
//! - Feature extraction from images (colour histogram or ResNet-50 embedding)
//! - A versioned, validated on-disk feature store
//! - Catalog building from directories of images
//! - Ranked cosine-similarity queries
//! - A shared handle for publishing rebuilt catalogs to running queries

pub mod builder;
pub mod engine;
pub mod extract;
pub mod handle;
pub mod store;
pub mod vector;

pub use builder::{BuildError, BuildFailure, BuildReport, BuildStats, CatalogBuilder};
pub use engine::{DEFAULT_THRESHOLD, QueryError, SimilarityEngine, SimilarityResult, rank};
pub use extract::{
    DecodeLimits, ExtractionError, ExtractorConfig, ExtractorKind, FeatureExtractor,
    HsvHistogramExtractor, ImageDecoder, ImageInfo, ModelLoadError, ResNetEmbeddingExtractor,
    SharedExtractor, verify_image,
};
pub use handle::{CatalogHandle, RebuildError, RebuildSummary, SharedCatalog};
pub use store::{FeatureStore, STORE_FORMAT, STORE_VERSION, StoreError, StoreHeader};
pub use vector::{FeatureVector, cosine_similarity};
