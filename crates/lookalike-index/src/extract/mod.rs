//! Feature extractors.
//!
//! An extractor maps an image file to a [`FeatureVector`] of a fixed
//! dimension. Two variants exist:
//! - [`HsvHistogramExtractor`]: joint hue/saturation/value colour histogram
//! - [`ResNetEmbeddingExtractor`]: pooled activations of a frozen ResNet-50
//!
//! The variant is chosen once at startup through [`ExtractorKind`] and the
//! resulting `Arc<dyn FeatureExtractor>` is handed to both the catalog builder
//! and the similarity engine. Vectors from different variants are never
//! comparable, so each extractor reports an [`id`](FeatureExtractor::id) that
//! is recorded in the store header.

pub mod embedding;
pub mod histogram;

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vector::FeatureVector;

pub use embedding::ResNetEmbeddingExtractor;
pub use histogram::HsvHistogramExtractor;

/// Per-image extraction failure. Recoverable: the builder records it and
/// moves on to the next file.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unrecognized image format: {}", .0.display())]
    UnknownFormat(PathBuf),

    #[error("Failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Image has zero width or height")]
    EmptyImage,

    #[error("Backbone inference failed: {0}")]
    Inference(String),

    #[error("Extractor produced {actual} values, expected {expected}")]
    WrongDimension { expected: usize, actual: usize },

    #[error("Extractor produced non-finite values")]
    NonFinite,
}

pub type Result<T> = std::result::Result<T, ExtractionError>;

/// Fatal extractor construction failure (bad configuration or unloadable
/// backbone weights). Never raised per image.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("Embedding extractor requires a weights file")]
    MissingWeights,

    #[error("Weights file not found: {}", .0.display())]
    WeightsNotFound(PathBuf),

    #[error("Failed to load backbone: {0}")]
    Backbone(String),

    #[error("Invalid extractor configuration: {0}")]
    InvalidConfig(String),
}

/// The capability shared by every extractor variant.
pub trait FeatureExtractor: Send + Sync {
    /// Stable identity recorded in store headers. Two extractors with the
    /// same id produce comparable vectors.
    fn id(&self) -> &str;

    /// Length of every vector this extractor produces.
    fn dimension(&self) -> usize;

    /// Decoder used by [`extract`](FeatureExtractor::extract).
    fn decoder(&self) -> &ImageDecoder;

    /// Encode an already-decoded image.
    fn extract_image(&self, image: &DynamicImage) -> Result<FeatureVector>;

    /// Decode the file at `path` and encode it.
    ///
    /// The output is checked against [`dimension`](FeatureExtractor::dimension)
    /// and for non-finite values before it is returned.
    fn extract(&self, path: &Path) -> Result<FeatureVector> {
        let image = self.decoder().decode(path)?;
        let vector = self.extract_image(&image)?;

        if vector.dimension() != self.dimension() {
            return Err(ExtractionError::WrongDimension {
                expected: self.dimension(),
                actual: vector.dimension(),
            });
        }
        if !vector.is_finite() {
            return Err(ExtractionError::NonFinite);
        }

        Ok(vector)
    }
}

/// Shared handle to the extractor selected at startup.
pub type SharedExtractor = Arc<dyn FeatureExtractor>;

/// Which extractor variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// Handcrafted HSV colour histogram. Fast, no model weights.
    #[default]
    Histogram,
    /// Pretrained ResNet-50 embedding. Slow, needs a weights file.
    Embedding,
}

impl ExtractorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractorKind::Histogram => "histogram",
            ExtractorKind::Embedding => "embedding",
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractorKind {
    type Err = ModelLoadError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "histogram" | "light" | "hsv" => Ok(ExtractorKind::Histogram),
            "embedding" | "resnet" | "resnet50" => Ok(ExtractorKind::Embedding),
            other => Err(ModelLoadError::InvalidConfig(format!(
                "unknown extractor '{}', expected 'histogram' or 'embedding'",
                other
            ))),
        }
    }
}

/// Everything needed to construct an extractor.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub kind: ExtractorKind,
    /// Histogram bin counts over (hue, saturation, value).
    pub bins: [u32; 3],
    /// ResNet-50 safetensors weights (embedding variant only).
    pub weights: Option<PathBuf>,
    /// Square input size fed to the backbone.
    pub input_size: u32,
    pub limits: DecodeLimits,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            kind: ExtractorKind::Histogram,
            bins: HsvHistogramExtractor::DEFAULT_BINS,
            weights: None,
            input_size: ResNetEmbeddingExtractor::DEFAULT_INPUT_SIZE,
            limits: DecodeLimits::default(),
        }
    }
}

impl ExtractorConfig {
    pub fn new(kind: ExtractorKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_bins(mut self, bins: [u32; 3]) -> Self {
        self.bins = bins;
        self
    }

    pub fn with_weights(mut self, weights: impl Into<PathBuf>) -> Self {
        self.weights = Some(weights.into());
        self
    }

    pub fn with_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Construct the configured extractor.
    ///
    /// Loading the embedding backbone happens here, so a bad weights file
    /// fails at startup rather than on the first image.
    pub fn build(&self) -> std::result::Result<SharedExtractor, ModelLoadError> {
        let extractor: SharedExtractor = match self.kind {
            ExtractorKind::Histogram => Arc::new(
                HsvHistogramExtractor::new(self.bins)?.with_decoder(ImageDecoder::new(self.limits)),
            ),
            ExtractorKind::Embedding => {
                let weights = self.weights.as_ref().ok_or(ModelLoadError::MissingWeights)?;
                Arc::new(
                    ResNetEmbeddingExtractor::load(weights, self.input_size)?
                        .with_decoder(ImageDecoder::new(self.limits)),
                )
            }
        };

        tracing::info!(
            "Using {} extractor '{}' ({} dimensions)",
            self.kind,
            extractor.id(),
            extractor.dimension()
        );

        Ok(extractor)
    }
}

/// Upper bounds applied while decoding a single image.
///
/// Decoding cost grows with pixel count, so capping dimensions and
/// allocation also caps the time a hostile file can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Maximum width and height in pixels.
    pub max_dimension: u32,
    /// Maximum bytes the decoder may allocate.
    pub max_alloc_bytes: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_dimension: 16_384,
            max_alloc_bytes: 512 * 1024 * 1024,
        }
    }
}

impl DecodeLimits {
    fn to_image_limits(self) -> Limits {
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        limits.max_alloc = Some(self.max_alloc_bytes);
        limits
    }
}

/// Header information gathered by [`ImageDecoder::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Bounded image decoder. The format is sniffed from file contents, not the
/// extension, so catalog files without extensions still decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder {
    limits: DecodeLimits,
}

impl ImageDecoder {
    pub fn new(limits: DecodeLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> DecodeLimits {
        self.limits
    }

    fn open(&self, path: &Path) -> Result<(ImageReader<BufReader<File>>, ImageFormat)> {
        let io_err = |source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = ImageReader::open(path)
            .map_err(io_err)?
            .with_guessed_format()
            .map_err(io_err)?;
        let format = reader
            .format()
            .ok_or_else(|| ExtractionError::UnknownFormat(path.to_path_buf()))?;
        reader.limits(self.limits.to_image_limits());

        Ok((reader, format))
    }

    /// Fully decode the image at `path`.
    pub fn decode(&self, path: &Path) -> Result<DynamicImage> {
        let (reader, _) = self.open(path)?;
        let image = reader.decode().map_err(|source| ExtractionError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

        if image.width() == 0 || image.height() == 0 {
            return Err(ExtractionError::EmptyImage);
        }

        Ok(image)
    }

    /// Check that `path` is a well-formed image without decoding pixel data.
    ///
    /// Reads only the header: the format must be recognized and the declared
    /// dimensions must be non-zero and within limits.
    pub fn verify(&self, path: &Path) -> Result<ImageInfo> {
        let (reader, format) = self.open(path)?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|source| ExtractionError::Decode {
                path: path.to_path_buf(),
                source,
            })?;

        if width == 0 || height == 0 {
            return Err(ExtractionError::EmptyImage);
        }

        Ok(ImageInfo {
            format,
            width,
            height,
        })
    }
}

/// Verify an image with default limits.
pub fn verify_image(path: &Path) -> Result<ImageInfo> {
    ImageDecoder::default().verify(path)
}
