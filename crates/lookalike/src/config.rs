//! Configuration file support for lookalike.
//!
//! All lookalike data is stored in a `.lookalike/` directory:
//! - `.lookalike/config.toml` - Configuration file
//! - `.lookalike/histogram.store.jsonl` - Catalog built by the histogram extractor
//! - `.lookalike/embedding.store.jsonl` - Catalog built by the embedding extractor
//! - `.lookalike/logs/` - Log files (with `--log-file`)
//!
//! Config discovery searches for `.lookalike/config.toml` starting from the
//! current directory and walking up to parent directories.

use std::path::{Path, PathBuf};

/// The lookalike data directory name.
pub const LOOKALIKE_DIR: &str = ".lookalike";
/// The config file name within the lookalike directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the store file.
pub const STORE_ENV: &str = "LOOKALIKE_STORE";
/// Environment variable overriding the extractor kind.
pub const EXTRACTOR_ENV: &str = "LOOKALIKE_EXTRACTOR";

/// Contents written by `lookalike init`.
pub const DEFAULT_CONFIG: &str = r#"# lookalike configuration
# catalog.root and extractor.weights are relative to the project directory
# (the parent of .lookalike/); catalog.store_dir is relative to .lookalike/.

[catalog]
root = "data"
store_dir = "."  # histogram.store.jsonl / embedding.store.jsonl
# store = "/path/to/catalog.jsonl"  # Or use LOOKALIKE_STORE env var

[extractor]
kind = "histogram"  # Options: "histogram", "embedding" (or LOOKALIKE_EXTRACTOR)
bins = [8, 8, 8]  # Hue, saturation, value
# weights = "models/resnet50.safetensors"  # Required for "embedding"
input_size = 224
max_image_dimension = 16384
max_decode_bytes = 536870912

[search]
threshold = 0.6
# limit = 10
"#;

use anyhow::{Context, Result};
use lookalike_index::{DEFAULT_THRESHOLD, DecodeLimits, ExtractorConfig, ExtractorKind};
use serde::{Deserialize, Serialize};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Catalog location settings.
    pub catalog: CatalogConfig,
    /// Feature extractor settings.
    pub extractor: ExtractorSettings,
    /// Query settings.
    pub search: SearchConfig,
}

/// Catalog configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory of images to index.
    pub root: PathBuf,
    /// Directory holding the per-extractor store files.
    pub store_dir: PathBuf,
    /// Explicit store file, used instead of the per-extractor default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            // Relative to .lookalike/ directory
            store_dir: PathBuf::from("."),
            store: None,
        }
    }
}

/// Extractor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractorSettings {
    /// Extractor variant: "histogram" or "embedding".
    pub kind: ExtractorKind,
    /// Histogram bins over hue, saturation and value.
    pub bins: [u32; 3],
    /// ResNet-50 safetensors weights (embedding only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<PathBuf>,
    /// Square input size for the embedding backbone.
    pub input_size: u32,
    /// Largest width or height accepted by the decoder.
    pub max_image_dimension: u32,
    /// Largest allocation the decoder may make for one image.
    pub max_decode_bytes: u64,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        let defaults = ExtractorConfig::default();
        Self {
            kind: defaults.kind,
            bins: defaults.bins,
            weights: None,
            input_size: defaults.input_size,
            max_image_dimension: defaults.limits.max_dimension,
            max_decode_bytes: defaults.limits.max_alloc_bytes,
        }
    }
}

/// Search configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Minimum similarity for a match (inclusive).
    pub threshold: f32,
    /// Maximum number of results to print.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            limit: None,
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Find and load configuration from current or parent directories.
    pub fn find_and_load() -> Result<Option<(Self, PathBuf)>> {
        let current = std::env::current_dir()?;
        Self::find_and_load_from(&current)
    }

    /// Find and load configuration starting from a specific directory.
    ///
    /// Looks for `.lookalike/config.toml` in the directory and its parents.
    /// Returns the config and the `.lookalike` directory it was found in.
    pub fn find_and_load_from(start: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start.to_path_buf();

        loop {
            let lookalike_dir = dir.join(LOOKALIKE_DIR);
            let config_path = lookalike_dir.join(CONFIG_FILE);
            if config_path.exists() {
                let config = Self::from_file(&config_path)?;
                return Ok(Some((config, lookalike_dir)));
            }

            if !dir.pop() {
                break;
            }
        }

        Ok(None)
    }

    /// Apply `LOOKALIKE_EXTRACTOR` and `LOOKALIKE_STORE` from the process
    /// environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup(EXTRACTOR_ENV).filter(|v| !v.trim().is_empty()) {
            self.extractor.kind = kind
                .parse()
                .with_context(|| format!("Invalid {}", EXTRACTOR_ENV))?;
        }
        if let Some(store) = lookup(STORE_ENV).filter(|v| !v.trim().is_empty()) {
            self.catalog.store = Some(PathBuf::from(store));
        }
        Ok(())
    }

    /// Resolve a config-relative path against the `.lookalike` directory's
    /// parent (the project directory).
    fn resolve_project_path(path: &Path, lookalike_dir: Option<&Path>) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match lookalike_dir.and_then(Path::parent) {
            Some(project) => project.join(path),
            None => path.to_path_buf(),
        }
    }

    /// Resolve the image catalog root.
    pub fn resolve_catalog_root(&self, lookalike_dir: Option<&Path>) -> PathBuf {
        Self::resolve_project_path(&self.catalog.root, lookalike_dir)
    }

    /// File name of the default store for an extractor kind.
    pub fn store_file_name(kind: ExtractorKind) -> String {
        format!("{}.store.jsonl", kind)
    }

    /// Resolve the store file for the configured extractor.
    ///
    /// An explicit `catalog.store` wins; otherwise the per-kind file inside
    /// `store_dir`, which is relative to the `.lookalike` directory.
    pub fn resolve_store_path(&self, lookalike_dir: Option<&Path>) -> PathBuf {
        if let Some(store) = &self.catalog.store {
            return store.clone();
        }

        let file_name = Self::store_file_name(self.extractor.kind);
        let store_dir = if self.catalog.store_dir.is_absolute() {
            self.catalog.store_dir.clone()
        } else if let Some(dir) = lookalike_dir {
            dir.join(&self.catalog.store_dir)
        } else {
            // Fall back to .lookalike in current directory
            PathBuf::from(LOOKALIKE_DIR).join(&self.catalog.store_dir)
        };
        store_dir.join(file_name)
    }

    /// Build the library-level extractor configuration.
    pub fn to_extractor_config(&self, lookalike_dir: Option<&Path>) -> ExtractorConfig {
        let mut config = ExtractorConfig::new(self.extractor.kind)
            .with_bins(self.extractor.bins)
            .with_limits(DecodeLimits {
                max_dimension: self.extractor.max_image_dimension,
                max_alloc_bytes: self.extractor.max_decode_bytes,
            });
        config.input_size = self.extractor.input_size;
        if let Some(weights) = &self.extractor.weights {
            config = config.with_weights(Self::resolve_project_path(weights, lookalike_dir));
        }
        config
    }

    /// Get the path to the .lookalike directory for a given base path.
    pub fn lookalike_dir(base: &Path) -> PathBuf {
        base.join(LOOKALIKE_DIR)
    }

    /// Get the config file path for a given .lookalike directory.
    pub fn config_path(lookalike_dir: &Path) -> PathBuf {
        lookalike_dir.join(CONFIG_FILE)
    }
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigValidationError {}

impl Config {
    /// Validate the configuration.
    ///
    /// Returns a list of validation errors if any are found.
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        for (name, count) in ["hue", "saturation", "value"]
            .iter()
            .zip(self.extractor.bins)
        {
            if count == 0 {
                errors.push(ConfigValidationError {
                    field: "extractor.bins".to_string(),
                    message: format!("Bin count for {} must be greater than zero.", name),
                });
            }
        }

        if self.extractor.kind == ExtractorKind::Embedding && self.extractor.weights.is_none() {
            errors.push(ConfigValidationError {
                field: "extractor.weights".to_string(),
                message: "Embedding extractor requires a ResNet-50 safetensors weights file."
                    .to_string(),
            });
        }

        if self.extractor.input_size == 0 {
            errors.push(ConfigValidationError {
                field: "extractor.input_size".to_string(),
                message: "Input size must be greater than zero.".to_string(),
            });
        }

        if self.extractor.max_image_dimension == 0 {
            errors.push(ConfigValidationError {
                field: "extractor.max_image_dimension".to_string(),
                message: "Maximum image dimension must be greater than zero.".to_string(),
            });
        }

        let threshold = self.search.threshold;
        if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
            errors.push(ConfigValidationError {
                field: "search.threshold".to_string(),
                message: format!(
                    "Invalid threshold {}. Expected a value between -1.0 and 1.0.",
                    threshold
                ),
            });
        }

        if self.search.limit == Some(0) {
            errors.push(ConfigValidationError {
                field: "search.limit".to_string(),
                message: "Result limit must be greater than zero when set.".to_string(),
            });
        }

        errors
    }
}
