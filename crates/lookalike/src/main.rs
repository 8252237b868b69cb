//! lookalike: find visually similar images
//!
//! Builds a catalog of feature vectors from a directory of images and ranks
//! catalog entries by cosine similarity against a query image.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::Config;
use lookalike_index::{
    CatalogBuilder, CatalogHandle, ExtractorKind, FeatureStore, SharedExtractor, SimilarityEngine,
    SimilarityResult,
};

/// Find visually similar images in a local catalog
#[derive(Parser)]
#[command(name = "lookalike")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to .lookalike directory (default: search for .lookalike/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Feature extractor: histogram or embedding (or use LOOKALIKE_EXTRACTOR env var)
    #[arg(long, global = true)]
    extractor: Option<ExtractorKind>,

    /// Catalog store file (or use LOOKALIKE_STORE env var)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Write logs to .lookalike/logs/ instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new .lookalike directory with config file
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Build the catalog from a directory of images
    Build {
        /// Directory to index (default: catalog root from config)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Find catalog images similar to a query image
    Query {
        /// Query image
        image: PathBuf,

        /// Minimum similarity score, inclusive (default: from config)
        #[arg(long, allow_hyphen_values = true)]
        threshold: Option<f32>,

        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the header of the catalog store
    Inspect,
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize logging to stderr for interactive use.
fn init_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(verbose))
        .init();
}

/// Initialize logging to rotating files in .lookalike/logs/ with daily rotation.
fn init_file_logging(lookalike_dir: &Path, verbose: bool) {
    let logs_dir = lookalike_dir.join("logs");

    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
        // Fall back to stderr logging
        init_logging(verbose);
        return;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "lookalike.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard would stop logging
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(env_filter(verbose))
        .init();
}

/// Load config from file or auto-discover from `.lookalike/config.toml`.
///
/// Returns the config and the path to the `.lookalike` directory (for
/// resolving relative paths).
fn load_config(override_path: Option<&PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = override_path {
        // Explicit path override - treat as path to .lookalike directory
        let config_file = if path.is_dir() {
            Config::config_path(path)
        } else {
            path.clone()
        };
        let lookalike_dir = config_file.parent().unwrap_or(path).to_path_buf();
        let config = Config::from_file(&config_file)?;
        return Ok((config, Some(lookalike_dir)));
    }

    match Config::find_and_load()? {
        Some((config, lookalike_dir)) => Ok((config, Some(lookalike_dir))),
        None => Ok((Config::default(), None)),
    }
}

fn build_extractor(config: &Config, lookalike_dir: Option<&Path>) -> Result<SharedExtractor> {
    config
        .to_extractor_config(lookalike_dir)
        .build()
        .context("Failed to initialize feature extractor")
}

/// Load, override and validate the configuration, and start logging.
///
/// Returns the effective config and the `.lookalike` directory, if one was
/// found.
fn prepare(cli: &Cli) -> Result<(Config, Option<PathBuf>)> {
    let (mut config, config_dir) = load_config(cli.config.as_ref())?;

    if cli.log_file {
        let lookalike_dir = config_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(config::LOOKALIKE_DIR));
        init_file_logging(&lookalike_dir, cli.verbose);
    } else {
        init_logging(cli.verbose);
    }

    match &config_dir {
        Some(dir) => info!("Using config from {}", dir.display()),
        None => tracing::debug!("No .lookalike/config.toml found, using defaults"),
    }

    // Precedence: command line, then environment, then config file.
    config.apply_env()?;
    if let Some(kind) = cli.extractor {
        config.extractor.kind = kind;
    }
    if let Some(store) = &cli.store {
        config.catalog.store = Some(store.clone());
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("Invalid configuration: {}", error);
        }
        anyhow::bail!("Configuration has {} error(s)", errors.len());
    }

    Ok((config, config_dir))
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    let Some(command) = cli.command.take() else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        // Writes a fresh config, so it must not require a readable one.
        Commands::Init { force } => {
            init_logging(cli.verbose);
            let base = cli.config.clone().unwrap_or_else(|| PathBuf::from("."));
            run_init(&base, force)?;
        }

        Commands::Build { path } => {
            let (config, config_dir) = prepare(&cli)?;
            let store_path = config.resolve_store_path(config_dir.as_deref());
            let root = path.unwrap_or_else(|| config.resolve_catalog_root(config_dir.as_deref()));
            run_build(&config, config_dir.as_deref(), root, store_path).await?;
        }

        Commands::Query {
            image,
            threshold,
            limit,
            json,
        } => {
            let (config, config_dir) = prepare(&cli)?;
            let store_path = config.resolve_store_path(config_dir.as_deref());
            let threshold = threshold.unwrap_or(config.search.threshold);
            if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
                anyhow::bail!("Threshold must be between -1.0 and 1.0, got {}", threshold);
            }
            let limit = limit.or(config.search.limit);
            let query = QueryArgs {
                image: &image,
                store_path: &store_path,
                threshold,
                limit,
                json,
            };
            run_query(&config, config_dir.as_deref(), query)?;
        }

        Commands::Inspect => {
            let (config, config_dir) = prepare(&cli)?;
            let store_path = config.resolve_store_path(config_dir.as_deref());
            let header = FeatureStore::read_header(&store_path)
                .with_context(|| format!("Failed to read store {}", store_path.display()))?;
            println!("Store:      {}", store_path.display());
            println!("Format:     {} v{}", header.format, header.version);
            println!("Extractor:  {}", header.extractor_id);
            println!("Dimension:  {}", header.dimension);
            println!("Entries:    {}", header.entry_count);
            println!("Built at:   {}", header.built_at.to_rfc3339());
        }
    }

    Ok(())
}

fn run_init(base: &Path, force: bool) -> Result<()> {
    let lookalike_dir = if base.ends_with(config::LOOKALIKE_DIR) {
        base.to_path_buf()
    } else {
        Config::lookalike_dir(base)
    };
    let config_path = Config::config_path(&lookalike_dir);

    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite.",
            config_path.display()
        );
    }

    if !lookalike_dir.exists() {
        std::fs::create_dir_all(&lookalike_dir)?;
        info!("Created {}/", lookalike_dir.display());
    }

    std::fs::write(&config_path, config::DEFAULT_CONFIG)?;
    info!("Created {}", config_path.display());
    info!("Next steps:");
    info!("  1. Put your images in data/ or edit [catalog] root");
    info!("  2. Run 'lookalike build' to index them");
    info!("  3. Run 'lookalike query <IMAGE>' to find similar ones");
    Ok(())
}

/// Rebuild the catalog through a [`CatalogHandle`] and report the outcome.
///
/// Per-file failures are printed but do not fail the command.
async fn run_build(
    config: &Config,
    lookalike_dir: Option<&Path>,
    root: PathBuf,
    store_path: PathBuf,
) -> Result<()> {
    let root = root.canonicalize().unwrap_or(root);
    let extractor = build_extractor(config, lookalike_dir)?;

    if let Some(parent) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let current = if store_path.exists() {
        CatalogHandle::load(&store_path).unwrap_or_else(|e| {
            tracing::warn!("Replacing unreadable store {}: {}", store_path.display(), e);
            CatalogHandle::new(FeatureStore::for_extractor(extractor.as_ref()))
        })
    } else {
        CatalogHandle::new(FeatureStore::for_extractor(extractor.as_ref()))
    };
    let handle = Arc::new(current);
    let builder = Arc::new(CatalogBuilder::new(extractor));

    info!("Building {} -> {}", root.display(), store_path.display());
    let summary = handle
        .rebuild(builder, root.clone(), store_path.clone())
        .await
        .with_context(|| format!("Failed to build catalog from {}", root.display()))?;

    println!(
        "Indexed {} of {} files into {} ({} previously, {}ms)",
        summary.stats.entries_added,
        summary.stats.files_seen,
        store_path.display(),
        summary.previous_entries,
        summary.stats.elapsed_ms
    );
    if !summary.failures.is_empty() {
        println!("{} file(s) could not be processed:", summary.failures.len());
        for failure in &summary.failures {
            println!("  {}: {}", failure.identifier, failure.error);
        }
    }
    Ok(())
}

/// Arguments of a single `query` invocation.
struct QueryArgs<'a> {
    image: &'a Path,
    store_path: &'a Path,
    threshold: f32,
    limit: Option<usize>,
    json: bool,
}

fn run_query(config: &Config, lookalike_dir: Option<&Path>, args: QueryArgs<'_>) -> Result<()> {
    let QueryArgs {
        image,
        store_path,
        threshold,
        limit,
        json,
    } = args;
    let extractor = build_extractor(config, lookalike_dir)?;

    let info = extractor
        .decoder()
        .verify(image)
        .with_context(|| format!("Not a readable image: {}", image.display()))?;
    tracing::debug!(
        "Query image {} is {:?} {}x{}",
        image.display(),
        info.format,
        info.width,
        info.height
    );

    let store = FeatureStore::load(store_path).with_context(|| {
        format!(
            "Failed to load catalog {} (run 'lookalike build' first)",
            store_path.display()
        )
    })?;

    let engine = SimilarityEngine::new(extractor);
    let mut results = engine
        .query(image, &store, threshold)
        .with_context(|| format!("Query failed for {}", image.display()))?;
    if let Some(limit) = limit {
        results.truncate(limit);
    }

    print_results(&results, json)
}

fn print_results(results: &[SimilarityResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No similar images found");
        return Ok(());
    }

    for result in results {
        println!("{:.4}  {}", result.score, result.identifier);
    }
    Ok(())
}
