//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use demotape_core::catalog::InMemoryCatalog;
use demotape_core::config::DemotapeConfig;
use demotape_core::demo::{DemoCache, DemoGenerator, DemoMethod};
use demotape_core::formats::{FormatProcessor, ProcessReport};
use demotape_core::metadata::JsonFileMetadataStore;
use demotape_core::transcoder::FfmpegTranscoder;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server and admin API
    Server {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
        /// JSON catalog manifest
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Render a demo of one audio file
    Demo {
        /// Source audio file
        source: PathBuf,
        /// Where to write the demo
        output: PathBuf,
        /// Share of the source to keep (0-100)
        #[arg(long)]
        percent: Option<u8>,
        /// Audio looped under the demo
        #[arg(long)]
        watermark: Option<PathBuf>,
    },
    /// Generate format bundles for one product
    Process {
        /// Product id from the catalog
        product_id: u64,
        /// JSON catalog manifest
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Delete every cached demo
    PurgeDemos,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the failure of the command that ran
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let mut config = DemotapeConfig::from_env();

    match command {
        Commands::Server {
            host,
            port,
            catalog,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if catalog.is_some() {
                config.server.catalog_path = catalog;
            }
            start_server(config).await
        }
        Commands::Demo {
            source,
            output,
            percent,
            watermark,
        } => {
            let percent = percent.unwrap_or(config.demo.percent);
            let watermark = watermark.or_else(|| config.demo.watermark.as_ref().map(PathBuf::from));
            make_demo(&config, source, output, percent, watermark).await
        }
        Commands::Process {
            product_id,
            catalog,
        } => {
            if catalog.is_some() {
                config.server.catalog_path = catalog;
            }
            process_product(&config, product_id).await
        }
        Commands::PurgeDemos => purge_demos(&config).await,
    }
}

/// Start the web server
///
/// # Errors
/// - Server setup failed or the address could not be bound
pub async fn start_server(config: DemotapeConfig) -> anyhow::Result<()> {
    demotape_web::run_server(config)
        .await
        .map_err(|e| anyhow::anyhow!("Server failed: {e}"))
}

/// Render a single demo
///
/// # Errors
/// - Source unreadable or the demo could not be written
pub async fn make_demo(
    config: &DemotapeConfig,
    source: PathBuf,
    output: PathBuf,
    percent: u8,
    watermark: Option<PathBuf>,
) -> anyhow::Result<()> {
    let generator = DemoGenerator::new(Arc::new(FfmpegTranscoder::from_config(&config.transcoder)));
    let outcome = generator
        .make_demo(&source, &output, percent, watermark.as_deref())
        .await
        .with_context(|| format!("Could not render a demo of {}", source.display()))?;

    match &outcome.method {
        DemoMethod::Transcoded { length } => println!(
            "Demo written to {} ({} bytes, {}s re-encoded)",
            outcome.path.display(),
            outcome.size,
            length.as_secs()
        ),
        DemoMethod::ByteTruncated { reason } => println!(
            "Demo written to {} ({} bytes, truncated: {reason})",
            outcome.path.display(),
            outcome.size
        ),
    }

    Ok(())
}

/// Generate format bundles for a product
///
/// # Errors
/// - Catalog or metadata unreadable
/// - Transcoder not configured
pub async fn process_product(config: &DemotapeConfig, product_id: u64) -> anyhow::Result<()> {
    let catalog_path = config
        .server
        .catalog_path
        .as_ref()
        .context("A catalog manifest is required (--catalog or DEMOTAPE_CATALOG)")?;
    let catalog = InMemoryCatalog::from_manifest(catalog_path).await?;
    let metadata = JsonFileMetadataStore::open(&config.server.metadata_path).await?;
    let transcoder = FfmpegTranscoder::from_config(&config.transcoder);

    let processor = FormatProcessor::new(
        config,
        Arc::new(catalog),
        Arc::new(metadata),
        Arc::new(transcoder),
    )?;

    match processor.process_product(product_id).await? {
        ProcessReport::Skipped(reason) => {
            println!("Product {product_id} skipped: {reason:?}");
        }
        ProcessReport::Completed(summary) => {
            println!("Product {product_id} formats generated");
            for (format, files) in &summary.produced {
                println!("  {format}: {} files", files.len());
            }
            for failure in &summary.failures {
                println!("  failed: {failure}");
            }
            println!(
                "  archives: {}",
                processor.product_dir(product_id).join("zips").display()
            );
        }
    }

    Ok(())
}

/// Delete cached demos
///
/// # Errors
/// - Demo directory could not be listed
pub async fn purge_demos(config: &DemotapeConfig) -> anyhow::Result<()> {
    let cache = DemoCache::new(&config.demo.cache_dir);
    let removed = cache
        .purge()
        .await
        .with_context(|| format!("Could not purge {}", cache.root().display()))?;
    println!("Removed {removed} cached demos");
    Ok(())
}
