use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harvester_client::{FetcherConfig, ReqwestFetcher};
use harvester_core::{Exporter, HarvestReport, Harvester, HarvesterConfig};
use harvester_export::{JsonExporter, NpsExporter, SqliteExporter};

#[derive(Parser)]
#[command(name = "harvester", version, about = "Multi-source package metadata harvester")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    Flathub,
    Nix,
    Arch,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    /// One `<source>/<name>.nps.json` file per record
    Nps,
    /// Flat `<source>_<name>.json` files in one directory
    Json,
    /// A single SQLite database
    Sqlite,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest package metadata from the configured sources
    Harvest {
        /// Root directory for the raw on-disk cache
        #[arg(long, default_value = "data/knowledge_source")]
        data_dir: PathBuf,

        /// Directory (or database location) for exported records
        #[arg(short, long, default_value = "data/export")]
        output_dir: PathBuf,

        /// Export format
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Nps)]
        format: ExportFormat,

        /// Comma-separated list of sources to query
        #[arg(long, value_delimiter = ',', default_value = "flathub,nix,arch")]
        sources: Vec<SourceKind>,

        /// Stop discovery after this many applications (trial runs)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Maximum concurrent tasks
        #[arg(long, default_value_t = 20)]
        concurrency: usize,

        /// Ignore any existing checkpoint and start from scratch
        #[arg(long, default_value_t = false)]
        no_resume: bool,

        /// GitHub API token, raises discovery rate limits
        #[arg(long, env = "GITHUB_TOKEN")]
        token: Option<String>,
    },

    /// Remove empty or corrupt files from the on-disk cache
    Clean {
        /// Root directory for the raw on-disk cache
        #[arg(long, default_value = "data/knowledge_source")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "harvester=debug"
    } else {
        "harvester=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Harvest {
            data_dir,
            output_dir,
            format,
            sources,
            limit,
            concurrency,
            no_resume,
            token,
        } => {
            cmd_harvest(
                data_dir, output_dir, format, &sources, limit, concurrency, no_resume, token,
            )
            .await
        }
        Commands::Clean { data_dir } => cmd_clean(data_dir).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_harvest(
    data_dir: PathBuf,
    output_dir: PathBuf,
    format: ExportFormat,
    sources: &[SourceKind],
    limit: Option<usize>,
    concurrency: usize,
    no_resume: bool,
    token: Option<String>,
) -> Result<()> {
    let config = HarvesterConfig {
        data_dir,
        concurrency,
        limit,
        resume: !no_resume,
        skip_flathub: !sources.contains(&SourceKind::Flathub),
        skip_nix: !sources.contains(&SourceKind::Nix),
        skip_arch: !sources.contains(&SourceKind::Arch),
        ..HarvesterConfig::default()
    };

    let fetcher = ReqwestFetcher::new(FetcherConfig::default().with_github_token(token))?;
    let exporters = build_exporters(format, &output_dir).await?;
    let harvester = Harvester::new(fetcher, exporters, config)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, letting in-flight tasks settle");
                cancel.cancel();
            }
        });
    }

    let report = harvester.run(cancel).await?;
    print_report(&report);
    Ok(())
}

async fn build_exporters(
    format: ExportFormat,
    output_dir: &PathBuf,
) -> Result<Vec<Box<dyn Exporter>>> {
    let exporter: Box<dyn Exporter> = match format {
        ExportFormat::Nps => Box::new(NpsExporter::new(output_dir)),
        ExportFormat::Json => Box::new(JsonExporter::new(output_dir)),
        ExportFormat::Sqlite => {
            std::fs::create_dir_all(output_dir)?;
            Box::new(SqliteExporter::connect(&output_dir.join("packages.db")).await?)
        }
    };
    Ok(vec![exporter])
}

async fn cmd_clean(data_dir: PathBuf) -> Result<()> {
    let config = HarvesterConfig {
        data_dir,
        ..HarvesterConfig::default()
    };
    let fetcher = ReqwestFetcher::new(FetcherConfig::default())?;
    let harvester = Harvester::new(fetcher, Vec::new(), config)?;
    let removed = harvester.clean_invalid_data()?;
    println!("Removed {removed} invalid cache files");
    Ok(())
}

fn print_report(report: &HarvestReport) {
    println!("\nHarvest report");
    println!("  Tasks:     {}/{} completed", report.completed, report.total_tasks);
    println!("  Failed:    {}", report.failed);
    println!("  Skipped:   {} (already done)", report.stats.tasks_skipped);
    println!(
        "  Requests:  {} ok / {} total",
        report.stats.successful_requests, report.stats.total_requests
    );
    println!(
        "  Download:  {:.2} MB in {:.0}s",
        report.stats.bytes_downloaded as f64 / (1024.0 * 1024.0),
        report.stats.elapsed.as_secs_f64()
    );
    if !report.stats.sources.is_empty() {
        println!("  Sources:");
        for (source, tally) in &report.stats.sources {
            println!(
                "    {:<8} {:>6} ok / {:>6} total ({:.1}%)",
                source,
                tally.success,
                tally.total(),
                tally.success_rate()
            );
        }
    }
}
