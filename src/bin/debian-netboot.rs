use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use debian_netboot::orchestrator::{FetchReport, TransformReport};
use debian_netboot::{
    preflight, ArchiveIndexDiscovery, CancelFlag, Config, Discovery, HttpFetcher, NativeCodec,
    Orchestrator, OrchestratorOptions, PipelineOptions, RunError, StaticDiscovery,
    TransformPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "debian-netboot", version, about = "Build netboot installers from Debian netinst ISOs")]
struct Cli {
    /// Configuration file (defaults to the per-user config, if present)
    #[arg(long, global = true, env = "DEBIAN_NETBOOT_CONFIG")]
    config: Option<PathBuf>,

    /// Root of the downloaded image tree
    #[arg(long, global = true)]
    dest_dir: Option<PathBuf>,

    /// Root of the published boot tree
    #[arg(long, global = true)]
    boot_root: Option<PathBuf>,

    /// Parallel downloads
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Image URL to fetch instead of reading the release index (repeatable)
    #[arg(long = "url", global = true)]
    urls: Vec<String>,

    /// Rebuild images whose published files are already current
    #[arg(long, global = true)]
    force: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Fetch, then transform everything under the image tree (default)
    Run,
    /// Download images only
    Fetch,
    /// Transform already downloaded images only
    Transform,
    /// Check that required host tools are installed
    Preflight,
}

/// Either a fixed URL list or the release index.
enum Source {
    Static(StaticDiscovery),
    Index(ArchiveIndexDiscovery),
}

#[async_trait]
impl Discovery for Source {
    async fn discover(&self) -> Result<Vec<String>, RunError> {
        match self {
            Self::Static(inner) => inner.discover().await,
            Self::Index(inner) => inner.discover().await,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,debian_netboot=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.dest_dir {
        config.fetch.dest_dir = dir.clone();
    }
    if let Some(dir) = &cli.boot_root {
        config.transform.boot_root = dir.clone();
    }
    if let Some(workers) = cli.workers {
        config.fetch.workers = workers;
    }
    if !cli.urls.is_empty() {
        config.discovery.urls = cli.urls.clone();
    }
    if cli.force {
        config.transform.skip_published = false;
    }
    config.validate()?;
    Ok(config)
}

/// `Ok(false)` when the run finished but something in it failed.
async fn run(cli: Cli) -> Result<bool> {
    let config = load_config(&cli)?;
    let command = cli.command.unwrap_or(Command::Run);

    if matches!(command, Command::Preflight | Command::Run | Command::Transform) {
        preflight::check_host_tools(&config)?;
        if matches!(command, Command::Preflight) {
            info!("all required host tools found");
            return Ok(true);
        }
    }

    let fetcher = HttpFetcher::new(&config.fetch).context("building HTTP client")?;
    let source = if config.discovery.urls.is_empty() {
        let client = reqwest::Client::builder()
            .timeout(config.fetch.connect_timeout())
            .build()
            .context("building HTTP client")?;
        Source::Index(ArchiveIndexDiscovery::new(
            client,
            config.discovery.index_url.clone(),
        ))
    } else {
        Source::Static(StaticDiscovery::new(config.discovery.urls.clone()))
    };

    let codec = NativeCodec::new(
        config.transform.extractor,
        config.transform.subprocess_timeout(),
        config.transform.gzip_level,
    );
    let pipeline = TransformPipeline::new(
        codec,
        PipelineOptions {
            boot_root: config.transform.boot_root.clone(),
            keep_extracted: config.transform.keep_extracted,
            skip_published: config.transform.skip_published,
        },
    );
    let orchestrator = Orchestrator::new(
        source,
        fetcher,
        pipeline,
        OrchestratorOptions {
            dest_dir: config.fetch.dest_dir.clone(),
            workers: config.fetch.workers,
            queue_capacity: config.fetch.queue_capacity,
        },
    );
    cancel_on_ctrl_c(orchestrator.cancel_flag());

    let ok = match command {
        Command::Fetch => report_fetch(&orchestrator.fetch_phase().await?),
        Command::Transform => report_transform(&orchestrator.transform_phase().await?),
        _ => {
            let summary = orchestrator.run().await?;
            let fetched = summary.fetch.as_ref().is_none_or(report_fetch);
            let transformed = summary.transform.as_ref().is_none_or(report_transform);
            fetched && transformed
        }
    };
    Ok(ok)
}

fn cancel_on_ctrl_c(cancel: Arc<CancelFlag>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; letting in-flight work finish");
            cancel.cancel();
        }
    });
}

fn report_fetch(report: &FetchReport) -> bool {
    let counters = &report.counters;
    info!(
        "fetched {}/{}: {} downloaded, {} already present, {} failed",
        counters.completed, counters.total, counters.downloaded, counters.skipped, counters.failed
    );
    if report.cancelled {
        warn!("fetch cancelled before every image was handled");
    }
    if report.worker_panics > 0 {
        error!("{} fetch workers panicked", report.worker_panics);
    }
    report.is_success()
}

fn report_transform(report: &TransformReport) -> bool {
    for artifact in &report.published {
        info!("published {} -> {}", artifact.version, artifact.initrd.display());
    }
    for failure in &report.failed {
        error!(image = %failure.artifact.display(), state = %failure.state, "not published");
    }
    if report.cancelled {
        warn!("transform cancelled before every image was handled");
    }
    info!(
        "transformed: {} published, {} unchanged, {} locked, {} failed",
        report.published.len(),
        report.already_published.len(),
        report.locked.len(),
        report.failed.len()
    );
    report.is_success()
}
