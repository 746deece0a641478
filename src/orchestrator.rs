//! Sequences discovery, the fetch phase, and the transform phase.
//!
//! The fetch phase runs `workers` downloads in parallel. The transform
//! phase starts only after every worker has exited and then handles one
//! image at a time, in file-name order of the destination tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::archive::ArchiveCodec;
use crate::discovery::{validate_urls, Discovery};
use crate::error::{ArtifactError, RunError};
use crate::fetch::{CancelFlag, Fetch, FetchQueue, FetchTask, FetchWorkerPool, ProgressCounters};
use crate::transform::{
    is_disc_image, PublishedArtifact, TransformOutcome, TransformPipeline, EXTRACTED_DIR,
};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub dest_dir: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub counters: ProgressCounters,
    pub cancelled: bool,
    pub worker_panics: usize,
}

impl FetchReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.worker_panics == 0 && self.counters.failed == 0
    }
}

#[derive(Debug, Default)]
pub struct TransformReport {
    pub published: Vec<PublishedArtifact>,
    pub already_published: Vec<PublishedArtifact>,
    pub locked: Vec<PathBuf>,
    pub failed: Vec<ArtifactError>,
    pub cancelled: bool,
}

impl TransformReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub fetch: Option<FetchReport>,
    pub transform: Option<TransformReport>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.fetch.as_ref().is_none_or(FetchReport::is_success)
            && self.transform.as_ref().is_none_or(TransformReport::is_success)
    }
}

pub struct Orchestrator<D, F, C> {
    discovery: D,
    fetcher: Arc<F>,
    pipeline: Arc<TransformPipeline<C>>,
    options: OrchestratorOptions,
    cancel: Arc<CancelFlag>,
}

impl<D, F, C> Orchestrator<D, F, C>
where
    D: Discovery,
    F: Fetch + 'static,
    C: ArchiveCodec + 'static,
{
    pub fn new(
        discovery: D,
        fetcher: F,
        pipeline: TransformPipeline<C>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            discovery,
            fetcher: Arc::new(fetcher),
            pipeline: Arc::new(pipeline),
            options,
            cancel: Arc::new(CancelFlag::new()),
        }
    }

    /// Raising this flag stops workers before their next task and the
    /// transform phase before its next image.
    pub fn cancel_flag(&self) -> Arc<CancelFlag> {
        self.cancel.clone()
    }

    /// Fetch everything discovery returns, then transform the whole tree.
    /// The transform phase is skipped when the fetch phase was cancelled.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let fetch = self.fetch_phase().await?;
        if fetch.cancelled {
            warn!("fetch phase cancelled; skipping transform");
            return Ok(RunSummary {
                fetch: Some(fetch),
                transform: None,
            });
        }
        let transform = self.transform_phase().await?;
        Ok(RunSummary {
            fetch: Some(fetch),
            transform: Some(transform),
        })
    }

    pub async fn fetch_phase(&self) -> Result<FetchReport, RunError> {
        let urls = self.discovery.discover().await?;
        validate_urls(&urls)?;
        let total = urls.len();
        info!(
            "fetching {total} images into {} with {} workers",
            self.options.dest_dir.display(),
            self.options.workers
        );

        let queue = Arc::new(FetchQueue::new(self.options.queue_capacity));
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(ProgressCounters::new(total).run(rx, |_| {}));
        let pool = FetchWorkerPool::start(
            self.options.workers,
            queue.clone(),
            self.fetcher.clone(),
            tx,
            self.cancel.clone(),
        );

        for url in urls {
            let task = FetchTask::new(url, &self.options.dest_dir);
            let enqueued = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                result = queue.enqueue(task) => result.is_ok(),
            };
            if !enqueued {
                break;
            }
        }
        queue.close();

        let worker_panics = pool.join().await;
        let counters = reporter
            .await
            .map_err(|e| RunError::Join(format!("progress reporter: {e}")))?;
        let cancelled = self.cancel.is_cancelled();

        info!(
            "fetch phase done: {} downloaded, {} already present, {} in flight elsewhere, {} failed",
            counters.downloaded, counters.skipped, counters.in_flight, counters.failed
        );
        Ok(FetchReport {
            counters,
            cancelled,
            worker_panics,
        })
    }

    /// Run the pipeline for every disc image below the destination tree.
    pub async fn transform_phase(&self) -> Result<TransformReport, RunError> {
        let pipeline = self.pipeline.clone();
        let cancel = self.cancel.clone();
        let root = self.options.dest_dir.clone();
        tokio::task::spawn_blocking(move || transform_tree(&pipeline, &root, &cancel))
            .await
            .map_err(|e| RunError::Join(e.to_string()))
    }
}

/// Disc images below `root`, skipping the pipeline's own working trees.
pub fn find_images(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && name.starts_with(EXTRACTED_DIR))
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_disc_image(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

fn transform_tree<C: ArchiveCodec>(
    pipeline: &TransformPipeline<C>,
    root: &Path,
    cancel: &CancelFlag,
) -> TransformReport {
    let mut report = TransformReport::default();
    if !root.is_dir() {
        warn!("{} does not exist; nothing to transform", root.display());
        return report;
    }

    let images = find_images(root);
    info!("transforming {} images under {}", images.len(), root.display());
    for image in images {
        if cancel.is_cancelled() {
            report.cancelled = true;
            warn!("transform phase cancelled before {}", image.display());
            break;
        }
        match pipeline.run(&image) {
            Ok(TransformOutcome::Published(artifact)) => report.published.push(artifact),
            Ok(TransformOutcome::AlreadyPublished(artifact)) => {
                report.already_published.push(artifact)
            }
            Ok(TransformOutcome::Locked) => report.locked.push(image),
            Err(e) => {
                error!("{e}");
                report.failed.push(e);
            }
        }
    }

    info!(
        "transform phase done: {} published, {} unchanged, {} locked, {} failed",
        report.published.len(),
        report.already_published.len(),
        report.locked.len(),
        report.failed.len()
    );
    report
}
