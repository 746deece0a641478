//! Fetch progress, reported by a single consumer of worker completions.
//!
//! Workers never touch the counters. They send a [`Completion`] over a
//! channel and the reporter task owns [`ProgressCounters`], so every
//! `completed` value it emits is strictly one more than the last.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::TransferError;

/// How a fetch task ended.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Bytes were transferred into the final file.
    Downloaded { bytes: u64 },
    /// The final file already existed; nothing was transferred.
    AlreadyPresent,
    /// Another worker or process is writing the same file right now.
    InFlight,
    Failed(TransferError),
}

/// Message from a worker once a task has finished.
#[derive(Debug)]
pub struct Completion {
    pub url: String,
    pub outcome: FetchOutcome,
}

/// What the reporter emits for every completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub url: String,
    pub completed: usize,
    pub total: usize,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounters {
    pub total: usize,
    pub completed: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub in_flight: usize,
    pub failed: usize,
}

impl ProgressCounters {
    /// `total` is fixed here, before any worker starts.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Account for one completion and return the update to report.
    pub fn record(&mut self, completion: &Completion) -> ProgressUpdate {
        self.completed += 1;
        let succeeded = match &completion.outcome {
            FetchOutcome::Downloaded { .. } => {
                self.downloaded += 1;
                true
            }
            FetchOutcome::AlreadyPresent => {
                self.skipped += 1;
                true
            }
            FetchOutcome::InFlight => {
                self.in_flight += 1;
                true
            }
            FetchOutcome::Failed(_) => {
                self.failed += 1;
                false
            }
        };
        ProgressUpdate {
            url: completion.url.clone(),
            completed: self.completed,
            total: self.total,
            succeeded,
        }
    }

    /// Consume completions until every sender is dropped.
    ///
    /// `observe` sees each update after it has been logged.
    pub async fn run<F>(mut self, mut rx: mpsc::UnboundedReceiver<Completion>, mut observe: F) -> Self
    where
        F: FnMut(&ProgressUpdate),
    {
        while let Some(completion) = rx.recv().await {
            let update = self.record(&completion);
            match &completion.outcome {
                FetchOutcome::Failed(err) => warn!(
                    "download of {} failed ({} of {}): {err}",
                    update.url, update.completed, update.total
                ),
                FetchOutcome::Downloaded { bytes } => info!(
                    "download of {} completed, {} of {} ({bytes} bytes)",
                    update.url, update.completed, update.total
                ),
                FetchOutcome::AlreadyPresent => info!(
                    "download of {} completed, {} of {} (already present)",
                    update.url, update.completed, update.total
                ),
                FetchOutcome::InFlight => info!(
                    "download of {} completed, {} of {} (in flight elsewhere)",
                    update.url, update.completed, update.total
                ),
            }
            observe(&update);
        }
        self
    }
}
