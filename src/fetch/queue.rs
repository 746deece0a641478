//! Bounded FIFO of pending fetch tasks.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;
use url::Url;

use crate::error::TransferError;

/// One image to download. Identity is the source URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchTask {
    pub source_url: String,
    pub dest_dir: PathBuf,
}

impl FetchTask {
    pub fn new(source_url: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            dest_dir: dest_dir.into(),
        }
    }

    /// Last path segment of the source URL.
    pub fn file_name(&self) -> Result<String, TransferError> {
        let invalid = |reason: &str| TransferError::InvalidUrl {
            url: self.source_url.clone(),
            reason: reason.to_string(),
        };
        let url = Url::parse(&self.source_url).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        url.path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .map(str::to_string)
            .ok_or_else(|| invalid("URL has no file name"))
    }

    /// Final location: `<dest_dir>/<version>/<file_name>`.
    pub fn target_path(&self, arch_suffix: &str) -> Result<PathBuf, TransferError> {
        let file_name = self.file_name()?;
        Ok(self
            .dest_dir
            .join(version_dir_name(&file_name, arch_suffix))
            .join(file_name))
    }
}

/// Version directory for an image file name.
///
/// `debian-12.5.0-amd64-netinst.iso` with suffix `-amd64` becomes
/// `debian-12.5.0`. Names without the suffix fall back to their stem so
/// the directory never collides with the file itself.
pub fn version_dir_name(file_name: &str, arch_suffix: &str) -> String {
    match file_name.find(arch_suffix) {
        Some(idx) if idx > 0 => file_name[..idx].to_string(),
        _ => Path::new(file_name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.to_string()),
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("fetch queue is full")]
    Full(FetchTask),
    #[error("fetch queue is closed")]
    Closed(FetchTask),
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: VecDeque<FetchTask>,
    closed: bool,
}

/// Multi-producer, multi-consumer FIFO with a capacity bound.
///
/// `dequeue` returns `None` only once the queue is closed and empty, so
/// workers can start before every task has been enqueued.
#[derive(Debug)]
pub struct FetchQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    items: Notify,
    space: Notify,
}

impl FetchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Critical sections never panic, so a poisoned lock still holds a valid queue.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push without waiting; fails if the queue is full or closed.
    pub fn try_enqueue(&self, task: FetchTask) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed(task));
            }
            if state.tasks.len() >= self.capacity {
                return Err(QueueError::Full(task));
            }
            state.tasks.push_back(task);
        }
        self.items.notify_one();
        Ok(())
    }

    /// Push, waiting for a free slot while the queue is at capacity.
    pub async fn enqueue(&self, mut task: FetchTask) -> Result<(), QueueError> {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_enqueue(task) {
                Ok(()) => return Ok(()),
                Err(QueueError::Full(returned)) => task = returned,
                Err(closed) => return Err(closed),
            }
            space.await;
        }
    }

    /// Pop the oldest task if there is one.
    pub fn dequeue_or_empty(&self) -> Option<FetchTask> {
        let task = self.lock().tasks.pop_front();
        if task.is_some() {
            self.space.notify_one();
        }
        task
    }

    /// Pop the oldest task, waiting while the queue is open and empty.
    pub async fn dequeue(&self) -> Option<FetchTask> {
        loop {
            let items = self.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();

            if let Some(task) = self.dequeue_or_empty() {
                return Some(task);
            }
            if self.lock().closed {
                return None;
            }
            items.await;
        }
    }

    /// Refuse further tasks; queued tasks are still handed out.
    pub fn close(&self) {
        self.lock().closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
