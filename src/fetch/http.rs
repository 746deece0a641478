//! Idempotent HTTP download of one image.

use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::config::FetchConfig;
use crate::error::TransferError;
use crate::fetch::progress::FetchOutcome;
use crate::fetch::queue::FetchTask;

/// Performs one fetch task. Failures are reported in the outcome, never
/// propagated, so a worker always moves on to its next task.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, task: &FetchTask) -> FetchOutcome;
}

/// Streams responses straight to disk through a locked `.part` file.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    arch_suffix: String,
    retries: u32,
    retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("debian-netboot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            arch_suffix: config.arch_suffix.clone(),
            retries: config.retries,
            retry_delay: config.retry_delay(),
        })
    }

    /// Download `task` unless its final file already exists.
    #[instrument(skip(self), fields(url = %task.source_url))]
    pub async fn fetch_one(&self, task: &FetchTask) -> Result<FetchOutcome, TransferError> {
        let target = task.target_path(&self.arch_suffix)?;
        if target.exists() {
            debug!("{} already present", target.display());
            return Ok(FetchOutcome::AlreadyPresent);
        }

        let version_dir = target.parent().unwrap_or(&task.dest_dir).to_path_buf();
        tokio::fs::create_dir_all(&version_dir)
            .await
            .map_err(|source| TransferError::Io {
                path: version_dir.clone(),
                source,
            })?;

        let part_path = part_path(&target);
        let Some(mut part) = PartFile::acquire(&part_path)? else {
            debug!("{} is locked by another writer", part_path.display());
            return Ok(FetchOutcome::InFlight);
        };
        // The lock holder may have finished between our existence check and the lock.
        if target.exists() {
            part.discard().await;
            return Ok(FetchOutcome::AlreadyPresent);
        }

        let mut attempt = 0;
        let bytes = loop {
            match self.transfer(&task.source_url, &mut part).await {
                Ok(bytes) => break bytes,
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "attempt {attempt} of {} for {} failed: {err}; retrying in {}s",
                        self.retries + 1,
                        task.source_url,
                        self.retry_delay.as_secs()
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => {
                    part.discard().await;
                    return Err(err);
                }
            }
        };

        part.commit(&target).await?;
        Ok(FetchOutcome::Downloaded { bytes })
    }

    async fn transfer(&self, url: &str, part: &mut PartFile) -> Result<u64, TransferError> {
        part.reset().await?;

        let request_err = |source| TransferError::Request {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(request_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(request_err)?;
            part.write(&chunk).await?;
            written += chunk.len() as u64;
        }
        part.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, task: &FetchTask) -> FetchOutcome {
        self.fetch_one(task)
            .await
            .unwrap_or_else(FetchOutcome::Failed)
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

/// Exclusively locked staging file. The lock dies with the process, so a
/// `.part` left behind by a crash is reclaimed by the next run.
struct PartFile {
    path: PathBuf,
    file: File,
}

impl PartFile {
    /// `Ok(None)` when another writer holds the lock.
    fn acquire(path: &Path) -> Result<Option<Self>, TransferError> {
        let io_err = |source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Ok(Some(Self {
            path: path.to_path_buf(),
            file: File::from_std(file),
        }))
    }

    fn io_err(&self, source: std::io::Error) -> TransferError {
        TransferError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn reset(&mut self) -> Result<(), TransferError> {
        self.file.set_len(0).await.map_err(|e| self.io_err(e))?;
        self.file
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| self.io_err(e))?;
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(chunk).await.map_err(|e| self.io_err(e))
    }

    async fn flush(&mut self) -> Result<(), TransferError> {
        self.file.flush().await.map_err(|e| self.io_err(e))?;
        self.file.sync_all().await.map_err(|e| self.io_err(e))
    }

    /// Rename into place while still holding the lock.
    async fn commit(self, target: &Path) -> Result<(), TransferError> {
        tokio::fs::rename(&self.path, target)
            .await
            .map_err(|e| self.io_err(e))
    }

    async fn discard(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!("could not remove {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tempfile::TempDir;

    fn config() -> FetchConfig {
        FetchConfig {
            retries: 1,
            retry_delay_secs: 0,
            request_timeout_secs: 10,
            connect_timeout_secs: 2,
            ..FetchConfig::default()
        }
    }

    #[tokio::test]
    async fn downloads_into_version_dir() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/debian-12.5.0-amd64-netinst.iso");
                then.status(200).body("iso-bytes");
            })
            .await;

        let temp = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new(&config()).unwrap();
        let task = FetchTask::new(server.url("/debian-12.5.0-amd64-netinst.iso"), temp.path());

        let outcome = fetcher.fetch_one(&task).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Downloaded { bytes: 9 }));
        let target = temp
            .path()
            .join("debian-12.5.0/debian-12.5.0-amd64-netinst.iso");
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "iso-bytes");
        assert!(!part_path(&target).exists());
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn existing_file_skips_the_network() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).body("fresh");
            })
            .await;

        let temp = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new(&config()).unwrap();
        let task = FetchTask::new(server.url("/debian-11.0.0-amd64-netinst.iso"), temp.path());
        let target = task.target_path("-amd64").unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, "old").unwrap();
        let before = std::fs::metadata(&target).unwrap().modified().unwrap();

        let outcome = fetcher.fetch_one(&task).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::AlreadyPresent));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "old");
        assert_eq!(std::fs::metadata(&target).unwrap().modified().unwrap(), before);
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn client_error_is_not_retried_and_leaves_nothing() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(404);
            })
            .await;

        let temp = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new(&config()).unwrap();
        let task = FetchTask::new(server.url("/debian-10.0.0-amd64-netinst.iso"), temp.path());

        let err = fetcher.fetch_one(&task).await.unwrap_err();
        assert!(matches!(err, TransferError::Status { status: 404, .. }));
        let target = task.target_path("-amd64").unwrap();
        assert!(!target.exists());
        assert!(!part_path(&target).exists());
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn server_error_is_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(503);
            })
            .await;

        let temp = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new(&config()).unwrap();
        let task = FetchTask::new(server.url("/debian-10.1.0-amd64-netinst.iso"), temp.path());

        let outcome = fetcher.fetch(&task).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failed(TransferError::Status { status: 503, .. })
        ));
        mock.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn locked_part_file_reports_in_flight() {
        let temp = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new(&config()).unwrap();
        let task = FetchTask::new(
            "http://127.0.0.1:9/debian-12.0.0-amd64-netinst.iso",
            temp.path(),
        );
        let target = task.target_path("-amd64").unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        let holder = PartFile::acquire(&part_path(&target)).unwrap().unwrap();

        let outcome = fetcher.fetch_one(&task).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::InFlight));
        drop(holder);
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/a/b.iso")),
            PathBuf::from("/a/b.iso.part")
        );
    }
}
