//! Run configuration, loaded from TOML and overridden from the command line.
//!
//! ```toml
//! [fetch]
//! dest_dir = "/images/debian-versions"
//! workers = 20
//!
//! [transform]
//! boot_root = "/var/lib/tftpboot/debian_processed"
//! extractor = "7z"
//! keep_extracted = true
//!
//! [discovery]
//! index_url = "https://get.debian.org/images/archive/"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::archive::DiscExtractor;
use crate::error::RunError;

const CONFIG_DIR: &str = "debian-netboot";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub fetch: FetchConfig,
    pub transform: TransformConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Root of the downloaded image tree.
    pub dest_dir: PathBuf,
    pub workers: usize,
    /// Pending tasks the queue holds before `enqueue` waits.
    pub queue_capacity: usize,
    /// Bound on a whole transfer, headers to last byte.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Extra attempts after a retryable failure.
    pub retries: u32,
    pub retry_delay_secs: u64,
    /// Token stripped from an image file name to get its version directory.
    pub arch_suffix: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            dest_dir: PathBuf::from("/images/debian-versions"),
            workers: 20,
            queue_capacity: 64,
            request_timeout_secs: 3600,
            connect_timeout_secs: 30,
            retries: 2,
            retry_delay_secs: 5,
            arch_suffix: "-amd64".to_string(),
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformConfig {
    /// Directory served by the boot server; one subdirectory per version.
    pub boot_root: PathBuf,
    pub extractor: DiscExtractor,
    pub subprocess_timeout_secs: u64,
    pub gzip_level: u32,
    /// Keep `extracted/` after a successful publish.
    pub keep_extracted: bool,
    /// Skip artifacts whose published files still match their manifest.
    pub skip_published: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            boot_root: PathBuf::from("/var/lib/tftpboot/debian_processed"),
            extractor: DiscExtractor::SevenZip,
            subprocess_timeout_secs: 1800,
            gzip_level: 6,
            keep_extracted: true,
            skip_published: true,
        }
    }
}

impl TransformConfig {
    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Release archive index scraped for netinst images.
    pub index_url: String,
    /// Fixed image URLs; when non-empty the index is not consulted.
    pub urls: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            index_url: "https://get.debian.org/images/archive/".to_string(),
            urls: Vec::new(),
        }
    }
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("parsing configuration")?;
        Ok(config)
    }

    /// Load `path`, or the per-user default file when `path` is `None`.
    ///
    /// A missing default file yields the built-in defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.is_file() => path,
                _ => return Ok(Self::default()),
            },
        };
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("loading config '{}'", path.display()))
    }

    pub fn validate(&self) -> Result<(), RunError> {
        let invalid = |msg: &str| Err(RunError::Config(msg.to_string()));
        if self.fetch.workers == 0 {
            return invalid("fetch.workers must be at least 1");
        }
        if self.fetch.queue_capacity == 0 {
            return invalid("fetch.queue_capacity must be at least 1");
        }
        if self.fetch.request_timeout_secs == 0 || self.fetch.connect_timeout_secs == 0 {
            return invalid("fetch timeouts must be non-zero");
        }
        if self.transform.subprocess_timeout_secs == 0 {
            return invalid("transform.subprocess_timeout_secs must be non-zero");
        }
        if !(1..=9).contains(&self.transform.gzip_level) {
            return invalid("transform.gzip_level must be between 1 and 9");
        }
        if self.fetch.arch_suffix.is_empty() {
            return invalid("fetch.arch_suffix must not be empty");
        }
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/debian-netboot/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}
