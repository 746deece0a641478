//! Sources of installer image URLs.
//!
//! The orchestrator treats whatever a [`Discovery`] returns as the complete,
//! ordered list of images to fetch.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};
use url::Url;

use crate::error::RunError;

/// Directory names on the archive index that are releases we can netboot.
const RELEASE_PATTERN: &str = r"^(1[0-9]|[2-9]\d)\.\d+\.\d+$";

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<String>, RunError>;
}

/// A fixed list, from the command line or the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    urls: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<String>, RunError> {
        Ok(self.urls.clone())
    }
}

/// Scrapes the Debian image archive index for netinst ISOs.
#[derive(Debug, Clone)]
pub struct ArchiveIndexDiscovery {
    client: reqwest::Client,
    index_url: String,
}

impl ArchiveIndexDiscovery {
    pub fn new(client: reqwest::Client, index_url: impl Into<String>) -> Self {
        Self {
            client,
            index_url: index_url.into(),
        }
    }
}

#[async_trait]
impl Discovery for ArchiveIndexDiscovery {
    async fn discover(&self) -> Result<Vec<String>, RunError> {
        info!("reading release index {}", self.index_url);
        let body = self
            .client
            .get(&self.index_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| RunError::Discovery(format!("{}: {e}", self.index_url)))?
            .text()
            .await
            .map_err(|e| RunError::Discovery(format!("{}: {e}", self.index_url)))?;

        let urls = netinst_urls(&self.index_url, &body)?;
        debug!(count = urls.len(), "releases found");
        Ok(urls)
    }
}

/// Build netinst image URLs for every release directory linked from `page`.
pub fn netinst_urls(index_url: &str, page: &str) -> Result<Vec<String>, RunError> {
    let href = Regex::new(r#"href="([^"]+)""#)
        .map_err(|e| RunError::Discovery(format!("bad link pattern: {e}")))?;
    let release = Regex::new(RELEASE_PATTERN)
        .map_err(|e| RunError::Discovery(format!("bad release pattern: {e}")))?;
    let base = index_url.trim_end_matches('/');

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for capture in href.captures_iter(page) {
        let name = capture[1].trim_start_matches("./").trim_end_matches('/');
        if !release.is_match(name) || !seen.insert(name.to_string()) {
            continue;
        }
        urls.push(format!(
            "{base}/{name}/amd64/iso-cd/debian-{name}-amd64-netinst.iso"
        ));
    }
    Ok(urls)
}

/// Reject an empty list or anything that is not an absolute http(s) URL.
pub fn validate_urls(urls: &[String]) -> Result<(), RunError> {
    if urls.is_empty() {
        return Err(RunError::NothingDiscovered);
    }
    for url in urls {
        let ok = Url::parse(url)
            .map(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.has_host())
            .unwrap_or(false);
        if !ok {
            return Err(RunError::InvalidUrl { url: url.clone() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
<table id="indexlist">
<tr class="even"><td class="indexcolname"><a href="../">Parent Directory</a></td></tr>
<tr class="odd"><td class="indexcolname"><a href="9.13.0/">9.13.0/</a></td></tr>
<tr class="even"><td class="indexcolname"><a href="10.0.0/">10.0.0/</a></td></tr>
<tr class="odd"><td class="indexcolname"><a href="12.5.0/">12.5.0/</a></td></tr>
<tr class="even"><td class="indexcolname"><a href="12.5.0-live/">12.5.0-live/</a></td></tr>
<tr class="odd"><td class="indexcolname"><a href="12.5.0/">12.5.0/</a></td></tr>
</table>
"#;

    #[test]
    fn extracts_supported_releases_in_page_order() {
        let urls = netinst_urls("https://get.debian.org/images/archive/", INDEX).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://get.debian.org/images/archive/10.0.0/amd64/iso-cd/debian-10.0.0-amd64-netinst.iso",
                "https://get.debian.org/images/archive/12.5.0/amd64/iso-cd/debian-12.5.0-amd64-netinst.iso",
            ]
        );
    }

    #[test]
    fn empty_list_fails_fast() {
        assert!(matches!(validate_urls(&[]), Err(RunError::NothingDiscovered)));
    }

    #[test]
    fn relative_or_foreign_urls_fail_fast() {
        let err = validate_urls(&["/images/a.iso".to_string()]).unwrap_err();
        assert!(matches!(err, RunError::InvalidUrl { .. }));
        assert!(validate_urls(&["ftp://example.org/a.iso".to_string()]).is_err());
        assert!(validate_urls(&["https://example.org/a.iso".to_string()]).is_ok());
    }

    #[tokio::test]
    async fn static_discovery_returns_its_list() {
        let discovery = StaticDiscovery::new(vec!["https://example.org/a.iso".into()]);
        assert_eq!(discovery.discover().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn index_discovery_reads_page() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/archive/");
                then.status(200).body(INDEX);
            })
            .await;

        let discovery = ArchiveIndexDiscovery::new(reqwest::Client::new(), server.url("/archive/"));
        let urls = discovery.discover().await.unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].starts_with(&server.url("/archive/10.0.0/")));
    }
}
