//! Publishing repacked boot files into the boot-server tree.
//!
//! The published directory holds exactly `initrd-iso.gz` and `vmlinuz`.
//! The record of what was published lives next to the image, in
//! `publish.json`, so reruns can tell whether the served files are current.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{FilesystemError, StateError};
use crate::fsutil::{copy_atomic, sha256_file};
use crate::transform::ArtifactLayout;

/// Boot files for one version, as served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedArtifact {
    pub version: String,
    pub initrd: PathBuf,
    pub kernel: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishManifest {
    pub version: String,
    pub initrd_sha256: String,
    pub initrd_size: u64,
    pub kernel_sha256: String,
    pub kernel_size: u64,
    pub published_at: String,
}

/// Copy the repacked initrd and the kernel into the version directory.
pub fn publish(layout: &ArtifactLayout) -> Result<PublishedArtifact, StateError> {
    for (what, path) in [("repacked initrd", &layout.initrd_out), ("kernel", &layout.kernel)] {
        if !path.is_file() {
            return Err(StateError::Missing(format!(
                "{what} '{}' not found",
                path.display()
            )));
        }
    }

    let dir = &layout.publish_dir;
    fs::create_dir_all(dir).map_err(|e| FilesystemError::new("creating directory", dir, e))?;

    let published = layout.published();
    copy_atomic(&layout.initrd_out, &published.initrd)?;
    copy_atomic(&layout.kernel, &published.kernel)?;

    let (initrd_sha256, initrd_size) = sha256_file(&published.initrd)?;
    let (kernel_sha256, kernel_size) = sha256_file(&published.kernel)?;
    let manifest = PublishManifest {
        version: layout.version.clone(),
        initrd_sha256,
        initrd_size,
        kernel_sha256,
        kernel_size,
        published_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
    };
    write_manifest(&layout.manifest, &manifest)?;

    info!(
        "published {} to {}",
        layout.version,
        layout.publish_dir.display()
    );
    Ok(published)
}

fn write_manifest(path: &Path, manifest: &PublishManifest) -> Result<(), FilesystemError> {
    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| FilesystemError::new("serializing", path, e.into()))?;
    let staged = path.with_extension("json.partial");
    fs::write(&staged, json).map_err(|e| FilesystemError::new("writing", &staged, e))?;
    fs::rename(&staged, path).map_err(|e| FilesystemError::new("renaming", &staged, e))
}

pub fn read_manifest(path: &Path) -> Option<PublishManifest> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// `true` when the served files exist and still match the manifest.
pub fn is_published(layout: &ArtifactLayout) -> bool {
    let Some(manifest) = read_manifest(&layout.manifest) else {
        return false;
    };
    let published = layout.published();
    let matches = |path: &Path, sha: &str, size: u64| {
        sha256_file(path)
            .map(|(actual, actual_size)| actual == sha && actual_size == size)
            .unwrap_or(false)
    };
    let current = manifest.version == layout.version
        && matches(&published.initrd, &manifest.initrd_sha256, manifest.initrd_size)
        && matches(&published.kernel, &manifest.kernel_sha256, manifest.kernel_size);
    debug!(version = %layout.version, current, "checked published files");
    current
}
