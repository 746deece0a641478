//! Per-image transform: disc image in, netboot initrd and kernel out.
//!
//! States run strictly in order and each one only starts if the previous
//! one succeeded:
//!
//! ```text
//! Extract ─▶ UnpackInitrd ─▶ Stage ─▶ Patch ─▶ Repack ─▶ Publish
//! ```
//!
//! A failure stops the remaining states for that image only. Extraction is
//! skipped when `extracted/` is already populated; that directory only
//! appears through a rename after a successful extraction, so a populated
//! one is always complete. Every later state is safe to repeat, so a failed
//! image is retried simply by running again.

pub mod patch;
pub mod publish;
pub mod stage;

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{info, instrument, warn};

use crate::archive::ArchiveCodec;
use crate::error::{ArtifactError, FilesystemError, StateError};
use crate::fsutil::{atomic_move, is_non_empty_dir, remove_dir_if_exists};

pub use publish::PublishedArtifact;

pub const EXTRACTED_DIR: &str = "extracted";
pub const INSTALL_DIR: &str = "install.amd";
pub const INITRD_IN: &str = "initrd.gz";
pub const INITRD_OUT: &str = "initrd-iso.gz";
pub const KERNEL: &str = "vmlinuz";
pub const CDROM_DIR: &str = "cdrom";
pub const IMAGE_EXTENSION: &str = "iso";

const PARTIAL_SUFFIX: &str = ".partial";
const MANIFEST: &str = "publish.json";
const LOCK_FILE: &str = ".transform.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Extract,
    UnpackInitrd,
    Stage,
    Patch,
    Repack,
    Publish,
}

impl PipelineState {
    pub const ALL: [PipelineState; 6] = [
        Self::Extract,
        Self::UnpackInitrd,
        Self::Stage,
        Self::Patch,
        Self::Repack,
        Self::Publish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::UnpackInitrd => "unpack-initrd",
            Self::Stage => "stage",
            Self::Patch => "patch",
            Self::Repack => "repack",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every path the pipeline touches for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    pub image: PathBuf,
    pub version: String,
    pub artifact_dir: PathBuf,
    pub extracted: PathBuf,
    pub extracted_partial: PathBuf,
    pub install_dir: PathBuf,
    pub initrd_in: PathBuf,
    pub initrd_out: PathBuf,
    pub kernel: PathBuf,
    pub cdrom: PathBuf,
    pub manifest: PathBuf,
    pub lock: PathBuf,
    pub publish_dir: PathBuf,
}

impl ArtifactLayout {
    /// Layout for `image`; the version is the name of its directory.
    pub fn for_image(image: &Path, boot_root: &Path) -> Result<Self, StateError> {
        let artifact_dir = image
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or_else(|| {
                StateError::Missing(format!("'{}' has no parent directory", image.display()))
            })?;
        let version = artifact_dir
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                StateError::Missing(format!(
                    "cannot derive a version from '{}'",
                    artifact_dir.display()
                ))
            })?
            .to_string();

        let extracted = artifact_dir.join(EXTRACTED_DIR);
        let install_dir = extracted.join(INSTALL_DIR);
        Ok(Self {
            image: image.to_path_buf(),
            artifact_dir: artifact_dir.to_path_buf(),
            extracted_partial: artifact_dir.join(format!("{EXTRACTED_DIR}{PARTIAL_SUFFIX}")),
            initrd_in: install_dir.join(INITRD_IN),
            initrd_out: install_dir.join(INITRD_OUT),
            kernel: install_dir.join(KERNEL),
            cdrom: install_dir.join(CDROM_DIR),
            manifest: artifact_dir.join(MANIFEST),
            lock: artifact_dir.join(LOCK_FILE),
            publish_dir: boot_root.join(&version),
            extracted,
            install_dir,
            version,
        })
    }

    pub fn published(&self) -> PublishedArtifact {
        PublishedArtifact {
            version: self.version.clone(),
            initrd: self.publish_dir.join(INITRD_OUT),
            kernel: self.publish_dir.join(KERNEL),
        }
    }
}

/// `true` for files the transform phase treats as disc images.
pub fn is_disc_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(IMAGE_EXTENSION))
}

/// Result of a pipeline run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    Published(PublishedArtifact),
    /// Served files already match the last publish; nothing ran.
    AlreadyPublished(PublishedArtifact),
    /// Another process holds the artifact lock.
    Locked,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub boot_root: PathBuf,
    pub keep_extracted: bool,
    pub skip_published: bool,
}

pub struct TransformPipeline<C> {
    codec: C,
    options: PipelineOptions,
}

impl<C: ArchiveCodec> TransformPipeline<C> {
    pub fn new(codec: C, options: PipelineOptions) -> Self {
        Self { codec, options }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run every state for `image`.
    #[instrument(skip(self), fields(image = %image.display()))]
    pub fn run(&self, image: &Path) -> Result<TransformOutcome, ArtifactError> {
        let fail = |state: PipelineState| {
            move |source: StateError| ArtifactError {
                artifact: image.to_path_buf(),
                state,
                source,
            }
        };

        let layout = ArtifactLayout::for_image(image, &self.options.boot_root)
            .map_err(fail(PipelineState::Extract))?;

        let Some(_lock) = ArtifactLock::try_acquire(&layout.lock)
            .map_err(|e| fail(PipelineState::Extract)(e.into()))?
        else {
            warn!("{} is being transformed elsewhere; skipping", image.display());
            return Ok(TransformOutcome::Locked);
        };

        if self.options.skip_published && publish::is_published(&layout) {
            info!("{} already published", layout.version);
            return Ok(TransformOutcome::AlreadyPublished(layout.published()));
        }

        self.extract(&layout).map_err(fail(PipelineState::Extract))?;
        self.unpack_initrd(&layout)
            .map_err(fail(PipelineState::UnpackInitrd))?;
        stage::stage_cdrom(&layout.extracted, &layout.cdrom).map_err(fail(PipelineState::Stage))?;
        patch::apply(&layout.install_dir).map_err(fail(PipelineState::Patch))?;
        self.repack(&layout).map_err(fail(PipelineState::Repack))?;
        let published = publish::publish(&layout).map_err(fail(PipelineState::Publish))?;

        if !self.options.keep_extracted {
            // The publish already succeeded; a leftover tree only costs disk.
            if let Err(e) = remove_dir_if_exists(&layout.extracted) {
                warn!("could not remove extracted tree: {e}");
            }
        }

        Ok(TransformOutcome::Published(published))
    }

    fn extract(&self, layout: &ArtifactLayout) -> Result<(), StateError> {
        if is_non_empty_dir(&layout.extracted) {
            info!("{} already extracted", layout.image.display());
            return Ok(());
        }
        remove_dir_if_exists(&layout.extracted)?;
        remove_dir_if_exists(&layout.extracted_partial)?;

        if let Err(e) = self
            .codec
            .extract_disc_image(&layout.image, &layout.extracted_partial)
        {
            if let Err(cleanup) = remove_dir_if_exists(&layout.extracted_partial) {
                warn!("could not remove partial extraction: {cleanup}");
            }
            return Err(e.into());
        }

        fs::rename(&layout.extracted_partial, &layout.extracted).map_err(|e| {
            FilesystemError::new("renaming", &layout.extracted_partial, e)
        })?;
        Ok(())
    }

    fn unpack_initrd(&self, layout: &ArtifactLayout) -> Result<(), StateError> {
        if !layout.initrd_in.is_file() {
            return Err(StateError::Missing(format!(
                "initrd '{}' not found in extracted image",
                layout.initrd_in.display()
            )));
        }
        self.codec
            .unpack_compressed_archive(&layout.initrd_in, &layout.install_dir)?;
        Ok(())
    }

    fn repack(&self, layout: &ArtifactLayout) -> Result<(), StateError> {
        let staged = layout
            .artifact_dir
            .join(format!("{INITRD_OUT}{PARTIAL_SUFFIX}"));
        let exclude = [Path::new(INITRD_IN), Path::new(INITRD_OUT)];
        let packed = self
            .codec
            .pack_compressed_archive(&layout.install_dir, &staged, &exclude);
        if let Err(e) = packed {
            if let Err(cleanup) = fs::remove_file(&staged) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove {}: {cleanup}", staged.display());
                }
            }
            return Err(e.into());
        }
        atomic_move(&staged, &layout.initrd_out)?;
        info!("repacked {}", layout.initrd_out.display());
        Ok(())
    }
}

/// Exclusive advisory lock on an artifact directory, released on drop.
struct ArtifactLock {
    _file: File,
}

impl ArtifactLock {
    fn try_acquire(path: &Path) -> Result<Option<Self>, FilesystemError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| FilesystemError::new("opening lock", path, e))?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Ok(Some(Self { _file: file }))
    }
}
