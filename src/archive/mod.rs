//! The two container formats an installer image is made of.
//!
//! - [`iso`] - optical-disc image extraction (external tool)
//! - [`cpio`] - gzip-compressed `newc` cpio archives (in process)
//!
//! [`ArchiveCodec`] is the seam the transform pipeline calls through;
//! [`NativeCodec`] is the production implementation.

pub mod cpio;
pub mod iso;

use std::path::Path;
use std::time::Duration;

use crate::error::{ExtractError, PackError, UnpackError};

pub use iso::DiscExtractor;

/// Open and create the container formats the transform pipeline touches.
pub trait ArchiveCodec: Send + Sync {
    /// Extract a disc image into `dest`.
    fn extract_disc_image(&self, image: &Path, dest: &Path) -> Result<(), ExtractError>;

    /// Decompress and unpack a gzip-compressed cpio archive into `dest`.
    fn unpack_compressed_archive(&self, archive: &Path, dest: &Path) -> Result<(), UnpackError>;

    /// Pack `source` recursively into a gzip-compressed cpio archive.
    ///
    /// `exclude` holds paths relative to `source` that are left out.
    fn pack_compressed_archive(
        &self,
        source: &Path,
        archive: &Path,
        exclude: &[&Path],
    ) -> Result<(), PackError>;
}

/// External extractor for disc images, in-process cpio and gzip.
#[derive(Debug, Clone)]
pub struct NativeCodec {
    pub extractor: DiscExtractor,
    pub timeout: Duration,
    pub gzip_level: u32,
}

impl NativeCodec {
    pub fn new(extractor: DiscExtractor, timeout: Duration, gzip_level: u32) -> Self {
        Self {
            extractor,
            timeout,
            gzip_level,
        }
    }
}

impl ArchiveCodec for NativeCodec {
    fn extract_disc_image(&self, image: &Path, dest: &Path) -> Result<(), ExtractError> {
        iso::extract(self.extractor, image, dest, self.timeout)
    }

    fn unpack_compressed_archive(&self, archive: &Path, dest: &Path) -> Result<(), UnpackError> {
        cpio::unpack(archive, dest)
    }

    fn pack_compressed_archive(
        &self,
        source: &Path,
        archive: &Path,
        exclude: &[&Path],
    ) -> Result<(), PackError> {
        cpio::pack(source, archive, exclude, self.gzip_level)
    }
}
