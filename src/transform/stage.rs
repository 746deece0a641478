//! Staging of the disc's package pool inside the initrd tree.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::{FilesystemError, StateError};
use crate::fsutil::copy_dir_merge;

/// Disc directories the installer needs to act as its own mirror.
pub const STAGED_DIRS: &[&str] = &[".disk", "pool", "dists"];

/// Copy [`STAGED_DIRS`] from `extracted` into `cdrom`, merging with
/// whatever a previous run left there.
pub fn stage_cdrom(extracted: &Path, cdrom: &Path) -> Result<(), StateError> {
    fs::create_dir_all(cdrom).map_err(|e| FilesystemError::new("creating directory", cdrom, e))?;

    for name in STAGED_DIRS {
        let src = extracted.join(name);
        if !src.is_dir() {
            return Err(StateError::Missing(format!(
                "disc directory '{}' not found",
                src.display()
            )));
        }
        copy_dir_merge(&src, &cdrom.join(name))?;
    }

    info!("staged {} into {}", STAGED_DIRS.join(", "), cdrom.display());
    Ok(())
}
