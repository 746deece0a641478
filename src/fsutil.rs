//! Filesystem helpers shared by the fetch and transform phases.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::FilesystemError;

/// Recursively copy `src` into `dst`, merging with whatever `dst` holds.
///
/// Files with the same relative path are overwritten; files that exist
/// only in `dst` are left alone. Symlinks are recreated, not followed, and
/// regular files keep their permission bits (`fs::copy` carries them).
/// Existing destination files are unlinked first, so read-only copies from
/// an earlier merge do not block the overwrite.
pub fn copy_dir_merge(src: &Path, dst: &Path) -> Result<(), FilesystemError> {
    fs::create_dir_all(dst).map_err(|e| FilesystemError::new("creating directory", dst, e))?;

    let entries =
        fs::read_dir(src).map_err(|e| FilesystemError::new("reading directory", src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| FilesystemError::new("reading directory", src, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| FilesystemError::new("inspecting", &src_path, e))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)
                .map_err(|e| FilesystemError::new("reading symlink", &src_path, e))?;
            if dst_path.is_symlink() || dst_path.is_file() {
                fs::remove_file(&dst_path)
                    .map_err(|e| FilesystemError::new("replacing", &dst_path, e))?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .map_err(|e| FilesystemError::new("creating symlink", &dst_path, e))?;
        } else if file_type.is_dir() {
            copy_dir_merge(&src_path, &dst_path)?;
        } else {
            remove_file_if_exists(&dst_path)?;
            fs::copy(&src_path, &dst_path)
                .map_err(|e| FilesystemError::new("copying", &src_path, e))?;
        }
    }

    Ok(())
}

/// Move a file by renaming, with fallback to copy+delete across filesystems.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<(), FilesystemError> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Copy next to the destination first so the final step is still a rename.
            let staged = dst.with_extension("moving");
            fs::copy(src, &staged).map_err(|e| FilesystemError::new("copying", src, e))?;
            fs::rename(&staged, dst).map_err(|e| FilesystemError::new("renaming", &staged, e))?;
            fs::remove_file(src).map_err(|e| FilesystemError::new("removing", src, e))?;
            Ok(())
        }
    }
}

/// Copy `src` to `dst` through a sibling temporary file so readers never
/// observe a half-written `dst`.
pub fn copy_atomic(src: &Path, dst: &Path) -> Result<(), FilesystemError> {
    let staged = dst.with_extension("partial");
    remove_file_if_exists(&staged)?;
    let result = fs::copy(src, &staged)
        .map_err(|e| FilesystemError::new("copying", src, e))
        .and_then(|_| {
            fs::rename(&staged, dst).map_err(|e| FilesystemError::new("renaming", &staged, e))
        });
    if result.is_err() {
        if let Err(cleanup) = remove_file_if_exists(&staged) {
            warn!("{cleanup}");
        }
    }
    result
}

/// Unlink a file or symlink; a missing path or a directory is left alone.
fn remove_file_if_exists(path: &Path) -> Result<(), FilesystemError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(path).map_err(|e| FilesystemError::new("removing", path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FilesystemError::new("inspecting", path, e)),
    }
}

/// `true` if `dir` exists and contains at least one entry.
pub fn is_non_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Remove a directory tree if present.
pub fn remove_dir_if_exists(dir: &Path) -> Result<(), FilesystemError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FilesystemError::new("removing directory", dir, e)),
    }
}

/// Hex sha256 and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64), FilesystemError> {
    let file = File::open(path).map_err(|e| FilesystemError::new("opening", path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| FilesystemError::new("reading", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_dir_merge_keeps_existing_files() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        fs::create_dir_all(src.join("subdir")).unwrap();
        fs::write(src.join("file.txt"), "new").unwrap();
        fs::write(src.join("subdir/nested.txt"), "world").unwrap();
        std::os::unix::fs::symlink("file.txt", src.join("link")).unwrap();

        fs::create_dir_all(dst.join("subdir")).unwrap();
        fs::write(dst.join("file.txt"), "old").unwrap();
        fs::write(dst.join("subdir/keep.txt"), "untouched").unwrap();

        copy_dir_merge(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("file.txt")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dst.join("subdir/nested.txt")).unwrap(), "world");
        assert_eq!(
            fs::read_to_string(dst.join("subdir/keep.txt")).unwrap(),
            "untouched"
        );
        assert!(dst.join("link").is_symlink());
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), Path::new("file.txt"));
    }

    #[test]
    fn test_copy_dir_merge_overwrites_read_only_files() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("pool")).unwrap();
        fs::write(src.join("pool/x.deb"), "fresh").unwrap();
        fs::set_permissions(src.join("pool/x.deb"), fs::Permissions::from_mode(0o444)).unwrap();

        copy_dir_merge(&src, &dst).unwrap();
        fs::write(src.join("pool/y.deb"), "second").unwrap();
        copy_dir_merge(&src, &dst).unwrap();

        let copied = dst.join("pool/x.deb");
        assert_eq!(fs::read_to_string(&copied).unwrap(), "fresh");
        assert_eq!(fs::metadata(&copied).unwrap().permissions().mode() & 0o777, 0o444);
        assert_eq!(fs::read_to_string(dst.join("pool/y.deb")).unwrap(), "second");
    }

    #[test]
    fn test_copy_atomic_cleans_up_after_failed_rename() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("vmlinuz");
        fs::write(&src, "kernel").unwrap();
        let dst = temp.path().join("target");
        fs::create_dir_all(dst.join("occupied")).unwrap();

        assert!(copy_atomic(&src, &dst).is_err());
        assert!(!temp.path().join("target.partial").exists());
    }

    #[test]
    fn test_copy_dir_merge_twice_is_stable() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        std::os::unix::fs::symlink("target", src.join("link")).unwrap();

        copy_dir_merge(&src, &dst).unwrap();
        copy_dir_merge(&src, &dst).unwrap();

        assert!(dst.join("link").is_symlink());
    }

    #[test]
    fn test_atomic_move() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");

        fs::write(&src, "content").unwrap();
        atomic_move(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "content");
    }

    #[test]
    fn test_is_non_empty_dir() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("d");
        assert!(!is_non_empty_dir(&dir));
        fs::create_dir(&dir).unwrap();
        assert!(!is_non_empty_dir(&dir));
        fs::write(dir.join("f"), "").unwrap();
        assert!(is_non_empty_dir(&dir));
    }

    #[test]
    fn test_sha256_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, "abc").unwrap();
        let (sha, size) = sha256_file(&path).unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
