//! Gzip-compressed cpio archives in `newc` format.
//!
//! This is the format the kernel accepts for an initramfs. Entries are
//! written in sorted walk order with uid/gid 0, so packing the same tree
//! twice yields the same entry sequence.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{PackError, UnpackError};

const NEWC_MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";
/// `PATH_MAX`; bounds entry names and symlink targets.
const MAX_PATH_LEN: u32 = 4096;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// One parsed `newc` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Header {
    ino: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    mtime: u32,
    filesize: u32,
    devmajor: u32,
    devminor: u32,
    rdevmajor: u32,
    rdevminor: u32,
    namesize: u32,
}

impl Header {
    fn encode(&self) -> String {
        format!(
            "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            self.ino,
            self.mode,
            self.uid,
            self.gid,
            self.nlink,
            self.mtime,
            self.filesize,
            self.devmajor,
            self.devminor,
            self.rdevmajor,
            self.rdevminor,
            self.namesize,
            0u32,
        )
    }

    fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self, String> {
        if &raw[..6] != NEWC_MAGIC {
            return Err(format!(
                "bad magic {:?}, only newc (070701) is supported",
                String::from_utf8_lossy(&raw[..6])
            ));
        }
        let field = |i: usize| -> Result<u32, String> {
            let start = 6 + i * 8;
            let text = std::str::from_utf8(&raw[start..start + 8])
                .map_err(|_| format!("header field {i} is not ASCII"))?;
            u32::from_str_radix(text, 16).map_err(|_| format!("header field {i} is not hex"))
        };
        Ok(Self {
            ino: field(0)?,
            mode: field(1)?,
            uid: field(2)?,
            gid: field(3)?,
            nlink: field(4)?,
            mtime: field(5)?,
            filesize: field(6)?,
            devmajor: field(7)?,
            devminor: field(8)?,
            rdevmajor: field(9)?,
            rdevminor: field(10)?,
            namesize: field(11)?,
        })
    }
}

fn pad4(len: u64) -> u64 {
    (4 - len % 4) % 4
}

/// Byte-counting reader so format errors can name an offset.
struct Tracked<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> Tracked<R> {
    fn read_exact_tracked(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(len), &mut io::sink())?;
        self.offset += copied;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "archive ended inside padding",
            ));
        }
        Ok(())
    }
}

/// Decompress `archive` and unpack every entry below `dest`.
///
/// Relative paths and permission bits are preserved. Regular files that
/// already exist at the destination are replaced. Device nodes and fifos
/// are skipped since creating them needs privileges the tool does not
/// assume.
pub fn unpack(archive: &Path, dest: &Path) -> Result<(), UnpackError> {
    let io_err = |source| UnpackError::Io {
        archive: archive.to_path_buf(),
        source,
    };
    let file = File::open(archive).map_err(io_err)?;
    let mut reader = Tracked {
        inner: GzDecoder::new(BufReader::new(file)),
        offset: 0,
    };

    fs::create_dir_all(dest).map_err(io_err)?;

    // Directory modes are applied last so read-only directories can still be filled.
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
    // Hard links in newc carry their data on the last entry of the group.
    let mut pending_links: HashMap<(u32, u32, u32), Vec<PathBuf>> = HashMap::new();

    loop {
        let entry_offset = reader.offset;
        let format_err = |reason: String| UnpackError::Format {
            archive: archive.to_path_buf(),
            offset: entry_offset,
            reason,
        };

        let mut raw = [0u8; HEADER_LEN];
        reader.read_exact_tracked(&mut raw).map_err(io_err)?;
        let header = Header::decode(&raw).map_err(format_err)?;

        if header.namesize == 0 {
            return Err(format_err("zero-length name".to_string()));
        }
        if header.namesize > MAX_PATH_LEN {
            return Err(format_err(format!(
                "name length {} exceeds {MAX_PATH_LEN}",
                header.namesize
            )));
        }
        let mut name_buf = vec![0u8; header.namesize as usize];
        reader.read_exact_tracked(&mut name_buf).map_err(io_err)?;
        reader
            .skip(pad4(HEADER_LEN as u64 + u64::from(header.namesize)))
            .map_err(io_err)?;
        if name_buf.last() != Some(&0) {
            return Err(format_err("name is not NUL-terminated".to_string()));
        }
        name_buf.pop();
        let name = String::from_utf8_lossy(&name_buf).into_owned();

        if name == TRAILER {
            break;
        }

        let size = u64::from(header.filesize);
        let Some(relative) = sanitize(&name) else {
            return Err(UnpackError::UnsafePath {
                archive: archive.to_path_buf(),
                name,
            });
        };
        if relative.as_os_str().is_empty() {
            reader.skip(size + pad4(size)).map_err(io_err)?;
            continue;
        }
        if crosses_symlink(dest, &relative).map_err(io_err)? {
            return Err(UnpackError::UnsafePath {
                archive: archive.to_path_buf(),
                name,
            });
        }
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        match header.mode & S_IFMT {
            S_IFDIR => {
                if !fs::symlink_metadata(&target).is_ok_and(|meta| meta.is_dir()) {
                    remove_existing(&target).map_err(io_err)?;
                    fs::create_dir_all(&target).map_err(io_err)?;
                }
                dir_modes.push((target, header.mode & 0o7777));
                reader.skip(size + pad4(size)).map_err(io_err)?;
            }
            S_IFREG => {
                remove_existing(&target).map_err(io_err)?;
                let link_key = (header.devmajor, header.devminor, header.ino);
                if header.nlink > 1 && size == 0 {
                    File::create(&target).map_err(io_err)?;
                    pending_links.entry(link_key).or_default().push(target.clone());
                } else {
                    let mut out = BufWriter::new(File::create(&target).map_err(io_err)?);
                    let copied =
                        io::copy(&mut (&mut reader.inner).take(size), &mut out).map_err(io_err)?;
                    reader.offset += copied;
                    if copied != size {
                        return Err(format_err(format!(
                            "'{name}' truncated: expected {size} bytes, got {copied}"
                        )));
                    }
                    out.flush().map_err(io_err)?;
                    reader.skip(pad4(size)).map_err(io_err)?;

                    if header.nlink > 1 {
                        for link in pending_links.remove(&link_key).unwrap_or_default() {
                            fs::remove_file(&link).map_err(io_err)?;
                            fs::hard_link(&target, &link).map_err(io_err)?;
                        }
                    }
                }
                fs::set_permissions(&target, fs::Permissions::from_mode(header.mode & 0o7777))
                    .map_err(io_err)?;
            }
            S_IFLNK => {
                if header.filesize > MAX_PATH_LEN {
                    return Err(format_err(format!(
                        "symlink '{name}' target length {} exceeds {MAX_PATH_LEN}",
                        header.filesize
                    )));
                }
                let mut link_target = vec![0u8; header.filesize as usize];
                reader.read_exact_tracked(&mut link_target).map_err(io_err)?;
                reader.skip(pad4(size)).map_err(io_err)?;
                remove_existing(&target).map_err(io_err)?;
                let link_target = String::from_utf8_lossy(&link_target).into_owned();
                std::os::unix::fs::symlink(&link_target, &target).map_err(io_err)?;
            }
            other => {
                warn!(
                    entry = %name,
                    kind = format!("{other:o}"),
                    "skipping special file in {}",
                    archive.display()
                );
                reader.skip(size + pad4(size)).map_err(io_err)?;
            }
        }
    }

    dir_modes.sort_by(|a, b| b.0.cmp(&a.0));
    for (dir, mode) in dir_modes {
        if !fs::symlink_metadata(&dir).is_ok_and(|meta| meta.is_dir()) {
            continue;
        }
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode)).map_err(io_err)?;
    }

    debug!("unpacked {} into {}", archive.display(), dest.display());
    Ok(())
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("'{}' is a directory", path.display()),
        )),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `true` when a strict ancestor of `relative` below `dest` is a symlink,
/// so writing the entry would land wherever that link points.
fn crosses_symlink(dest: &Path, relative: &Path) -> io::Result<bool> {
    let mut current = dest.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(true),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Strip leading `./` and `/`, reject anything that climbs out of the root.
fn sanitize(name: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Pack every entry below `root` into a gzip-compressed newc archive.
///
/// Paths listed in `exclude` (relative to `root`) are left out, together
/// with anything beneath them.
pub fn pack(
    root: &Path,
    archive: &Path,
    exclude: &[&Path],
    gzip_level: u32,
) -> Result<(), PackError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PackError::Io { path, source }
    };

    let file = File::create(archive).map_err(io_err(archive))?;
    let mut out = GzEncoder::new(BufWriter::new(file), Compression::new(gzip_level));

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| !exclude.iter().any(|ex| rel == *ex))
                .unwrap_or(true)
        });

    let mut ino = 0u32;
    for entry in walker {
        let entry = entry.map_err(|source| PackError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let meta = fs::symlink_metadata(path).map_err(io_err(path))?;
        ino += 1;

        let name = relative.to_string_lossy();
        let kind = meta.mode() & S_IFMT;
        let (rdevmajor, rdevminor) = split_dev(meta.rdev());
        let mut header = Header {
            ino,
            mode: meta.mode(),
            uid: 0,
            gid: 0,
            nlink: if kind == S_IFDIR { 2 } else { 1 },
            mtime: u32::try_from(meta.mtime()).unwrap_or(0),
            filesize: 0,
            devmajor: 0,
            devminor: 0,
            rdevmajor,
            rdevminor,
            namesize: name.len() as u32 + 1,
        };

        match kind {
            S_IFREG => {
                header.filesize =
                    u32::try_from(meta.len()).map_err(|_| PackError::TooLarge {
                        path: path.to_path_buf(),
                    })?;
                write_header(&mut out, &header, &name).map_err(io_err(path))?;
                let mut src = File::open(path).map_err(io_err(path))?;
                let copied = io::copy(&mut src, &mut out).map_err(io_err(path))?;
                if copied != meta.len() {
                    return Err(PackError::Io {
                        path: path.to_path_buf(),
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "file changed size while packing",
                        ),
                    });
                }
                write_padding(&mut out, copied).map_err(io_err(path))?;
            }
            S_IFLNK => {
                let target = fs::read_link(path).map_err(io_err(path))?;
                let target = target.to_string_lossy();
                header.filesize = target.len() as u32;
                write_header(&mut out, &header, &name).map_err(io_err(path))?;
                out.write_all(target.as_bytes()).map_err(io_err(path))?;
                write_padding(&mut out, target.len() as u64).map_err(io_err(path))?;
            }
            _ => write_header(&mut out, &header, &name).map_err(io_err(path))?,
        }
    }

    let trailer = Header {
        nlink: 1,
        namesize: TRAILER.len() as u32 + 1,
        ..Header::default()
    };
    write_header(&mut out, &trailer, TRAILER).map_err(io_err(archive))?;

    let mut inner = out.finish().map_err(io_err(archive))?;
    inner.flush().map_err(io_err(archive))?;
    debug!("packed {} into {}", root.display(), archive.display());
    Ok(())
}

fn write_header<W: Write>(out: &mut W, header: &Header, name: &str) -> io::Result<()> {
    out.write_all(header.encode().as_bytes())?;
    out.write_all(name.as_bytes())?;
    out.write_all(&[0])?;
    write_padding(out, HEADER_LEN as u64 + name.len() as u64 + 1)
}

fn write_padding<W: Write>(out: &mut W, written: u64) -> io::Result<()> {
    const ZEROS: [u8; 3] = [0; 3];
    out.write_all(&ZEROS[..pad4(written) as usize])
}

/// Linux `dev_t` encoding.
fn split_dev(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major as u32, minor as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn snapshot(root: &Path) -> BTreeMap<String, (Option<Vec<u8>>, bool)> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
                let meta = fs::symlink_metadata(e.path()).unwrap();
                let content = if meta.is_file() {
                    Some(fs::read(e.path()).unwrap())
                } else if meta.file_type().is_symlink() {
                    Some(fs::read_link(e.path()).unwrap().to_string_lossy().into_owned().into_bytes())
                } else {
                    None
                };
                let exec = meta.is_file() && meta.mode() & 0o111 != 0;
                (rel, (content, exec))
            })
            .collect()
    }

    #[test]
    fn test_pack_unpack_preserves_tree() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("usr/lib/finish-install.d")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("init"), "#!/bin/sh\nexec /bin/sh\n").unwrap();
        fs::set_permissions(root.join("init"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(root.join("usr/lib/finish-install.d/11x"), "abc").unwrap();
        fs::write(root.join("odd-size"), vec![7u8; 4099]).unwrap();
        fs::write(root.join("zero"), "").unwrap();
        std::os::unix::fs::symlink("init", root.join("linuxrc")).unwrap();

        let archive = temp.path().join("initrd.gz");
        pack(&root, &archive, &[], 6).unwrap();

        let out = temp.path().join("out");
        unpack(&archive, &out).unwrap();

        assert_eq!(snapshot(&root), snapshot(&out));
        assert!(out.join("empty").is_dir());
    }

    #[test]
    fn test_pack_is_deterministic_in_order() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        for name in ["b", "a", "c/d", "c/a"] {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, name).unwrap();
        }
        let first = temp.path().join("1.gz");
        let second = temp.path().join("2.gz");
        pack(&root, &first, &[], 6).unwrap();
        pack(&root, &second, &[], 6).unwrap();
        assert_eq!(fs::read(first).unwrap(), fs::read(second).unwrap());
    }

    #[test]
    fn test_pack_honours_excludes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("skipdir")).unwrap();
        fs::write(root.join("skipdir/inner"), "x").unwrap();
        fs::write(root.join("initrd.gz"), "old").unwrap();
        fs::write(root.join("keep"), "k").unwrap();

        let archive = temp.path().join("a.gz");
        pack(&root, &archive, &[Path::new("initrd.gz"), Path::new("skipdir")], 6).unwrap();
        let out = temp.path().join("out");
        unpack(&archive, &out).unwrap();

        assert!(out.join("keep").exists());
        assert!(!out.join("initrd.gz").exists());
        assert!(!out.join("skipdir").exists());
    }

    #[test]
    fn test_unpack_replaces_read_only_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("f"), "fresh").unwrap();
        let archive = temp.path().join("a.gz");
        pack(&root, &archive, &[], 1).unwrap();

        let out = temp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("f"), "stale").unwrap();
        fs::set_permissions(out.join("f"), fs::Permissions::from_mode(0o444)).unwrap();
        fs::write(out.join("sibling"), "kept").unwrap();

        unpack(&archive, &out).unwrap();
        assert_eq!(fs::read_to_string(out.join("f")).unwrap(), "fresh");
        assert_eq!(fs::read_to_string(out.join("sibling")).unwrap(), "kept");
    }

    fn raw_archive(entries: &[(&str, u32, u32, u32, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (name, mode, ino, nlink, data) in entries {
            let header = Header {
                ino: *ino,
                mode: *mode,
                nlink: *nlink,
                filesize: data.len() as u32,
                namesize: name.len() as u32 + 1,
                ..Header::default()
            };
            write_header(&mut buf, &header, name).unwrap();
            buf.extend_from_slice(data);
            write_padding(&mut buf, data.len() as u64).unwrap();
        }
        let trailer = Header {
            namesize: TRAILER.len() as u32 + 1,
            ..Header::default()
        };
        write_header(&mut buf, &trailer, TRAILER).unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&buf).unwrap();
        gz.finish().unwrap()
    }

    #[test]
    fn test_unpack_rejects_parent_traversal() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("evil.gz");
        fs::write(&archive, raw_archive(&[("../escape", 0o100644, 1, 1, b"x")])).unwrap();

        let err = unpack(&archive, &temp.path().join("out")).unwrap_err();
        assert!(matches!(err, UnpackError::UnsafePath { .. }));
        assert!(!temp.path().join("escape").exists());
    }

    #[test]
    fn test_unpack_refuses_writes_through_symlinks() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        let archive = temp.path().join("evil.gz");
        fs::write(
            &archive,
            raw_archive(&[
                ("lnk", 0o120777, 1, 1, outside.to_str().unwrap().as_bytes()),
                ("lnk/pwned", 0o100644, 2, 1, b"owned"),
            ]),
        )
        .unwrap();

        let err = unpack(&archive, &temp.path().join("dest")).unwrap_err();
        assert!(matches!(err, UnpackError::UnsafePath { .. }));
        assert!(!outside.join("pwned").exists());
    }

    #[test]
    fn test_unpack_directory_entry_replaces_symlink() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        let archive = temp.path().join("dir.gz");
        fs::write(
            &archive,
            raw_archive(&[
                ("lnk", 0o120777, 1, 1, outside.to_str().unwrap().as_bytes()),
                ("lnk", 0o040700, 2, 2, b""),
            ]),
        )
        .unwrap();

        let dest = temp.path().join("dest");
        unpack(&archive, &dest).unwrap();
        assert!(fs::symlink_metadata(dest.join("lnk")).unwrap().is_dir());
        assert_ne!(fs::metadata(&outside).unwrap().mode() & 0o7777, 0o700);
    }

    #[test]
    fn test_unpack_rejects_oversized_lengths() {
        let temp = TempDir::new().unwrap();
        let cases = [
            Header {
                mode: 0o100644,
                namesize: MAX_PATH_LEN + 1,
                ..Header::default()
            },
            Header {
                mode: 0o120777,
                filesize: MAX_PATH_LEN + 1,
                namesize: 4,
                ..Header::default()
            },
        ];
        for (i, header) in cases.iter().enumerate() {
            let mut buf = Vec::new();
            write_header(&mut buf, header, "lnk").unwrap();
            let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
            gz.write_all(&buf).unwrap();
            let archive = temp.path().join(format!("big{i}.gz"));
            fs::write(&archive, gz.finish().unwrap()).unwrap();

            let err = unpack(&archive, &temp.path().join("out")).unwrap_err();
            assert!(matches!(err, UnpackError::Format { .. }), "case {i}: {err}");
        }
    }

    #[test]
    fn test_unpack_resolves_hard_links() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("links.gz");
        fs::write(
            &archive,
            raw_archive(&[
                ("./bin/a", 0o100755, 9, 2, b""),
                ("./bin/b", 0o100755, 9, 2, b"payload"),
            ]),
        )
        .unwrap();

        let out = temp.path().join("out");
        unpack(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("bin/a")).unwrap(), b"payload");
        assert_eq!(fs::read(out.join("bin/b")).unwrap(), b"payload");
    }

    #[test]
    fn test_unpack_rejects_non_newc() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("odc.gz");
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&[b'0'; HEADER_LEN]).unwrap();
        fs::write(&archive, gz.finish().unwrap()).unwrap();

        let err = unpack(&archive, &temp.path().join("out")).unwrap_err();
        assert!(matches!(err, UnpackError::Format { offset: 0, .. }));
    }

    #[test]
    fn test_split_dev() {
        // /dev/console is 5:1
        assert_eq!(split_dev((5 << 8) | 1), (5, 1));
    }
}
