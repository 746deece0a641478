//! Installer script edits applied to the unpacked initrd.
//!
//! Every appended snippet starts with a marker line; a script that already
//! carries the marker is left alone, so patching a tree twice is the same
//! as patching it once.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::debug;

use crate::error::{FilesystemError, StateError};

pub const CONSOLE_SETUP: &str = "usr/lib/base-installer.d/20console-setup";
pub const COPY_CDROM: &str = "usr/lib/base-installer.d/99copy-cdrom";
pub const DELETE_CDROM: &str = "usr/lib/finish-install.d/11delete-cdrom";

const SCRIPT_HEADER: &str = "#!/bin/sh\nset -e\n. /usr/share/debconf/confmodule\n\n";

const COPY_CDROM_MARKER: &str = "# debian-netboot: copy staged cdrom to target";
const COPY_CDROM_BODY: &str = "\
mkdir -p /target/media/cdrom
cp -r /cdrom/. /target/media/cdrom/
sed -i '2s/-e/-x/' /usr/lib/apt-setup/generators/50mirror
sed -i '124s/use_mirror=false/use_mirror=true/g' /usr/lib/apt-setup/generators/50mirror
";

const DELETE_CDROM_MARKER: &str = "# debian-netboot: drop staged cdrom from target";
const DELETE_CDROM_BODY: &str = "rm -rf /target/media/cdrom/*\n";

/// Which edits changed something on this run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub console_setup: bool,
    pub copy_cdrom: bool,
    pub delete_cdrom: bool,
}

/// Apply all edits below the unpacked installer tree `install_dir`.
pub fn apply(install_dir: &Path) -> Result<PatchReport, StateError> {
    let console_setup = swap_line_flag(&install_dir.join(CONSOLE_SETUP), 2, "-e", "-x")?;
    let copy_cdrom = ensure_snippet(
        &install_dir.join(COPY_CDROM),
        COPY_CDROM_MARKER,
        COPY_CDROM_BODY,
    )?;
    let delete_cdrom = ensure_snippet(
        &install_dir.join(DELETE_CDROM),
        DELETE_CDROM_MARKER,
        DELETE_CDROM_BODY,
    )?;

    let report = PatchReport {
        console_setup,
        copy_cdrom,
        delete_cdrom,
    };
    debug!(?report, "patched {}", install_dir.display());
    Ok(report)
}

/// Replace the first `from` on 1-based line `line` with `to`, the way
/// `sed -i '<line>s/<from>/<to>/'` does. Returns whether the file changed.
pub fn swap_line_flag(path: &Path, line: usize, from: &str, to: &str) -> Result<bool, StateError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StateError::Missing(format!(
                "installer script '{}' not found",
                path.display()
            )))
        }
        Err(e) => return Err(FilesystemError::new("reading", path, e).into()),
    };

    let mut changed = false;
    let patched: Vec<String> = text
        .split_inclusive('\n')
        .enumerate()
        .map(|(idx, current)| {
            if idx + 1 == line && current.contains(from) {
                changed = true;
                current.replacen(from, to, 1)
            } else {
                current.to_string()
            }
        })
        .collect();

    if changed {
        fs::write(path, patched.concat()).map_err(|e| FilesystemError::new("writing", path, e))?;
    }
    Ok(changed)
}

/// Append `body` under `marker` unless the marker is already present, then
/// make the script executable. A new or empty script gets a shell header.
pub fn ensure_snippet(path: &Path, marker: &str, body: &str) -> Result<bool, StateError> {
    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(FilesystemError::new("reading", path, e).into()),
    };

    let appended = !existing.lines().any(|l| l.trim_end() == marker);
    if appended {
        let mut content = existing;
        if content.trim().is_empty() {
            content = SCRIPT_HEADER.to_string();
        } else if !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(marker);
        content.push('\n');
        content.push_str(body);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| FilesystemError::new("creating directory", parent, e))?;
        }
        fs::write(path, content).map_err(|e| FilesystemError::new("writing", path, e))?;
    }

    let mode = fs::metadata(path)
        .map_err(|e| FilesystemError::new("inspecting", path, e))?
        .permissions()
        .mode();
    fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o111))
        .map_err(|e| FilesystemError::new("setting permissions on", path, e))?;

    Ok(appended)
}
