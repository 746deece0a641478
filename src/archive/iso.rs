//! Optical-disc image extraction through an external tool.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ExtractError;
use crate::fsutil::is_non_empty_dir;
use crate::process::Cmd;

/// Supported ISO extraction tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscExtractor {
    /// `7z x <image> -o<dest> -y`
    #[serde(rename = "7z")]
    SevenZip,
    /// `xorriso -osirrox on -indev <image> -extract / <dest>`
    Xorriso,
}

impl DiscExtractor {
    pub fn program(self) -> &'static str {
        match self {
            Self::SevenZip => "7z",
            Self::Xorriso => "xorriso",
        }
    }

    /// Host package that ships [`Self::program`].
    pub fn package(self) -> &'static str {
        match self {
            Self::SevenZip => "p7zip-full",
            Self::Xorriso => "xorriso",
        }
    }

    fn command(self, image: &Path, dest: &Path) -> Cmd {
        match self {
            Self::SevenZip => Cmd::new(self.program())
                .arg("x")
                .arg_path(image)
                .arg(format!("-o{}", dest.display()))
                .arg("-y"),
            Self::Xorriso => Cmd::new(self.program())
                .args(["-osirrox", "on", "-indev"])
                .arg_path(image)
                .args(["-extract", "/"])
                .arg_path(dest),
        }
    }
}

impl std::str::FromStr for DiscExtractor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "7z" | "7za" | "sevenzip" => Ok(Self::SevenZip),
            "xorriso" => Ok(Self::Xorriso),
            other => Err(format!(
                "unsupported extractor '{other}' (expected '7z' or 'xorriso')"
            )),
        }
    }
}

/// Extract `image` into `dest`, which is created if missing.
pub fn extract(
    extractor: DiscExtractor,
    image: &Path,
    dest: &Path,
    timeout: Duration,
) -> Result<(), ExtractError> {
    std::fs::create_dir_all(dest).map_err(|e| {
        ExtractError::Filesystem(crate::error::FilesystemError::new(
            "creating extraction directory",
            dest,
            e,
        ))
    })?;

    info!(
        "extracting {} with {}",
        image.display(),
        extractor.program()
    );
    let output = extractor
        .command(image, dest)
        .timeout(timeout)
        .run_blocking()
        .map_err(|source| ExtractError::Tool {
            image: image.to_path_buf(),
            source,
        })?;
    debug!(stdout = %output.stdout.trim(), "extraction finished");

    if !is_non_empty_dir(dest) {
        return Err(ExtractError::Empty {
            image: image.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_extractor() {
        assert_eq!("7z".parse::<DiscExtractor>().unwrap(), DiscExtractor::SevenZip);
        assert_eq!(
            " Xorriso ".parse::<DiscExtractor>().unwrap(),
            DiscExtractor::Xorriso
        );
        assert!("bsdtar".parse::<DiscExtractor>().is_err());
    }

    #[test]
    fn test_sevenzip_arguments() {
        let cmd = DiscExtractor::SevenZip.command(Path::new("/a/b.iso"), Path::new("/out"));
        let rendered = format!("{cmd:?}");
        assert!(rendered.contains("\"-o/out\""));
        assert!(rendered.contains("\"/a/b.iso\""));
    }

    #[test]
    fn test_extract_garbage_fails() {
        if which::which("7z").is_err() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("bogus.iso");
        std::fs::write(&image, "not an iso").unwrap();
        let dest = temp.path().join("out");

        let err = extract(
            DiscExtractor::SevenZip,
            &image,
            &dest,
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::Tool { .. } | ExtractError::Empty { .. }
        ));
    }
}
