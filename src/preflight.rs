//! Host checks run before any image is touched.
//!
//! Disc extraction shells out, so the configured extractor must be on
//! `PATH`. Everything else is done in-process.

use anyhow::{bail, Result};

use crate::config::Config;

/// `true` when `cmd` resolves on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// `(command, package)` pairs the configured run depends on.
pub fn required_tools(config: &Config) -> Vec<(&'static str, &'static str)> {
    let extractor = config.transform.extractor;
    vec![(extractor.program(), extractor.package())]
}

/// Fail with every missing tool and the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {tool} (install: {package})"))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

pub fn check_host_tools(config: &Config) -> Result<()> {
    check_required_tools(&required_tools(config))
}
