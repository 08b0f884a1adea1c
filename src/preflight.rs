//! Preflight checks.
//!
//! Refusal conditions detected before any external effect: a run that
//! would fail halfway through for a missing tool or missing privilege
//! should fail here instead, with nothing to clean up.

use crate::error::{InstallerError, Result};

/// Host tools the run shells out to, with the package providing each.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("nix-build", "nix"),
    ("nixos-install", "nixos-install-tools"),
    ("umount", "util-linux"),
    ("cp", "coreutils"),
];

/// Formatting disks and mounting filesystems require superuser
/// privilege; refuse at startup instead of failing mid-run.
pub fn require_root() -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(InstallerError::Privilege(
            "disko-install must be run as root".to_string(),
        ));
    }
    Ok(())
}

/// Check that every tool in [`REQUIRED_TOOLS`] resolves on PATH.
pub fn check_host_tools() -> Result<()> {
    check_tools(REQUIRED_TOOLS)
}

/// Check that specific tools are available, listing every missing one
/// with its package in a single error.
pub fn check_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| which::which(tool).is_err())
        .map(|(tool, package)| format!("  {tool} (install: {package})"))
        .collect();

    if !missing.is_empty() {
        return Err(InstallerError::Io {
            context: "checking required host tools".to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("missing:\n{}", missing.join("\n")),
            ),
        });
    }
    Ok(())
}
