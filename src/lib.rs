//! Unattended NixOS installation onto a target disk.
//!
//! `disko-install` turns a flake reference plus disk mappings into a
//! formatted, mounted, and installed system in one fail-safe sequence:
//!
//! 1. validate the command line into a [`config::RunConfig`];
//! 2. acquire a scoped temporary mount point ([`mount::MountPoint`]);
//! 3. evaluate the flake into the system closure and the disko
//!    partition script ([`nix::build_artifacts`]);
//! 4. run the partition script, copy extra files into the target root,
//!    and invoke `nixos-install` ([`install`]), or just print those
//!    actions under `--dry-run`;
//! 5. release the mount point on every exit path, including
//!    termination signals.
//!
//! Partition-table handling, filesystem creation, and installer
//! internals stay in the external tools; this crate owns the ordering,
//! the two-artifact build contract, and the mount-point lifetime.

pub mod config;
pub mod error;
pub mod install;
pub mod mount;
pub mod nix;
pub mod preflight;

pub use config::{Invocation, Mode, RunConfig};
pub use error::InstallerError;
pub use nix::ArtifactSet;
