//! The installation run.
//!
//! [`run`] is the whole control flow: acquire the mount point, resolve
//! the build artifacts, then either print the plan (dry run) or execute
//! the three destructive steps in order. Every external invocation
//! blocks, every failure is fatal, and the mount point is released on
//! every exit path out of this module.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::RunConfig;
use crate::error::{InstallerError, Result};
use crate::mount::MountPoint;
use crate::nix::{self, ArtifactSet};

/// Perform one installation run for `config`.
///
/// The drop guard on [`MountPoint`] covers early error returns; the
/// signal handler registered on acquire covers external termination.
pub fn run(config: &RunConfig) -> Result<()> {
    let mut mount_point = MountPoint::acquire()?;

    let artifacts = nix::build_artifacts(config, mount_point.path())?;

    if config.dry_run {
        for line in dry_run_plan(&artifacts, mount_point.path()) {
            println!("{line}");
        }
    } else {
        execute(config, &artifacts, mount_point.path())?;
        println!("Installation finished");
    }

    mount_point.release()
}

/// The two actions a non-dry run would perform, in order. Printing this
/// is all a dry run does after the artifacts resolve.
pub fn dry_run_plan(artifacts: &ArtifactSet, mount_point: &Path) -> [String; 2] {
    [
        format!("Would run: {}", artifacts.partition_script.display()),
        format!(
            "Would run: {}",
            render_command(&installer_command(&artifacts.system, mount_point))
        ),
    ]
}

/// Run the partition script, copy the extra files, and install the
/// system, in that order. A failing step aborts everything after it.
pub fn execute(config: &RunConfig, artifacts: &ArtifactSet, mount_point: &Path) -> Result<()> {
    run_partition_script(&artifacts.partition_script)?;
    copy_extra_files(&config.extra_files, mount_point)?;
    run_system_installer(&artifacts.system, mount_point)
}

/// Execute the disko-generated script that formats or mounts the target
/// disks onto the mount point. The script takes no arguments; the mount
/// point was baked in at evaluation time.
fn run_partition_script(script: &Path) -> Result<()> {
    println!("Running partition script {}", script.display());
    let status = Command::new(script).status().map_err(InstallerError::io(format!(
        "running partition script '{}'",
        script.display()
    )))?;
    if !status.success() {
        return Err(InstallerError::Partition {
            script: script.to_path_buf(),
            status,
        });
    }
    Ok(())
}

/// Copy each extra file or directory into the mounted root, preserving
/// attributes. Entries are independent and fail-fast: the first failure
/// aborts the run with the remaining entries untouched, and entries
/// already copied stay on disk.
pub fn copy_extra_files(
    extra_files: &BTreeMap<PathBuf, PathBuf>,
    mount_point: &Path,
) -> Result<()> {
    for (source, destination) in extra_files {
        let relative = destination
            .strip_prefix("/")
            .unwrap_or_else(|_| destination.as_path());
        let target = mount_point.join(relative);
        let copy_err = |reason: String| InstallerError::Copy {
            from: source.clone(),
            to: target.clone(),
            reason,
        };

        if !source.exists() {
            return Err(copy_err("source does not exist".to_string()));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| copy_err(format!("creating '{}': {err}", parent.display())))?;
        }

        println!("Copying {} to {}", source.display(), target.display());
        let status = Command::new("cp")
            .arg("-a")
            .arg("--")
            .arg(source)
            .arg(&target)
            .status()
            .map_err(|err| copy_err(format!("running cp: {err}")))?;
        if !status.success() {
            return Err(copy_err(format!("cp -a exited with {status}")));
        }
    }
    Ok(())
}

/// The `nixos-install` invocation for `system` into `mount_point`. The
/// run is unattended: no root password prompt, no channel copy.
fn installer_command(system: &Path, mount_point: &Path) -> Command {
    let mut command = Command::new("nixos-install");
    command
        .arg("--no-root-passwd")
        .arg("--no-channel-copy")
        .arg("--system")
        .arg(system)
        .arg("--root")
        .arg(mount_point);
    command
}

fn run_system_installer(system: &Path, mount_point: &Path) -> Result<()> {
    println!("Installing the system to {}", mount_point.display());
    let status = installer_command(system, mount_point)
        .status()
        .map_err(InstallerError::io("running nixos-install"))?;
    if !status.success() {
        return Err(InstallerError::Install { status });
    }
    Ok(())
}

/// Render a command for the dry-run plan.
fn render_command(command: &Command) -> String {
    let mut rendered = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
