//! Mount-point lifecycle.
//!
//! The run owns exactly one mount point: a uniquely named temporary
//! directory that the partition script mounts the target filesystems
//! onto. Whatever way the run ends, the directory is unmounted
//! (recursively, if anything is mounted) and removed exactly once:
//! normal completion and early error returns go through the drop guard,
//! termination signals go through an async-signal-safe handler.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{InstallerError, Result};

/// Mode for the mount point directory. Some filesystems refuse to mount
/// onto a directory that is not world-readable and executable.
const MOUNT_POINT_MODE: u32 = 0o755;

/// The run's scoped mount point. Create with [`MountPoint::acquire`];
/// dropping it releases it if [`MountPoint::release`] was not called.
#[derive(Debug)]
pub struct MountPoint {
    path: PathBuf,
    released: bool,
}

impl MountPoint {
    /// Create a fresh uniquely named directory with mode 0755 and
    /// register it for cleanup on SIGINT/SIGTERM.
    ///
    /// At most one mount point is live per run; the signal handler
    /// tracks only the most recently acquired path.
    pub fn acquire() -> Result<Self> {
        let path = tempfile::Builder::new()
            .prefix("disko-install.")
            .tempdir()
            .map_err(InstallerError::io("creating mount point directory"))?
            .keep();
        signal_cleanup::install(&path);
        let mount_point = MountPoint {
            path,
            released: false,
        };
        fs::set_permissions(mount_point.path(), fs::Permissions::from_mode(MOUNT_POINT_MODE))
            .map_err(InstallerError::io(format!(
                "setting mode on '{}'",
                mount_point.path().display()
            )))?;
        Ok(mount_point)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmount (recursively, if mounted) and remove the directory.
    ///
    /// Idempotent: the second and later calls are no-ops, and a
    /// directory that is already gone does not fail the run.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        signal_cleanup::clear();

        if is_mount_point(&self.path)? {
            let status = Command::new("umount")
                .arg("-R")
                .arg(&self.path)
                .status()
                .map_err(InstallerError::io("running umount"))?;
            if !status.success() {
                return Err(InstallerError::Io {
                    context: format!("unmounting '{}'", self.path.display()),
                    source: std::io::Error::other(format!("umount -R exited with {status}")),
                });
            }
        }

        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(InstallerError::io(format!("removing '{}'", self.path.display()))(err))
            }
        }
    }
}

impl Drop for MountPoint {
    fn drop(&mut self) {
        // Runs on early error returns; must not panic or mask the error
        // already propagating.
        if let Err(err) = self.release() {
            eprintln!("warning: failed to clean up mount point: {err}");
        }
    }
}

/// A path is a mount point when it sits on a different device than its
/// parent directory, the same check `mountpoint(1)` performs. A missing
/// path is not a mount point.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(InstallerError::io(format!("inspecting '{}'", path.display()))(err))
        }
    };
    let Some(parent) = path.parent() else {
        // The filesystem root is a mount point by definition.
        return Ok(true);
    };
    let parent_metadata = fs::symlink_metadata(parent)
        .map_err(InstallerError::io(format!("inspecting '{}'", parent.display())))?;
    Ok(metadata.dev() != parent_metadata.dev())
}

/// Signal-path cleanup. The handler may only use async-signal-safe
/// functions: raw `umount2`/`rmdir`/`write`/`_exit`, no allocation, no
/// stdio, no unwinding.
mod signal_cleanup {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr;
    use std::sync::atomic::{AtomicPtr, Ordering};

    static CLEANUP_PATH: AtomicPtr<libc::c_char> = AtomicPtr::new(ptr::null_mut());

    /// Publish `path` to the signal handler and install the handlers.
    pub(super) fn install(path: &Path) {
        let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
            // A path with an interior NUL cannot come from the
            // filesystem; nothing to register.
            return;
        };
        let previous = CLEANUP_PATH.swap(c_path.into_raw(), Ordering::SeqCst);
        if !previous.is_null() {
            drop(unsafe { CString::from_raw(previous) });
        }
        unsafe {
            libc::signal(libc::SIGINT, handle_signal as usize);
            libc::signal(libc::SIGTERM, handle_signal as usize);
        }
    }

    /// Withdraw the path after a normal release.
    pub(super) fn clear() {
        let previous = CLEANUP_PATH.swap(ptr::null_mut(), Ordering::SeqCst);
        if !previous.is_null() {
            drop(unsafe { CString::from_raw(previous) });
        }
    }

    extern "C" fn handle_signal(signal: libc::c_int) {
        let path = CLEANUP_PATH.swap(ptr::null_mut(), Ordering::SeqCst);
        if !path.is_null() {
            unsafe {
                // MNT_DETACH detaches the whole subtree in one syscall;
                // both calls are harmless if nothing is mounted or the
                // directory is already gone.
                libc::umount2(path, libc::MNT_DETACH);
                libc::rmdir(path);
            }
        }
        let message = b"disko-install: interrupted, mount point released\n";
        unsafe {
            libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
            libc::_exit(128 + signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_an_empty_directory_with_mode_755() {
        let mut mount_point = MountPoint::acquire().unwrap();
        let path = mount_point.path().to_path_buf();

        assert!(path.is_dir());
        assert_eq!(fs::read_dir(&path).unwrap().count(), 0);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        mount_point.release().unwrap();
    }

    #[test]
    fn release_removes_the_directory() {
        let mut mount_point = MountPoint::acquire().unwrap();
        let path = mount_point.path().to_path_buf();

        mount_point.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn release_twice_is_a_no_op() {
        let mut mount_point = MountPoint::acquire().unwrap();
        mount_point.release().unwrap();
        mount_point.release().unwrap();
    }

    #[test]
    fn release_tolerates_an_already_removed_directory() {
        let mut mount_point = MountPoint::acquire().unwrap();
        fs::remove_dir(mount_point.path()).unwrap();
        mount_point.release().unwrap();
    }

    #[test]
    fn drop_releases_on_early_error_paths() {
        fn fails_after_acquire(observed: &mut PathBuf) -> Result<()> {
            let mount_point = MountPoint::acquire()?;
            *observed = mount_point.path().to_path_buf();
            Err(InstallerError::Build("simulated failure".to_string()))
        }

        let mut path = PathBuf::new();
        let err = fails_after_acquire(&mut path).unwrap_err();
        assert!(matches!(err, InstallerError::Build(_)));
        assert!(!path.as_os_str().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn unmounted_directory_is_not_a_mount_point() {
        let temp = tempfile::TempDir::new().unwrap();
        let nested = temp.path().join("nested");
        fs::create_dir(&nested).unwrap();
        assert!(!is_mount_point(&nested).unwrap());
    }

    #[test]
    fn filesystem_root_is_a_mount_point() {
        assert!(is_mount_point(Path::new("/")).unwrap());
    }

    #[test]
    fn missing_path_is_not_a_mount_point() {
        assert!(!is_mount_point(Path::new("/does/not/exist/anywhere")).unwrap());
    }
}
