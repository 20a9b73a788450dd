//! Mount table probing and the mount/umount primitives built on top of
//! [`CommandRunner`].

use std::fmt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::statfs::{AUTOFS_SUPER_MAGIC, statfs};
use procfs::process::Process;
use thiserror::Error;
use tracing::debug;

use crate::exec::{Cmd, CommandRunner, ExecError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// The probe itself failed.
    Unknown,
    NotMounted,
    Mounted,
    /// Listed in the mount table, but the backing filesystem is gone.
    Corrupted,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountState::Unknown => "UNKNOWN",
            MountState::NotMounted => "NOT_MOUNTED",
            MountState::Mounted => "MOUNTED",
            MountState::Corrupted => "CORRUPTED",
        };
        f.write_str(s)
    }
}

/// One line of `/proc/self/mountinfo`, reduced to what we look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
}

impl MountEntry {
    pub fn new(mount_point: impl Into<PathBuf>, fs_type: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            fs_type: fs_type.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to read mount table: {0}")]
    MountTable(String),

    #[error("failed to probe {path:?}: {source}")]
    Probe {
        path: PathBuf,
        #[source]
        source: Errno,
    },
}

impl From<procfs::ProcError> for MountError {
    fn from(e: procfs::ProcError) -> Self {
        MountError::MountTable(e.to_string())
    }
}

/// Read-only view of the kernel state the plugin makes decisions on.
pub trait Kernel: Send + Sync {
    /// Current mount table of the plugin's mount namespace.
    fn mounts(&self) -> Result<Vec<MountEntry>, MountError>;

    /// `stat(2)`. Resets autofs idle timers when `path` is autofs-managed.
    fn stat(&self, path: &Path) -> Result<(), Errno>;

    /// Whether `path` is the root of a live autofs mount.
    fn is_autofs(&self, path: &Path) -> Result<bool, Errno>;
}

/// The real kernel, through procfs and nix.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostKernel;

impl Kernel for HostKernel {
    fn mounts(&self) -> Result<Vec<MountEntry>, MountError> {
        let infos = Process::myself()?.mountinfo()?;
        Ok(infos
            .into_iter()
            .map(|info| MountEntry::new(info.mount_point, info.fs_type))
            .collect())
    }

    fn stat(&self, path: &Path) -> Result<(), Errno> {
        nix::sys::stat::stat(path).map(|_| ())
    }

    fn is_autofs(&self, path: &Path) -> Result<bool, Errno> {
        Ok(statfs(path)?.filesystem_type() == AUTOFS_SUPER_MAGIC)
    }
}

// Errors k8s mount-utils treats as a corrupted mount.
fn is_corrupted_mnt(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::ENOTCONN | Errno::ESTALE | Errno::EIO | Errno::EACCES | Errno::EHOSTDOWN
    )
}

/// Classify `path` from the mount table.
///
/// Only a path the table lists as a mountpoint is ever stat'ed, to tell a
/// live mount from a corrupted one. An `Err` means the state is
/// [`MountState::Unknown`].
pub fn mount_state(kernel: &dyn Kernel, path: &Path) -> Result<MountState, MountError> {
    let mounts = kernel.mounts()?;
    if !mounts.iter().any(|m| m.mount_point == path) {
        return Ok(MountState::NotMounted);
    }

    match kernel.stat(path) {
        Ok(()) => Ok(MountState::Mounted),
        Err(errno) if is_corrupted_mnt(errno) => Ok(MountState::Corrupted),
        Err(source) => Err(MountError::Probe {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

pub async fn bind_mount(runner: &dyn CommandRunner, from: &Path, to: &Path) -> Result<(), ExecError> {
    runner
        .combined_output(&Cmd::new("mount").arg("--bind").arg(path_arg(from)).arg(path_arg(to)))
        .await
        .map(|_| ())
}

/// Bind `from` with all its submounts onto `to`, receiving but never sending
/// mount events.
pub async fn slave_recursive_bind(
    runner: &dyn CommandRunner,
    from: &Path,
    to: &Path,
) -> Result<(), ExecError> {
    runner
        .combined_output(
            &Cmd::new("mount")
                .arg(path_arg(from))
                .arg(path_arg(to))
                .args(["--rbind", "--make-slave"]),
        )
        .await
        .map(|_| ())
}

pub async fn make_shared(runner: &dyn CommandRunner, path: &Path) -> Result<(), ExecError> {
    runner
        .combined_output(&Cmd::new("mount").arg("--make-shared").arg(path_arg(path)))
        .await
        .map(|_| ())
}

// umount has no dedicated exit codes for these, only the message.
fn already_unmounted(output: &str) -> bool {
    output.trim_end_matches(['\n', '.']).ends_with(": not mounted")
        || output.contains("No such file or directory")
}

/// `umount [extra_args..] mountpoint`. A mountpoint that is already gone
/// counts as success.
pub async fn unmount(
    runner: &dyn CommandRunner,
    mountpoint: &Path,
    extra_args: &[&str],
) -> Result<(), ExecError> {
    let cmd = Cmd::new("umount")
        .args(extra_args.iter().copied())
        .arg(path_arg(mountpoint));
    match runner.combined_output(&cmd).await {
        Ok(_) => Ok(()),
        Err(e) if already_unmounted(e.output()) => {
            debug!("{} is not mounted", mountpoint.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub async fn force_unmount(runner: &dyn CommandRunner, mountpoint: &Path) -> Result<(), ExecError> {
    unmount(runner, mountpoint, &["--force"]).await
}

/// Unmount `mountpoint` and everything mounted below it. Needed for
/// bindmounts holding live submounts, which would otherwise fail with EBUSY.
pub async fn recursive_unmount(
    runner: &dyn CommandRunner,
    mountpoint: &Path,
) -> Result<(), ExecError> {
    unmount(runner, mountpoint, &["--recursive", "--force"]).await
}
