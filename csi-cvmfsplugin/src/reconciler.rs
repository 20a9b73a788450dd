//! Periodic repair of CVMFS mounts whose client process has died.
//!
//! Mounts under the autofs root must not be stat'ed to check their health:
//! that resets the autofs idle timer and they would never be evicted. The
//! client is asked through `cvmfs_talk` instead, and `stat` is used only to
//! confirm that a client which does not answer really is gone.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, trace};

use crate::exec::{Cmd, CommandRunner, ExecError};
use crate::mountutil::{self, Kernel, MountError};

/// FUSE filesystem type the cvmfs client mounts as.
const CVMFS_FS_TYPE: &str = "fuse";
const TALK_CONN_REFUSED: &str = "(111 - Connection refused)";
const TALK_NOT_RUNNING: &str = "Seems like CernVM-FS is not running";

#[derive(Debug, Clone)]
pub struct ReconcilerOpts {
    pub period: Duration,
    pub autofs_root: PathBuf,
    /// Upper bound for a single `cvmfs_talk` query.
    pub talk_timeout: Duration,
}

impl Default for ReconcilerOpts {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(30),
            autofs_root: PathBuf::from("/cvmfs"),
            talk_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("repository is mounted at an unexpected location {0:?}, expected {1:?}")]
    UnexpectedMountpoint(String, PathBuf),

    #[error("unexpected error from stat: {0}")]
    Stat(#[source] Errno),

    #[error("failed to talk to CVMFS client: {0}")]
    Talk(#[source] ExecError),
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub unmounted: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Reconciler {
    opts: ReconcilerOpts,
    runner: Arc<dyn CommandRunner>,
    kernel: Arc<dyn Kernel>,
}

impl Reconciler {
    pub fn new(opts: ReconcilerOpts, runner: Arc<dyn CommandRunner>, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            opts,
            runner,
            kernel,
        }
    }

    /// Reconcile every `period` until the task is dropped. The first pass
    /// runs one period after start.
    pub async fn run(self) {
        let period = self.opts.period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            trace!("Reconciling {}", self.opts.autofs_root.display());
            if let Err(e) = self.reconcile().await {
                error!("Failed to reconcile {}: {e}", self.opts.autofs_root.display());
            }
        }
    }

    /// Names of the repositories the kernel has mounted under the autofs root.
    pub fn mounted_repositories(&self) -> Result<Vec<String>, MountError> {
        let root = &self.opts.autofs_root;
        Ok(self
            .kernel
            .mounts()?
            .into_iter()
            .filter(|m| m.fs_type == CVMFS_FS_TYPE)
            .filter_map(|m| {
                let repo = m.mount_point.strip_prefix(root).ok()?;
                let repo = repo.to_str()?;
                (!repo.is_empty()).then(|| repo.to_string())
            })
            .collect())
    }

    fn mountpoint(&self, repo: &str) -> PathBuf {
        self.opts.autofs_root.join(repo)
    }

    pub async fn repo_needs_unmount(&self, repo: &str) -> Result<bool, ReconcileError> {
        let talk = Cmd::new("cvmfs_talk")
            .args(["-i", repo, "mountpoint"])
            .timeout(self.opts.talk_timeout);

        let err = match self.runner.combined_output(&talk).await {
            Ok(out) => {
                let out = String::from_utf8_lossy(&out);
                let root = self.opts.autofs_root.to_string_lossy();
                let under_root = out
                    .strip_prefix(root.as_ref())
                    .is_some_and(|rest| rest.starts_with('/'));
                if under_root {
                    return Ok(false);
                }
                return Err(ReconcileError::UnexpectedMountpoint(
                    out.trim_end().to_string(),
                    self.opts.autofs_root.clone(),
                ));
            }
            Err(e) => e,
        };

        // stdout comes before stderr, so the messages may be anywhere
        let output = err.output();
        if output.contains(TALK_CONN_REFUSED) || output.contains(TALK_NOT_RUNNING) {
            // The client is gone and its watchdog did not bring it back.
            // Only now is a stat allowed, to confirm the mount is dead.
            match self.kernel.stat(&self.mountpoint(repo)) {
                Err(Errno::ENOTCONN) => return Ok(true),
                Err(errno) => return Err(ReconcileError::Stat(errno)),
                Ok(()) => {}
            }
        }

        Err(ReconcileError::Talk(err))
    }

    /// One pass over all mounted repositories. Per-repository failures are
    /// logged and reported, they never abort the pass.
    pub async fn reconcile(&self) -> Result<TickReport, MountError> {
        let repos = self.mounted_repositories()?;
        trace!("CVMFS mounts in {}: {repos:?}", self.opts.autofs_root.display());

        let mut report = TickReport {
            checked: repos.len(),
            ..Default::default()
        };

        for repo in repos {
            let mountpoint = self.mountpoint(&repo);
            match self.repo_needs_unmount(&repo).await {
                Ok(false) => {}
                Ok(true) => {
                    info!("{} is corrupted, unmounting", mountpoint.display());
                    if let Err(e) = mountutil::force_unmount(self.runner.as_ref(), &mountpoint).await {
                        error!(
                            "Failed to unmount {} during mount reconciliation: {e}",
                            mountpoint.display()
                        );
                        report.failed.push(repo);
                        continue;
                    }
                    report.unmounted.push(repo);
                }
                Err(e) => {
                    error!("Failed to reconcile {}: {e}", mountpoint.display());
                    report.failed.push(repo);
                }
            }
        }

        Ok(report)
    }
}
