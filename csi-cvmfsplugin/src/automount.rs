//! Bringing the autofs root up: host configuration, the automount daemon
//! and mount propagation of `/cvmfs`.

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info};

use crate::exec::{Cmd, CommandRunner, ExecError};
use crate::mountutil::{self, Kernel};

const AUTOFS_ROOT: &str = "/cvmfs";
const ALIEN_CACHE: &str = "/cvmfs-aliencache";
const AUTOFS_CONFIG: &str = "/etc/sysconfig/autofs";
/// Leave the idle timeout to the daemon's own configuration.
pub const DAEMON_DEFAULT_TIMEOUT: i64 = -1;

#[derive(Debug, Clone)]
pub struct AutomountOpts {
    pub autofs_root: PathBuf,
    /// Alien cache volume, made world-writable for the cvmfs user.
    pub alien_cache: Option<PathBuf>,
    /// Whether to run our own daemon, or rely on one already running on the
    /// host in a shared PID namespace.
    pub start_automount_daemon: bool,
    pub daemon_program: String,
    pub config_path: PathBuf,
    /// Number of autofs liveness checks before giving up.
    pub startup_timeout: u32,
    pub poll_interval: Duration,
    /// Seconds of inactivity before autofs unmounts a repository. `0` never
    /// unmounts, [`DAEMON_DEFAULT_TIMEOUT`] keeps the daemon default.
    pub unmount_after_idle: i64,
    pub log_level: LevelFilter,
}

impl Default for AutomountOpts {
    fn default() -> Self {
        Self {
            autofs_root: PathBuf::from(AUTOFS_ROOT),
            alien_cache: None,
            start_automount_daemon: true,
            daemon_program: "automount".to_string(),
            config_path: PathBuf::from(AUTOFS_CONFIG),
            startup_timeout: 5,
            poll_interval: Duration::from_secs(1),
            unmount_after_idle: DAEMON_DEFAULT_TIMEOUT,
            log_level: LevelFilter::INFO,
        }
    }
}

impl AutomountOpts {
    pub fn with_alien_cache(mut self, enabled: bool) -> Self {
        self.alien_cache = enabled.then(|| PathBuf::from(ALIEN_CACHE));
        self
    }
}

#[derive(Debug, Error)]
pub enum AutomountError {
    #[error("failed to chmod {path:?}: {source}")]
    AlienCache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to setup CVMFS config: {0}")]
    Setup(#[source] ExecError),

    #[error("failed to write autofs configuration to {path:?}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start automount daemon {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("statfs {path:?} failed: {source}")]
    Statfs {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("automount daemon failed during start-up: {0}")]
    DaemonExited(DaemonExit),

    #[error("timed-out while waiting for autofs to be mounted in {path:?} after {attempts} attempts")]
    Timeout { path: PathBuf, attempts: u32 },

    #[error("failed to share {path:?}: {source}")]
    MakeShared {
        path: PathBuf,
        #[source]
        source: ExecError,
    },
}

/// Contents of the autofs config file and the daemon's command line.
pub fn automount_config(opts: &AutomountOpts) -> (String, Vec<String>) {
    let mut conf = String::from("USE_MISC_DEVICE=\"yes\"\n");
    let mut args = vec!["--foreground".to_string()];

    if opts.log_level >= LevelFilter::DEBUG {
        args.push("--verbose".to_string());
    }
    if opts.log_level >= LevelFilter::TRACE {
        // -O is handed down to the cvmfs mounts
        args.extend(["-O".to_string(), "debug".to_string()]);
    }

    // The daemon ignores --timeout, only the config file is honoured.
    if opts.unmount_after_idle != DAEMON_DEFAULT_TIMEOUT {
        conf.push_str(&format!("TIMEOUT={}\n", opts.unmount_after_idle));
    }

    (conf, args)
}

/// How the automount daemon ended.
#[derive(Debug)]
pub struct DaemonExit {
    pub pid: u32,
    pub status: Result<ExitStatus, String>,
}

impl DaemonExit {
    pub fn success(&self) -> bool {
        matches!(&self.status, Ok(s) if s.success())
    }
}

impl fmt::Display for DaemonExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            Ok(status) => write!(f, "automount[{}] has exited: {status}", self.pid),
            Err(e) => write!(f, "automount[{}] could not be waited on: {e}", self.pid),
        }
    }
}

/// The supervised automount daemon. Resolves once, when the process ends.
#[derive(Debug)]
pub struct DaemonHandle {
    pub pid: u32,
    exit: oneshot::Receiver<DaemonExit>,
}

impl DaemonHandle {
    pub async fn wait(mut self) -> DaemonExit {
        self.exited().await
    }

    /// Resolves when the daemon exits. Must not be polled again after that.
    async fn exited(&mut self) -> DaemonExit {
        let pid = self.pid;
        (&mut self.exit).await.unwrap_or_else(|_| DaemonExit {
            pid,
            status: Err("supervisor task is gone".to_string()),
        })
    }
}

async fn drain_lines<R>(pid: u32, reader: Option<R>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!("automount[{pid}]: {line}"),
            Ok(None) => break,
            Err(e) => {
                error!("automount[{pid}]: failed to read output: {e}");
                break;
            }
        }
    }
}

/// Start `program` and supervise it until it exits, logging its output.
pub fn spawn_daemon(program: &str, args: &[String]) -> Result<DaemonHandle, AutomountError> {
    info!("Starting automount daemon prog={program} args={args:?}");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| AutomountError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let pid = child.id().unwrap_or_default();
    info!("Started automount daemon PID {pid}");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (_, _, status) = tokio::join!(
            drain_lines(pid, stdout),
            drain_lines(pid, stderr),
            child.wait()
        );
        let exit = DaemonExit {
            pid,
            status: status.map_err(|e| e.to_string()),
        };
        if exit.success() {
            info!("{exit}");
        } else {
            error!("automount[{pid}] has exited unexpectedly: {:?}", exit.status);
        }
        let _ = tx.send(exit);
    });

    Ok(DaemonHandle { pid, exit: rx })
}

pub struct AutomountManager {
    opts: AutomountOpts,
    runner: Arc<dyn CommandRunner>,
    kernel: Arc<dyn Kernel>,
}

impl AutomountManager {
    pub fn new(opts: AutomountOpts, runner: Arc<dyn CommandRunner>, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            opts,
            runner,
            kernel,
        }
    }

    /// Make the autofs root live and shared. Returns the daemon handle when
    /// the daemon is ours to run.
    pub async fn setup(&self) -> Result<Option<DaemonHandle>, AutomountError> {
        if let Some(cache) = &self.opts.alien_cache {
            tokio::fs::set_permissions(cache, std::fs::Permissions::from_mode(0o777))
                .await
                .map_err(|source| AutomountError::AlienCache {
                    path: cache.clone(),
                    source,
                })?;
        }

        self.runner
            .combined_output(&Cmd::new("cvmfs_config").arg("setup"))
            .await
            .map_err(AutomountError::Setup)?;

        let daemon = if self.opts.start_automount_daemon {
            let mut daemon = self.start_daemon().await?;
            tokio::select! {
                biased;
                res = self.wait_for_autofs() => res?,
                exit = daemon.exited() => return Err(AutomountError::DaemonExited(exit)),
            }
            Some(daemon)
        } else {
            info!("Not starting automount daemon, expecting one on the host");
            self.wait_for_autofs().await?;
            None
        };

        let root = &self.opts.autofs_root;
        mountutil::make_shared(self.runner.as_ref(), root)
            .await
            .map_err(|source| AutomountError::MakeShared {
                path: root.clone(),
                source,
            })?;

        info!("autofs is live in {}", root.display());
        Ok(daemon)
    }

    async fn start_daemon(&self) -> Result<DaemonHandle, AutomountError> {
        let (conf, args) = automount_config(&self.opts);
        tokio::fs::write(&self.opts.config_path, conf)
            .await
            .map_err(|source| AutomountError::WriteConfig {
                path: self.opts.config_path.clone(),
                source,
            })?;
        spawn_daemon(&self.opts.daemon_program, &args)
    }

    async fn wait_for_autofs(&self) -> Result<(), AutomountError> {
        let root = &self.opts.autofs_root;
        for attempt in 1..=self.opts.startup_timeout {
            let live = self
                .kernel
                .is_autofs(root)
                .map_err(|source| AutomountError::Statfs {
                    path: root.clone(),
                    source,
                })?;
            if live {
                return Ok(());
            }
            debug!("autofs not mounted in {} yet, attempt {attempt}", root.display());
            tokio::time::sleep(self.opts.poll_interval).await;
        }

        Err(AutomountError::Timeout {
            path: root.clone(),
            attempts: self.opts.startup_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let (conf, args) = automount_config(&AutomountOpts::default());
        assert_eq!(conf, "USE_MISC_DEVICE=\"yes\"\n");
        assert_eq!(args, vec!["--foreground"]);
    }

    #[test]
    fn test_config_timeout_and_verbosity() {
        let opts = AutomountOpts {
            unmount_after_idle: 0,
            log_level: LevelFilter::DEBUG,
            ..Default::default()
        };
        let (conf, args) = automount_config(&opts);
        assert_eq!(conf, "USE_MISC_DEVICE=\"yes\"\nTIMEOUT=0\n");
        assert_eq!(args, vec!["--foreground", "--verbose"]);

        let opts = AutomountOpts {
            unmount_after_idle: 300,
            log_level: LevelFilter::TRACE,
            ..Default::default()
        };
        let (conf, args) = automount_config(&opts);
        assert_eq!(conf, "USE_MISC_DEVICE=\"yes\"\nTIMEOUT=300\n");
        assert_eq!(args, vec!["--foreground", "--verbose", "-O", "debug"]);
    }

    #[test]
    fn test_alien_cache_path() {
        let opts = AutomountOpts::default().with_alien_cache(true);
        assert_eq!(opts.alien_cache, Some(PathBuf::from("/cvmfs-aliencache")));
        let opts = opts.with_alien_cache(false);
        assert_eq!(opts.alien_cache, None);
    }
}
