use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::level_filters::LevelFilter;

use crate::automount::{AutomountOpts, DAEMON_DEFAULT_TIMEOUT};
use crate::driver::{DEFAULT_DRIVER_NAME, DEFAULT_ENDPOINT, DriverOpts, ServiceRole};

#[derive(Parser, Debug)]
#[command(name = "csi-cvmfsplugin", version, about = "CVMFS CSI plugin", long_about = None)]
pub struct Args {
    /// CSI endpoint
    #[arg(long, env = "CVMFS_CSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Name of the driver
    #[arg(long = "drivername", env = "CVMFS_CSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    pub driver_name: String,

    /// Node id
    #[arg(long = "nodeid", env = "CVMFS_CSI_NODE_ID", default_value = "")]
    pub node_id: String,

    /// Enable driver service role (comma-separated list or repeated --role flags)
    #[arg(long = "role", env = "CVMFS_CSI_ROLES", value_enum, value_delimiter = ',')]
    pub roles: Vec<ServiceRole>,

    /// CVMFS client is using alien cache volume
    #[arg(long, env = "CVMFS_CSI_HAS_ALIEN_CACHE")]
    pub has_alien_cache: bool,

    /// Start automount daemon when initializing CVMFS CSI driver
    #[arg(
        long,
        env = "CVMFS_CSI_START_AUTOMOUNT_DAEMON",
        action = ArgAction::Set,
        default_value_t = true
    )]
    pub start_automount_daemon: bool,

    /// Number of seconds to wait for automount daemon to start up before exiting
    #[arg(long, env = "CVMFS_CSI_AUTOMOUNT_STARTUP_TIMEOUT", default_value_t = 5)]
    pub automount_startup_timeout: u32,

    /// Number of seconds of idle time after which an autofs-managed CVMFS
    /// mount will be unmounted. '0' means never unmount, '-1' leaves
    /// automount default option
    #[arg(
        long,
        env = "CVMFS_CSI_AUTOMOUNT_UNMOUNT_TIMEOUT",
        default_value_t = DAEMON_DEFAULT_TIMEOUT,
        allow_negative_numbers = true
    )]
    pub automount_unmount_timeout: i64,

    /// Seconds between two mount reconciliation passes
    #[arg(long, env = "CVMFS_CSI_MOUNT_RECONCILE_PERIOD", default_value_t = 30)]
    pub mount_reconcile_period: u64,

    /// Seconds to wait for cvmfs_talk to answer
    #[arg(long, env = "CVMFS_CSI_CVMFS_TALK_TIMEOUT", default_value_t = 10)]
    pub cvmfs_talk_timeout: u64,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "CVMFS_CSI_LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

impl Args {
    /// `active_level` is the most verbose level the installed subscriber
    /// enables, which `RUST_LOG` may have raised above `--log-level`. The
    /// automount daemon's verbosity follows it.
    pub fn driver_opts(&self, active_level: LevelFilter) -> DriverOpts {
        let automount = AutomountOpts {
            start_automount_daemon: self.start_automount_daemon,
            startup_timeout: self.automount_startup_timeout,
            unmount_after_idle: self.automount_unmount_timeout,
            log_level: active_level,
            ..Default::default()
        }
        .with_alien_cache(self.has_alien_cache);

        DriverOpts {
            driver_name: self.driver_name.clone(),
            endpoint: self.endpoint.clone(),
            node_id: self.node_id.clone(),
            roles: self.roles.clone(),
            automount,
            reconcile_period: Duration::from_secs(self.mount_reconcile_period),
            talk_timeout: Duration::from_secs(self.cvmfs_talk_timeout),
        }
    }
}
