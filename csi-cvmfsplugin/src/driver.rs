//! Plugin start-up: option validation, host preparation for the node role
//! and the gRPC server carrying the enabled services.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use libcsi::v1::controller_server::ControllerServer;
use libcsi::v1::identity_server::IdentityServer;
use libcsi::v1::node_server::NodeServer;
use libcsi::{CallCounter, Endpoint, ServerError};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::signal;
use tokio::task::JoinHandle;
use tonic::service::RoutesBuilder;
use tracing::{debug, error, info};

use crate::automount::{AutomountError, AutomountManager, AutomountOpts};
use crate::controller::ControllerService;
use crate::exec::{Cmd, CommandRunner, ExecError, Executor};
use crate::identity::IdentityService;
use crate::mountutil::{HostKernel, Kernel};
use crate::node::NodeService;
use crate::reconciler::{Reconciler, ReconcilerOpts};

pub const DEFAULT_DRIVER_NAME: &str = "cvmfs.csi.cern.ch";
pub const DEFAULT_ENDPOINT: &str = "unix:///var/lib/kubelet/plugins/cvmfs.csi.cern.ch/csi.sock";
const MAX_DRIVER_NAME_LEN: usize = 63;

static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ServiceRole {
    Identity,
    Node,
    Controller,
}

#[derive(Debug, Clone)]
pub struct DriverOpts {
    /// Advertised through GetPluginInfo.
    pub driver_name: String,
    pub endpoint: String,
    pub node_id: String,
    pub roles: Vec<ServiceRole>,
    pub automount: AutomountOpts,
    pub reconcile_period: Duration,
    pub talk_timeout: Duration,
}

impl Default for DriverOpts {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            node_id: String::new(),
            roles: Vec::new(),
            automount: AutomountOpts::default(),
            reconcile_period: Duration::from_secs(30),
            talk_timeout: Duration::from_secs(10),
        }
    }
}

impl DriverOpts {
    pub fn has_role(&self, role: ServiceRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn validate(&self) -> Result<(), DriverError> {
        let invalid = |msg: String| Err(DriverError::InvalidOpts(msg));

        if self.driver_name.is_empty() {
            return invalid("drivername is a required parameter".to_string());
        }
        if self.driver_name.len() > MAX_DRIVER_NAME_LEN {
            return invalid(format!(
                "driver name too long: is {} characters, maximum is {MAX_DRIVER_NAME_LEN}",
                self.driver_name.len()
            ));
        }
        if !DNS1123_SUBDOMAIN.is_match(&self.driver_name.to_lowercase()) {
            return invalid(format!(
                "driver name {:?} is invalid: must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character",
                self.driver_name
            ));
        }
        if self.endpoint.is_empty() {
            return invalid("endpoint is a required parameter".to_string());
        }
        Endpoint::parse(&self.endpoint)?;
        if self.node_id.is_empty() {
            return invalid("nodeid is a required parameter".to_string());
        }
        if self.roles.is_empty() {
            return invalid("at least one service role is required".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid driver options: {0}")]
    InvalidOpts(String),

    #[error("failed to get CVMFS version: {0}")]
    Version(#[source] ExecError),

    #[error(transparent)]
    Automount(#[from] AutomountError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("automount daemon is gone: {0}")]
    DaemonExited(String),
}

pub struct Driver {
    opts: DriverOpts,
    runner: Arc<dyn CommandRunner>,
    kernel: Arc<dyn Kernel>,
}

impl Driver {
    pub fn new(opts: DriverOpts) -> Result<Self, DriverError> {
        Self::with_host(opts, Arc::new(Executor::default()), Arc::new(HostKernel))
    }

    /// Like [`Driver::new`], with the given host access.
    pub fn with_host(
        opts: DriverOpts,
        runner: Arc<dyn CommandRunner>,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Self, DriverError> {
        opts.validate()?;
        Ok(Self {
            opts,
            runner,
            kernel,
        })
    }

    /// Serve until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<(), DriverError> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves. Fails as soon as the automount
    /// daemon started by this driver exits.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), DriverError>
    where
        F: Future<Output = ()> + Send,
    {
        info!("Driver: {}", self.opts.driver_name);
        info!("Version: {}", env!("CARGO_PKG_VERSION"));

        let endpoint = Endpoint::parse(&self.opts.endpoint)?;
        let mut routes = RoutesBuilder::default();

        if self.opts.has_role(ServiceRole::Identity) {
            debug!("Registering Identity server");
            routes.add_service(IdentityServer::new(IdentityService::new(
                self.opts.driver_name.clone(),
                self.opts.has_role(ServiceRole::Controller),
            )));
        }

        let mut daemon = None;
        let mut reconciler: Option<JoinHandle<()>> = None;
        if self.opts.has_role(ServiceRole::Node) {
            let version = self.cvmfs_version().await?;
            info!("{version}");

            let manager = AutomountManager::new(
                self.opts.automount.clone(),
                self.runner.clone(),
                self.kernel.clone(),
            );
            daemon = manager.setup().await?;

            let reconcile_opts = ReconcilerOpts {
                period: self.opts.reconcile_period,
                autofs_root: self.opts.automount.autofs_root.clone(),
                talk_timeout: self.opts.talk_timeout,
            };
            let task = Reconciler::new(reconcile_opts, self.runner.clone(), self.kernel.clone());
            reconciler = Some(tokio::spawn(task.run()));

            debug!("Registering Node server");
            routes.add_service(NodeServer::new(NodeService::new(
                self.opts.node_id.clone(),
                self.opts.automount.autofs_root.clone(),
                self.runner.clone(),
                self.kernel.clone(),
            )));
        }

        if self.opts.has_role(ServiceRole::Controller) {
            debug!("Registering Controller server");
            routes.add_service(ControllerServer::new(ControllerService::new()));
        }

        let daemon_exit = async move {
            match daemon {
                Some(handle) => handle.wait().await,
                None => std::future::pending().await,
            }
        };

        let counter = Arc::new(CallCounter::default());
        let res = tokio::select! {
            res = libcsi::serve(&endpoint, routes.routes(), counter, shutdown) => res.map_err(DriverError::from),
            exit = daemon_exit => Err(DriverError::DaemonExited(exit.to_string())),
        };

        if let Some(task) = reconciler {
            task.abort();
        }
        res
    }

    async fn cvmfs_version(&self) -> Result<String, DriverError> {
        let out = self
            .runner
            .combined_output(&Cmd::new("cvmfs2").arg("--version"))
            .await
            .map_err(DriverError::Version)?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down...");
}
