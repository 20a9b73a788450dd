//! CSI Node service: publishing CVMFS repositories into Pod volume paths.
//!
//! Every call probes the kernel mount table before touching anything, so a
//! retried call after a partial failure converges instead of stacking mounts.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libcsi::v1::node_server::Node;
use libcsi::v1::*;
use tokio::fs::DirBuilder;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::exec::CommandRunner;
use crate::locks::{VolumeGuard, VolumeLocks};
use crate::mountutil::{self, Kernel, MountState};
use crate::validation::{REPOSITORY_PARAM, validate_publish, validate_unpublish};

pub struct NodeService {
    node_id: String,
    autofs_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    kernel: Arc<dyn Kernel>,
    locks: VolumeLocks,
}

impl NodeService {
    pub fn new(
        node_id: impl Into<String>,
        autofs_root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        kernel: Arc<dyn Kernel>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            autofs_root: autofs_root.into(),
            runner,
            kernel,
            locks: VolumeLocks::default(),
        }
    }

    fn lock(&self, volume_id: &str) -> Result<VolumeGuard, Status> {
        self.locks.try_acquire(volume_id).ok_or_else(|| {
            Status::aborted(format!(
                "an operation with the given volume id {volume_id} already exists"
            ))
        })
    }

    fn probe(&self, target: &Path) -> Result<MountState, Status> {
        mountutil::mount_state(self.kernel.as_ref(), target).map_err(|e| {
            Status::internal(format!(
                "failed to probe mountpoint {}: {} ({e})",
                target.display(),
                MountState::Unknown
            ))
        })
    }

    async fn do_mount(&self, req: &NodePublishVolumeRequest, target: &Path) -> Result<(), Status> {
        let res = match req.volume_context.get(REPOSITORY_PARAM).filter(|r| !r.is_empty()) {
            Some(repository) => {
                let source = self.autofs_root.join(repository);
                mountutil::bind_mount(self.runner.as_ref(), &source, target).await
            }
            None => {
                mountutil::slave_recursive_bind(self.runner.as_ref(), &self.autofs_root, target)
                    .await
            }
        };
        res.map_err(|e| Status::internal(format!("failed to bind mount: {e}")))
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        validate_publish(&req)?;
        let _guard = self.lock(&req.volume_id)?;

        let target = Path::new(&req.target_path);
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(target)
            .await
            .map_err(|e| {
                Status::internal(format!(
                    "failed to create mountpoint directory at {}: {e}",
                    target.display()
                ))
            })?;

        match self.probe(target)? {
            MountState::NotMounted => {
                self.do_mount(&req, target).await?;
                info!("Published volume {} at {}", req.volume_id, target.display());
            }
            MountState::Mounted => {
                debug!("Volume {} already published at {}", req.volume_id, target.display());
            }
            state => {
                return Err(Status::internal(format!(
                    "unexpected mountpoint state in {}: expected {} or {}, got {state}",
                    target.display(),
                    MountState::NotMounted,
                    MountState::Mounted
                )));
            }
        }

        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        validate_unpublish(&req)?;
        let _guard = self.lock(&req.volume_id)?;

        let target = Path::new(&req.target_path);
        if self.probe(target)? != MountState::NotMounted {
            mountutil::recursive_unmount(self.runner.as_ref(), target)
                .await
                .map_err(|e| {
                    Status::internal(format!("failed to unmount {}: {e}", target.display()))
                })?;
        }

        match tokio::fs::remove_dir(target).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Status::internal(format!(
                    "failed to remove {}: {e}",
                    target.display()
                )));
            }
        }

        info!("Unpublished volume {} from {}", req.volume_id, target.display());
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_stage_volume(
        &self,
        _request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            ..Default::default()
        }))
    }
}
