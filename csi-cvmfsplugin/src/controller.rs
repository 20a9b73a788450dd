//! CSI Controller service. CVMFS volumes have no backing storage to
//! provision, so this only hands out volume ids.

use libcsi::v1::controller_server::Controller;
use libcsi::v1::controller_service_capability::rpc;
use libcsi::v1::validate_volume_capabilities_response::Confirmed;
use libcsi::v1::volume_capability::access_mode::Mode;
use libcsi::v1::*;
use tonic::{Request, Response, Status};
use tracing::info;
use uuid::Uuid;

use crate::validation::validate_capability;

#[derive(Debug, Default)]
pub struct ControllerService;

impl ControllerService {
    pub fn new() -> Self {
        Self
    }
}

fn new_volume_id(name: &str) -> String {
    format!("csi-cvmfs-{name}-{}", Uuid::new_v4())
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("volume name cannot be empty"));
        }
        for cap in &req.volume_capabilities {
            validate_capability(cap)?;
        }

        let volume_id = new_volume_id(&req.name);
        info!("Assigned new volume ID {volume_id} to volume {}", req.name);

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: req.capacity_range.map(|r| r.required_bytes).unwrap_or(0),
                volume_id,
                volume_context: req.parameters,
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        if request.get_ref().volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume capabilities missing in request"));
        }

        if let Some(e) = req
            .volume_capabilities
            .iter()
            .find_map(|cap| validate_capability(cap).err())
        {
            return Ok(Response::new(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: e.to_string(),
            }));
        }

        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: vec![VolumeCapability::mount(Mode::MultiNodeReaderOnly)],
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![ControllerServiceCapability::rpc(
                rpc::Type::CreateDeleteVolume,
            )],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tonic::Code;

    #[test]
    fn test_volume_id_format() {
        let id = new_volume_id("pvc-1");
        let uuid = id.strip_prefix("csi-cvmfs-pvc-1-").unwrap();
        assert!(Uuid::parse_str(uuid).is_ok());
        assert_ne!(new_volume_id("pvc-1"), id);
    }

    #[tokio::test]
    async fn test_create_volume() {
        let controller = ControllerService::new();
        let params = HashMap::from([("repository".to_string(), "atlas.cern.ch".to_string())]);
        let volume = controller
            .create_volume(Request::new(CreateVolumeRequest {
                name: "pvc-1".to_string(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 1024,
                    limit_bytes: 0,
                }),
                volume_capabilities: vec![VolumeCapability::mount(Mode::MultiNodeReaderOnly)],
                parameters: params.clone(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        assert!(volume.volume_id.starts_with("csi-cvmfs-pvc-1-"));
        assert_eq!(volume.capacity_bytes, 1024);
        assert_eq!(volume.volume_context, params);
    }

    #[tokio::test]
    async fn test_create_volume_rejects_bad_input() {
        let controller = ControllerService::new();
        let err = controller
            .create_volume(Request::new(CreateVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = controller
            .create_volume(Request::new(CreateVolumeRequest {
                name: "pvc-1".to_string(),
                volume_capabilities: vec![VolumeCapability::mount(Mode::SingleNodeWriter)],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_validate_volume_capabilities() {
        let controller = ControllerService::new();
        let resp = controller
            .validate_volume_capabilities(Request::new(ValidateVolumeCapabilitiesRequest {
                volume_id: "vol".to_string(),
                volume_capabilities: vec![VolumeCapability::mount(Mode::MultiNodeReaderOnly)],
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.confirmed.is_some());

        let resp = controller
            .validate_volume_capabilities(Request::new(ValidateVolumeCapabilitiesRequest {
                volume_id: "vol".to_string(),
                volume_capabilities: vec![VolumeCapability::block(Mode::MultiNodeReaderOnly)],
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.confirmed.is_none());
        assert_eq!(resp.message, "volume access type Block is unsupported");
    }
}
