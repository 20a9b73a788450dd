use libcsi::v1::identity_server::Identity;
use libcsi::v1::plugin_capability::{self, service};
use libcsi::v1::*;
use tonic::{Request, Response, Status};

pub struct IdentityService {
    driver_name: String,
    has_controller: bool,
}

impl IdentityService {
    pub fn new(driver_name: impl Into<String>, has_controller: bool) -> Self {
        Self {
            driver_name: driver_name.into(),
            has_controller,
        }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let mut capabilities = Vec::new();
        if self.has_controller {
            capabilities.push(PluginCapability {
                r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
                    r#type: service::Type::ControllerService as i32,
                })),
            });
        }
        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_controller_capability_follows_role() {
        let with = IdentityService::new("cvmfs.csi.cern.ch", true);
        let caps = with
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;
        assert_eq!(caps.len(), 1);

        let without = IdentityService::new("cvmfs.csi.cern.ch", false);
        let caps = without
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner()
            .capabilities;
        assert!(caps.is_empty());
    }

    #[tokio::test]
    async fn test_plugin_info() {
        let identity = IdentityService::new("cvmfs.csi.cern.ch", false);
        let info = identity
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.name, "cvmfs.csi.cern.ch");
        assert_eq!(info.vendor_version, env!("CARGO_PKG_VERSION"));

        let probe = identity.probe(Request::new(ProbeRequest {})).await.unwrap();
        assert_eq!(probe.into_inner().ready, Some(true));
    }
}
