use tonic_build::manual::{Builder, Method, Service};

/// Unary method whose messages live in `crate::proto`.
fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{input}"))
        .output_type(format!("crate::proto::{output}"))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn service(name: &str, methods: Vec<Method>) -> Service {
    methods
        .into_iter()
        .fold(Service::builder().name(name).package("csi.v1"), |b, m| {
            b.method(m)
        })
        .build()
}

fn main() {
    let identity = service(
        "Identity",
        vec![
            unary(
                "get_plugin_info",
                "GetPluginInfo",
                "GetPluginInfoRequest",
                "GetPluginInfoResponse",
            ),
            unary(
                "get_plugin_capabilities",
                "GetPluginCapabilities",
                "GetPluginCapabilitiesRequest",
                "GetPluginCapabilitiesResponse",
            ),
            unary("probe", "Probe", "ProbeRequest", "ProbeResponse"),
        ],
    );

    // Controller RPCs missing here are answered with UNIMPLEMENTED by the router.
    let controller = service(
        "Controller",
        vec![
            unary(
                "create_volume",
                "CreateVolume",
                "CreateVolumeRequest",
                "CreateVolumeResponse",
            ),
            unary(
                "delete_volume",
                "DeleteVolume",
                "DeleteVolumeRequest",
                "DeleteVolumeResponse",
            ),
            unary(
                "validate_volume_capabilities",
                "ValidateVolumeCapabilities",
                "ValidateVolumeCapabilitiesRequest",
                "ValidateVolumeCapabilitiesResponse",
            ),
            unary(
                "controller_get_capabilities",
                "ControllerGetCapabilities",
                "ControllerGetCapabilitiesRequest",
                "ControllerGetCapabilitiesResponse",
            ),
        ],
    );

    let node = service(
        "Node",
        vec![
            unary(
                "node_stage_volume",
                "NodeStageVolume",
                "NodeStageVolumeRequest",
                "NodeStageVolumeResponse",
            ),
            unary(
                "node_unstage_volume",
                "NodeUnstageVolume",
                "NodeUnstageVolumeRequest",
                "NodeUnstageVolumeResponse",
            ),
            unary(
                "node_publish_volume",
                "NodePublishVolume",
                "NodePublishVolumeRequest",
                "NodePublishVolumeResponse",
            ),
            unary(
                "node_unpublish_volume",
                "NodeUnpublishVolume",
                "NodeUnpublishVolumeRequest",
                "NodeUnpublishVolumeResponse",
            ),
            unary(
                "node_get_volume_stats",
                "NodeGetVolumeStats",
                "NodeGetVolumeStatsRequest",
                "NodeGetVolumeStatsResponse",
            ),
            unary(
                "node_expand_volume",
                "NodeExpandVolume",
                "NodeExpandVolumeRequest",
                "NodeExpandVolumeResponse",
            ),
            unary(
                "node_get_capabilities",
                "NodeGetCapabilities",
                "NodeGetCapabilitiesRequest",
                "NodeGetCapabilitiesResponse",
            ),
            unary(
                "node_get_info",
                "NodeGetInfo",
                "NodeGetInfoRequest",
                "NodeGetInfoResponse",
            ),
        ],
    );

    Builder::new()
        .build_server(true)
        .build_client(true)
        .compile(&[identity, controller, node]);
}
