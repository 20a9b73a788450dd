use libcsi::v1::volume_capability::access_mode::Mode;
use libcsi::v1::{NodePublishVolumeRequest, NodeUnpublishVolumeRequest, VolumeCapability};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tonic::Status;

/// Volume context key selecting a single repository.
pub const REPOSITORY_PARAM: &str = "repository";

/// Volume context keys that may only be set at provisioning time.
const UNSUPPORTED_VOLUME_PARAMS: [&str; 2] = ["hash", "tag"];

/// Repository names are fully qualified, e.g. `atlas.cern.ch`. A name is
/// joined onto the autofs root, so it must stay a single path component.
static REPOSITORY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([-_A-Za-z0-9]*[A-Za-z0-9])?(\.[A-Za-z0-9]([-_A-Za-z0-9]*[A-Za-z0-9])?)*$")
        .expect("static regex")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("volume ID missing in request")]
    MissingVolumeId,
    #[error("target path missing in request")]
    MissingTargetPath,
    #[error("volume capability missing in request")]
    MissingCapability,
    #[error("volume access type Block is unsupported")]
    BlockAccess,
    #[error("volume access type must by Mount")]
    NotMount,
    #[error("volume access mode must be ReadOnlyMany")]
    AccessMode,
    #[error("volume parameter {0} is not supported")]
    UnsupportedParameter(String),
    #[error("invalid repository name {0:?}")]
    InvalidRepository(String),
}

impl From<InvalidRequest> for Status {
    fn from(e: InvalidRequest) -> Self {
        Status::invalid_argument(e.to_string())
    }
}

pub fn validate_capability(cap: &VolumeCapability) -> Result<(), InvalidRequest> {
    if cap.is_block() {
        return Err(InvalidRequest::BlockAccess);
    }
    if !cap.is_mount() {
        return Err(InvalidRequest::NotMount);
    }
    if cap.mode() != Mode::MultiNodeReaderOnly {
        return Err(InvalidRequest::AccessMode);
    }
    Ok(())
}

/// Overrides are rejected before anything else is looked at.
pub fn validate_publish(req: &NodePublishVolumeRequest) -> Result<(), InvalidRequest> {
    for param in UNSUPPORTED_VOLUME_PARAMS {
        if req.volume_context.contains_key(param) {
            return Err(InvalidRequest::UnsupportedParameter(param.to_string()));
        }
    }
    if req.volume_id.is_empty() {
        return Err(InvalidRequest::MissingVolumeId);
    }
    if req.target_path.is_empty() {
        return Err(InvalidRequest::MissingTargetPath);
    }
    let cap = req
        .volume_capability
        .as_ref()
        .ok_or(InvalidRequest::MissingCapability)?;
    validate_capability(cap)?;

    match req.volume_context.get(REPOSITORY_PARAM) {
        Some(repo) if !repo.is_empty() && !REPOSITORY_NAME.is_match(repo) => {
            Err(InvalidRequest::InvalidRepository(repo.clone()))
        }
        _ => Ok(()),
    }
}

pub fn validate_unpublish(req: &NodeUnpublishVolumeRequest) -> Result<(), InvalidRequest> {
    if req.volume_id.is_empty() {
        return Err(InvalidRequest::MissingVolumeId);
    }
    if req.target_path.is_empty() {
        return Err(InvalidRequest::MissingTargetPath);
    }
    Ok(())
}
