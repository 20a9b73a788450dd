//! # libcsi: CSI v1 plumbing for rk8s storage plugins
//!
//! | Module | Purpose |
//! |---|---|
//! | [`proto`] | prost messages of the `csi.v1` package. |
//! | [`v1`] | Messages plus the generated `Identity`, `Controller` and `Node` service traits, servers and clients. |
//! | [`server`] | UNIX domain socket endpoint handling and the call-logging gRPC server. |

pub mod proto;
pub mod server;

/// The `csi.v1` package: messages and generated services.
pub mod v1 {
    pub use crate::proto::*;

    include!(concat!(env!("OUT_DIR"), "/csi.v1.Identity.rs"));
    include!(concat!(env!("OUT_DIR"), "/csi.v1.Controller.rs"));
    include!(concat!(env!("OUT_DIR"), "/csi.v1.Node.rs"));
}

pub use server::{CallCounter, Endpoint, ServerError, serve};
