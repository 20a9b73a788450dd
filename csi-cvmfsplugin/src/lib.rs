//! CVMFS CSI node plugin.
//!
//! Exposes CernVM-FS repositories, served through an autofs root at
//! `/cvmfs`, as read-only Kubernetes volumes.
//!
//! | Module | Role |
//! |--------|------|
//! | [`exec`] | external commands with correlation ids |
//! | [`mountutil`] | mount table probing, mount and umount primitives |
//! | [`automount`] | autofs root set-up and the supervised automount daemon |
//! | [`reconciler`] | periodic repair of mounts whose client died |
//! | [`node`] | `NodePublishVolume` / `NodeUnpublishVolume` |
//! | [`controller`], [`identity`] | the remaining CSI services |
//! | [`driver`] | start-up and serving |

pub mod automount;
pub mod cli;
pub mod controller;
pub mod driver;
pub mod exec;
pub mod identity;
pub mod locks;
pub mod mountutil;
pub mod node;
pub mod reconciler;
pub mod validation;
