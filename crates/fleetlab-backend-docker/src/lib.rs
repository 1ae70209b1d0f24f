//! Docker backend for fleetlab
//!
//! Runs every node as a long-lived container on one Docker engine.
//!
//! - Groups and nodes are containers named `fleetlab-<group>_<node>`
//!   (clients: `fleetlab_c-<group>_<node>`) and carry the fleetlab tag set
//!   as container labels
//! - Templates are committed images `fleetlab-<distro>_<version>_<arch>:<tag>`
//! - Firewalls map to Docker networks, volumes to Docker volumes
//! - Labels cannot change after creation, so relabeling and expiry updates
//!   are unsupported; expired containers are removed by `fleetlab expiry run`

pub mod archive;
pub mod backend;
pub mod converter;
pub mod error;
pub mod exec;
pub mod naming;

pub use backend::DockerBackend;
pub use error::{DockerError, Result};
