//! GCP backend for fleetlab
//!
//! Drives Compute Engine, Cloud Scheduler and Cloud Functions through the
//! `gcloud` CLI, reusing whatever account and project the user's shell is
//! configured with.
//!
//! - Nodes are VM instances named `fleetlab-<group>-<s|c>-<node>`; the exact
//!   fleetlab tags live in instance metadata, lowercased copies in labels
//! - Templates are images labelled `fleetlab-template=true`
//! - Firewalls are VPC firewall rules, volumes are persistent disks
//! - The expiry system is a Cloud Scheduler job calling a Cloud Function

pub mod backend;
pub mod cli;
pub mod convert;
pub mod error;
pub mod expiry;
pub mod types;

pub use backend::{GcpBackend, GcpSettings};
pub use cli::GcloudCli;
pub use error::{GcpError, Result};
