//! AWS backend for fleetlab
//!
//! Drives EC2, EFS, IAM, Lambda and EventBridge Scheduler through the `aws`
//! CLI, so credentials, profiles and SSO work exactly as they do for the
//! user's own shell.
//!
//! - Nodes are EC2 instances; all fleetlab metadata lives in EC2 tags
//! - Templates are self-owned AMIs tagged `fleetlab-template=true`
//! - Firewalls are security groups, volumes are EFS file systems
//! - The expiry system is a scheduled Lambda function

pub mod backend;
pub mod cli;
pub mod convert;
pub mod error;
pub mod expiry;
pub mod types;

pub use backend::{AwsBackend, AwsSettings};
pub use cli::AwsCli;
pub use error::{AwsError, Result};
