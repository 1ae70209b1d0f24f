//! fleetlab backend contract
//!
//! Provider-neutral model and operations for managing groups of database
//! nodes (clusters) and client machines on Docker, AWS or GCP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  fleetlab CLI                    │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               fleetlab-backend                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  Fleet (create/grow/destroy/start/stop)  │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐   │
//! │  │ Inventory  │ │ RemoteExec │ │  Expiry    │   │
//! │  └────────────┘ └────────────┘ └────────────┘   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait FleetBackend { ... }              │   │
//! │  └──────────────────────────────────────────┘   │
//! └───────┬─────────────────┬───────────────┬───────┘
//!         │                 │               │
//! ┌───────▼───────┐ ┌───────▼──────┐ ┌──────▼───────┐
//! │    docker     │ │     aws      │ │     gcp      │
//! │   (bollard)   │ │  (aws CLI)   │ │ (gcloud CLI) │
//! └───────────────┘ └──────────────┘ └──────────────┘
//! ```

pub mod context;
pub mod error;
pub mod executor;
pub mod expiry;
pub mod fleet;
pub mod inventory;
pub mod model;
pub mod provider;
pub mod remote;
pub mod selector;
pub mod ssh;
pub mod tags;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

// Re-exports
pub use context::ExecutionContext;
pub use error::{FleetError, NodeFailure, PartialFailure, Result};
pub use executor::{DEFAULT_PARALLEL_THREADS, collect_node_results, for_each_node, map_limit};
pub use expiry::{SweepReport, sweep_expired};
pub use fleet::{CreateGroup, Fleet};
pub use inventory::{Inventory, InventoryItem, InventoryRequest, InventorySnapshot};
pub use model::*;
pub use provider::{
    AwsExtra, BackendKind, DeployRequest, DockerExtra, FileStream, FileUpload, FleetBackend,
    GcpExtra, NodeOutput, ProviderExtra, RetryConfig, RunFailure,
};
pub use remote::RemoteExec;
pub use selector::NodeSelector;
pub use ssh::SshTransport;
