//! Fleet backend error types

use crate::model::NodeNo;
use std::fmt;
use thiserror::Error;

/// Errors returned by every layer of the fleet backend
#[derive(Error, Debug)]
pub enum FleetError {
    /// A precondition failed locally. Never retried.
    #[error("{0}")]
    Validation(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The provider control plane rejected or failed a call
    #[error("{provider} backend error: {message}")]
    Backend { provider: String, message: String },

    #[error(transparent)]
    PartialFailure(#[from] PartialFailure),

    #[error("command failed on {group} node {node}: {message}")]
    CommandFailed {
        group: String,
        node: NodeNo,
        message: String,
    },

    #[error("{operation} is not supported by the {provider} backend")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn backend(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(provider: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            operation,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// One failed node inside a fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub group: String,
    pub node: NodeNo,
    pub message: String,
}

/// Aggregate of a fan-out where at least one node failed.
///
/// The message lists every failing node with its cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFailure {
    pub operation: String,
    pub attempted: usize,
    pub failures: Vec<NodeFailure>,
}

impl PartialFailure {
    pub fn failed_nodes(&self) -> Vec<NodeNo> {
        self.failures.iter().map(|f| f.node).collect()
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed on {} of {} nodes",
            self.operation,
            self.failures.len(),
            self.attempted
        )?;
        for failure in &self.failures {
            write!(
                f,
                "\n  {} node {}: {}",
                failure.group, failure.node, failure.message
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailure {}

pub type Result<T> = std::result::Result<T, FleetError>;
