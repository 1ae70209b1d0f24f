//! GCP backend error types

use fleetlab_backend::FleetError;
use thiserror::Error;

pub const PROVIDER: &str = "gcp";

#[derive(Error, Debug)]
pub enum GcpError {
    #[error("gcloud CLI not found. Install it: https://cloud.google.com/sdk/docs/install")]
    CliNotFound,

    #[error("gcloud {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unexpected gcloud output: {0}")]
    UnexpectedOutput(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

const NOT_FOUND_MARKERS: [&str; 4] = ["was not found", "NOT_FOUND", "notFound", "does not exist"];

const THROTTLE_MARKERS: [&str; 4] = [
    "rateLimitExceeded",
    "RESOURCE_EXHAUSTED",
    "Quota exceeded for quota metric",
    "Error 429",
];

impl GcpError {
    pub fn is_not_found(&self) -> bool {
        match self {
            GcpError::CommandFailed { stderr, .. } => {
                NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m))
            }
            GcpError::Fleet(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, GcpError::CommandFailed { stderr, .. }
            if THROTTLE_MARKERS.iter().any(|m| stderr.contains(m)))
    }
}

impl From<GcpError> for FleetError {
    fn from(err: GcpError) -> Self {
        match err {
            GcpError::Fleet(e) => e,
            GcpError::Io(e) => FleetError::Io(e),
            GcpError::Json(e) => FleetError::Json(e),
            other => FleetError::backend(PROVIDER, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GcpError>;

/// `Ok(None)` when the resource does not exist
pub fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> GcpError {
        GcpError::CommandFailed {
            command: "compute instances".to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_classification() {
        let missing = failed(
            "ERROR: (gcloud.compute.instances.describe) Could not fetch resource:\n - The resource 'projects/p/zones/us-central1-a/instances/x' was not found",
        );
        assert!(missing.is_not_found());
        assert!(!missing.is_throttled());

        let throttled = failed("ERROR: (gcloud.compute.instances.list) Quota exceeded for quota metric 'Read requests'");
        assert!(throttled.is_throttled());
        assert!(!throttled.is_not_found());

        assert!(ignore_not_found::<()>(Err(missing)).unwrap().is_none());
        assert!(ignore_not_found::<()>(Err(throttled)).is_err());
    }

    #[test]
    fn test_into_fleet_error() {
        let err: FleetError = failed("PERMISSION_DENIED").into();
        assert!(matches!(err, FleetError::Backend { ref provider, .. } if provider == "gcp"));

        let err: FleetError = GcpError::Fleet(FleetError::not_found("disk", "data")).into();
        assert!(err.is_not_found());
    }
}
