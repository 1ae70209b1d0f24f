//! AWS backend error types

use fleetlab_backend::FleetError;
use thiserror::Error;

pub const PROVIDER: &str = "aws";

#[derive(Error, Debug)]
pub enum AwsError {
    #[error("aws CLI not found. Install it: https://aws.amazon.com/cli/")]
    CliNotFound,

    #[error("aws {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unexpected aws output: {0}")]
    UnexpectedOutput(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

/// Error codes AWS returns for missing resources
const NOT_FOUND_CODES: [&str; 8] = [
    "NotFound",
    "InvalidInstanceID.NotFound",
    "InvalidAMIID.NotFound",
    "InvalidGroup.NotFound",
    "FileSystemNotFound",
    "ResourceNotFoundException",
    "NoSuchEntity",
    "does not exist",
];

impl AwsError {
    /// The CLI reported that the addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            AwsError::CommandFailed { stderr, .. } => {
                NOT_FOUND_CODES.iter().any(|code| stderr.contains(code))
            }
            AwsError::Fleet(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, AwsError::CommandFailed { stderr, .. } if is_throttling(stderr))
    }

    pub fn stderr_contains(&self, needle: &str) -> bool {
        matches!(self, AwsError::CommandFailed { stderr, .. } if stderr.contains(needle))
    }
}

pub fn is_throttling(stderr: &str) -> bool {
    ["Throttling", "RequestLimitExceeded", "TooManyRequests", "SlowDown"]
        .iter()
        .any(|code| stderr.contains(code))
}

impl From<AwsError> for FleetError {
    fn from(err: AwsError) -> Self {
        match err {
            AwsError::Fleet(e) => e,
            AwsError::Io(e) => FleetError::Io(e),
            AwsError::Json(e) => FleetError::Json(e),
            other => FleetError::backend(PROVIDER, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AwsError>;

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

    fn failed(stderr: &str) -> AwsError {
        AwsError::CommandFailed {
            command: "ec2 describe-instances".to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_classification() {
        let missing = failed(
            "An error occurred (InvalidInstanceID.NotFound) when calling the StopInstances operation",
        );
        assert!(missing.is_not_found());
        assert!(!missing.is_throttled());

        let throttled = failed("An error occurred (RequestLimitExceeded) when calling the RunInstances operation");
        assert!(throttled.is_throttled());
        assert!(!throttled.is_not_found());

        assert!(ignore_not_found::<()>(Err(missing)).unwrap().is_none());
        assert!(ignore_not_found::<()>(Err(throttled)).is_err());
    }

    #[test]
    fn test_into_fleet_error() {
        let err: FleetError = failed("AccessDenied").into();
        assert!(matches!(err, FleetError::Backend { ref provider, .. } if provider == "aws"));

        let err: FleetError = AwsError::Fleet(FleetError::validation("bad")).into();
        assert!(err.is_validation());
    }
}
