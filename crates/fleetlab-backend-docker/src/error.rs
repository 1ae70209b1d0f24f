use fleetlab_backend::FleetError;
use thiserror::Error;

pub const PROVIDER: &str = "docker";

#[derive(Error, Debug)]
pub enum DockerError {
    #[error(
        "cannot connect to Docker: {0}\n\nHint:\n  • make sure the Docker daemon is running\n  • check that `docker ps` works for this user"
    )]
    ConnectionFailed(String),

    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("command exited with code {code}: {output}")]
    ExecFailed { code: i64, output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

impl DockerError {
    /// Docker answered with this HTTP status
    pub fn is_status(&self, status: u16) -> bool {
        matches!(
            self,
            DockerError::Api(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if *status_code == status
        )
    }
}

impl From<DockerError> for FleetError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::Fleet(e) => e,
            DockerError::Io(e) => FleetError::Io(e),
            other => FleetError::backend(PROVIDER, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DockerError>;

/// `Ok(None)` for a 404, the value otherwise
pub fn ignore_not_found<T>(result: std::result::Result<T, bollard::errors::Error>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_status_match() {
        let err = DockerError::from(server_error(404));
        assert!(err.is_status(404));
        assert!(!err.is_status(409));
    }

    #[test]
    fn test_ignore_not_found() {
        assert_eq!(ignore_not_found::<()>(Err(server_error(404))).unwrap(), None);
        assert!(ignore_not_found::<()>(Err(server_error(500))).is_err());
        assert_eq!(ignore_not_found(Ok(3)).unwrap(), Some(3));
    }

    #[test]
    fn test_converts_to_fleet_error() {
        let err: FleetError = DockerError::from(server_error(500)).into();
        assert!(matches!(err, FleetError::Backend { .. }));

        let err: FleetError = DockerError::Fleet(FleetError::validation("bad")).into();
        assert!(err.is_validation());
    }
}
