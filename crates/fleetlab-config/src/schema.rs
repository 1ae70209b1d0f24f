//! fleetlab.yaml schema

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_BACKEND: &str = "FLEETLAB_BACKEND";
pub const ENV_PROJECT: &str = "FLEETLAB_PROJECT";
pub const ENV_OWNER: &str = "FLEETLAB_OWNER";

const BACKEND_TYPES: [&str; 3] = ["docker", "aws", "gcp"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetlabConfig {
    pub backend: BackendConfig,
    pub defaults: DefaultsConfig,
    pub docker: DockerConfig,
    pub aws: AwsConfig,
    pub gcp: GcpConfig,
    pub expiry: ExpiryConfig,

    /// File this configuration was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "docker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub owner: Option<String>,
    pub project: Option<String>,
    pub parallel_threads: Option<usize>,
    /// Ttl of new groups created without `--expire`, e.g. `30h`; `0` never
    /// expires. Unset means 30h on aws and gcp, never on docker.
    pub expire: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Engine endpoint; the local socket when unset
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
    pub ssh_user: String,
    /// Directory holding `<key-name>.pem` files
    pub ssh_key_dir: Option<PathBuf>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: None,
            profile: None,
            ssh_user: "ubuntu".to_string(),
            ssh_key_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    pub project: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub ssh_user: String,
    pub ssh_key_path: Option<PathBuf>,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project: None,
            region: None,
            zone: None,
            ssh_user: "fleetlab".to_string(),
            ssh_key_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    pub interval_minutes: u32,
    /// Zip package deployed as the Lambda function
    pub aws_function_package: Option<PathBuf>,
    /// Source directory deployed as the Cloud Function
    pub gcp_function_source: Option<PathBuf>,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            aws_function_package: None,
            gcp_function_source: None,
        }
    }
}

impl FleetlabConfig {
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        let mut config: FleetlabConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content, path)
    }

    /// Applies `FLEETLAB_BACKEND`, `FLEETLAB_PROJECT` and `FLEETLAB_OWNER`
    pub fn apply_env_overrides(&mut self) {
        if let Some(backend) = env_value(ENV_BACKEND) {
            self.backend.kind = backend;
        }
        if let Some(project) = env_value(ENV_PROJECT) {
            self.defaults.project = Some(project);
        }
        if let Some(owner) = env_value(ENV_OWNER) {
            self.defaults.owner = Some(owner);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let kind = self.backend.kind.to_ascii_lowercase();
        if !BACKEND_TYPES.contains(&kind.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown backend type '{}' (expected one of: {})",
                self.backend.kind,
                BACKEND_TYPES.join(", ")
            )));
        }
        if self.defaults.parallel_threads == Some(0) {
            return Err(ConfigError::Invalid(
                "defaults.parallel_threads must be at least 1".to_string(),
            ));
        }
        if self.expiry.interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "expiry.interval_minutes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FleetlabConfig::from_yaml("{}", Path::new("fleetlab.yaml")).unwrap();
        assert_eq!(config.backend.kind, "docker");
        assert_eq!(config.expiry.interval_minutes, 15);
        assert_eq!(config.aws.ssh_user, "ubuntu");
        assert_eq!(config.source, Some(PathBuf::from("fleetlab.yaml")));
    }

    #[test]
    fn test_parse_full_file() {
        let yaml = r#"
backend:
  type: gcp
defaults:
  owner: alice
  project: perf
  parallel_threads: 8
  expire: 12h
gcp:
  project: my-gcp-project
  zone: us-central1-a
expiry:
  interval_minutes: 30
"#;
        let config = FleetlabConfig::from_yaml(yaml, Path::new("x.yaml")).unwrap();
        assert_eq!(config.backend.kind, "gcp");
        assert_eq!(config.defaults.owner.as_deref(), Some("alice"));
        assert_eq!(config.defaults.parallel_threads, Some(8));
        assert_eq!(config.defaults.expire.as_deref(), Some("12h"));
        assert_eq!(config.gcp.zone.as_deref(), Some("us-central1-a"));
        assert_eq!(config.gcp.ssh_user, "fleetlab");
        assert_eq!(config.expiry.interval_minutes, 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = FleetlabConfig::from_yaml("backend: [", Path::new("broken.yaml")).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let mut config = FleetlabConfig::default();
        config.backend.kind = "azure".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("azure"));

        let mut config = FleetlabConfig::default();
        config.defaults.parallel_threads = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                (ENV_BACKEND, Some("aws")),
                (ENV_PROJECT, Some("nightly")),
                (ENV_OWNER, Some("")),
            ],
            || {
                let mut config = FleetlabConfig::default();
                config.defaults.owner = Some("alice".to_string());
                config.apply_env_overrides();
                assert_eq!(config.backend.kind, "aws");
                assert_eq!(config.defaults.project.as_deref(), Some("nightly"));
                assert_eq!(config.defaults.owner.as_deref(), Some("alice"));
            },
        );
    }
}
