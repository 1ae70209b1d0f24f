//! gcloud CLI wrapper
//!
//! Every call runs `gcloud … --format=json --project=<p> --quiet`, so prompts
//! never block and output is always parseable. Rate-limited calls are retried.

use crate::error::{GcpError, Result};
use fleetlab_backend::RetryConfig;
use serde::de::DeserializeOwned;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct GcloudCli {
    project: String,
    region: String,
    zone: String,
    retry: RetryConfig,
}

impl GcloudCli {
    pub fn new(project: impl Into<String>, region: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            region: region.into(),
            zone: zone.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Default zone for new resources
    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub async fn check_installed(&self) -> Result<()> {
        let which = Command::new("which").arg("gcloud").output().await?;
        if !which.status.success() {
            return Err(GcpError::CliNotFound);
        }
        Ok(())
    }

    pub fn command_args(&self, args: &[&str]) -> Vec<String> {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        full.push("--format=json".to_string());
        full.push(format!("--project={}", self.project));
        full.push("--quiet".to_string());
        full
    }

    /// Run a gcloud command and return stdout
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let full = self.command_args(args);
        let name = args.iter().take(3).copied().collect::<Vec<_>>().join(" ");
        let mut attempt = 0;
        loop {
            let mut cmd = Command::new("gcloud");
            cmd.args(&full);
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());

            tracing::debug!(project = %self.project, attempt, "Running: gcloud {}", args.join(" "));

            let output = cmd.output().await.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => GcpError::CliNotFound,
                _ => GcpError::Io(e),
            })?;

            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).to_string());
            }

            let err = GcpError::CommandFailed {
                command: name.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            attempt += 1;
            if err.is_throttled() && attempt < self.retry.max_attempts {
                let delay = self.retry.delay_for_attempt(attempt - 1);
                tracing::warn!(command = %name, attempt, delay_ms = delay.as_millis() as u64, "gcloud rate limited, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(err);
        }
    }

    pub async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let output = self.run(args).await?;
        parse_output(&output)
    }
}

/// Parses CLI output; an empty body reads as `null`
pub fn parse_output<T: DeserializeOwned>(output: &str) -> Result<T> {
    let trimmed = output.trim();
    let body = if trimmed.is_empty() { "null" } else { trimmed };
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_command_args() {
        let cli = GcloudCli::new("lab-project", "us-central1", "us-central1-a");
        assert_eq!(
            cli.command_args(&["compute", "instances", "list"]),
            vec![
                "compute",
                "instances",
                "list",
                "--format=json",
                "--project=lab-project",
                "--quiet"
            ]
        );
        assert_eq!(cli.zone(), "us-central1-a");
        assert_eq!(cli.region(), "us-central1");
    }

    #[test]
    fn test_parse_output() {
        let value: Vec<Value> = parse_output("[]\n").unwrap();
        assert!(value.is_empty());
        let value: Option<Value> = parse_output("").unwrap();
        assert!(value.is_none());
    }
}
