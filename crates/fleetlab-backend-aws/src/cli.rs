//! aws CLI wrapper
//!
//! Every call runs `aws <service> <operation> … --output json` with the
//! configured region and profile. Throttled calls are retried with backoff.

use crate::error::{AwsError, Result};
use fleetlab_backend::RetryConfig;
use serde::de::DeserializeOwned;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: String,
    profile: Option<String>,
    retry: RetryConfig,
}

impl AwsCli {
    pub fn new(region: impl Into<String>, profile: Option<String>) -> Self {
        Self {
            program: "aws".to_string(),
            region: region.into(),
            profile,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Use another aws executable
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Same account and profile in another region
    pub fn in_region(&self, region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..self.clone()
        }
    }

    /// Check that the aws binary is installed
    pub async fn check_installed(&self) -> Result<()> {
        let which = Command::new("which").arg(&self.program).output().await?;
        if !which.status.success() {
            return Err(AwsError::CliNotFound);
        }
        Ok(())
    }

    /// Full argument vector for one call
    pub fn command_args(&self, args: &[&str]) -> Vec<String> {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        full.extend(["--output".to_string(), "json".to_string()]);
        full.extend(["--region".to_string(), self.region.clone()]);
        if let Some(profile) = &self.profile {
            full.extend(["--profile".to_string(), profile.clone()]);
        }
        full
    }

    /// Run an aws command and return stdout
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let full = self.command_args(args);
        let name = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        let mut attempt = 0;
        loop {
            let mut cmd = Command::new(&self.program);
            cmd.args(&full);
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());

            tracing::debug!(region = %self.region, attempt, "Running: aws {}", args.join(" "));

            let output = cmd.output().await.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AwsError::CliNotFound,
                _ => AwsError::Io(e),
            })?;

            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).to_string());
            }

            let err = AwsError::CommandFailed {
                command: name.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            attempt += 1;
            if err.is_throttled() && attempt < self.retry.max_attempts {
                let delay = self.retry.delay_for_attempt(attempt - 1);
                tracing::warn!(command = %name, attempt, delay_ms = delay.as_millis() as u64, "aws throttled, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(err);
        }
    }

    /// Run a command and parse its JSON output
    pub async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let output = self.run(args).await?;
        parse_output(&output)
    }
}

/// Parses CLI output. Commands without a body print nothing, which reads
/// as `null`.
pub fn parse_output<T: DeserializeOwned>(output: &str) -> Result<T> {
    let trimmed = output.trim();
    let body = if trimmed.is_empty() { "null" } else { trimmed };
    Ok(serde_json::from_str(body)?)
}

/// `Name=<name>,Values=<v1>,<v2>` filter argument
pub fn filter(name: &str, values: &[&str]) -> String {
    format!("Name={},Values={}", name, values.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_command_args() {
        let cli = AwsCli::new("eu-west-1", Some("lab".to_string()));
        assert_eq!(
            cli.command_args(&["ec2", "describe-vpcs"]),
            vec![
                "ec2",
                "describe-vpcs",
                "--output",
                "json",
                "--region",
                "eu-west-1",
                "--profile",
                "lab"
            ]
        );

        let other = cli.in_region("us-east-1");
        assert_eq!(other.region(), "us-east-1");
        assert!(other.command_args(&["sts", "get-caller-identity"]).contains(&"lab".to_string()));
    }

    #[test]
    fn test_parse_output() {
        let value: Value = parse_output("").unwrap();
        assert!(value.is_null());
        let value: Value = parse_output("  {\"ImageId\": \"ami-1\"}\n").unwrap();
        assert_eq!(value["ImageId"], "ami-1");
        assert!(parse_output::<Value>("not json").is_err());
    }

    #[test]
    fn test_filter() {
        assert_eq!(
            filter("instance-state-name", &["pending", "running"]),
            "Name=instance-state-name,Values=pending,running"
        );
    }
}
