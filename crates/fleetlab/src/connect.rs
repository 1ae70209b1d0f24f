//! Selects and connects the one backend named by the configuration

use anyhow::{Context, anyhow};
use fleetlab_backend::{BackendKind, ExecutionContext, Fleet, FleetBackend, parse_duration};
use fleetlab_backend_aws::{AwsBackend, AwsSettings};
use fleetlab_backend_docker::DockerBackend;
use fleetlab_backend_gcp::{GcpBackend, GcpSettings};
use fleetlab_config::FleetlabConfig;
use std::sync::Arc;

const GCP_KEY_NAME: &str = "fleetlab-gcp";

pub fn context(config: &FleetlabConfig) -> anyhow::Result<ExecutionContext> {
    let backend: BackendKind = config.backend.kind.parse()?;
    let mut ctx = ExecutionContext::new(backend).with_project(config.defaults.project.clone());
    if let Some(owner) = &config.defaults.owner {
        ctx = ctx.with_owner(owner.clone());
    }
    if let Some(threads) = config.defaults.parallel_threads {
        ctx = ctx.with_parallel_threads(threads);
    }
    if let Some(expire) = &config.defaults.expire {
        let ttl = parse_duration(expire).context("invalid defaults.expire")?;
        ctx = ctx.with_default_ttl(ttl);
    }
    Ok(ctx)
}

pub async fn open(config: &FleetlabConfig) -> anyhow::Result<Fleet> {
    let ctx = context(config)?;
    let backend: Arc<dyn FleetBackend> = match ctx.backend {
        BackendKind::Docker => Arc::new(
            DockerBackend::connect(config.docker.host.as_deref())
                .await
                .context("cannot reach the Docker engine")?,
        ),
        BackendKind::Aws => Arc::new(AwsBackend::connect(aws_settings(config)?).await?),
        BackendKind::Gcp => Arc::new(GcpBackend::connect(gcp_settings(config)?).await?),
    };
    tracing::debug!(backend = %ctx.backend, owner = %ctx.owner, "backend connected");
    Ok(Fleet::new(backend, ctx))
}

fn aws_settings(config: &FleetlabConfig) -> anyhow::Result<AwsSettings> {
    let region = config
        .aws
        .region
        .clone()
        .or_else(|| env_region("AWS_REGION"))
        .or_else(|| env_region("AWS_DEFAULT_REGION"))
        .ok_or_else(|| anyhow!("no AWS region: set aws.region in fleetlab.yaml or AWS_REGION"))?;
    let key_dir = match &config.aws.ssh_key_dir {
        Some(dir) => dir.clone(),
        None => fleetlab_config::default_key_dir()?,
    };
    Ok(AwsSettings {
        region,
        profile: config.aws.profile.clone(),
        ssh_user: config.aws.ssh_user.clone(),
        key_dir,
    })
}

fn gcp_settings(config: &FleetlabConfig) -> anyhow::Result<GcpSettings> {
    let gcp = &config.gcp;
    let project = gcp
        .project
        .clone()
        .ok_or_else(|| anyhow!("gcp.project is not set in fleetlab.yaml"))?;
    let zone = gcp
        .zone
        .clone()
        .ok_or_else(|| anyhow!("gcp.zone is not set in fleetlab.yaml"))?;
    let region = match &gcp.region {
        Some(region) => region.clone(),
        None => region_of_zone(&zone)
            .ok_or_else(|| anyhow!("cannot derive a region from zone '{}'", zone))?,
    };
    let key_path = match &gcp.ssh_key_path {
        Some(path) => path.clone(),
        None => fleetlab_config::default_key_dir()?.join(GCP_KEY_NAME),
    };
    Ok(GcpSettings {
        project,
        region,
        zone,
        ssh_user: gcp.ssh_user.clone(),
        key_path,
    })
}

/// `us-central1-a` -> `us-central1`
fn region_of_zone(zone: &str) -> Option<String> {
    zone.rsplit_once('-')
        .map(|(region, _)| region.to_string())
        .filter(|region| !region.is_empty())
}

fn env_region(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_region_of_zone() {
        assert_eq!(region_of_zone("us-central1-a").as_deref(), Some("us-central1"));
        assert_eq!(region_of_zone("europe-west4-b").as_deref(), Some("europe-west4"));
        assert_eq!(region_of_zone("nozone"), None);
    }

    #[test]
    fn test_context_from_config() {
        let mut config = FleetlabConfig::default();
        config.backend.kind = "GCP".to_string();
        config.defaults.owner = Some("alice".to_string());
        config.defaults.project = Some("perf".to_string());
        config.defaults.parallel_threads = Some(4);

        let ctx = context(&config).unwrap();
        assert_eq!(ctx.backend, BackendKind::Gcp);
        assert_eq!(ctx.owner, "alice");
        assert_eq!(ctx.project.as_deref(), Some("perf"));
        assert_eq!(ctx.parallel_threads, 4);
        assert_eq!(ctx.default_ttl, chrono::Duration::hours(30));
    }

    #[test]
    fn test_context_default_expire() {
        let mut config = FleetlabConfig::default();
        config.backend.kind = "aws".to_string();
        config.defaults.expire = Some("2d".to_string());
        assert_eq!(context(&config).unwrap().default_ttl, chrono::Duration::days(2));

        config.defaults.expire = Some("0".to_string());
        assert!(context(&config).unwrap().default_ttl.is_zero());

        config.defaults.expire = Some("soon".to_string());
        assert!(context(&config).is_err());

        config.backend.kind = "docker".to_string();
        config.defaults.expire = None;
        assert!(context(&config).unwrap().default_ttl.is_zero());
    }

    #[test]
    fn test_context_rejects_unknown_backend() {
        let mut config = FleetlabConfig::default();
        config.backend.kind = "azure".to_string();
        assert!(context(&config).is_err());
    }

    #[test]
    fn test_aws_region_from_env() {
        let config = FleetlabConfig::default();
        temp_env::with_vars(
            [("AWS_REGION", None), ("AWS_DEFAULT_REGION", Some("eu-west-1"))],
            || {
                let mut config = config.clone();
                config.aws.ssh_key_dir = Some(PathBuf::from("/tmp/keys"));
                let settings = aws_settings(&config).unwrap();
                assert_eq!(settings.region, "eu-west-1");
                assert_eq!(settings.key_dir, PathBuf::from("/tmp/keys"));
            },
        );
        temp_env::with_vars_unset(["AWS_REGION", "AWS_DEFAULT_REGION"], || {
            assert!(aws_settings(&config).is_err());
        });
    }

    #[test]
    fn test_gcp_settings_derive_region() {
        let mut config = FleetlabConfig::default();
        config.gcp.project = Some("lab".to_string());
        config.gcp.zone = Some("us-east1-c".to_string());
        config.gcp.ssh_key_path = Some(PathBuf::from("/tmp/gcp-key"));

        let settings = gcp_settings(&config).unwrap();
        assert_eq!(settings.region, "us-east1");
        assert_eq!(settings.ssh_user, "fleetlab");
        assert_eq!(settings.key_path, PathBuf::from("/tmp/gcp-key"));

        config.gcp.zone = None;
        assert!(gcp_settings(&config).is_err());
    }
}
