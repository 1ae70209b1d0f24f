//! Scheduled expiry system: a Cloud Scheduler job calling an HTTP Cloud
//! Function (2nd gen) with an OIDC token of the function's service account

use crate::cli::GcloudCli;
use crate::error::{Result, ignore_not_found};
use crate::types::{CloudFunction, SchedulerJob};
use fleetlab_backend::{ExpirySystemRecord, FleetError};
use std::path::Path;

pub const EXPIRY_NAME: &str = "fleetlab-expiries";
const FUNCTION_RUNTIME: &str = "go122";
const FUNCTION_ENTRY_POINT: &str = "FleetlabExpire";

/// Cron schedule for an interval: 1-60 minutes in 1-minute steps, then whole
/// hours up to a day
pub fn cron_schedule(interval_minutes: u32) -> std::result::Result<String, FleetError> {
    match interval_minutes {
        1..=59 => Ok(format!("*/{} * * * *", interval_minutes)),
        60 => Ok("0 * * * *".to_string()),
        1440 => Ok("0 1 * * *".to_string()),
        m if m > 60 && m < 1440 && m % 60 == 0 => Ok(format!("0 */{} * * *", m / 60)),
        _ => Err(FleetError::validation(
            "frequency can be 1-60 minutes in 1-minute steps, or 60-1440 in 60-minute steps",
        )),
    }
}

async fn describe_job(cli: &GcloudCli, region: &str) -> Result<Option<SchedulerJob>> {
    ignore_not_found(
        cli.run_json(&["scheduler", "jobs", "describe", EXPIRY_NAME, "--location", region])
            .await,
    )
}

async fn describe_function(cli: &GcloudCli, region: &str) -> Result<Option<CloudFunction>> {
    ignore_not_found(
        cli.run_json(&["functions", "describe", EXPIRY_NAME, "--region", region, "--gen2"])
            .await,
    )
}

pub async fn inspect(cli: &GcloudCli, region: &str) -> Result<Option<ExpirySystemRecord>> {
    let Some(job) = describe_job(cli, region).await? else {
        return Ok(None);
    };
    let function = describe_function(cli, region).await?;
    let target = job.http_target.unwrap_or_default();
    let service = function.as_ref().and_then(|f| f.service_config.clone()).unwrap_or_default();

    Ok(Some(ExpirySystemRecord {
        region: region.to_string(),
        schedule: job.schedule,
        scheduler: job.name,
        scheduler_role: target
            .oidc_token
            .map(|t| t.service_account_email)
            .unwrap_or_default(),
        function: function.map(|f| f.name).unwrap_or_default(),
        function_role: service.service_account_email.unwrap_or_default(),
        source: target.uri,
    }))
}

/// Deploys the function from `source` and schedules it
pub async fn install(cli: &GcloudCli, region: &str, interval_minutes: u32, source: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(FleetError::validation(format!(
            "function source directory {} does not exist",
            source.display()
        ))
        .into());
    }
    let schedule = cron_schedule(interval_minutes)?;
    if describe_job(cli, region).await?.is_some() {
        return Err(FleetError::validation(format!(
            "expiry system already installed in {}",
            region
        ))
        .into());
    }

    tracing::info!(region = %region, "deploying expiry function");
    let source_arg = format!("--source={}", source.display());
    let project_env = format!("--set-env-vars=FLEETLAB_PROJECT={}", cli.project());
    let region_arg = format!("--region={}", region);
    cli.run(&[
        "functions",
        "deploy",
        EXPIRY_NAME,
        "--gen2",
        &region_arg,
        &format!("--runtime={}", FUNCTION_RUNTIME),
        &format!("--entry-point={}", FUNCTION_ENTRY_POINT),
        &source_arg,
        "--trigger-http",
        "--no-allow-unauthenticated",
        "--memory=256M",
        "--timeout=60s",
        "--min-instances=0",
        "--max-instances=2",
        &project_env,
    ])
    .await?;

    let function = describe_function(cli, region)
        .await?
        .ok_or_else(|| FleetError::backend(crate::error::PROVIDER, "expiry function vanished after deploy"))?;
    let service = function.service_config.unwrap_or_default();
    let (Some(uri), Some(account)) = (service.uri, service.service_account_email) else {
        return Err(FleetError::backend(
            crate::error::PROVIDER,
            "expiry function has no URL or service account",
        )
        .into());
    };

    tracing::info!(region = %region, schedule = %schedule, "creating expiry schedule");
    let created = cli
        .run(&[
            "scheduler",
            "jobs",
            "create",
            "http",
            EXPIRY_NAME,
            &format!("--location={}", region),
            &format!("--schedule={}", schedule),
            &format!("--uri={}", uri),
            "--http-method=POST",
            &format!("--oidc-service-account-email={}", account),
            "--time-zone=Etc/UTC",
            "--max-retry-attempts=0",
        ])
        .await;
    if let Err(e) = created {
        tracing::warn!(error = %e, "schedule creation failed, removing function");
        if let Err(cleanup) = ignore_not_found(
            cli.run(&["functions", "delete", EXPIRY_NAME, &region_arg, "--gen2"])
                .await,
        ) {
            tracing::warn!(error = %cleanup, "could not remove expiry function");
        }
        return Err(e);
    }
    Ok(())
}

pub async fn set_frequency(cli: &GcloudCli, region: &str, interval_minutes: u32) -> Result<()> {
    let schedule = cron_schedule(interval_minutes)?;
    if describe_job(cli, region).await?.is_none() {
        return Err(FleetError::not_found("expiry system", region.to_string()).into());
    }
    cli.run(&[
        "scheduler",
        "jobs",
        "update",
        "http",
        EXPIRY_NAME,
        "--location",
        region,
        "--schedule",
        &schedule,
    ])
    .await?;
    tracing::info!(region = %region, schedule = %schedule, "expiry schedule updated");
    Ok(())
}

/// Removes the schedule and the function; missing parts are skipped
pub async fn remove(cli: &GcloudCli, region: &str) -> Result<()> {
    ignore_not_found(
        cli.run(&["scheduler", "jobs", "delete", EXPIRY_NAME, "--location", region])
            .await,
    )?;
    ignore_not_found(
        cli.run(&["functions", "delete", EXPIRY_NAME, "--region", region, "--gen2"])
            .await,
    )?;
    tracing::info!(region = %region, "expiry system removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GcpError;

    #[test]
    fn test_cron_schedule() {
        assert_eq!(cron_schedule(15).unwrap(), "*/15 * * * *");
        assert_eq!(cron_schedule(60).unwrap(), "0 * * * *");
        assert_eq!(cron_schedule(180).unwrap(), "0 */3 * * *");
        assert_eq!(cron_schedule(1440).unwrap(), "0 1 * * *");
        assert!(cron_schedule(0).unwrap_err().is_validation());
        assert!(cron_schedule(90).is_err());
        assert!(cron_schedule(2880).is_err());
    }

    #[test]
    fn test_install_requires_source_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cli = GcloudCli::new("p", "us-central1", "us-central1-a");
        let missing = dir.path().join("function");
        let err = tokio_test::block_on(install(&cli, "us-central1", 15, &missing)).unwrap_err();
        assert!(matches!(err, GcpError::Fleet(ref e) if e.is_validation()));
    }
}
