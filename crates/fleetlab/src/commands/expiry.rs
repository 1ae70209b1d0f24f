use super::{print_done, print_json};
use crate::ExpiryCommands;
use chrono::Utc;
use colored::Colorize;
use fleetlab_backend::{BackendKind, ExpirySystemRecord, ExpirySystemSpec, Fleet, sweep_expired};
use fleetlab_config::FleetlabConfig;
use std::path::PathBuf;

pub fn print_records(records: &[ExpirySystemRecord]) {
    if records.is_empty() {
        println!("{}", "not installed".dimmed());
        return;
    }
    println!(
        "{}",
        format!("{:<16} {:<16} {:<40} {:<40}", "REGION", "SCHEDULE", "SCHEDULER", "FUNCTION").bold()
    );
    println!("{}", "─".repeat(112).dimmed());
    for record in records {
        println!(
            "{:<16} {:<16} {:<40} {:<40}",
            record.region.cyan(),
            record.schedule,
            record.scheduler,
            record.function
        );
    }
}

/// Function artifact configured for the active backend
fn configured_source(backend: BackendKind, config: &FleetlabConfig) -> Option<PathBuf> {
    match backend {
        BackendKind::Aws => config.expiry.aws_function_package.clone(),
        BackendKind::Gcp => config.expiry.gcp_function_source.clone(),
        BackendKind::Docker => None,
    }
}

pub fn install_spec(
    backend: BackendKind,
    config: &FleetlabConfig,
    region: Option<String>,
    frequency: Option<u32>,
    source: Option<PathBuf>,
) -> ExpirySystemSpec {
    ExpirySystemSpec {
        region,
        interval_minutes: frequency.unwrap_or(config.expiry.interval_minutes),
        source: source.or_else(|| configured_source(backend, config)),
    }
}

pub async fn handle(fleet: &Fleet, config: &FleetlabConfig, command: ExpiryCommands) -> anyhow::Result<()> {
    let backend = fleet.backend();
    match command {
        ExpiryCommands::Show { json } => {
            let records = backend.expiry_system().await?;
            if json {
                return print_json(&records);
            }
            print_records(&records);
        }
        ExpiryCommands::Install {
            region,
            frequency,
            source,
        } => {
            let spec = install_spec(fleet.context().backend, config, region, frequency, source);
            backend.install_expiry_system(&spec).await?;
            print_done(format!(
                "expiry system installed, running every {} minutes",
                spec.interval_minutes
            ));
        }
        ExpiryCommands::Remove { region } => {
            backend.remove_expiry_system(region.as_deref()).await?;
            print_done("expiry system removed");
        }
        ExpiryCommands::Frequency { minutes } => {
            backend.set_expiry_frequency(minutes).await?;
            print_done(format!("expiry system now runs every {} minutes", minutes));
        }
        ExpiryCommands::Run { dry_run, json } => {
            let report = sweep_expired(backend, fleet.context(), Utc::now(), dry_run).await?;
            if json {
                return print_json(&report);
            }
            if report.groups.is_empty() {
                println!("{}", "no expired nodes".dimmed());
            }
            let verb = if dry_run { "would destroy" } else { "destroyed" };
            for group in &report.groups {
                println!(
                    "{} {} {} nodes {:?}",
                    verb.yellow(),
                    group.kind,
                    group.group.cyan(),
                    group.nodes
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_spec_uses_configuration() {
        let mut config = FleetlabConfig::default();
        config.expiry.interval_minutes = 30;
        config.expiry.aws_function_package = Some(PathBuf::from("/opt/expiry.zip"));
        config.expiry.gcp_function_source = Some(PathBuf::from("/opt/expiry-src"));

        let spec = install_spec(BackendKind::Aws, &config, None, None, None);
        assert_eq!(spec.interval_minutes, 30);
        assert_eq!(spec.source, Some(PathBuf::from("/opt/expiry.zip")));

        let spec = install_spec(BackendKind::Gcp, &config, Some("us-east1".to_string()), Some(60), None);
        assert_eq!(spec.interval_minutes, 60);
        assert_eq!(spec.region.as_deref(), Some("us-east1"));
        assert_eq!(spec.source, Some(PathBuf::from("/opt/expiry-src")));

        let explicit = Some(PathBuf::from("./fn"));
        let spec = install_spec(BackendKind::Docker, &config, None, None, explicit.clone());
        assert_eq!(spec.source, explicit);
        assert_eq!(install_spec(BackendKind::Docker, &config, None, None, None).source, None);
    }
}
