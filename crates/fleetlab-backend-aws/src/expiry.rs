//! Scheduled expiry system: an EventBridge Scheduler schedule invoking a
//! Lambda function, each side with its own IAM role

use crate::cli::AwsCli;
use crate::error::{AwsError, Result, ignore_not_found};
use crate::types::{CallerIdentity, FunctionResponse, GetFunction, RoleResponse, Schedule};
use fleetlab_backend::{ExpirySystemRecord, FleetError};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

pub const EXPIRY_NAME: &str = "fleetlab-expiries";
const LAMBDA_RUNTIME: &str = "provided.al2023";
const LAMBDA_TIMEOUT_SECS: &str = "60";
const ROLE_PROPAGATION_RETRIES: u32 = 4;
const ROLE_PROPAGATION_DELAY: Duration = Duration::from_secs(5);
const LAMBDA_MANAGED_POLICIES: [&str; 2] = [
    "arn:aws:iam::aws:policy/AmazonEC2FullAccess",
    "arn:aws:iam::aws:policy/AmazonElasticFileSystemFullAccess",
];

pub fn lambda_role_name(region: &str) -> String {
    format!("{}-lambda-{}", EXPIRY_NAME, region)
}

pub fn scheduler_role_name(region: &str) -> String {
    format!("{}-scheduler-{}", EXPIRY_NAME, region)
}

fn lambda_policy_name(region: &str) -> String {
    format!("{}-lambda-policy-{}", EXPIRY_NAME, region)
}

fn scheduler_policy_name(region: &str) -> String {
    format!("{}-scheduler-policy-{}", EXPIRY_NAME, region)
}

/// EventBridge rate expression
pub fn rate_expression(interval_minutes: u32) -> String {
    if interval_minutes == 1 {
        "rate(1 minute)".to_string()
    } else {
        format!("rate({} minutes)", interval_minutes)
    }
}

fn lambda_trust_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": {"Service": "lambda.amazonaws.com"},
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

fn scheduler_trust_policy(account: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": {"Service": "scheduler.amazonaws.com"},
            "Action": "sts:AssumeRole",
            "Condition": {"StringEquals": {"aws:SourceAccount": account}}
        }]
    })
    .to_string()
}

fn lambda_logging_policy(region: &str, account: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": "logs:CreateLogGroup",
                "Resource": format!("arn:aws:logs:{}:{}:*", region, account)
            },
            {
                "Effect": "Allow",
                "Action": ["logs:CreateLogStream", "logs:PutLogEvents"],
                "Resource": [format!(
                    "arn:aws:logs:{}:{}:log-group:/aws/lambda/{}:*",
                    region, account, EXPIRY_NAME
                )]
            }
        ]
    })
    .to_string()
}

fn scheduler_invoke_policy(region: &str, account: &str) -> String {
    let function = format!("arn:aws:lambda:{}:{}:function:{}", region, account, EXPIRY_NAME);
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": ["lambda:InvokeFunction"],
            "Resource": [format!("{}:*", function), function]
        }]
    })
    .to_string()
}

async fn get_schedule(cli: &AwsCli) -> Result<Option<Schedule>> {
    ignore_not_found(
        cli.run_json(&["scheduler", "get-schedule", "--name", EXPIRY_NAME])
            .await,
    )
}

/// Installed expiry system in the CLI's region, if any
pub async fn inspect(cli: &AwsCli) -> Result<Option<ExpirySystemRecord>> {
    let Some(schedule) = get_schedule(cli).await? else {
        return Ok(None);
    };
    let function: Option<GetFunction> = ignore_not_found(
        cli.run_json(&["lambda", "get-function", "--function-name", EXPIRY_NAME])
            .await,
    )?;
    Ok(Some(ExpirySystemRecord {
        region: cli.region().to_string(),
        schedule: schedule.schedule_expression,
        scheduler: schedule.name,
        scheduler_role: schedule.target.role_arn,
        function: schedule.target.arn,
        function_role: function
            .and_then(|f| f.configuration.role)
            .unwrap_or_default(),
        source: LAMBDA_RUNTIME.to_string(),
    }))
}

async fn create_role(cli: &AwsCli, name: &str, trust: &str) -> Result<RoleResponse> {
    let role: RoleResponse = cli
        .run_json(&[
            "iam",
            "create-role",
            "--role-name",
            name,
            "--assume-role-policy-document",
            trust,
        ])
        .await?;
    cli.run(&["iam", "wait", "role-exists", "--role-name", name])
        .await?;
    Ok(role)
}

/// Creates roles, function and schedule. Leftovers of an earlier failed
/// install are removed first.
pub async fn install(cli: &AwsCli, interval_minutes: u32, package: &Path) -> Result<()> {
    if !package.is_file() {
        return Err(FleetError::validation(format!(
            "expiry function package {} does not exist",
            package.display()
        ))
        .into());
    }
    if get_schedule(cli).await?.is_some() {
        return Err(FleetError::validation(format!(
            "expiry system is already installed in {}",
            cli.region()
        ))
        .into());
    }

    tracing::info!(region = %cli.region(), "installing expiry system");
    remove(cli).await?;

    let region = cli.region().to_string();
    let identity: CallerIdentity = cli.run_json(&["sts", "get-caller-identity"]).await?;
    let account = identity.account;

    let lambda_role = create_role(cli, &lambda_role_name(&region), &lambda_trust_policy()).await?;
    cli.run(&[
        "iam",
        "put-role-policy",
        "--role-name",
        &lambda_role.role.role_name,
        "--policy-name",
        &lambda_policy_name(&region),
        "--policy-document",
        &lambda_logging_policy(&region, &account),
    ])
    .await?;
    for policy in LAMBDA_MANAGED_POLICIES {
        cli.run(&[
            "iam",
            "attach-role-policy",
            "--role-name",
            &lambda_role.role.role_name,
            "--policy-arn",
            policy,
        ])
        .await?;
    }

    let scheduler_role = create_role(
        cli,
        &scheduler_role_name(&region),
        &scheduler_trust_policy(&account),
    )
    .await?;
    cli.run(&[
        "iam",
        "put-role-policy",
        "--role-name",
        &scheduler_role.role.role_name,
        "--policy-name",
        &scheduler_policy_name(&region),
        "--policy-document",
        &scheduler_invoke_policy(&region, &account),
    ])
    .await?;

    let zip = format!("fileb://{}", package.display());
    let mut attempt = 0;
    let function: FunctionResponse = loop {
        let result = cli
            .run_json(&[
                "lambda",
                "create-function",
                "--function-name",
                EXPIRY_NAME,
                "--runtime",
                LAMBDA_RUNTIME,
                "--handler",
                "bootstrap",
                "--timeout",
                LAMBDA_TIMEOUT_SECS,
                "--publish",
                "--role",
                &lambda_role.role.arn,
                "--zip-file",
                &zip,
            ])
            .await;
        match result {
            // A fresh role takes a few seconds to become assumable
            Err(e) if e.stderr_contains("cannot be assumed by Lambda") && attempt < ROLE_PROPAGATION_RETRIES => {
                attempt += 1;
                tracing::info!(attempt, "IAM role not ready yet, retrying");
                tokio::time::sleep(ROLE_PROPAGATION_DELAY).await;
            }
            other => break other?,
        }
    };

    create_or_update_schedule(cli, "create-schedule", interval_minutes, &function.function_arn, &scheduler_role.role.arn)
        .await?;
    tracing::info!(region = %region, interval_minutes, "expiry system installed");
    Ok(())
}

async fn create_or_update_schedule(
    cli: &AwsCli,
    operation: &str,
    interval_minutes: u32,
    function_arn: &str,
    role_arn: &str,
) -> Result<()> {
    let target = json!({"Arn": function_arn, "RoleArn": role_arn}).to_string();
    cli.run(&[
        "scheduler",
        operation,
        "--name",
        EXPIRY_NAME,
        "--schedule-expression",
        &rate_expression(interval_minutes),
        "--state",
        "ENABLED",
        "--flexible-time-window",
        "Mode=OFF",
        "--target",
        &target,
    ])
    .await?;
    Ok(())
}

/// Changes the schedule interval of an installed system
pub async fn set_frequency(cli: &AwsCli, interval_minutes: u32) -> Result<()> {
    let schedule = get_schedule(cli).await?.ok_or_else(|| {
        AwsError::Fleet(FleetError::not_found("expiry system", cli.region().to_string()))
    })?;
    create_or_update_schedule(
        cli,
        "update-schedule",
        interval_minutes,
        &schedule.target.arn,
        &schedule.target.role_arn,
    )
    .await?;
    tracing::info!(region = %cli.region(), interval_minutes, "expiry frequency updated");
    Ok(())
}

/// Deletes every piece; missing pieces are skipped
pub async fn remove(cli: &AwsCli) -> Result<()> {
    let region = cli.region().to_string();
    let lambda_role = lambda_role_name(&region);
    let scheduler_role = scheduler_role_name(&region);

    let lambda_policy = lambda_policy_name(&region);
    let scheduler_policy = scheduler_policy_name(&region);
    let steps: [[&str; 6]; 8] = [
        ["scheduler", "delete-schedule", "--name", EXPIRY_NAME, "", ""],
        ["lambda", "delete-function", "--function-name", EXPIRY_NAME, "", ""],
        [
            "iam",
            "detach-role-policy",
            "--role-name",
            lambda_role.as_str(),
            "--policy-arn",
            LAMBDA_MANAGED_POLICIES[0],
        ],
        [
            "iam",
            "detach-role-policy",
            "--role-name",
            lambda_role.as_str(),
            "--policy-arn",
            LAMBDA_MANAGED_POLICIES[1],
        ],
        [
            "iam",
            "delete-role-policy",
            "--role-name",
            lambda_role.as_str(),
            "--policy-name",
            lambda_policy.as_str(),
        ],
        ["iam", "delete-role", "--role-name", lambda_role.as_str(), "", ""],
        [
            "iam",
            "delete-role-policy",
            "--role-name",
            scheduler_role.as_str(),
            "--policy-name",
            scheduler_policy.as_str(),
        ],
        ["iam", "delete-role", "--role-name", scheduler_role.as_str(), "", ""],
    ];

    for step in &steps {
        let args: Vec<&str> = step.iter().copied().filter(|a| !a.is_empty()).collect();
        if ignore_not_found(cli.run(&args).await)?.is_none() {
            tracing::debug!(step = %step[..2].join(" "), "already removed");
        }
    }
    tracing::info!(region = %region, "expiry system removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_names() {
        assert_eq!(lambda_role_name("eu-west-1"), "fleetlab-expiries-lambda-eu-west-1");
        assert_eq!(scheduler_role_name("us-east-2"), "fleetlab-expiries-scheduler-us-east-2");
    }

    #[test]
    fn test_rate_expression() {
        assert_eq!(rate_expression(1), "rate(1 minute)");
        assert_eq!(rate_expression(15), "rate(15 minutes)");
    }

    #[test]
    fn test_policies_are_json() {
        let trust: Value = serde_json::from_str(&scheduler_trust_policy("123456789012")).unwrap();
        assert_eq!(
            trust["Statement"][0]["Condition"]["StringEquals"]["aws:SourceAccount"],
            "123456789012"
        );

        let invoke: Value = serde_json::from_str(&scheduler_invoke_policy("eu-west-1", "1")).unwrap();
        assert_eq!(
            invoke["Statement"][0]["Resource"][1],
            "arn:aws:lambda:eu-west-1:1:function:fleetlab-expiries"
        );

        let logs: Value = serde_json::from_str(&lambda_logging_policy("eu-west-1", "1")).unwrap();
        assert_eq!(logs["Statement"].as_array().unwrap().len(), 2);
        let _: Value = serde_json::from_str(&lambda_trust_policy()).unwrap();
    }

    #[test]
    fn test_schedule_parsing() {
        let json = r#"{"Name":"fleetlab-expiries","ScheduleExpression":"rate(15 minutes)",
            "State":"ENABLED","Target":{"Arn":"arn:aws:lambda:eu-west-1:1:function:fleetlab-expiries",
            "RoleArn":"arn:aws:iam::1:role/fleetlab-expiries-scheduler-eu-west-1"}}"#;
        let schedule: Schedule = serde_json::from_str(json).unwrap();
        assert_eq!(schedule.schedule_expression, "rate(15 minutes)");
        assert!(schedule.target.role_arn.ends_with("scheduler-eu-west-1"));
    }

    #[test]
    fn test_install_rejects_missing_package() {
        let cli = AwsCli::new("eu-west-1", None);
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("expiry.zip");

        let err = tokio_test::block_on(install(&cli, 15, &missing)).unwrap_err();
        assert!(matches!(err, AwsError::Fleet(ref e) if e.is_validation()));
    }
}
