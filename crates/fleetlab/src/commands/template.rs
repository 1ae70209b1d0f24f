use super::{print_done, print_json};
use crate::{TemplateArgs, TemplateCommands};
use anyhow::Context;
use colored::Colorize;
use fleetlab_backend::{Fleet, Template, TemplateKey, TemplateSpec};

pub fn print_templates(templates: &[Template]) {
    if templates.is_empty() {
        println!("{}", "none".dimmed());
        return;
    }
    println!(
        "{}",
        format!(
            "{:<12} {:<10} {:<12} {:<7} {:<24} {:<14} {:<20}",
            "DISTRO", "VERSION", "AEROSPIKE", "ARCH", "IMAGE", "REGION", "CREATED"
        )
        .bold()
    );
    println!("{}", "─".repeat(105).dimmed());
    for template in templates {
        let created = template
            .created
            .map(|c| c.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<10} {:<12} {:<7} {:<24} {:<14} {:<20}",
            template.key.distribution.cyan(),
            template.key.distro_version,
            template.key.aerospike_version,
            template.key.arch.as_str(),
            template.image_id,
            template.region,
            created.dimmed()
        );
    }
}

fn template_key(args: TemplateArgs) -> TemplateKey {
    TemplateKey::new(args.distro, args.distro_version, args.aerospike_version, args.arch)
}

pub async fn handle(fleet: &Fleet, command: TemplateCommands) -> anyhow::Result<()> {
    let backend = fleet.backend();
    match command {
        TemplateCommands::List { json } => {
            let mut templates = backend.list_templates().await?;
            templates.sort_by(|a, b| a.key.cmp(&b.key));
            if json {
                return print_json(&templates);
            }
            print_templates(&templates);
        }
        TemplateCommands::Create {
            key,
            script,
            base_image,
            instance_type,
        } => {
            let install_script = tokio::fs::read(&script)
                .await
                .with_context(|| format!("cannot read install script {}", script.display()))?;
            let spec = TemplateSpec {
                key: template_key(key),
                base_image,
                install_script,
                files: Vec::new(),
                instance_type,
            };
            println!("{}", format!("building template {}...", spec.key).blue());
            let template = backend.create_template(&spec).await?;
            print_done(format!("template {} created as {}", template.key, template.image_id));
        }
        TemplateCommands::Destroy { key } => {
            let key = template_key(key);
            backend.destroy_template(&key).await?;
            print_done(format!("template {} destroyed", key));
        }
    }
    Ok(())
}
