use super::{print_done, print_json, print_nodes};
use crate::{CreateArgs, GroupCommands};
use anyhow::anyhow;
use chrono::{Duration, Utc};
use colored::Colorize;
use fleetlab_backend::{
    Arch, AwsExtra, BackendKind, CreateGroup, DockerExtra, Expiry, Features, Fleet, GcpExtra,
    GroupId, GroupKind, InventoryItem, InventoryRequest, ProviderExtra, TemplateKey,
    parse_duration,
};
use std::collections::BTreeMap;

/// Groups expiring within this window get a warning when listed
const EXPIRY_WARNING_HOURS: i64 = 24;

pub async fn handle(fleet: &Fleet, kind: GroupKind, command: GroupCommands) -> anyhow::Result<()> {
    match command {
        GroupCommands::Create(args) => {
            let request = create_request(fleet, kind, args).await?;
            let name = request.name.clone();
            let nodes = fleet.create(kind, request).await?;
            print_done(format!("{} '{}' created with nodes {:?}", kind, name, nodes));
        }
        GroupCommands::Grow(args) => {
            let request = create_request(fleet, kind, args).await?;
            let name = request.name.clone();
            let nodes = fleet.grow(kind, request).await?;
            print_done(format!("{} '{}' grew by nodes {:?}", kind, name, nodes));
        }
        GroupCommands::List { name, json } => match name {
            Some(name) => {
                let id = GroupId::new(kind, name);
                let group = fleet
                    .group(&id)
                    .await?
                    .ok_or_else(|| anyhow!("{} does not exist", id))?;
                fleet
                    .expiring_soon(&id, Utc::now(), Duration::hours(EXPIRY_WARNING_HOURS))
                    .await?;
                if json {
                    return print_json(&group);
                }
                print_nodes(&group.nodes);
            }
            None => {
                let snapshot = fleet
                    .inventory(&InventoryRequest::new().require(InventoryItem::for_kind(kind)))
                    .await?;
                if json {
                    return print_json(&snapshot.groups(kind));
                }
                print_nodes(snapshot.nodes(kind));
            }
        },
        GroupCommands::Start(select) => {
            let id = GroupId::new(kind, select.name);
            let nodes = fleet.start(&id, &select.nodes).await?;
            print_done(format!("started {} nodes {:?}", id, nodes));
        }
        GroupCommands::Stop(select) => {
            let id = GroupId::new(kind, select.name);
            let nodes = fleet.stop(&id, &select.nodes).await?;
            print_done(format!("stopped {} nodes {:?}", id, nodes));
        }
        GroupCommands::Destroy { select, force } => {
            let id = GroupId::new(kind, select.name);
            let nodes = fleet.destroy(&id, &select.nodes, force).await?;
            if nodes.is_empty() {
                println!("{}", format!("nothing to destroy in {}", id).dimmed());
            } else {
                print_done(format!("destroyed {} nodes {:?}", id, nodes));
            }
        }
        GroupCommands::Expire { select, expire } => {
            let id = GroupId::new(kind, select.name);
            let expiry = expiry_from_ttl(&expire)?;
            let nodes = fleet.set_expiry(&id, &select.nodes, expiry).await?;
            print_done(format!("{} nodes {:?} now expire: {}", id, nodes, expiry));
        }
        GroupCommands::Label { name, key, value } => {
            let id = GroupId::new(kind, name);
            fleet.relabel(&id, &key, &value).await?;
            print_done(format!("{} labelled {}={}", id, key, value));
        }
        GroupCommands::Ips {
            name,
            internal,
            json,
        } => {
            let id = GroupId::new(kind, name);
            let ips = fleet.ip_map(&id, internal).await?;
            if json {
                return print_json(&ips);
            }
            for (node, ip) in ips {
                println!("{:<5} {}", node, ip.cyan());
            }
        }
    }
    Ok(())
}

fn expiry_from_ttl(ttl: &str) -> anyhow::Result<Expiry> {
    Ok(Expiry::after(parse_duration(ttl)?, Utc::now()))
}

async fn create_request(fleet: &Fleet, kind: GroupKind, args: CreateArgs) -> anyhow::Result<CreateGroup> {
    let arch = match args.arch {
        Some(arch) => arch,
        None => {
            let instance_type = args.instance_type.as_deref().unwrap_or_default();
            Arch::from_is_arm(fleet.backend().is_system_arm(instance_type).await?)
        }
    };
    let template = match kind {
        GroupKind::Cluster => TemplateKey::new(
            args.distro.clone(),
            args.distro_version.clone(),
            args.aerospike_version.clone(),
            arch,
        ),
        GroupKind::Client => TemplateKey::client(args.distro.clone(), args.distro_version.clone(), arch),
    };
    let expires = args.expire.as_deref().map(expiry_from_ttl).transpose()?;
    let features = if args.features.is_empty() {
        default_features(kind)
    } else {
        Features::from_names(args.features.iter().map(String::as_str))
    };
    let extra = provider_extra(fleet.context().backend, &args);

    Ok(CreateGroup {
        name: args.name,
        count: args.count,
        template,
        expires,
        features,
        client_type: args.client_type,
        tags: parse_tags(&args.tags)?,
        extra,
    })
}

fn default_features(kind: GroupKind) -> Features {
    match kind {
        GroupKind::Cluster => Features::AEROSPIKE,
        GroupKind::Client => Features::NONE,
    }
}

/// `key=value` pairs
pub fn parse_tags(raw: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| anyhow!("invalid tag '{}', expected key=value", pair))
        })
        .collect()
}

fn provider_extra(backend: BackendKind, args: &CreateArgs) -> ProviderExtra {
    match backend {
        BackendKind::Docker => ProviderExtra::Docker(DockerExtra {
            image: args.image.clone(),
            network: args.network.clone(),
            ..DockerExtra::default()
        }),
        BackendKind::Aws => ProviderExtra::Aws(AwsExtra {
            instance_type: args.instance_type.clone().unwrap_or_default(),
            ami: args.image.clone(),
            root_volume_gb: args.disk_size,
            security_groups: args.firewall.clone(),
            subnet_id: args.network.clone(),
            spot: args.spot,
            ..AwsExtra::default()
        }),
        BackendKind::Gcp => {
            if args.image.is_some() {
                tracing::warn!("--image is ignored on gcp; instances always boot from the template");
            }
            ProviderExtra::Gcp(GcpExtra {
                machine_type: args.instance_type.clone().unwrap_or_default(),
                boot_disk_gb: args.disk_size,
                network_tags: args.firewall.clone(),
                subnet: args.network.clone(),
                spot: args.spot,
                ..GcpExtra::default()
            })
        }
    }
}
