//! Conversions between fleetlab resources and Docker API types

// Uses the bollard 0.19 deprecated option structs
#![allow(deprecated)]

use crate::naming;
use bollard::container::{Config, CreateContainerOptions};
use bollard::models::{
    ContainerSummary, HostConfig, ImageSummary, Ipam, IpamConfig, Network, NetworkCreateRequest,
    PortBinding,
};
use chrono::{DateTime, TimeZone, Utc};
use fleetlab_backend::model::{
    Expiry, FirewallDetail, FirewallRule, FirewallSpec, Node, NodeInstance, NodeNo, NodeState,
    Template, Volume,
};
use fleetlab_backend::tags::{TAG_EXPIRES, TAG_MANAGED, TAG_OWNER, TAG_VOLUME, is_managed, node_from_tags};
use fleetlab_backend::{DeployRequest, DockerExtra, FleetError, GroupKind, Result};
use std::collections::{BTreeMap, HashMap};

const MTU_OPTION: &str = "com.docker.network.driver.mtu";
const LOCAL_ZONE: &str = "local";

/// Keeps the container alive until it is stopped
pub fn keepalive_cmd() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}

/// Parses a `host:container` port publication
pub fn parse_port_mapping(mapping: &str) -> Result<(u16, u16)> {
    let invalid = || {
        FleetError::validation(format!(
            "invalid port mapping '{}', expected HOST:CONTAINER",
            mapping
        ))
    };
    let (host, container) = mapping.split_once(':').ok_or_else(invalid)?;
    let host: u16 = host.trim().parse().map_err(|_| invalid())?;
    let container: u16 = container.trim().parse().map_err(|_| invalid())?;
    Ok((host, container))
}

/// Container settings for node `node_no`, the `index`-th node of the request.
/// Host ports are shifted by `index` so several nodes can publish the same
/// container port.
pub fn node_container_config(
    request: &DeployRequest,
    extra: &DockerExtra,
    node_no: NodeNo,
    index: usize,
    image: &str,
) -> Result<(Config<String>, CreateContainerOptions<String>)> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for mapping in &extra.exposed_ports {
        let (host, container) = parse_port_mapping(mapping)?;
        let host = u16::try_from(usize::from(host) + index).map_err(|_| {
            FleetError::validation(format!("host port {} + {} is out of range", host, index))
        })?;
        let container_port = format!("{}/tcp", container);
        exposed_ports.insert(container_port.clone(), HashMap::new());
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        network_mode: extra.network.clone(),
        privileged: Some(extra.privileged),
        nano_cpus: extra.cpus.map(|cpus| (cpus * 1_000_000_000.0) as i64),
        memory: extra.memory,
        init: Some(true),
        ..Default::default()
    };

    let name = naming::container_name(&request.group, node_no);
    let config = Config {
        image: Some(image.to_string()),
        hostname: Some(name.clone()),
        env: Some(vec![format!("NODE={}", node_no)]),
        cmd: Some(keepalive_cmd()),
        exposed_ports: Some(exposed_ports),
        labels: Some(request.tags.to_map(node_no).into_iter().collect()),
        host_config: Some(host_config),
        ..Default::default()
    };
    let options = CreateContainerOptions {
        name,
        platform: Some(naming::platform(request.template.arch)),
    };
    Ok((config, options))
}

pub fn labels_to_tags(labels: Option<&HashMap<String, String>>) -> BTreeMap<String, String> {
    labels
        .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// First IP address the container has on any network
pub fn container_ip(summary: &ContainerSummary) -> Option<String> {
    summary
        .network_settings
        .as_ref()
        .and_then(|s| s.networks.as_ref())
        .and_then(|networks| {
            let mut ips: Vec<(&String, &String)> = networks
                .iter()
                .filter_map(|(name, endpoint)| {
                    endpoint
                        .ip_address
                        .as_ref()
                        .filter(|ip| !ip.is_empty())
                        .map(|ip| (name, ip))
                })
                .collect();
            ips.sort();
            ips.first().map(|(_, ip)| ip.to_string())
        })
}

fn network_names(summary: &ContainerSummary) -> Vec<String> {
    let mut names: Vec<String> = summary
        .network_settings
        .as_ref()
        .and_then(|s| s.networks.as_ref())
        .map(|n| n.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    names
}

/// The node a fleetlab container represents; `None` for foreign containers
pub fn summary_to_node(summary: &ContainerSummary, kind: GroupKind) -> Option<Node> {
    let tags = labels_to_tags(summary.labels.as_ref());
    if !is_managed(&tags, Some(kind)) {
        return None;
    }
    let state = summary
        .state
        .as_ref()
        .map(|s| NodeState::from_provider(&s.to_string()));
    let instance = NodeInstance {
        instance_id: summary.id.clone().unwrap_or_default(),
        private_ip: container_ip(summary),
        public_ip: None,
        state,
        arch: None,
        zone: LOCAL_ZONE.to_string(),
        instance_type: summary.image.clone().unwrap_or_default(),
        spot: false,
        firewalls: network_names(summary),
    };
    match node_from_tags(tags, instance) {
        Ok(node) => Some(node),
        Err(e) => {
            tracing::warn!(container = ?summary.names, error = %e, "skipping container with broken fleetlab labels");
            None
        }
    }
}

/// Templates for every fleetlab tag an image carries
pub fn image_to_templates(image: &ImageSummary) -> Vec<Template> {
    image
        .repo_tags
        .iter()
        .filter_map(|tag| naming::parse_image_name(tag))
        .map(|key| Template {
            key,
            image_id: image.id.clone(),
            region: LOCAL_ZONE.to_string(),
            created: Utc.timestamp_opt(image.created, 0).single(),
            size_bytes: u64::try_from(image.size).ok(),
        })
        .collect()
}

pub fn firewall_request(spec: &FirewallSpec) -> NetworkCreateRequest {
    let mut labels = HashMap::new();
    labels.insert(TAG_MANAGED.to_string(), "true".to_string());
    labels.insert(TAG_OWNER.to_string(), spec.owner.clone());

    let ipam = spec.subnet.as_ref().map(|subnet| Ipam {
        config: Some(vec![IpamConfig {
            subnet: Some(subnet.clone()),
            ..Default::default()
        }]),
        ..Default::default()
    });
    let options = spec.mtu.as_ref().map(|mtu| {
        let mut options = HashMap::new();
        options.insert(MTU_OPTION.to_string(), mtu.clone());
        options
    });

    NetworkCreateRequest {
        name: spec.name.clone(),
        driver: Some("bridge".to_string()),
        labels: Some(labels),
        ipam,
        options,
        ..Default::default()
    }
}

/// fleetlab-managed networks as firewall rules
pub fn network_to_firewall(network: &Network) -> Option<FirewallRule> {
    let labels = labels_to_tags(network.labels.as_ref());
    if labels.get(TAG_MANAGED).map(String::as_str) != Some("true") {
        return None;
    }
    let name = network.name.clone()?;
    let subnets = network
        .ipam
        .as_ref()
        .and_then(|ipam| ipam.config.as_ref())
        .map(|configs| configs.iter().filter_map(|c| c.subnet.clone()).collect())
        .unwrap_or_default();
    Some(FirewallRule {
        network: name.clone(),
        name,
        allow_ports: Vec::new(),
        deny_ports: Vec::new(),
        source_ranges: Vec::new(),
        owner: labels.get(TAG_OWNER).cloned().unwrap_or_default(),
        detail: FirewallDetail::Docker {
            driver: network.driver.clone().unwrap_or_default(),
            subnets,
            mtu: network
                .options
                .as_ref()
                .and_then(|o| o.get(MTU_OPTION).cloned()),
        },
    })
}

/// fleetlab-managed volumes
pub fn to_volume(volume: &bollard::models::Volume) -> Option<Volume> {
    let tags: BTreeMap<String, String> = volume
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if tags.get(TAG_VOLUME).map(String::as_str) != Some("true") {
        return None;
    }
    Some(Volume {
        name: volume.name.clone(),
        id: volume.name.clone(),
        zone: LOCAL_ZONE.to_string(),
        owner: tags.get(TAG_OWNER).cloned().unwrap_or_default(),
        expires: tags
            .get(TAG_EXPIRES)
            .and_then(|e| Expiry::parse(e).ok())
            .unwrap_or_default(),
        size_bytes: volume
            .usage_data
            .as_ref()
            .and_then(|u| u64::try_from(u.size).ok()),
        created: volume
            .created_at
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|c| c.with_timezone(&Utc)),
        attached_to: Vec::new(),
        tags,
    })
}
