//! gcloud output to fleetlab model conversion
//!
//! Compute Engine labels only hold `[a-z0-9_-]`, so labels carry lowercased
//! copies for server-side filtering while the exact values live in instance
//! metadata (nodes) or the image description (templates).

use crate::types::{Disk, Firewall, FirewallPorts, GcpSubnet, Image, Instance, last_segment};
use chrono::{DateTime, Utc};
use fleetlab_backend::tags::{
    TAG_ARCH, TAG_DISTRO, TAG_EXPIRES, TAG_GROUP, TAG_KIND, TAG_MANAGED, TAG_NODE, TAG_OWNER, TAG_TEMPLATE,
    TAG_VOLUME, is_managed, node_from_tags,
};
use fleetlab_backend::{
    Arch, Expiry, FirewallDetail, FirewallRule, FleetError, GroupKind, Node, NodeInstance,
    NodeNo, NodeState, Result, Subnet, Template, TemplateKey, Volume,
};
use std::collections::BTreeMap;

/// Machine families running on arm64
pub const ARM_FAMILIES: [&str; 3] = ["t2a", "c4a", "a4x"];

/// Metadata keys that belong to the guest environment, not to fleetlab
pub const SYSTEM_METADATA: [&str; 3] = ["ssh-keys", "startup-script", "enable-oslogin"];

const OWNER_PREFIX: &str = "fleetlab owner=";
const ANYWHERE: &str = "0.0.0.0/0";
const GIB: u64 = 1024 * 1024 * 1024;
const MAX_LABEL_LEN: usize = 63;

/// Lowercased resource-name form: anything outside `[a-z0-9-]` becomes `-`
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

pub fn instance_name(group: &str, kind: GroupKind, node: NodeNo) -> String {
    let letter = match kind {
        GroupKind::Cluster => 's',
        GroupKind::Client => 'c',
    };
    format!("fleetlab-{}-{}-{}", sanitize(group), letter, node)
}

/// Node number encoded in an instance name
pub fn node_from_name(name: &str) -> Option<NodeNo> {
    name.rsplit('-').next()?.parse().ok().filter(|n| *n > 0)
}

/// Label-safe value: dots and pluses become `-`, other invalid characters `_`
pub fn label_value(value: &str) -> String {
    value
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => c,
            '.' | '+' => '-',
            _ => '_',
        })
        .take(MAX_LABEL_LEN)
        .collect()
}

/// `--labels` argument
pub fn labels_arg(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", label_value(k), label_value(v)))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn is_arm_machine(machine_type: &str) -> bool {
    let family = machine_type.split('-').next().unwrap_or_default();
    ARM_FAMILIES.contains(&family.to_ascii_lowercase().as_str())
}

/// Compute Engine reports stopped instances as `TERMINATED`
pub fn instance_state(status: &str) -> NodeState {
    match status {
        "TERMINATED" | "STOPPING" | "SUSPENDING" | "SUSPENDED" => NodeState::Stopped,
        "PROVISIONING" | "STAGING" | "REPAIRING" => NodeState::Provisioning,
        other => NodeState::from_provider(other),
    }
}

/// Decodes a managed instance of `kind`; anything else is skipped
pub fn instance_to_node(instance: &Instance, kind: GroupKind) -> Option<Node> {
    let mut tags: BTreeMap<String, String> = instance
        .metadata_map()
        .into_iter()
        .filter(|(k, _)| !SYSTEM_METADATA.contains(&k.as_str()))
        .collect();
    if !is_managed(&tags, Some(kind)) {
        return None;
    }
    // Written after creation; fall back to the name until it lands
    if !tags.contains_key(TAG_NODE)
        && let Some(node) = node_from_name(&instance.name)
    {
        tags.insert(TAG_NODE.to_string(), node.to_string());
    }

    let machine_type = last_segment(&instance.machine_type).to_string();
    let facts = NodeInstance {
        instance_id: instance.name.clone(),
        private_ip: instance.private_ip(),
        public_ip: instance.public_ip(),
        state: Some(instance_state(&instance.status)),
        arch: Some(Arch::from_is_arm(is_arm_machine(&machine_type))),
        zone: last_segment(&instance.zone).to_string(),
        instance_type: machine_type,
        spot: instance.scheduling.as_ref().is_some_and(|s| {
            s.preemptible || s.provisioning_model.as_deref() == Some("SPOT")
        }),
        firewalls: instance.tags.as_ref().map(|t| t.items.clone()).unwrap_or_default(),
    };
    match node_from_tags(tags, facts) {
        Ok(node) => Some(node),
        Err(e) => {
            tracing::warn!(instance = %instance.name, error = %e, "skipping instance with broken metadata");
            None
        }
    }
}

/// Labels every fleetlab node carries, for server-side filtering
pub fn node_labels(kind: GroupKind, group: &str, owner: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(TAG_MANAGED.to_string(), "true".to_string());
    labels.insert(TAG_KIND.to_string(), kind.as_str().to_string());
    labels.insert(TAG_GROUP.to_string(), sanitize(group));
    if !owner.is_empty() {
        labels.insert(TAG_OWNER.to_string(), owner.to_string());
    }
    labels
}

pub fn template_image_name(key: &TemplateKey) -> String {
    format!(
        "fleetlab-{}",
        sanitize(&format!(
            "{}-{}-{}-{}",
            key.distribution, key.distro_version, key.arch, key.aerospike_version
        ))
    )
}

pub fn template_labels(key: &TemplateKey) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(TAG_TEMPLATE.to_string(), "true".to_string());
    labels.insert(TAG_DISTRO.to_string(), key.distribution.clone());
    labels.insert(TAG_ARCH.to_string(), key.arch.as_str().to_string());
    labels
}

/// Image description holding the exact template key
pub fn template_description(key: &TemplateKey) -> Result<String> {
    Ok(serde_json::to_string(key)?)
}

pub fn image_to_template(image: &Image) -> Option<Template> {
    if image.labels.get(TAG_TEMPLATE).map(String::as_str) != Some("true") {
        return None;
    }
    let key: TemplateKey = serde_json::from_str(image.description.as_deref()?).ok()?;
    Some(Template {
        key,
        image_id: image.name.clone(),
        region: "global".to_string(),
        created: image.creation_timestamp.as_deref().and_then(parse_time),
        size_bytes: image
            .disk_size_gb
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|gb| gb * GIB),
    })
}

pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Owner recorded in a rule description
pub fn firewall_description(owner: &str) -> String {
    format!("{}{}", OWNER_PREFIX, owner)
}

fn port_list(rules: &[FirewallPorts]) -> Vec<String> {
    rules
        .iter()
        .flat_map(|rule| {
            if rule.ip_protocol == "all" {
                vec!["all".to_string()]
            } else if rule.ports.is_empty() {
                vec![rule.ip_protocol.clone()]
            } else {
                rule.ports
                    .iter()
                    .map(|p| format!("{}/{}", p, rule.ip_protocol))
                    .collect()
            }
        })
        .collect()
}

pub fn firewall_to_rule(firewall: &Firewall) -> FirewallRule {
    FirewallRule {
        name: firewall.name.clone(),
        network: last_segment(&firewall.network).to_string(),
        allow_ports: port_list(&firewall.allowed),
        deny_ports: port_list(&firewall.denied),
        source_ranges: firewall.source_ranges.clone(),
        owner: firewall
            .description
            .as_deref()
            .and_then(|d| d.strip_prefix(OWNER_PREFIX))
            .unwrap_or_default()
            .to_string(),
        detail: FirewallDetail::Gcp {
            target_tags: firewall.target_tags.clone(),
            direction: firewall.direction.clone().unwrap_or_else(|| "INGRESS".to_string()),
            priority: firewall.priority.unwrap_or(1000),
        },
    }
}

/// `22`, `3000-3005` or `53/udp` as a `--allow` entry
pub fn allow_rule(port: &str) -> Result<String> {
    let invalid = || FleetError::validation(format!("invalid port '{}'", port));
    let (range, protocol) = port.split_once('/').unwrap_or((port, "tcp"));
    if !matches!(protocol, "tcp" | "udp") {
        return Err(invalid());
    }
    let (from, to) = range.split_once('-').unwrap_or((range, range));
    let from: u16 = from.trim().parse().map_err(|_| invalid())?;
    let to: u16 = to.trim().parse().map_err(|_| invalid())?;
    if from > to {
        return Err(invalid());
    }
    Ok(if from == to {
        format!("{}:{}", protocol, from)
    } else {
        format!("{}:{}-{}", protocol, from, to)
    })
}

pub fn source_ranges(ranges: &[String]) -> String {
    if ranges.is_empty() {
        ANYWHERE.to_string()
    } else {
        ranges.join(",")
    }
}

pub fn to_subnet(subnet: &GcpSubnet) -> Subnet {
    let network = last_segment(&subnet.network).to_string();
    Subnet {
        id: subnet.id.clone().unwrap_or_else(|| subnet.name.clone()),
        name: subnet.name.clone(),
        cidr: subnet.ip_cidr_range.clone(),
        network_id: network.clone(),
        is_zone_default: network == "default",
        network_name: network,
        network_cidr: String::new(),
        zone: last_segment(&subnet.region).to_string(),
        auto_public_ip: true,
    }
}

/// Decodes a persistent disk labelled as a fleetlab volume
pub fn disk_to_volume(disk: &Disk) -> Option<Volume> {
    if disk.labels.get(TAG_VOLUME).map(String::as_str) != Some("true") {
        return None;
    }
    Some(Volume {
        name: disk.name.clone(),
        id: disk.id.clone().unwrap_or_else(|| disk.name.clone()),
        zone: last_segment(&disk.zone).to_string(),
        owner: disk.labels.get(TAG_OWNER).cloned().unwrap_or_default(),
        expires: disk
            .labels
            .get(TAG_EXPIRES)
            .and_then(|v| Expiry::parse(v).ok())
            .unwrap_or_default(),
        size_bytes: disk
            .size_gb
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|gb| gb * GIB),
        created: disk.creation_timestamp.as_deref().and_then(parse_time),
        attached_to: disk.users.iter().map(|u| last_segment(u).to_string()).collect(),
        tags: disk
            .labels
            .iter()
            .filter(|(k, _)| k.as_str() != TAG_MANAGED)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, MetadataItem};

    fn item(key: &str, value: &str) -> MetadataItem {
        MetadataItem {
            key: key.to_string(),
            value: Some(value.to_string()),
        }
    }

    fn node_instance(items: Vec<MetadataItem>) -> Instance {
        Instance {
            name: "fleetlab-my-dc-s-4".to_string(),
            zone: "projects/p/zones/europe-west1-b".to_string(),
            status: "TERMINATED".to_string(),
            machine_type: "projects/p/zones/europe-west1-b/machineTypes/c4a-standard-4".to_string(),
            metadata: Some(Metadata { items }),
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_and_names() {
        assert_eq!(sanitize("My_DC.1"), "my-dc-1");
        assert_eq!(instance_name("My_DC", GroupKind::Cluster, 3), "fleetlab-my-dc-s-3");
        assert_eq!(instance_name("load", GroupKind::Client, 12), "fleetlab-load-c-12");
        assert_eq!(node_from_name("fleetlab-load-c-12"), Some(12));
        assert_eq!(node_from_name("fleetlab-load-c-0"), None);
    }

    #[test]
    fn test_label_value() {
        assert_eq!(label_value("8.0.0.1"), "8-0-0-1");
        assert_eq!(label_value("Alice@Example"), "alice_example");
        assert_eq!(label_value("1+2"), "1-2");
        assert_eq!(label_value(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn test_is_arm_machine() {
        assert!(is_arm_machine("t2a-standard-1"));
        assert!(is_arm_machine("c4a-highmem-8"));
        assert!(is_arm_machine("a4x-highgpu-4g"));
        assert!(!is_arm_machine("e2-medium"));
        assert!(!is_arm_machine("n2-standard-4"));
    }

    #[test]
    fn test_instance_to_node() {
        let instance = node_instance(vec![
            item(TAG_MANAGED, "true"),
            item(TAG_KIND, "cluster"),
            item(TAG_GROUP, "My_DC"),
            item(TAG_EXPIRES, "2026-03-01T00:00:00Z"),
            item("ssh-keys", "fleetlab:ssh-ed25519 AAAA"),
        ]);
        let node = instance_to_node(&instance, GroupKind::Cluster).unwrap();
        assert_eq!(node.group.as_str(), "My_DC");
        assert_eq!(node.node_no, 4);
        assert_eq!(node.state, NodeState::Stopped);
        assert_eq!(node.arch, Arch::Arm64);
        assert_eq!(node.zone, "europe-west1-b");
        assert!(!node.expires.is_never());
        assert!(!node.tags.contains_key("ssh-keys"));

        assert!(instance_to_node(&instance, GroupKind::Client).is_none());
        assert!(instance_to_node(&node_instance(Vec::new()), GroupKind::Cluster).is_none());
    }

    #[test]
    fn test_template_image() {
        let key = TemplateKey::new("ubuntu", "24.04", "8.0.0.1", Arch::Arm64);
        assert_eq!(template_image_name(&key), "fleetlab-ubuntu-24-04-arm64-8-0-0-1");

        let image = Image {
            name: template_image_name(&key),
            description: Some(template_description(&key).unwrap()),
            disk_size_gb: Some("20".to_string()),
            creation_timestamp: Some("2026-01-02T03:04:05.000-08:00".to_string()),
            labels: template_labels(&key),
            ..Default::default()
        };
        let template = image_to_template(&image).unwrap();
        assert_eq!(template.key, key);
        assert_eq!(template.size_bytes, Some(20 * GIB));
        assert!(template.created.is_some());

        assert!(image_to_template(&Image::default()).is_none());
    }

    #[test]
    fn test_allow_rule() {
        assert_eq!(allow_rule("22").unwrap(), "tcp:22");
        assert_eq!(allow_rule("3000-3005").unwrap(), "tcp:3000-3005");
        assert_eq!(allow_rule("53/udp").unwrap(), "udp:53");
        assert!(allow_rule("5-1").is_err());
        assert!(allow_rule("22/icmp").is_err());
        assert_eq!(source_ranges(&[]), "0.0.0.0/0");
    }

    #[test]
    fn test_firewall_to_rule() {
        let firewall = Firewall {
            name: "fleetlab-db".to_string(),
            network: "projects/p/global/networks/default".to_string(),
            description: Some(firewall_description("alice")),
            allowed: vec![FirewallPorts {
                ip_protocol: "tcp".to_string(),
                ports: vec!["22".to_string(), "3000-3003".to_string()],
            }],
            denied: vec![FirewallPorts {
                ip_protocol: "all".to_string(),
                ports: Vec::new(),
            }],
            ..Default::default()
        };
        let rule = firewall_to_rule(&firewall);
        assert_eq!(rule.network, "default");
        assert_eq!(rule.owner, "alice");
        assert_eq!(rule.allow_ports, vec!["22/tcp", "3000-3003/tcp"]);
        assert_eq!(rule.deny_ports, vec!["all"]);
    }

    #[test]
    fn test_disk_to_volume() {
        let mut labels = BTreeMap::new();
        labels.insert(TAG_MANAGED.to_string(), "true".to_string());
        labels.insert(TAG_VOLUME.to_string(), "true".to_string());
        labels.insert(TAG_EXPIRES.to_string(), "1767225600".to_string());
        let disk = Disk {
            name: "data".to_string(),
            zone: "projects/p/zones/us-east1-c".to_string(),
            size_gb: Some("100".to_string()),
            users: vec!["projects/p/zones/us-east1-c/instances/fleetlab-db-s-1".to_string()],
            labels,
            ..Default::default()
        };
        let volume = disk_to_volume(&disk).unwrap();
        assert_eq!(volume.zone, "us-east1-c");
        assert_eq!(volume.attached_to, vec!["fleetlab-db-s-1"]);
        assert!(!volume.expires.is_never());
        assert!(!volume.tags.contains_key(TAG_MANAGED));

        assert!(disk_to_volume(&Disk::default()).is_none());
    }
}
