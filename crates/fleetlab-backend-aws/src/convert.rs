//! aws CLI output to fleetlab model conversion

use crate::types::{
    AwsSubnet, FileSystem, Image, Instance, IpPermission, IpRange, SecurityGroup, Vpc, tag_map,
};
use chrono::{DateTime, Utc};
use fleetlab_backend::tags::{
    TAG_AEROSPIKE_VERSION, TAG_ARCH, TAG_DISTRO, TAG_DISTRO_VERSION, TAG_EXPIRES, TAG_MANAGED,
    TAG_OWNER, TAG_TEMPLATE, TAG_VOLUME, TAG_BATCH_FIRST, TAG_NODE, is_managed, node_from_tags,
};
use fleetlab_backend::{
    Arch, Expiry, FirewallDetail, FirewallRule, FleetError, GroupKind, Node, NodeInstance,
    NodeNo, NodeState, Result, Subnet, Template, TemplateKey, Volume,
};
use std::collections::BTreeMap;

pub const TAG_NAME: &str = "Name";
const ANYWHERE: &str = "0.0.0.0/0";

/// EC2 architecture name for `arch`
pub fn ec2_arch(arch: Arch) -> &'static str {
    match arch {
        Arch::Amd64 => "x86_64",
        Arch::Arm64 => "arm64",
    }
}

/// `Name` tag of node instances
pub fn instance_name(group: &str, kind: GroupKind, node: u32) -> String {
    match kind {
        GroupKind::Cluster => format!("fleetlab-{}_{}", group, node),
        GroupKind::Client => format!("fleetlab_c-{}_{}", group, node),
    }
}

/// Decodes a managed instance of `kind`; anything else is skipped
pub fn instance_to_node(instance: &Instance, kind: GroupKind) -> Option<Node> {
    let mut tags = tag_map(&instance.tags);
    if !is_managed(&tags, Some(kind)) {
        return None;
    }
    fill_node_tag(&mut tags, instance.ami_launch_index);
    let facts = NodeInstance {
        instance_id: instance.instance_id.clone(),
        private_ip: instance.private_ip_address.clone(),
        public_ip: instance.public_ip_address.clone(),
        state: Some(NodeState::from_provider(instance.state_name())),
        arch: instance.architecture.as_deref().and_then(|a| a.parse().ok()),
        zone: instance
            .placement
            .as_ref()
            .and_then(|p| p.availability_zone.clone())
            .unwrap_or_default(),
        instance_type: instance.instance_type.clone().unwrap_or_default(),
        spot: instance.instance_lifecycle.as_deref() == Some("spot"),
        firewalls: instance
            .security_groups
            .iter()
            .filter_map(|g| g.group_name.clone().or_else(|| g.group_id.clone()))
            .collect(),
    };
    match node_from_tags(tags, facts) {
        Ok(node) => Some(node),
        Err(e) => {
            tracing::warn!(instance = %instance.instance_id, error = %e, "skipping instance with broken tags");
            None
        }
    }
}

/// Derives the node number of an instance whose per-node tag was never
/// written from its batch's first number and its launch index
pub fn fill_node_tag(tags: &mut BTreeMap<String, String>, launch_index: Option<u32>) {
    if tags.contains_key(TAG_NODE) {
        return;
    }
    let node = tags
        .get(TAG_BATCH_FIRST)
        .and_then(|v| v.parse::<NodeNo>().ok())
        .zip(launch_index)
        .and_then(|(first, index)| first.checked_add(index));
    if let Some(node) = node {
        tags.insert(TAG_NODE.to_string(), node.to_string());
    }
}

/// Tags written on template AMIs
pub fn template_tags(key: &TemplateKey) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(TAG_TEMPLATE.to_string(), "true".to_string());
    tags.insert(TAG_DISTRO.to_string(), key.distribution.clone());
    tags.insert(TAG_DISTRO_VERSION.to_string(), key.distro_version.clone());
    tags.insert(TAG_AEROSPIKE_VERSION.to_string(), key.aerospike_version.clone());
    tags.insert(TAG_ARCH.to_string(), key.arch.as_str().to_string());
    tags.insert(TAG_NAME.to_string(), template_image_name(key));
    tags
}

/// AMI name; unique per template key
pub fn template_image_name(key: &TemplateKey) -> String {
    format!(
        "fleetlab-{}-{}-{}-{}",
        key.distribution, key.distro_version, key.arch, key.aerospike_version
    )
}

pub fn template_key(tags: &BTreeMap<String, String>) -> Option<TemplateKey> {
    if tags.get(TAG_TEMPLATE).map(String::as_str) != Some("true") {
        return None;
    }
    Some(TemplateKey::new(
        tags.get(TAG_DISTRO)?.clone(),
        tags.get(TAG_DISTRO_VERSION)?.clone(),
        tags.get(TAG_AEROSPIKE_VERSION)?.clone(),
        tags.get(TAG_ARCH)?.parse().ok()?,
    ))
}

pub fn image_to_template(image: &Image, region: &str) -> Option<Template> {
    let key = template_key(&tag_map(&image.tags))?;
    Some(Template {
        key,
        image_id: image.image_id.clone(),
        region: region.to_string(),
        created: image.creation_date.as_deref().and_then(parse_time),
        size_bytes: image
            .block_device_mappings
            .iter()
            .filter_map(|m| m.ebs.as_ref()?.volume_size)
            .reduce(|a, b| a + b)
            .map(|gib| gib * 1024 * 1024 * 1024),
    })
}

pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn port_range(permission: &IpPermission) -> String {
    match (permission.from_port, permission.to_port) {
        _ if permission.ip_protocol == "-1" => "all".to_string(),
        (Some(from), Some(to)) if from == to => format!("{}/{}", from, permission.ip_protocol),
        (Some(from), Some(to)) => format!("{}-{}/{}", from, to, permission.ip_protocol),
        _ => permission.ip_protocol.clone(),
    }
}

pub fn security_group_to_firewall(group: &SecurityGroup) -> FirewallRule {
    let tags = tag_map(&group.tags);
    let mut source_ranges: Vec<String> = group
        .ip_permissions
        .iter()
        .flat_map(|p| p.ip_ranges.iter().map(|r| r.cidr_ip.clone()))
        .collect();
    source_ranges.sort();
    source_ranges.dedup();

    FirewallRule {
        name: group.group_name.clone(),
        network: group.vpc_id.clone().unwrap_or_default(),
        allow_ports: group.ip_permissions.iter().map(port_range).collect(),
        deny_ports: Vec::new(),
        source_ranges,
        owner: tags.get(TAG_OWNER).cloned().unwrap_or_default(),
        detail: FirewallDetail::Aws {
            group_id: group.group_id.clone(),
            description: group.description.clone(),
        },
    }
}

/// `22`, `3000-3005` or `3000/udp` as a TCP/UDP ingress permission
pub fn ingress_permission(port: &str, source_ranges: &[String]) -> Result<IpPermission> {
    let invalid = || FleetError::validation(format!("invalid port '{}'", port));
    let (range, protocol) = port.split_once('/').unwrap_or((port, "tcp"));
    if !matches!(protocol, "tcp" | "udp") {
        return Err(invalid());
    }
    let (from, to) = range.split_once('-').unwrap_or((range, range));
    let from: i32 = from.trim().parse().map_err(|_| invalid())?;
    let to: i32 = to.trim().parse().map_err(|_| invalid())?;
    if from < 0 || to > 65535 || from > to {
        return Err(invalid());
    }

    let ranges = if source_ranges.is_empty() {
        vec![ANYWHERE.to_string()]
    } else {
        source_ranges.to_vec()
    };
    Ok(IpPermission {
        ip_protocol: protocol.to_string(),
        from_port: Some(from),
        to_port: Some(to),
        ip_ranges: ranges.into_iter().map(|cidr_ip| IpRange { cidr_ip }).collect(),
    })
}

/// Joins subnets with their VPCs
pub fn to_subnets(subnets: &[AwsSubnet], vpcs: &[Vpc]) -> Vec<Subnet> {
    subnets
        .iter()
        .map(|subnet| {
            let vpc = vpcs.iter().find(|v| v.vpc_id == subnet.vpc_id);
            Subnet {
                id: subnet.subnet_id.clone(),
                name: tag_map(&subnet.tags).remove(TAG_NAME).unwrap_or_default(),
                cidr: subnet.cidr_block.clone(),
                network_id: subnet.vpc_id.clone(),
                network_name: vpc
                    .and_then(|v| tag_map(&v.tags).remove(TAG_NAME))
                    .unwrap_or_default(),
                network_cidr: vpc.map(|v| v.cidr_block.clone()).unwrap_or_default(),
                zone: subnet.availability_zone.clone(),
                is_zone_default: subnet.default_for_az,
                auto_public_ip: subnet.map_public_ip_on_launch,
            }
        })
        .collect()
}

/// Decodes an EFS file system tagged as a fleetlab volume
pub fn file_system_to_volume(fs: &FileSystem) -> Option<Volume> {
    let tags = tag_map(&fs.tags);
    if tags.get(TAG_VOLUME).map(String::as_str) != Some("true") {
        return None;
    }
    Some(Volume {
        name: fs
            .name
            .clone()
            .or_else(|| tags.get(TAG_NAME).cloned())
            .unwrap_or_else(|| fs.file_system_id.clone()),
        id: fs.file_system_id.clone(),
        zone: fs.availability_zone_name.clone().unwrap_or_default(),
        owner: tags.get(TAG_OWNER).cloned().unwrap_or_default(),
        expires: tags
            .get(TAG_EXPIRES)
            .and_then(|v| Expiry::parse(v).ok())
            .unwrap_or_default(),
        size_bytes: fs.size_in_bytes.as_ref().map(|s| s.value),
        created: fs.creation_time.as_deref().and_then(parse_time),
        attached_to: Vec::new(),
        tags: tags
            .into_iter()
            .filter(|(k, _)| k != TAG_MANAGED)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DescribeInstances, DescribeSecurityGroups, Tag};
    use fleetlab_backend::tags::{TAG_GROUP, TAG_KIND};

    fn tag(key: &str, value: &str) -> Tag {
        Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn node_instance(kind: &str) -> Instance {
        Instance {
            instance_id: "i-1".to_string(),
            instance_type: Some("c7g.large".to_string()),
            state: Some(crate::types::InstanceState {
                name: "stopped".to_string(),
            }),
            private_ip_address: Some("10.0.0.5".to_string()),
            architecture: Some("arm64".to_string()),
            instance_lifecycle: Some("spot".to_string()),
            tags: vec![
                tag(TAG_MANAGED, "true"),
                tag(TAG_KIND, kind),
                tag(TAG_GROUP, "demo"),
                tag(TAG_NODE, "3"),
                tag(TAG_OWNER, "alice"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_instance_to_node() {
        let node = instance_to_node(&node_instance("cluster"), GroupKind::Cluster).unwrap();
        assert_eq!(node.group.as_str(), "demo");
        assert_eq!(node.node_no, 3);
        assert_eq!(node.state, NodeState::Stopped);
        assert_eq!(node.arch, Arch::Arm64);
        assert!(node.spot);
        assert_eq!(node.reachable_ip(), Some("10.0.0.5"));

        assert!(instance_to_node(&node_instance("client"), GroupKind::Cluster).is_none());
        assert!(instance_to_node(&Instance::default(), GroupKind::Cluster).is_none());
    }

    #[test]
    fn test_untagged_node_uses_launch_index() {
        let mut instance = node_instance("cluster");
        instance.tags.retain(|t| t.key != TAG_NODE);
        instance.tags.push(tag(TAG_BATCH_FIRST, "4"));
        instance.ami_launch_index = Some(1);
        let node = instance_to_node(&instance, GroupKind::Cluster).unwrap();
        assert_eq!(node.node_no, 5);
        assert_eq!(node.group.as_str(), "demo");

        // the written tag wins
        let mut tagged = node_instance("cluster");
        tagged.tags.push(tag(TAG_BATCH_FIRST, "4"));
        tagged.ami_launch_index = Some(1);
        assert_eq!(instance_to_node(&tagged, GroupKind::Cluster).unwrap().node_no, 3);

        let mut overflow = BTreeMap::new();
        overflow.insert(TAG_BATCH_FIRST.to_string(), u32::MAX.to_string());
        fill_node_tag(&mut overflow, Some(1));
        assert!(!overflow.contains_key(TAG_NODE));
    }

    #[test]
    fn test_instance_from_cli_json() {
        let json = r#"{"Reservations":[{"Instances":[{"InstanceId":"i-9","State":{"Name":"pending"},
            "Tags":[{"Key":"fleetlab-managed","Value":"true"},{"Key":"fleetlab-kind","Value":"client"},
                    {"Key":"fleetlab-group","Value":"load"},{"Key":"fleetlab-node","Value":"1"}]}]}]}"#;
        let parsed: DescribeInstances = serde_json::from_str(json).unwrap();
        let node = instance_to_node(&parsed.reservations[0].instances[0], GroupKind::Client).unwrap();
        assert_eq!(node.state, NodeState::Provisioning);
        assert_eq!(node.kind, GroupKind::Client);
    }

    #[test]
    fn test_template_tags() {
        let key = TemplateKey::new("ubuntu", "24.04", "8.0.0.1", Arch::Amd64);
        let tags = template_tags(&key);
        assert_eq!(template_key(&tags), Some(key.clone()));
        assert_eq!(tags[TAG_NAME], "fleetlab-ubuntu-24.04-amd64-8.0.0.1");

        let image = Image {
            image_id: "ami-1".to_string(),
            creation_date: Some("2026-01-02T03:04:05.000Z".to_string()),
            tags: crate::types::tag_list(&tags),
            ..Default::default()
        };
        let template = image_to_template(&image, "eu-west-1").unwrap();
        assert_eq!(template.key, key);
        assert!(template.created.is_some());

        assert!(image_to_template(&Image::default(), "eu-west-1").is_none());
    }

    #[test]
    fn test_ingress_permission() {
        let p = ingress_permission("3000-3005", &[]).unwrap();
        assert_eq!((p.from_port, p.to_port), (Some(3000), Some(3005)));
        assert_eq!(p.ip_ranges[0].cidr_ip, "0.0.0.0/0");

        let p = ingress_permission("53/udp", &["10.0.0.0/8".to_string()]).unwrap();
        assert_eq!(p.ip_protocol, "udp");
        assert_eq!(p.ip_ranges[0].cidr_ip, "10.0.0.0/8");

        assert!(ingress_permission("10-5", &[]).is_err());
        assert!(ingress_permission("22/icmp", &[]).is_err());
        assert!(ingress_permission("ssh", &[]).is_err());
    }

    #[test]
    fn test_security_group_to_firewall() {
        let json = r#"{"SecurityGroups":[{"GroupId":"sg-1","GroupName":"fleetlab-db","Description":"fleetlab",
            "VpcId":"vpc-1","IpPermissions":[{"IpProtocol":"tcp","FromPort":22,"ToPort":22,"IpRanges":[{"CidrIp":"0.0.0.0/0"}]},
            {"IpProtocol":"tcp","FromPort":3000,"ToPort":3003,"IpRanges":[{"CidrIp":"0.0.0.0/0"}]}],
            "Tags":[{"Key":"fleetlab-owner","Value":"bob"}]}]}"#;
        let parsed: DescribeSecurityGroups = serde_json::from_str(json).unwrap();
        let rule = security_group_to_firewall(&parsed.security_groups[0]);
        assert_eq!(rule.allow_ports, vec!["22/tcp", "3000-3003/tcp"]);
        assert_eq!(rule.source_ranges, vec!["0.0.0.0/0"]);
        assert_eq!(rule.owner, "bob");
        assert_eq!(rule.network, "vpc-1");
    }

    #[test]
    fn test_to_subnets() {
        let subnets = vec![AwsSubnet {
            subnet_id: "subnet-1".to_string(),
            vpc_id: "vpc-1".to_string(),
            cidr_block: "172.31.0.0/20".to_string(),
            availability_zone: "eu-west-1a".to_string(),
            default_for_az: true,
            map_public_ip_on_launch: true,
            tags: vec![],
        }];
        let vpcs = vec![Vpc {
            vpc_id: "vpc-1".to_string(),
            cidr_block: "172.31.0.0/16".to_string(),
            tags: vec![tag(TAG_NAME, "default")],
        }];
        let joined = to_subnets(&subnets, &vpcs);
        assert_eq!(joined[0].network_name, "default");
        assert_eq!(joined[0].network_cidr, "172.31.0.0/16");
        assert!(joined[0].is_zone_default);
    }

    #[test]
    fn test_file_system_to_volume() {
        let fs = FileSystem {
            file_system_id: "fs-1".to_string(),
            name: Some("shared".to_string()),
            tags: vec![
                tag(TAG_VOLUME, "true"),
                tag(TAG_OWNER, "carol"),
                tag(TAG_EXPIRES, "2030-01-01T00:00:00Z"),
            ],
            ..Default::default()
        };
        let volume = file_system_to_volume(&fs).unwrap();
        assert_eq!(volume.name, "shared");
        assert_eq!(volume.owner, "carol");
        assert!(!volume.expires.is_never());

        let plain = FileSystem {
            file_system_id: "fs-2".to_string(),
            ..Default::default()
        };
        assert!(file_system_to_volume(&plain).is_none());
    }
}
