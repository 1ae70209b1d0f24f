//! Durable metadata written onto every provisioned resource
//!
//! Tags are the only state fleetlab keeps. Adapters store them as EC2 tags,
//! Compute Engine metadata or container labels and decode them back into
//! [`Node`]s on every listing.

use crate::error::{FleetError, Result};
use crate::model::{
    Arch, Expiry, Features, GroupKind, GroupName, Node, NodeInstance, NodeNo, NodeState,
};
use std::collections::BTreeMap;

pub const TAG_MANAGED: &str = "fleetlab-managed";
pub const TAG_OWNER: &str = "fleetlab-owner";
pub const TAG_EXPIRES: &str = "fleetlab-expires";
pub const TAG_FEATURES: &str = "fleetlab-features";
pub const TAG_KIND: &str = "fleetlab-kind";
pub const TAG_GROUP: &str = "fleetlab-group";
pub const TAG_NODE: &str = "fleetlab-node";
pub const TAG_NODE_SEQ_HIGH: &str = "fleetlab-node-seq-high";
/// First node number of a contiguous deploy batch
pub const TAG_BATCH_FIRST: &str = "fleetlab-batch-first";
pub const TAG_PROJECT: &str = "fleetlab-project";
pub const TAG_DISTRO: &str = "fleetlab-distro";
pub const TAG_DISTRO_VERSION: &str = "fleetlab-distro-version";
pub const TAG_AEROSPIKE_VERSION: &str = "fleetlab-aerospike-version";
pub const TAG_CLIENT_TYPE: &str = "fleetlab-client-type";
pub const TAG_ARCH: &str = "fleetlab-arch";
pub const TAG_TEMPLATE: &str = "fleetlab-template";
pub const TAG_VOLUME: &str = "fleetlab-volume";

/// Keys owned by fleetlab; user labels must not overwrite them
pub const RESERVED_TAGS: [&str; 15] = [
    TAG_MANAGED,
    TAG_EXPIRES,
    TAG_FEATURES,
    TAG_KIND,
    TAG_GROUP,
    TAG_NODE,
    TAG_NODE_SEQ_HIGH,
    TAG_BATCH_FIRST,
    TAG_PROJECT,
    TAG_DISTRO,
    TAG_DISTRO_VERSION,
    TAG_AEROSPIKE_VERSION,
    TAG_CLIENT_TYPE,
    TAG_ARCH,
    TAG_TEMPLATE,
];

/// Tags shared by every node of one deploy request
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTags {
    pub kind: GroupKind,
    pub group: GroupName,
    pub owner: String,
    pub project: Option<String>,
    pub expires: Expiry,
    pub features: Features,
    pub node_seq_high: NodeNo,
    pub distribution: String,
    pub distro_version: String,
    pub aerospike_version: Option<String>,
    pub client_type: Option<String>,
    pub arch: Arch,
    /// Free-form user tags
    pub extra: BTreeMap<String, String>,
}

impl NodeTags {
    /// Full tag map for node `node_no`
    pub fn to_map(&self, node_no: NodeNo) -> BTreeMap<String, String> {
        let mut tags = self.extra.clone();
        tags.insert(TAG_MANAGED.to_string(), "true".to_string());
        tags.insert(TAG_KIND.to_string(), self.kind.as_str().to_string());
        tags.insert(TAG_GROUP.to_string(), self.group.to_string());
        tags.insert(TAG_NODE.to_string(), node_no.to_string());
        tags.insert(TAG_NODE_SEQ_HIGH.to_string(), self.node_seq_high.to_string());
        tags.insert(TAG_OWNER.to_string(), self.owner.clone());
        tags.insert(TAG_EXPIRES.to_string(), self.expires.to_tag());
        tags.insert(TAG_FEATURES.to_string(), self.features.to_tag());
        tags.insert(TAG_DISTRO.to_string(), self.distribution.clone());
        tags.insert(TAG_DISTRO_VERSION.to_string(), self.distro_version.clone());
        tags.insert(TAG_ARCH.to_string(), self.arch.as_str().to_string());
        if let Some(project) = &self.project {
            tags.insert(TAG_PROJECT.to_string(), project.clone());
        }
        if let Some(version) = &self.aerospike_version {
            tags.insert(TAG_AEROSPIKE_VERSION.to_string(), version.clone());
        }
        if let Some(client_type) = &self.client_type {
            tags.insert(TAG_CLIENT_TYPE.to_string(), client_type.clone());
        }
        tags
    }

    /// Decodes a tag map written by [`NodeTags::to_map`]
    pub fn from_map(tags: &BTreeMap<String, String>) -> Result<(NodeTags, NodeNo)> {
        let required = |key: &str| {
            tags.get(key)
                .map(String::as_str)
                .ok_or_else(|| FleetError::validation(format!("missing tag {}", key)))
        };
        let optional = |key: &str| tags.get(key).filter(|v| !v.is_empty()).cloned();

        let kind: GroupKind = required(TAG_KIND)?.parse()?;
        let group = GroupName::new(required(TAG_GROUP)?)?;
        let node_no: NodeNo = required(TAG_NODE)?
            .parse()
            .map_err(|_| FleetError::validation(format!("invalid {} tag", TAG_NODE)))?;
        if node_no == 0 {
            return Err(FleetError::validation(format!("invalid {} tag", TAG_NODE)));
        }
        let node_seq_high = tags
            .get(TAG_NODE_SEQ_HIGH)
            .and_then(|v| v.parse().ok())
            .unwrap_or(node_no);
        let expires = match tags.get(TAG_EXPIRES) {
            Some(raw) => Expiry::parse(raw)?,
            None => Expiry::Never,
        };
        let features = tags
            .get(TAG_FEATURES)
            .map(|v| Features::from_tag(v))
            .unwrap_or_default();
        let arch = tags
            .get(TAG_ARCH)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let extra = tags
            .iter()
            .filter(|(k, _)| !RESERVED_TAGS.contains(&k.as_str()) && k.as_str() != TAG_OWNER)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok((
            NodeTags {
                kind,
                group,
                owner: optional(TAG_OWNER).unwrap_or_default(),
                project: optional(TAG_PROJECT),
                expires,
                features,
                node_seq_high,
                distribution: optional(TAG_DISTRO).unwrap_or_default(),
                distro_version: optional(TAG_DISTRO_VERSION).unwrap_or_default(),
                aerospike_version: optional(TAG_AEROSPIKE_VERSION),
                client_type: optional(TAG_CLIENT_TYPE),
                arch,
                extra,
            },
            node_no,
        ))
    }
}

/// Builds a [`Node`] from its tag map plus the provider's instance facts
pub fn node_from_tags(tags: BTreeMap<String, String>, instance: NodeInstance) -> Result<Node> {
    let (decoded, node_no) = NodeTags::from_map(&tags)?;
    Ok(Node {
        group: decoded.group,
        kind: decoded.kind,
        node_no,
        instance_id: instance.instance_id,
        private_ip: instance.private_ip,
        public_ip: instance.public_ip,
        state: instance.state.unwrap_or(NodeState::Provisioning),
        arch: instance.arch.unwrap_or(decoded.arch),
        distribution: decoded.distribution,
        distro_version: decoded.distro_version,
        aerospike_version: decoded.aerospike_version,
        client_type: decoded.client_type,
        owner: decoded.owner,
        project: decoded.project,
        expires: decoded.expires,
        features: decoded.features,
        zone: instance.zone,
        instance_type: instance.instance_type,
        spot: instance.spot,
        firewalls: instance.firewalls,
        node_seq_high: decoded.node_seq_high,
        tags,
    })
}

/// True when `tags` belong to a fleetlab node of `kind`
pub fn is_managed(tags: &BTreeMap<String, String>, kind: Option<GroupKind>) -> bool {
    if tags.get(TAG_MANAGED).map(String::as_str) != Some("true") {
        return false;
    }
    match kind {
        Some(kind) => tags.get(TAG_KIND).map(String::as_str) == Some(kind.as_str()),
        None => true,
    }
}

/// Rejects user labels that would overwrite fleetlab-owned keys
pub fn check_user_tag(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(FleetError::validation("tag key must not be empty"));
    }
    if RESERVED_TAGS.contains(&key) {
        return Err(FleetError::validation(format!(
            "tag '{}' is managed by fleetlab",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample() -> NodeTags {
        NodeTags {
            kind: GroupKind::Cluster,
            group: GroupName::new("mydc").unwrap(),
            owner: "alice".to_string(),
            project: Some("demo".to_string()),
            expires: Expiry::At(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()),
            features: Features::AEROSPIKE,
            node_seq_high: 3,
            distribution: "ubuntu".to_string(),
            distro_version: "24.04".to_string(),
            aerospike_version: Some("8.0.0.1".to_string()),
            client_type: None,
            arch: Arch::Arm64,
            extra: BTreeMap::from([("team".to_string(), "qa".to_string())]),
        }
    }

    #[test]
    fn test_map_contains_node_specific_values() {
        let map = sample().to_map(2);
        assert_eq!(map[TAG_NODE], "2");
        assert_eq!(map[TAG_NODE_SEQ_HIGH], "3");
        assert_eq!(map[TAG_EXPIRES], "2026-05-01T00:00:00Z");
        assert_eq!(map[TAG_FEATURES], "1");
        assert_eq!(map["team"], "qa");
        assert!(!map.contains_key(TAG_CLIENT_TYPE));
        assert!(is_managed(&map, Some(GroupKind::Cluster)));
        assert!(!is_managed(&map, Some(GroupKind::Client)));
    }

    #[test]
    fn test_decode_written_tags() {
        let tags = sample();
        let (decoded, node_no) = NodeTags::from_map(&tags.to_map(2)).unwrap();
        assert_eq!(node_no, 2);
        assert_eq!(decoded, tags);
    }

    #[test]
    fn test_node_from_tags_prefers_instance_facts() {
        let node = node_from_tags(
            sample().to_map(1),
            NodeInstance {
                instance_id: "i-1".to_string(),
                public_ip: Some("203.0.113.5".to_string()),
                state: Some(NodeState::Running),
                arch: Some(Arch::Amd64),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(node.arch, Arch::Amd64);
        assert_eq!(node.state, NodeState::Running);
        assert_eq!(node.owner, "alice");
        assert_eq!(node.reachable_ip(), Some("203.0.113.5"));
    }

    #[test]
    fn test_missing_or_bad_tags() {
        let mut map = sample().to_map(1);
        map.insert(TAG_NODE.to_string(), "0".to_string());
        assert!(NodeTags::from_map(&map).is_err());
        map.remove(TAG_GROUP);
        assert!(NodeTags::from_map(&map).is_err());
    }

    #[test]
    fn test_reserved_user_tags() {
        assert!(check_user_tag("team").is_ok());
        assert!(check_user_tag(TAG_EXPIRES).is_err());
        assert!(check_user_tag("").is_err());
    }
}
