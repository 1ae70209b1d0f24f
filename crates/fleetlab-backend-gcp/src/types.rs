//! Shapes of the gcloud JSON output
//!
//! Compute Engine returns numbers such as disk sizes and ids as strings;
//! they are kept that way and converted where used.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Last path segment of a resource URL
pub fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    pub id: Option<String>,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub machine_type: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub metadata: Option<Metadata>,
    pub scheduling: Option<Scheduling>,
    pub tags: Option<NetworkTags>,
}

impl Instance {
    pub fn private_ip(&self) -> Option<String> {
        self.network_interfaces.iter().find_map(|n| n.network_ip.clone())
    }

    pub fn public_ip(&self) -> Option<String> {
        self.network_interfaces
            .iter()
            .flat_map(|n| n.access_configs.iter())
            .find_map(|a| a.nat_ip.clone())
    }

    pub fn metadata_map(&self) -> BTreeMap<String, String> {
        self.metadata
            .iter()
            .flat_map(|m| m.items.iter())
            .map(|i| (i.key.clone(), i.value.clone().unwrap_or_default()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(rename = "networkIP")]
    pub network_ip: Option<String>,
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    #[serde(rename = "natIP")]
    pub nat_ip: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    pub provisioning_model: Option<String>,
    #[serde(default)]
    pub preemptible: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkTags {
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub name: String,
    pub id: Option<String>,
    pub status: Option<String>,
    pub creation_timestamp: Option<String>,
    pub description: Option<String>,
    pub disk_size_gb: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,
    pub id: Option<String>,
    #[serde(default)]
    pub zone: String,
    pub size_gb: Option<String>,
    pub creation_timestamp: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Firewall {
    pub name: String,
    #[serde(default)]
    pub network: String,
    pub direction: Option<String>,
    pub priority: Option<u32>,
    pub description: Option<String>,
    #[serde(default)]
    pub source_ranges: Vec<String>,
    #[serde(default)]
    pub target_tags: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<FirewallPorts>,
    #[serde(default)]
    pub denied: Vec<FirewallPorts>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FirewallPorts {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpSubnet {
    pub name: String,
    pub id: Option<String>,
    #[serde(default)]
    pub ip_cidr_range: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerJob {
    pub name: String,
    #[serde(default)]
    pub schedule: String,
    pub http_target: Option<HttpTarget>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTarget {
    #[serde(default)]
    pub uri: String,
    pub oidc_token: Option<OidcToken>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcToken {
    pub service_account_email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudFunction {
    pub name: String,
    pub service_config: Option<ServiceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub uri: Option<String>,
    pub service_account_email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance() {
        let json = r#"{
            "name": "fleetlab-demo-s-1",
            "id": "4521",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a",
            "status": "RUNNING",
            "machineType": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a/machineTypes/t2a-standard-2",
            "networkInterfaces": [{
                "networkIP": "10.128.0.5",
                "accessConfigs": [{"name": "External NAT", "natIP": "34.1.2.3"}]
            }],
            "labels": {"fleetlab-managed": "true"},
            "metadata": {"items": [{"key": "fleetlab-group", "value": "Demo"}]},
            "scheduling": {"provisioningModel": "SPOT"}
        }"#;
        let instance: Instance = serde_json::from_str(json).unwrap();
        assert_eq!(last_segment(&instance.zone), "us-central1-a");
        assert_eq!(last_segment(&instance.machine_type), "t2a-standard-2");
        assert_eq!(instance.private_ip().as_deref(), Some("10.128.0.5"));
        assert_eq!(instance.public_ip().as_deref(), Some("34.1.2.3"));
        assert_eq!(instance.metadata_map()["fleetlab-group"], "Demo");
    }

    #[test]
    fn test_firewall() {
        let json = r#"{
            "name": "fleetlab-ssh",
            "network": "https://www.googleapis.com/compute/v1/projects/p/global/networks/default",
            "direction": "INGRESS",
            "priority": 1000,
            "sourceRanges": ["0.0.0.0/0"],
            "allowed": [{"IPProtocol": "tcp", "ports": ["22", "3000-3003"]}]
        }"#;
        let rule: Firewall = serde_json::from_str(json).unwrap();
        assert_eq!(rule.allowed[0].ports, vec!["22", "3000-3003"]);
        assert!(rule.denied.is_empty());
        assert!(rule.target_tags.is_empty());
    }
}
