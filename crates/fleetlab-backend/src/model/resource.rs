use super::{Arch, Expiry};
use crate::provider::FileUpload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// `aerospike_version` used by templates for client nodes
pub const CLIENT_TEMPLATE_VERSION: &str = "client";

/// Identity of a cached golden image
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateKey {
    pub distribution: String,
    pub distro_version: String,
    pub aerospike_version: String,
    pub arch: Arch,
}

impl TemplateKey {
    pub fn new(
        distribution: impl Into<String>,
        distro_version: impl Into<String>,
        aerospike_version: impl Into<String>,
        arch: Arch,
    ) -> Self {
        Self {
            distribution: distribution.into(),
            distro_version: distro_version.into(),
            aerospike_version: aerospike_version.into(),
            arch,
        }
    }

    pub fn client(distribution: impl Into<String>, distro_version: impl Into<String>, arch: Arch) -> Self {
        Self::new(distribution, distro_version, CLIENT_TEMPLATE_VERSION, arch)
    }

    pub fn is_client(&self) -> bool {
        self.aerospike_version == CLIENT_TEMPLATE_VERSION
    }
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            self.distribution, self.distro_version, self.aerospike_version, self.arch
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(flatten)]
    pub key: TemplateKey,
    pub image_id: String,
    pub region: String,
    pub created: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
}

/// Inputs for building a template from a base image
#[derive(Debug, Clone)]
pub struct TemplateSpec {
    pub key: TemplateKey,
    /// Provider image to start from; adapters pick a default per distribution
    pub base_image: Option<String>,
    pub install_script: Vec<u8>,
    pub files: Vec<FileUpload>,
    pub instance_type: Option<String>,
}

/// Unified view over a security group, VPC firewall rule or bridge network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FirewallRule {
    pub name: String,
    pub network: String,
    pub allow_ports: Vec<String>,
    pub deny_ports: Vec<String>,
    pub source_ranges: Vec<String>,
    pub owner: String,
    pub detail: FirewallDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Provider")]
pub enum FirewallDetail {
    #[serde(rename = "aws")]
    Aws {
        #[serde(rename = "GroupId")]
        group_id: String,
        #[serde(rename = "Description")]
        description: String,
    },
    #[serde(rename = "gcp")]
    Gcp {
        #[serde(rename = "TargetTags")]
        target_tags: Vec<String>,
        #[serde(rename = "Direction")]
        direction: String,
        #[serde(rename = "Priority")]
        priority: u32,
    },
    #[serde(rename = "docker")]
    Docker {
        #[serde(rename = "Driver")]
        driver: String,
        #[serde(rename = "Subnets")]
        subnets: Vec<String>,
        #[serde(rename = "Mtu")]
        mtu: Option<String>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct FirewallSpec {
    pub name: String,
    /// VPC id, VPC network or, for containers, nothing
    pub network: Option<String>,
    pub allow_ports: Vec<String>,
    pub source_ranges: Vec<String>,
    /// CIDR for container bridge networks
    pub subnet: Option<String>,
    pub mtu: Option<String>,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subnet {
    pub id: String,
    pub name: String,
    pub cidr: String,
    pub network_id: String,
    pub network_name: String,
    pub network_cidr: String,
    pub zone: String,
    pub is_zone_default: bool,
    pub auto_public_ip: bool,
}

/// Externally attached storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    pub name: String,
    pub id: String,
    pub zone: String,
    pub owner: String,
    pub expires: Expiry,
    pub size_bytes: Option<u64>,
    pub created: Option<DateTime<Utc>>,
    pub attached_to: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub name: String,
    pub zone: Option<String>,
    pub size_gb: Option<u32>,
    pub owner: String,
    pub expires: Expiry,
    pub tags: BTreeMap<String, String>,
}

/// Provider-native scheduled cleanup wiring
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExpirySystemRecord {
    pub region: String,
    pub schedule: String,
    pub scheduler: String,
    pub scheduler_role: String,
    pub function: String,
    pub function_role: String,
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExpirySystemSpec {
    pub region: Option<String>,
    pub interval_minutes: u32,
    /// Packaged function (zip) or source directory to deploy
    pub source: Option<PathBuf>,
}
