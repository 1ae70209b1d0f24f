use super::{Expiry, Features};
use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Node number within a group. Always >= 1.
pub type NodeNo = u32;

pub const MAX_GROUP_NAME_LEN: usize = 24;

/// Validated, case-sensitive group name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupName(String);

impl GroupName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(FleetError::validation("group name must not be empty"));
        }
        if name.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(FleetError::validation(format!(
                "group name '{}' is longer than {} characters",
                name, MAX_GROUP_NAME_LEN
            )));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(FleetError::validation(format!(
                "group name '{}' contains invalid character '{}'",
                name, bad
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GroupName {
    type Error = FleetError;

    fn try_from(value: String) -> Result<Self> {
        GroupName::new(value)
    }
}

impl From<GroupName> for String {
    fn from(name: GroupName) -> String {
        name.0
    }
}

impl FromStr for GroupName {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        GroupName::new(s)
    }
}

impl AsRef<str> for GroupName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Namespace a group lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Cluster,
    Client,
}

impl GroupKind {
    pub const ALL: [GroupKind; 2] = [GroupKind::Cluster, GroupKind::Client];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Cluster => "cluster",
            GroupKind::Client => "client",
        }
    }

    pub fn other(&self) -> GroupKind {
        match self {
            GroupKind::Cluster => GroupKind::Client,
            GroupKind::Client => GroupKind::Cluster,
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cluster" | "server" => Ok(GroupKind::Cluster),
            "client" => Ok(GroupKind::Client),
            other => Err(FleetError::validation(format!(
                "unknown group kind '{}'",
                other
            ))),
        }
    }
}

/// A group name qualified by its namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId {
    pub kind: GroupKind,
    pub name: GroupName,
}

impl GroupId {
    pub fn new(kind: GroupKind, name: GroupName) -> Self {
        Self { kind, name }
    }

    pub fn cluster(name: GroupName) -> Self {
        Self::new(GroupKind::Cluster, name)
    }

    pub fn client(name: GroupName) -> Self {
        Self::new(GroupKind::Client, name)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Provisioning,
    Running,
    Stopped,
    Terminated,
}

impl NodeState {
    /// Maps a provider state string (EC2, Compute Engine, Docker) to a node state
    pub fn from_provider(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" | "restarting" => NodeState::Running,
            "stopping" | "stopped" | "exited" | "paused" | "suspending" | "suspended" => {
                NodeState::Stopped
            }
            "shutting-down" | "terminated" | "dead" | "removing" => NodeState::Terminated,
            _ => NodeState::Provisioning,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, NodeState::Terminated)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, NodeState::Running)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Provisioning => "provisioning",
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
            NodeState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    Amd64,
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }

    pub fn from_is_arm(is_arm: bool) -> Self {
        if is_arm { Arch::Arm64 } else { Arch::Amd64 }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" | "x86-64" => Ok(Arch::Amd64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => Err(FleetError::validation(format!(
                "unknown architecture '{}'",
                other
            ))),
        }
    }
}

/// One compute instance belonging to a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    pub group: GroupName,
    pub kind: GroupKind,
    pub node_no: NodeNo,
    pub instance_id: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub state: NodeState,
    pub arch: Arch,
    pub distribution: String,
    pub distro_version: String,
    pub aerospike_version: Option<String>,
    pub client_type: Option<String>,
    pub owner: String,
    pub project: Option<String>,
    pub expires: Expiry,
    pub features: Features,
    pub zone: String,
    pub instance_type: String,
    pub spot: bool,
    pub firewalls: Vec<String>,
    /// Highest node number assigned by the request that created this node
    pub node_seq_high: NodeNo,
    pub tags: BTreeMap<String, String>,
}

impl Node {
    pub fn group_id(&self) -> GroupId {
        GroupId::new(self.kind, self.group.clone())
    }

    /// Address used to reach the node from outside the provider network
    pub fn reachable_ip(&self) -> Option<&str> {
        self.public_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.private_ip.as_deref().filter(|ip| !ip.is_empty()))
    }
}

/// Provider facts about an instance that are not carried in fleetlab tags
#[derive(Debug, Clone, Default)]
pub struct NodeInstance {
    pub instance_id: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub state: Option<NodeState>,
    pub arch: Option<Arch>,
    pub zone: String,
    pub instance_type: String,
    pub spot: bool,
    pub firewalls: Vec<String>,
}

/// A named fleet, derived from the nodes that carry its name
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Group {
    pub name: GroupName,
    pub kind: GroupKind,
    pub owner: String,
    pub features: Features,
    pub nodes: Vec<Node>,
}

impl Group {
    /// Groups nodes by (kind, name); output and nodes are ascending.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Vec<Group> {
        let mut by_id: BTreeMap<GroupId, Vec<Node>> = BTreeMap::new();
        for node in nodes {
            by_id.entry(node.group_id()).or_default().push(node);
        }

        by_id
            .into_iter()
            .map(|(id, mut nodes)| {
                nodes.sort_by_key(|n| n.node_no);
                let owner = nodes.first().map(|n| n.owner.clone()).unwrap_or_default();
                let features = nodes
                    .iter()
                    .fold(Features::NONE, |acc, n| acc | n.features);
                Group {
                    name: id.name,
                    kind: id.kind,
                    owner,
                    features,
                    nodes,
                }
            })
            .collect()
    }

    pub fn id(&self) -> GroupId {
        GroupId::new(self.kind, self.name.clone())
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.state.is_live())
    }

    pub fn node_numbers(&self) -> Vec<NodeNo> {
        self.live_nodes().map(|n| n.node_no).collect()
    }

    /// Next unused node number: above every number ever handed out
    /// to a node that still exists.
    pub fn next_node_no(&self) -> Result<NodeNo> {
        self.nodes
            .iter()
            .map(|n| n.node_no.max(n.node_seq_high))
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| {
                FleetError::validation(format!(
                    "{} '{}' has no node numbers left",
                    self.kind, self.name
                ))
            })
    }

    /// Group-wide expiry (see [`crate::expiry::group_expiry`])
    pub fn expiry(&self) -> Expiry {
        crate::expiry::group_expiry(self.nodes.iter())
    }
}
