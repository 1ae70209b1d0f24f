//! In-memory backend for tests
//!
//! Behaves like a provider with instant provisioning. Faults can be injected
//! per inventory item, per node (command runs) and for destroy/deploy, and
//! every trait call is recorded.

use crate::error::{FleetError, Result};
use crate::inventory::InventoryItem;
use crate::model::{
    Arch, Expiry, ExpirySystemRecord, ExpirySystemSpec, Features, FirewallDetail, FirewallRule,
    FirewallSpec, GroupId, GroupKind, GroupName, Node, NodeInstance, NodeNo, NodeState, Subnet,
    Template, TemplateKey, TemplateSpec, Volume, VolumeSpec,
};
use crate::provider::{DeployRequest, FileUpload, FleetBackend, NodeOutput, RunFailure};
use crate::tags::{NodeTags, TAG_EXPIRES, TAG_OWNER, TAG_PROJECT, node_from_tags};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

const PROVIDER: &str = "memory";

type NodeKey = (GroupKind, String, NodeNo);

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<NodeKey, Node>,
    templates: Vec<Template>,
    firewalls: Vec<FirewallRule>,
    volumes: Vec<Volume>,
    expiry: Vec<ExpirySystemRecord>,
    files: BTreeMap<(NodeKey, String), Vec<u8>>,
    calls: Vec<String>,
    channel_opens: usize,
    failing_items: BTreeSet<InventoryItem>,
    fail_run_on: BTreeSet<NodeNo>,
    fail_destroy: bool,
    fail_deploy: bool,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

/// A running cluster or client node with fleetlab tags, for fixtures
pub fn sample_node(kind: GroupKind, group: &str, node_no: NodeNo, owner: &str) -> Node {
    let tags = NodeTags {
        kind,
        group: GroupName::new(group).expect("fixture group name must be valid"),
        owner: owner.to_string(),
        project: None,
        expires: Expiry::Never,
        features: match kind {
            GroupKind::Cluster => Features::AEROSPIKE,
            GroupKind::Client => Features::AEROSPIKE_TOOLS,
        },
        node_seq_high: node_no,
        distribution: "ubuntu".to_string(),
        distro_version: "24.04".to_string(),
        aerospike_version: (kind == GroupKind::Cluster).then(|| "8.0.0.1".to_string()),
        client_type: (kind == GroupKind::Client).then(|| "tools".to_string()),
        arch: Arch::Amd64,
        extra: BTreeMap::new(),
    };
    memory_node(&tags, node_no)
}

fn memory_node(tags: &NodeTags, node_no: NodeNo) -> Node {
    let instance = NodeInstance {
        instance_id: format!("mem-{}-{}-{}", tags.kind, tags.group, node_no),
        private_ip: Some(format!("10.0.0.{}", node_no)),
        public_ip: Some(format!("192.0.2.{}", node_no)),
        state: Some(NodeState::Running),
        arch: Some(tags.arch),
        zone: "memory-1a".to_string(),
        instance_type: "mem.small".to_string(),
        spot: false,
        firewalls: Vec::new(),
    };
    node_from_tags(tags.to_map(node_no), instance).expect("fixture tags must decode")
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: impl Into<String>) {
        self.state().calls.push(call.into());
    }

    /// Adds a running group; every node records the highest seeded number
    pub fn seed_group(&self, kind: GroupKind, name: &str, nodes: &[NodeNo], owner: &str) {
        let high = nodes.iter().copied().max().unwrap_or(0);
        let mut state = self.state();
        for node_no in nodes {
            let mut node = sample_node(kind, name, *node_no, owner);
            node.node_seq_high = high;
            state.nodes.insert((kind, name.to_string(), *node_no), node);
        }
    }

    pub fn set_node_expiry(&self, kind: GroupKind, name: &str, expiry: Expiry) {
        for node in self.state().nodes.values_mut() {
            if node.kind == kind && node.group.as_str() == name {
                node.expires = expiry;
                node.tags.insert(TAG_EXPIRES.to_string(), expiry.to_tag());
            }
        }
    }

    pub fn set_node_state(&self, kind: GroupKind, name: &str, node_no: NodeNo, state: NodeState) {
        if let Some(node) = self
            .state()
            .nodes
            .get_mut(&(kind, name.to_string(), node_no))
        {
            node.state = state;
        }
    }

    pub fn set_node_project(&self, kind: GroupKind, name: &str, project: &str) {
        for node in self.state().nodes.values_mut() {
            if node.kind == kind && node.group.as_str() == name {
                node.project = Some(project.to_string());
                node.tags.insert(TAG_PROJECT.to_string(), project.to_string());
            }
        }
    }

    /// Makes listings of `item` fail with a backend error
    pub fn fail_item(&self, item: InventoryItem) {
        self.state().failing_items.insert(item);
    }

    /// Makes command runs fail on these nodes
    pub fn fail_run_on(&self, nodes: &[NodeNo]) {
        self.state().fail_run_on.extend(nodes.iter().copied());
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.state().fail_destroy = fail;
    }

    pub fn fail_deploy(&self, fail: bool) {
        self.state().fail_deploy = fail;
    }

    /// Every trait call so far, e.g. `deploy_group` or `describe_nodes:cluster`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of remote channels opened by `attach_and_run`
    pub fn channel_opens(&self) -> usize {
        self.state().channel_opens
    }

    pub fn nodes(&self, kind: GroupKind, name: &str) -> Vec<Node> {
        self.state()
            .nodes
            .values()
            .filter(|n| n.kind == kind && n.group.as_str() == name)
            .cloned()
            .collect()
    }

    pub fn uploaded(&self, kind: GroupKind, name: &str, node_no: NodeNo, path: &str) -> Option<Vec<u8>> {
        self.state()
            .files
            .get(&((kind, name.to_string(), node_no), path.to_string()))
            .cloned()
    }

    fn check_item(&self, item: InventoryItem) -> Result<()> {
        if self.state().failing_items.contains(&item) {
            return Err(FleetError::backend(PROVIDER, format!("listing {} failed", item)));
        }
        Ok(())
    }

    fn key(group: &GroupId, node_no: NodeNo) -> NodeKey {
        (group.kind, group.name.to_string(), node_no)
    }

    fn require_nodes(state: &MemoryState, group: &GroupId, nodes: &[NodeNo]) -> Result<()> {
        match nodes
            .iter()
            .find(|n| !state.nodes.contains_key(&Self::key(group, **n)))
        {
            Some(missing) => Err(FleetError::not_found(
                "node",
                format!("{} node {}", group, missing),
            )),
            None => Ok(()),
        }
    }

    fn set_state(&self, group: &GroupId, nodes: &[NodeNo], to: NodeState) -> Result<()> {
        let mut state = self.state();
        Self::require_nodes(&state, group, nodes)?;
        for node_no in nodes {
            if let Some(node) = state.nodes.get_mut(&Self::key(group, *node_no)) {
                node.state = to;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FleetBackend for MemoryBackend {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_groups(&self, kind: GroupKind) -> Result<Vec<GroupName>> {
        self.record(format!("list_groups:{}", kind));
        let names: BTreeSet<GroupName> = self
            .state()
            .nodes
            .values()
            .filter(|n| n.kind == kind && n.state.is_live())
            .map(|n| n.group.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn list_nodes(&self, group: &GroupId) -> Result<Vec<NodeNo>> {
        self.record("list_nodes");
        let nodes: Vec<NodeNo> = self
            .nodes(group.kind, group.name.as_str())
            .iter()
            .filter(|n| n.state.is_live())
            .map(|n| n.node_no)
            .collect();
        if nodes.is_empty() {
            return Err(FleetError::not_found(group.kind.as_str(), group.name.to_string()));
        }
        Ok(nodes)
    }

    async fn describe_nodes(&self, kind: GroupKind) -> Result<Vec<Node>> {
        self.record(format!("describe_nodes:{}", kind));
        self.check_item(InventoryItem::for_kind(kind))?;
        Ok(self
            .state()
            .nodes
            .values()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect())
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        self.record("list_templates");
        self.check_item(InventoryItem::Templates)?;
        Ok(self.state().templates.clone())
    }

    async fn create_template(&self, spec: &TemplateSpec) -> Result<Template> {
        self.record("create_template");
        let template = Template {
            key: spec.key.clone(),
            image_id: format!("mem-image-{}", self.state().templates.len() + 1),
            region: "memory".to_string(),
            created: Some(chrono::Utc::now()),
            size_bytes: None,
        };
        let mut state = self.state();
        state.templates.retain(|t| t.key != spec.key);
        state.templates.push(template.clone());
        Ok(template)
    }

    async fn destroy_template(&self, key: &TemplateKey) -> Result<()> {
        self.record("destroy_template");
        let mut state = self.state();
        let before = state.templates.len();
        state.templates.retain(|t| &t.key != key);
        if state.templates.len() == before {
            return Err(FleetError::not_found("template", key.to_string()));
        }
        Ok(())
    }

    async fn list_firewalls(&self) -> Result<Vec<FirewallRule>> {
        self.record("list_firewalls");
        self.check_item(InventoryItem::FirewallRules)?;
        Ok(self.state().firewalls.clone())
    }

    async fn create_firewall(&self, spec: &FirewallSpec) -> Result<()> {
        self.record("create_firewall");
        self.state().firewalls.push(FirewallRule {
            name: spec.name.clone(),
            network: spec.network.clone().unwrap_or_default(),
            allow_ports: spec.allow_ports.clone(),
            deny_ports: Vec::new(),
            source_ranges: spec.source_ranges.clone(),
            owner: spec.owner.clone(),
            detail: FirewallDetail::Docker {
                driver: "memory".to_string(),
                subnets: spec.subnet.iter().cloned().collect(),
                mtu: spec.mtu.clone(),
            },
        });
        Ok(())
    }

    async fn delete_firewall(&self, name: &str) -> Result<()> {
        self.record("delete_firewall");
        self.state().firewalls.retain(|f| f.name != name);
        Ok(())
    }

    async fn list_subnets(&self) -> Result<Vec<Subnet>> {
        self.record("list_subnets");
        self.check_item(InventoryItem::Subnets)?;
        Ok(Vec::new())
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.record("list_volumes");
        self.check_item(InventoryItem::Volumes)?;
        Ok(self.state().volumes.clone())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume> {
        self.record("create_volume");
        let mut tags = spec.tags.clone();
        tags.insert(TAG_OWNER.to_string(), spec.owner.clone());
        tags.insert(TAG_EXPIRES.to_string(), spec.expires.to_tag());
        let volume = Volume {
            name: spec.name.clone(),
            id: format!("mem-vol-{}", spec.name),
            zone: spec.zone.clone().unwrap_or_else(|| "memory-1a".to_string()),
            owner: spec.owner.clone(),
            expires: spec.expires,
            size_bytes: spec.size_gb.map(|gb| u64::from(gb) << 30),
            created: Some(chrono::Utc::now()),
            attached_to: Vec::new(),
            tags,
        };
        self.state().volumes.push(volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.record("delete_volume");
        self.state().volumes.retain(|v| v.name != name);
        Ok(())
    }

    async fn tag_volume(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.record("tag_volume");
        let mut state = self.state();
        let volume = state
            .volumes
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| FleetError::not_found("volume", name))?;
        volume.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn expiry_system(&self) -> Result<Vec<ExpirySystemRecord>> {
        self.record("expiry_system");
        self.check_item(InventoryItem::ExpirySystem)?;
        Ok(self.state().expiry.clone())
    }

    async fn install_expiry_system(&self, spec: &ExpirySystemSpec) -> Result<()> {
        self.record("install_expiry_system");
        let region = spec.region.clone().unwrap_or_else(|| "memory".to_string());
        let mut state = self.state();
        state.expiry.retain(|r| r.region != region);
        state.expiry.push(ExpirySystemRecord {
            region,
            schedule: format!("rate({} minutes)", spec.interval_minutes),
            scheduler: "fleetlab-expiry".to_string(),
            function: "fleetlab-expiry".to_string(),
            ..Default::default()
        });
        Ok(())
    }

    async fn remove_expiry_system(&self, region: Option<&str>) -> Result<()> {
        self.record("remove_expiry_system");
        self.state()
            .expiry
            .retain(|r| region.is_some_and(|wanted| r.region != wanted));
        Ok(())
    }

    async fn set_expiry_frequency(&self, interval_minutes: u32) -> Result<()> {
        self.record("set_expiry_frequency");
        let mut state = self.state();
        if state.expiry.is_empty() {
            return Err(FleetError::not_found("expiry system", PROVIDER));
        }
        for record in state.expiry.iter_mut() {
            record.schedule = format!("rate({} minutes)", interval_minutes);
        }
        Ok(())
    }

    async fn deploy_group(&self, request: &DeployRequest) -> Result<()> {
        self.record("deploy_group");
        let mut state = self.state();
        if state.fail_deploy {
            return Err(FleetError::backend(PROVIDER, "capacity exhausted"));
        }
        if let Some(existing) = request
            .nodes
            .iter()
            .find(|n| state.nodes.contains_key(&Self::key(&request.group, **n)))
        {
            return Err(FleetError::validation(format!(
                "{} node {} already exists",
                request.group, existing
            )));
        }
        for node_no in &request.nodes {
            state.nodes.insert(
                Self::key(&request.group, *node_no),
                memory_node(&request.tags, *node_no),
            );
        }
        Ok(())
    }

    async fn start_group(&self, group: &GroupId, nodes: &[NodeNo]) -> Result<()> {
        self.record("start_group");
        self.set_state(group, nodes, NodeState::Running)
    }

    async fn stop_group(&self, group: &GroupId, nodes: &[NodeNo]) -> Result<()> {
        self.record("stop_group");
        self.set_state(group, nodes, NodeState::Stopped)
    }

    async fn destroy_group(&self, group: &GroupId, nodes: &[NodeNo], force: bool) -> Result<()> {
        self.record(format!("destroy_group:{}", group.name));
        let mut state = self.state();
        if state.fail_destroy {
            return Err(FleetError::backend(PROVIDER, "destroy rejected"));
        }
        for node_no in nodes {
            let key = Self::key(group, *node_no);
            let running = state.nodes.get(&key).is_some_and(|n| n.state.is_running());
            if running && !force {
                return Err(FleetError::validation(format!(
                    "{} node {} is running",
                    group, node_no
                )));
            }
            if running {
                state.calls.push(format!("stop:{}", node_no));
            }
            state.nodes.remove(&key);
        }
        Ok(())
    }

    async fn node_ip_map(&self, group: &GroupId, internal: bool) -> Result<BTreeMap<NodeNo, String>> {
        self.record("node_ip_map");
        if internal {
            return Ok(BTreeMap::new());
        }
        Ok(self
            .nodes(group.kind, group.name.as_str())
            .into_iter()
            .filter_map(|n| n.public_ip.clone().map(|ip| (n.node_no, ip)))
            .collect())
    }

    async fn run_commands(
        &self,
        group: &GroupId,
        commands: &[Vec<String>],
        nodes: &[NodeNo],
    ) -> std::result::Result<Vec<NodeOutput>, RunFailure> {
        self.record("run_commands");
        let state = self.state();
        let mut outputs = Vec::new();
        for node_no in nodes {
            if !state.nodes.contains_key(&Self::key(group, *node_no)) {
                return Err(RunFailure {
                    group: group.name.to_string(),
                    node: *node_no,
                    outputs,
                    source: FleetError::not_found("node", node_no.to_string()),
                });
            }
            let mut output = Vec::new();
            for command in commands {
                output.extend_from_slice(format!("node {}: {}\n", node_no, command.join(" ")).as_bytes());
            }
            outputs.push(NodeOutput {
                node: *node_no,
                output,
            });
            if state.fail_run_on.contains(node_no) {
                return Err(RunFailure {
                    group: group.name.to_string(),
                    node: *node_no,
                    outputs,
                    source: FleetError::backend(PROVIDER, "exit status 1"),
                });
            }
        }
        Ok(outputs)
    }

    async fn copy_files(&self, group: &GroupId, files: &[FileUpload], nodes: &[NodeNo]) -> Result<()> {
        self.record("copy_files");
        let mut state = self.state();
        Self::require_nodes(&state, group, nodes)?;
        for node_no in nodes {
            for file in files {
                state
                    .files
                    .insert((Self::key(group, *node_no), file.path.clone()), file.contents.clone());
            }
        }
        Ok(())
    }

    async fn copy_from_node(&self, group: &GroupId, node: NodeNo, path: &str) -> Result<Vec<u8>> {
        self.record("copy_from_node");
        let state = self.state();
        Self::require_nodes(&state, group, &[node])?;
        state
            .files
            .get(&(Self::key(group, node), path.to_string()))
            .cloned()
            .ok_or_else(|| FleetError::backend(PROVIDER, format!("{}: no such file on node {}", path, node)))
    }

    async fn attach_and_run(
        &self,
        group: &GroupId,
        node: NodeNo,
        args: &[String],
        interactive: bool,
    ) -> Result<Vec<u8>> {
        self.record("attach_and_run");
        let mut state = self.state();
        Self::require_nodes(&state, group, &[node])?;
        state.channel_opens += 1;
        if interactive {
            return Ok(Vec::new());
        }
        Ok(format!("node {}: {}\n", node, args.join(" ")).into_bytes())
    }

    async fn is_system_arm(&self, instance_type: &str) -> Result<bool> {
        Ok(instance_type.starts_with("arm"))
    }

    async fn set_label(&self, group: &GroupId, key: &str, value: &str) -> Result<()> {
        self.record("set_label");
        for node in self.state().nodes.values_mut() {
            if node.group_id() == *group {
                node.tags.insert(key.to_string(), value.to_string());
                if key == TAG_OWNER {
                    node.owner = value.to_string();
                }
            }
        }
        Ok(())
    }

    async fn set_group_expiry(&self, group: &GroupId, expiry: Expiry, nodes: &[NodeNo]) -> Result<()> {
        self.record("set_group_expiry");
        let mut state = self.state();
        Self::require_nodes(&state, group, nodes)?;
        for node_no in nodes {
            if let Some(node) = state.nodes.get_mut(&Self::key(group, *node_no)) {
                node.expires = expiry;
                node.tags.insert(TAG_EXPIRES.to_string(), expiry.to_tag());
            }
        }
        Ok(())
    }
}
