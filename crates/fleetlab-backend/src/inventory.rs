//! Inventory aggregation
//!
//! Collects the requested resource kinds from the active backend and
//! normalizes them into one [`InventorySnapshot`]. Only the requested kinds
//! are fetched. A kind that fails to load degrades to an empty list with a
//! warning unless the caller marked it as required.

use crate::context::ExecutionContext;
use crate::error::{FleetError, Result};
use crate::model::{
    ExpirySystemRecord, FirewallRule, Group, GroupKind, GroupName, Node, Subnet, Template, Volume,
};
use crate::provider::FleetBackend;
use crate::tags::TAG_PROJECT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InventoryItem {
    Clusters,
    Clients,
    Templates,
    FirewallRules,
    Subnets,
    Volumes,
    ExpirySystem,
}

impl InventoryItem {
    pub const ALL: [InventoryItem; 7] = [
        InventoryItem::Clusters,
        InventoryItem::Clients,
        InventoryItem::Templates,
        InventoryItem::FirewallRules,
        InventoryItem::Subnets,
        InventoryItem::Volumes,
        InventoryItem::ExpirySystem,
    ];

    pub fn for_kind(kind: GroupKind) -> Self {
        match kind {
            GroupKind::Cluster => InventoryItem::Clusters,
            GroupKind::Client => InventoryItem::Clients,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InventoryItem::Clusters => "clusters",
            InventoryItem::Clients => "clients",
            InventoryItem::Templates => "templates",
            InventoryItem::FirewallRules => "firewalls",
            InventoryItem::Subnets => "subnets",
            InventoryItem::Volumes => "volumes",
            InventoryItem::ExpirySystem => "expiry",
        }
    }
}

impl fmt::Display for InventoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InventoryItem {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clusters" | "cluster" => Ok(InventoryItem::Clusters),
            "clients" | "client" => Ok(InventoryItem::Clients),
            "templates" | "template" => Ok(InventoryItem::Templates),
            "firewalls" | "firewall" | "firewallrules" => Ok(InventoryItem::FirewallRules),
            "subnets" | "subnet" => Ok(InventoryItem::Subnets),
            "volumes" | "volume" => Ok(InventoryItem::Volumes),
            "expiry" | "expirysystem" => Ok(InventoryItem::ExpirySystem),
            other => Err(FleetError::validation(format!(
                "unknown inventory item '{}'",
                other
            ))),
        }
    }
}

/// What to collect and which kinds must not silently degrade
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryRequest {
    pub owner: Option<String>,
    pub items: BTreeSet<InventoryItem>,
    pub required: BTreeSet<InventoryItem>,
}

impl InventoryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            items: InventoryItem::ALL.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn item(mut self, item: InventoryItem) -> Self {
        self.items.insert(item);
        self
    }

    /// Requests `item` and propagates its failure
    pub fn require(mut self, item: InventoryItem) -> Self {
        self.items.insert(item);
        self.required.insert(item);
        self
    }

    pub fn owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner.filter(|o| !o.is_empty());
        self
    }
}

/// Point-in-time view of everything fleetlab manages.
///
/// Every list is always serialized, even when empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InventorySnapshot {
    #[serde(default)]
    pub clusters: Vec<Node>,
    #[serde(default)]
    pub clients: Vec<Node>,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub firewall_rules: Vec<FirewallRule>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub expiry_system: Vec<ExpirySystemRecord>,
}

impl InventorySnapshot {
    pub fn nodes(&self, kind: GroupKind) -> &[Node] {
        match kind {
            GroupKind::Cluster => &self.clusters,
            GroupKind::Client => &self.clients,
        }
    }

    pub fn groups(&self, kind: GroupKind) -> Vec<Group> {
        Group::from_nodes(self.nodes(kind).iter().cloned())
    }

    pub fn group(&self, kind: GroupKind, name: &GroupName) -> Option<Group> {
        self.groups(kind).into_iter().find(|g| &g.name == name)
    }

    /// Namespace that currently holds `name`, looking at clusters first
    pub fn find_group(&self, name: &GroupName) -> Option<GroupKind> {
        GroupKind::ALL
            .into_iter()
            .find(|kind| self.nodes(*kind).iter().any(|n| &n.group == name))
    }
}

/// Inventory aggregator over one backend
pub struct Inventory<'a> {
    backend: &'a dyn FleetBackend,
    ctx: &'a ExecutionContext,
}

impl<'a> Inventory<'a> {
    pub fn new(backend: &'a dyn FleetBackend, ctx: &'a ExecutionContext) -> Self {
        Self { backend, ctx }
    }

    pub async fn collect(&self, request: &InventoryRequest) -> Result<InventorySnapshot> {
        let backend = self.backend;
        let mut snapshot = InventorySnapshot {
            clusters: self
                .fetch(request, InventoryItem::Clusters, || {
                    backend.describe_nodes(GroupKind::Cluster)
                })
                .await?,
            clients: self
                .fetch(request, InventoryItem::Clients, || {
                    backend.describe_nodes(GroupKind::Client)
                })
                .await?,
            templates: self
                .fetch(request, InventoryItem::Templates, || backend.list_templates())
                .await?,
            firewall_rules: self
                .fetch(request, InventoryItem::FirewallRules, || backend.list_firewalls())
                .await?,
            subnets: self
                .fetch(request, InventoryItem::Subnets, || backend.list_subnets())
                .await?,
            volumes: self
                .fetch(request, InventoryItem::Volumes, || backend.list_volumes())
                .await?,
            expiry_system: self
                .fetch(request, InventoryItem::ExpirySystem, || backend.expiry_system())
                .await?,
        };

        self.filter(&mut snapshot, request.owner.as_deref());
        sort_snapshot(&mut snapshot);
        Ok(snapshot)
    }

    async fn fetch<T, F, Fut>(
        &self,
        request: &InventoryRequest,
        item: InventoryItem,
        load: F,
    ) -> Result<Vec<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        if !request.items.contains(&item) {
            return Ok(Vec::new());
        }

        match load().await {
            Ok(values) => Ok(values),
            Err(e) if request.required.contains(&item) => Err(e),
            Err(e) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    item = %item,
                    error = %e,
                    "could not list inventory item; showing it as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    fn filter(&self, snapshot: &mut InventorySnapshot, owner: Option<&str>) {
        let project = self.ctx.project.as_deref();
        let keep_node = |node: &Node| {
            owner.is_none_or(|o| node.owner == o) && project.is_none_or(|p| node.project.as_deref() == Some(p))
        };
        snapshot.clusters.retain(|n| keep_node(n));
        snapshot.clients.retain(|n| keep_node(n));
        snapshot.volumes.retain(|v| {
            owner.is_none_or(|o| v.owner == o)
                && project.is_none_or(|p| v.tags.get(TAG_PROJECT).map(String::as_str) == Some(p))
        });
    }
}

fn sort_snapshot(snapshot: &mut InventorySnapshot) {
    let by_group = |a: &Node, b: &Node| {
        a.group
            .as_str()
            .cmp(b.group.as_str())
            .then(a.node_no.cmp(&b.node_no))
    };
    snapshot.clusters.sort_by(by_group);
    snapshot.clients.sort_by(by_group);
    snapshot.templates.sort_by(|a, b| a.key.cmp(&b.key));
    snapshot.firewall_rules.sort_by(|a, b| a.name.cmp(&b.name));
    snapshot
        .subnets
        .sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    snapshot.volumes.sort_by(|a, b| a.name.cmp(&b.name));
    snapshot.expiry_system.sort_by(|a, b| a.region.cmp(&b.region));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::model::{GroupId, VolumeSpec};
    use crate::provider::BackendKind;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(BackendKind::Docker).with_owner("alice")
    }

    async fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.seed_group(GroupKind::Cluster, "zeta", &[2, 1], "alice");
        backend.seed_group(GroupKind::Cluster, "alpha", &[1], "bob");
        backend.seed_group(GroupKind::Client, "tools", &[1], "alice");
        backend
    }

    #[tokio::test]
    async fn test_only_requested_items_are_fetched() {
        let backend = seeded().await;
        let ctx = ctx();
        let snapshot = Inventory::new(&backend, &ctx)
            .collect(&InventoryRequest::new().item(InventoryItem::Clusters))
            .await
            .unwrap();

        assert_eq!(snapshot.clusters.len(), 3);
        assert!(snapshot.clients.is_empty());
        let calls = backend.calls();
        assert!(calls.contains(&"describe_nodes:cluster".to_string()));
        assert!(!calls.iter().any(|c| c == "list_templates" || c.ends_with(":client")));
    }

    #[tokio::test]
    async fn test_sorted_by_name_then_node() {
        let backend = seeded().await;
        let ctx = ctx();
        let snapshot = Inventory::new(&backend, &ctx)
            .collect(&InventoryRequest::all())
            .await
            .unwrap();

        let order: Vec<(String, u32)> = snapshot
            .clusters
            .iter()
            .map(|n| (n.group.to_string(), n.node_no))
            .collect();
        assert_eq!(
            order,
            vec![
                ("alpha".to_string(), 1),
                ("zeta".to_string(), 1),
                ("zeta".to_string(), 2)
            ]
        );
        assert_eq!(snapshot.find_group(&GroupName::new("tools").unwrap()), Some(GroupKind::Client));
    }

    #[tokio::test]
    async fn test_failed_item_degrades_unless_required() {
        let backend = seeded().await;
        backend.fail_item(InventoryItem::Templates);
        let ctx = ctx();
        let inventory = Inventory::new(&backend, &ctx);

        let snapshot = inventory.collect(&InventoryRequest::all()).await.unwrap();
        assert!(snapshot.templates.is_empty());
        assert_eq!(snapshot.clusters.len(), 3);

        let err = inventory
            .collect(&InventoryRequest::all().require(InventoryItem::Templates))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Backend { .. }));
    }

    #[tokio::test]
    async fn test_owner_and_project_filter() {
        let backend = seeded().await;
        backend
            .create_volume(&VolumeSpec {
                name: "data".to_string(),
                owner: "bob".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let ctx = ctx();
        let snapshot = Inventory::new(&backend, &ctx)
            .collect(&InventoryRequest::all().owner(Some("bob".to_string())))
            .await
            .unwrap();
        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.clusters[0].group.as_str(), "alpha");
        assert!(snapshot.clients.is_empty());
        assert_eq!(snapshot.volumes.len(), 1);

        let scoped = ctx.clone().with_project(Some("other".to_string()));
        let snapshot = Inventory::new(&backend, &scoped)
            .collect(&InventoryRequest::all())
            .await
            .unwrap();
        assert!(snapshot.clusters.is_empty());
        assert!(snapshot.volumes.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_json_has_every_field() {
        let json = serde_json::to_value(InventorySnapshot::default()).unwrap();
        for key in [
            "Clusters",
            "Clients",
            "Templates",
            "FirewallRules",
            "Subnets",
            "Volumes",
            "ExpirySystem",
        ] {
            assert_eq!(json[key], serde_json::json!([]), "{key}");
        }
        let back: InventorySnapshot = serde_json::from_str("{}").unwrap();
        assert_eq!(back, InventorySnapshot::default());
    }

    #[tokio::test]
    async fn test_group_lookup() {
        let backend = seeded().await;
        let ctx = ctx();
        let snapshot = Inventory::new(&backend, &ctx)
            .collect(&InventoryRequest::all())
            .await
            .unwrap();
        let zeta = snapshot
            .group(GroupKind::Cluster, &GroupName::new("zeta").unwrap())
            .unwrap();
        assert_eq!(zeta.node_numbers(), vec![1, 2]);
        assert_eq!(zeta.id(), GroupId::cluster(GroupName::new("zeta").unwrap()));
    }
}
