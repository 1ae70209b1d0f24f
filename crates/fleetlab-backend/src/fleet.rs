//! Group lifecycle on top of one backend
//!
//! Every precondition is checked before the backend is asked to mutate
//! anything.

use crate::context::ExecutionContext;
use crate::error::{FleetError, Result};
use crate::expiry::{expiring_within, grow_expiry};
use crate::inventory::{Inventory, InventoryRequest, InventorySnapshot};
use crate::model::{
    Expiry, Features, Group, GroupId, GroupKind, GroupName, NodeNo, TemplateKey,
};
use crate::provider::{DeployRequest, FleetBackend, ProviderExtra};
use crate::remote::RemoteExec;
use crate::selector::NodeSelector;
use crate::tags::{NodeTags, check_user_tag};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Upper bound on nodes created by one request
pub const MAX_NODES_PER_REQUEST: u32 = 128;

/// Parameters shared by `create` and `grow`
#[derive(Debug, Clone)]
pub struct CreateGroup {
    pub name: GroupName,
    pub count: u32,
    pub template: TemplateKey,
    /// `None` keeps the default (the context ttl for create, the group rule for grow)
    pub expires: Option<Expiry>,
    pub features: Features,
    pub client_type: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub extra: ProviderExtra,
}

pub struct Fleet {
    backend: Arc<dyn FleetBackend>,
    ctx: ExecutionContext,
}

impl Fleet {
    pub fn new(backend: Arc<dyn FleetBackend>, ctx: ExecutionContext) -> Self {
        Self { backend, ctx }
    }

    pub fn backend(&self) -> &dyn FleetBackend {
        self.backend.as_ref()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn remote(&self) -> RemoteExec {
        self.remote_with(self.ctx.parallel_threads)
    }

    /// Remote execution with its own concurrency limit
    pub fn remote_with(&self, parallel_threads: usize) -> RemoteExec {
        RemoteExec::new(self.backend.clone(), parallel_threads)
    }

    pub async fn inventory(&self, request: &InventoryRequest) -> Result<InventorySnapshot> {
        Inventory::new(self.backend.as_ref(), &self.ctx)
            .collect(request)
            .await
    }

    /// Current state of one group, `None` when it has no nodes
    pub async fn group(&self, group: &GroupId) -> Result<Option<Group>> {
        let nodes = self.backend.describe_nodes(group.kind).await?;
        Ok(Group::from_nodes(nodes.into_iter().filter(|n| n.group == group.name))
            .into_iter()
            .next())
    }

    /// Creates a new group with nodes numbered from 1
    pub async fn create(&self, kind: GroupKind, request: CreateGroup) -> Result<Vec<NodeNo>> {
        check_count(request.count)?;
        check_tags(&request.tags)?;

        for existing_kind in GroupKind::ALL {
            let names = self.backend.list_groups(existing_kind).await?;
            if names.contains(&request.name) {
                return Err(if existing_kind == kind {
                    FleetError::validation(format!(
                        "{} '{}' already exists, did you mean '{} grow'?",
                        kind, request.name, kind
                    ))
                } else {
                    FleetError::validation(format!(
                        "'{}' is already used by a {}; cluster and client names share one namespace",
                        request.name, existing_kind
                    ))
                });
            }
        }

        let nodes: Vec<NodeNo> = (1..=request.count).collect();
        let expires = request
            .expires
            .unwrap_or_else(|| self.ctx.default_expiry(Utc::now()));
        let tags = self.node_tags(kind, &request, self.ctx.owner.clone(), request.features, expires, request.count);
        let name = request.name.clone();
        let nodes = self.deploy(kind, request, nodes, tags).await?;
        if let Expiry::At(at) = expires {
            tracing::info!(
                "{} EXPIRES {} (in {}h), to extend use 'fleetlab {} expire -n {} --expire <ttl>'",
                kind.as_str().to_uppercase(),
                at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                (at - Utc::now()).num_hours(),
                kind,
                name
            );
        }
        Ok(nodes)
    }

    /// Adds nodes to an existing group, numbered above every node it has had
    pub async fn grow(&self, kind: GroupKind, request: CreateGroup) -> Result<Vec<NodeNo>> {
        check_count(request.count)?;
        check_tags(&request.tags)?;

        let id = GroupId::new(kind, request.name.clone());
        let group = match self.group(&id).await? {
            Some(group) => group,
            None => {
                let other = kind.other();
                if self.backend.list_groups(other).await?.contains(&request.name) {
                    return Err(FleetError::validation(format!(
                        "'{}' is a {}, not a {}",
                        request.name, other, kind
                    )));
                }
                return Err(FleetError::validation(format!(
                    "{} '{}' does not exist, did you mean '{} create'?",
                    kind, request.name, kind
                )));
            }
        };

        let first = group.next_node_no()?;
        let last = first.checked_add(request.count - 1).ok_or_else(|| {
            FleetError::validation(format!(
                "{} cannot grow by {} nodes from node {}",
                id, request.count, first
            ))
        })?;
        let nodes: Vec<NodeNo> = (first..=last).collect();

        let group_expiry = group.expiry();
        let expires = grow_expiry(group_expiry, request.expires);
        if request.expires.is_some() && expires != group_expiry {
            tracing::warn!(
                group = %id,
                group_expiry = %group_expiry,
                new_expiry = %expires,
                "new nodes get a different expiry than the rest of the group"
            );
        }

        let features = if group.features.is_empty() {
            request.features
        } else {
            group.features
        };
        let tags = self.node_tags(kind, &request, group.owner.clone(), features, expires, last);
        self.deploy(kind, request, nodes, tags).await
    }

    /// Destroys the selected nodes. Absent groups or nodes are not an error.
    pub async fn destroy(
        &self,
        group: &GroupId,
        selector: &NodeSelector,
        force: bool,
    ) -> Result<Vec<NodeNo>> {
        let Some(current) = self.group(group).await? else {
            tracing::info!(group = %group, "nothing to destroy");
            return Ok(Vec::new());
        };

        let nodes = selector.resolve_existing(&current.node_numbers());
        if nodes.is_empty() {
            tracing::info!(group = %group, selector = %selector, "no matching nodes to destroy");
            return Ok(Vec::new());
        }

        if !force {
            let running: Vec<NodeNo> = current
                .live_nodes()
                .filter(|n| n.state.is_running() && nodes.contains(&n.node_no))
                .map(|n| n.node_no)
                .collect();
            if !running.is_empty() {
                return Err(FleetError::validation(format!(
                    "nodes {:?} of {} are running; stop them first or use --force",
                    running, group
                )));
            }
        }

        self.backend.destroy_group(group, &nodes, force).await?;
        tracing::info!(group = %group, nodes = ?nodes, "destroyed");
        Ok(nodes)
    }

    pub async fn start(&self, group: &GroupId, selector: &NodeSelector) -> Result<Vec<NodeNo>> {
        let nodes = self.remote().resolve(group, selector).await?;
        self.backend.start_group(group, &nodes).await?;
        Ok(nodes)
    }

    pub async fn stop(&self, group: &GroupId, selector: &NodeSelector) -> Result<Vec<NodeNo>> {
        let nodes = self.remote().resolve(group, selector).await?;
        self.backend.stop_group(group, &nodes).await?;
        Ok(nodes)
    }

    /// Rewrites the expiry of the selected nodes
    pub async fn set_expiry(
        &self,
        group: &GroupId,
        selector: &NodeSelector,
        expiry: Expiry,
    ) -> Result<Vec<NodeNo>> {
        let nodes = self.remote().resolve(group, selector).await?;
        self.backend.set_group_expiry(group, expiry, &nodes).await?;
        Ok(nodes)
    }

    /// Explicit relabel; the only way owner or user tags change after creation
    pub async fn relabel(&self, group: &GroupId, key: &str, value: &str) -> Result<()> {
        check_user_tag(key)?;
        self.backend.list_nodes(group).await?;
        self.backend.set_label(group, key, value).await
    }

    /// Node addresses; an empty internal map falls back to external addresses
    pub async fn ip_map(&self, group: &GroupId, internal: bool) -> Result<BTreeMap<NodeNo, String>> {
        if internal {
            let map = self.backend.node_ip_map(group, true).await?;
            if !map.is_empty() {
                return Ok(map);
            }
            tracing::debug!(group = %group, "no internal addresses, using external ones");
        }
        self.backend.node_ip_map(group, false).await
    }

    /// Earliest expiry of the group if it is within `within` of `now`
    pub async fn expiring_soon(
        &self,
        group: &GroupId,
        now: DateTime<Utc>,
        within: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(current) = self.group(group).await? else {
            return Ok(None);
        };
        let soon = expiring_within(current.nodes.iter(), now, within);
        if let Some(at) = soon {
            tracing::warn!(group = %group, expires = %at, "group expires soon");
        }
        Ok(soon)
    }

    fn node_tags(
        &self,
        kind: GroupKind,
        request: &CreateGroup,
        owner: String,
        features: Features,
        expires: Expiry,
        node_seq_high: NodeNo,
    ) -> NodeTags {
        let template = &request.template;
        NodeTags {
            kind,
            group: request.name.clone(),
            owner,
            project: self.ctx.project.clone(),
            expires,
            features,
            node_seq_high,
            distribution: template.distribution.clone(),
            distro_version: template.distro_version.clone(),
            aerospike_version: (!template.is_client()).then(|| template.aerospike_version.clone()),
            client_type: request.client_type.clone(),
            arch: template.arch,
            extra: request.tags.clone(),
        }
    }

    async fn deploy(
        &self,
        kind: GroupKind,
        request: CreateGroup,
        nodes: Vec<NodeNo>,
        tags: NodeTags,
    ) -> Result<Vec<NodeNo>> {
        let group = GroupId::new(kind, request.name);
        tracing::info!(
            group = %group,
            nodes = ?nodes,
            template = %request.template,
            expires = %tags.expires,
            backend = self.backend.name(),
            "deploying nodes"
        );
        self.backend
            .deploy_group(&DeployRequest {
                group,
                template: request.template,
                nodes: nodes.clone(),
                tags,
                extra: request.extra,
            })
            .await?;
        Ok(nodes)
    }
}

fn check_count(count: u32) -> Result<()> {
    if count == 0 || count > MAX_NODES_PER_REQUEST {
        return Err(FleetError::validation(format!(
            "node count must be between 1 and {}, got {}",
            MAX_NODES_PER_REQUEST, count
        )));
    }
    Ok(())
}

fn check_tags(tags: &BTreeMap<String, String>) -> Result<()> {
    tags.keys().try_for_each(|key| check_user_tag(key))
}
