//! Expiry policies and the in-process expiry sweep
//!
//! Two policies exist on purpose:
//! - [`group_expiry`] is the group-wide TTL adopted by `grow`: never if any
//!   live node never expires, otherwise the latest expiry.
//! - [`earliest_expiry`] drives the "expiring soon" warning.

use crate::context::ExecutionContext;
use crate::error::{NodeFailure, PartialFailure, Result};
use crate::executor::map_limit;
use crate::inventory::{Inventory, InventoryItem, InventoryRequest};
use crate::model::{Expiry, GroupId, Node, NodeNo};
use crate::provider::FleetBackend;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Group-wide expiry over the live nodes of one group
pub fn group_expiry<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Expiry {
    let mut latest: Option<DateTime<Utc>> = None;
    for node in nodes.into_iter().filter(|n| n.state.is_live()) {
        match node.expires {
            Expiry::Never => return Expiry::Never,
            Expiry::At(at) => latest = Some(latest.map_or(at, |l| l.max(at))),
        }
    }
    latest.map_or(Expiry::Never, Expiry::At)
}

/// Earliest expiry among live nodes; `None` when none of them expire
pub fn earliest_expiry<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Option<DateTime<Utc>> {
    nodes
        .into_iter()
        .filter(|n| n.state.is_live())
        .filter_map(|n| n.expires.timestamp())
        .min()
}

/// Expiry for nodes added by `grow`. An explicit override wins.
pub fn grow_expiry(group: Expiry, explicit: Option<Expiry>) -> Expiry {
    explicit.unwrap_or(group)
}

/// Earliest expiry if it falls within `within` of `now`
pub fn expiring_within<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    now: DateTime<Utc>,
    within: Duration,
) -> Option<DateTime<Utc>> {
    earliest_expiry(nodes).filter(|at| *at <= now + within)
}

/// Live nodes whose expiry has passed
pub fn expired_nodes<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    now: DateTime<Utc>,
) -> Vec<&'a Node> {
    nodes
        .into_iter()
        .filter(|n| n.state.is_live() && n.expires.is_expired(now))
        .collect()
}

/// Nodes removed (or, in a dry run, selected) by one sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweptGroup {
    pub kind: String,
    pub group: String,
    pub nodes: Vec<NodeNo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub groups: Vec<SweptGroup>,
}

/// Destroys every expired node the context can see.
///
/// This is the same contract the provider-native cleanup function follows:
/// read the expiry tag, force-destroy what is past it.
pub async fn sweep_expired(
    backend: &dyn FleetBackend,
    ctx: &ExecutionContext,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<SweepReport> {
    let snapshot = Inventory::new(backend, ctx)
        .collect(
            &InventoryRequest::new()
                .require(InventoryItem::Clusters)
                .require(InventoryItem::Clients),
        )
        .await?;

    let mut targets: BTreeMap<GroupId, Vec<NodeNo>> = BTreeMap::new();
    for node in expired_nodes(snapshot.clusters.iter().chain(snapshot.clients.iter()), now) {
        targets.entry(node.group_id()).or_default().push(node.node_no);
    }
    let targets: Vec<(GroupId, Vec<NodeNo>)> = targets.into_iter().collect();

    if !dry_run && !targets.is_empty() {
        let results = map_limit(&targets, ctx.parallel_threads, |(group, nodes)| async move {
            tracing::info!(group = %group, nodes = ?nodes, "destroying expired nodes");
            backend.destroy_group(group, nodes, true).await
        })
        .await;

        let mut attempted = 0;
        let mut failures = Vec::new();
        for ((group, nodes), result) in targets.iter().zip(results) {
            attempted += nodes.len();
            if let Err(e) = result {
                failures.extend(nodes.iter().map(|node| NodeFailure {
                    group: group.to_string(),
                    node: *node,
                    message: e.to_string(),
                }));
            }
        }
        if !failures.is_empty() {
            return Err(PartialFailure {
                operation: "expiry sweep".to_string(),
                attempted,
                failures,
            }
            .into());
        }
    }

    Ok(SweepReport {
        dry_run,
        groups: targets
            .into_iter()
            .map(|(group, nodes)| SweptGroup {
                kind: group.kind.to_string(),
                group: group.name.to_string(),
                nodes,
            })
            .collect(),
    })
}
