//! Bounded-concurrency fan-out over nodes
//!
//! [`map_limit`] admits items in input order with at most `limit` futures in
//! flight. A failing item never cancels its siblings; results come back
//! index-aligned with the input once everything has finished.

use crate::error::{FleetError, NodeFailure, PartialFailure, Result};
use crate::model::{GroupId, NodeNo};
use futures_util::stream::{self, StreamExt};
use std::future::Future;

/// Default fan-out width when the configuration does not set one
pub const DEFAULT_PARALLEL_THREADS: usize = 50;

/// Applies `f` to every item with at most `limit` concurrent invocations.
///
/// Every item is attempted exactly once. A `limit` of 0 is treated as 1.
pub async fn map_limit<'a, T, R, F, Fut>(items: &'a [T], limit: usize, mut f: F) -> Vec<R>
where
    F: FnMut(&'a T) -> Fut,
    Fut: Future<Output = R>,
{
    let limit = limit.max(1);
    let mut results: Vec<(usize, R)> = stream::iter(0..items.len())
        .map(|index| {
            let fut = f(&items[index]);
            async move { (index, fut.await) }
        })
        .buffer_unordered(limit)
        .collect()
        .await;

    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

/// Collapses index-aligned per-node results into one outcome.
///
/// Succeeds with every value when no node failed, otherwise returns a
/// [`PartialFailure`] naming each failing node.
pub fn collect_node_results<T>(
    operation: &str,
    group: &str,
    nodes: &[NodeNo],
    results: Vec<Result<T>>,
) -> Result<Vec<T>> {
    let attempted = results.len();
    let mut values = Vec::with_capacity(attempted);
    let mut failures = Vec::new();

    for (node, result) in nodes.iter().zip(results) {
        match result {
            Ok(value) => values.push(value),
            Err(e) => failures.push(NodeFailure {
                group: group.to_string(),
                node: *node,
                message: e.to_string(),
            }),
        }
    }

    if failures.is_empty() {
        Ok(values)
    } else {
        Err(FleetError::PartialFailure(PartialFailure {
            operation: operation.to_string(),
            attempted,
            failures,
        }))
    }
}

/// Runs a per-node operation on every node of `group` with at most `limit`
/// in flight. Fails with a [`PartialFailure`] naming each node that failed.
pub async fn for_each_node<F, Fut>(
    operation: &str,
    group: &GroupId,
    nodes: &[NodeNo],
    limit: usize,
    mut f: F,
) -> Result<()>
where
    F: FnMut(NodeNo) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let results = map_limit(nodes, limit, |node| f(*node)).await;
    collect_node_results(operation, &group.to_string(), nodes, results)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_are_index_aligned() {
        let items: Vec<u64> = vec![30, 10, 20, 0, 5];
        let results = map_limit(&items, 3, |delay| async move {
            tokio::time::sleep(Duration::from_millis(*delay)).await;
            *delay * 2
        })
        .await;
        assert_eq!(results, vec![60, 20, 40, 0, 10]);
    }

    #[tokio::test]
    async fn test_partial_failure_attempts_every_node() {
        let nodes: Vec<NodeNo> = vec![1, 2, 3, 4, 5];

        for limit in [0, 1, 2, 5, 50] {
            let calls = Arc::new(AtomicUsize::new(0));
            let results = map_limit(&nodes, limit, |node| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    if *node % 2 == 0 {
                        Err(FleetError::validation(format!("node {} broke", node)))
                    } else {
                        Ok(*node)
                    }
                }
            })
            .await;

            assert_eq!(results.len(), 5);
            assert_eq!(calls.load(Ordering::SeqCst), 5);
            let failed: Vec<usize> = results
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_err())
                .map(|(i, _)| i)
                .collect();
            assert_eq!(failed, vec![1, 3], "limit {}", limit);
        }
    }

    #[tokio::test]
    async fn test_limit_bounds_in_flight() {
        let items: Vec<usize> = (0..20).collect();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        map_limit(&items, 4, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_for_each_node_names_failures() {
        let group = GroupId::new(
            crate::model::GroupKind::Cluster,
            crate::model::GroupName::new("mydc").unwrap(),
        );
        let attempted = Arc::new(AtomicUsize::new(0));
        let err = for_each_node("stop", &group, &[1, 2, 3], 1, |node| {
            let attempted = attempted.clone();
            async move {
                attempted.fetch_add(1, Ordering::SeqCst);
                if node == 2 {
                    Err(FleetError::backend("docker", "server error 500"))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(attempted.load(Ordering::SeqCst), 3);
        match &err {
            FleetError::PartialFailure(failure) => assert_eq!(failure.failed_nodes(), vec![2]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("node 2: "), "{}", err);

        for_each_node("stop", &group, &[1, 2], 4, |_| async { Ok(()) })
            .await
            .unwrap();
    }

    #[test]
    fn test_collect_node_results() {
        let nodes = vec![1, 2, 3];
        let ok = collect_node_results("start", "mydc", &nodes, vec![Ok(1), Ok(2), Ok(3)]);
        assert_eq!(ok.unwrap(), vec![1, 2, 3]);

        let err = collect_node_results(
            "start",
            "mydc",
            &nodes,
            vec![
                Ok(()),
                Err(FleetError::validation("boom")),
                Err(FleetError::not_found("node", "3")),
            ],
        )
        .unwrap_err();
        match err {
            FleetError::PartialFailure(failure) => {
                assert_eq!(failure.attempted, 3);
                assert_eq!(failure.failed_nodes(), vec![2, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
