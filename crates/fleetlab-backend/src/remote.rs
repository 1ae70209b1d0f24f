//! Remote execution and file transfer by group name and node selector

use crate::error::{FleetError, Result};
use crate::executor::{collect_node_results, map_limit};
use crate::model::{GroupId, NodeNo};
use crate::provider::{FileStream, FileUpload, FleetBackend, NodeOutput, RunFailure};
use crate::selector::NodeSelector;
use std::sync::Arc;

/// Resolves selectors against live groups and delegates to the backend
#[derive(Clone)]
pub struct RemoteExec {
    backend: Arc<dyn FleetBackend>,
    parallel_threads: usize,
}

impl RemoteExec {
    pub fn new(backend: Arc<dyn FleetBackend>, parallel_threads: usize) -> Self {
        Self {
            backend,
            parallel_threads: parallel_threads.max(1),
        }
    }

    /// Concrete node numbers for `selector`; `NotFound` when the group or a
    /// listed node is missing.
    pub async fn resolve(&self, group: &GroupId, selector: &NodeSelector) -> Result<Vec<NodeNo>> {
        let available = self.backend.list_nodes(group).await?;
        selector.resolve(group, &available)
    }

    /// Runs `commands` sequentially on each selected node, stopping at the
    /// first failing node. The outer error covers selector resolution; the
    /// inner one carries the partial output of an interrupted run.
    pub async fn run(
        &self,
        group: &GroupId,
        selector: &NodeSelector,
        commands: &[Vec<String>],
    ) -> Result<std::result::Result<Vec<NodeOutput>, RunFailure>> {
        let nodes = self.resolve(group, selector).await?;
        tracing::debug!(group = %group, nodes = ?nodes, "running commands");
        Ok(self.backend.run_commands(group, commands, &nodes).await)
    }

    /// Runs `commands` on every selected node through the executor. Results
    /// are index-aligned with the returned node list; one node failing does
    /// not stop the others.
    pub async fn run_parallel(
        &self,
        group: &GroupId,
        selector: &NodeSelector,
        commands: &[Vec<String>],
    ) -> Result<Vec<(NodeNo, Result<NodeOutput>)>> {
        let nodes = self.resolve(group, selector).await?;
        let backend = &self.backend;
        let results = map_limit(&nodes, self.parallel_threads, |node| async move {
            backend
                .run_commands(group, commands, std::slice::from_ref(node))
                .await
                .map_err(FleetError::from)
                .and_then(|mut outputs| {
                    outputs.pop().ok_or_else(|| {
                        FleetError::backend(backend.name(), format!("no output from node {}", node))
                    })
                })
        })
        .await;
        Ok(nodes.into_iter().zip(results).collect())
    }

    /// Runs `args` on the selected nodes, or attaches the local terminal.
    ///
    /// Interactive sessions need exactly one node; that is checked before
    /// any channel is opened.
    pub async fn attach(
        &self,
        group: &GroupId,
        selector: &NodeSelector,
        args: &[String],
        interactive: bool,
    ) -> Result<Vec<NodeOutput>> {
        let nodes = self.resolve(group, selector).await?;
        if nodes.is_empty() {
            return Err(FleetError::not_found("node", format!("{} has no nodes", group)));
        }

        if interactive {
            if nodes.len() != 1 {
                return Err(FleetError::validation(format!(
                    "interactive attach needs exactly one node, but the selector matched {} nodes of {}; pass a command to run on several nodes",
                    nodes.len(),
                    group
                )));
            }
            let node = nodes[0];
            self.backend.attach_and_run(group, node, args, true).await?;
            return Ok(vec![NodeOutput {
                node,
                output: Vec::new(),
            }]);
        }

        let backend = &self.backend;
        let results = map_limit(&nodes, self.parallel_threads, |node| async move {
            backend
                .attach_and_run(group, *node, args, false)
                .await
                .map(|output| NodeOutput {
                    node: *node,
                    output,
                })
        })
        .await;
        collect_node_results("attach", group.name.as_str(), &nodes, results)
    }

    pub async fn upload(
        &self,
        group: &GroupId,
        selector: &NodeSelector,
        files: &[FileUpload],
    ) -> Result<Vec<NodeNo>> {
        let nodes = self.resolve(group, selector).await?;
        tracing::debug!(group = %group, nodes = ?nodes, files = files.len(), "uploading files");
        self.backend.copy_files(group, files, &nodes).await?;
        Ok(nodes)
    }

    pub async fn upload_stream(
        &self,
        group: &GroupId,
        selector: &NodeSelector,
        stream: &mut FileStream,
    ) -> Result<Vec<NodeNo>> {
        let nodes = self.resolve(group, selector).await?;
        tracing::debug!(group = %group, nodes = ?nodes, path = %stream.path, size = stream.size, "streaming file");
        self.backend.copy_stream(group, stream, &nodes).await?;
        Ok(nodes)
    }

    /// Reads `path` from every selected node. Every node is attempted; the
    /// ones that fail are reported together.
    pub async fn download(
        &self,
        group: &GroupId,
        selector: &NodeSelector,
        path: &str,
    ) -> Result<Vec<(NodeNo, Vec<u8>)>> {
        let nodes = self.resolve(group, selector).await?;
        tracing::debug!(group = %group, nodes = ?nodes, path = %path, "downloading file");
        let backend = &self.backend;
        let results = map_limit(&nodes, self.parallel_threads, |node| async move {
            backend.copy_from_node(group, *node, path).await
        })
        .await;
        let contents = collect_node_results("download", &group.to_string(), &nodes, results)?;
        Ok(nodes.into_iter().zip(contents).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::model::{GroupKind, GroupName};
    use std::io::Cursor;

    fn setup() -> (Arc<MemoryBackend>, RemoteExec, GroupId) {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_group(GroupKind::Cluster, "mydc", &[1, 2, 3, 4, 5], "alice");
        let remote = RemoteExec::new(backend.clone(), 2);
        (backend, remote, GroupId::cluster(GroupName::new("mydc").unwrap()))
    }

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_interactive_attach_rejects_many_nodes() {
        let (backend, remote, group) = setup();
        let err = remote
            .attach(&group, &NodeSelector::parse("1-2").unwrap(), &[], true)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(backend.channel_opens(), 0);

        let err = remote
            .attach(&group, &NodeSelector::All, &[], true)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(backend.channel_opens(), 0);
    }

    #[tokio::test]
    async fn test_interactive_attach_single_node() {
        let (backend, remote, group) = setup();
        let outputs = remote
            .attach(&group, &NodeSelector::single(3), &[], true)
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].node, 3);
        assert!(outputs[0].output.is_empty());
        assert_eq!(backend.channel_opens(), 1);
    }

    #[tokio::test]
    async fn test_batch_attach_collects_per_node() {
        let (_, remote, group) = setup();
        let outputs = remote
            .attach(&group, &NodeSelector::parse("1,3").unwrap(), &cmd(&["hostname"]), false)
            .await
            .unwrap();
        let nodes: Vec<NodeNo> = outputs.iter().map(|o| o.node).collect();
        assert_eq!(nodes, vec![1, 3]);
        assert!(outputs[1].text().contains("hostname"));
    }

    #[tokio::test]
    async fn test_run_returns_partial_output() {
        let (backend, remote, group) = setup();
        backend.fail_run_on(&[3]);
        let failure = remote
            .run(&group, &NodeSelector::All, &[cmd(&["echo", "hi"])])
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.node, 3);
        let done: Vec<NodeNo> = failure.outputs.iter().map(|o| o.node).collect();
        assert_eq!(done, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_run_parallel_isolates_failures() {
        let (backend, remote, group) = setup();
        backend.fail_run_on(&[2, 4]);
        let results = remote
            .run_parallel(&group, &NodeSelector::All, &[cmd(&["true"])])
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        let failed: Vec<NodeNo> = results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(n, _)| *n)
            .collect();
        assert_eq!(failed, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_found() {
        let (_, remote, group) = setup();
        let err = remote
            .upload(
                &group,
                &NodeSelector::parse("9").unwrap(),
                &[FileUpload::new("/etc/x", b"x".to_vec()).unwrap()],
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_upload_stream_reaches_every_node() {
        let (backend, remote, group) = setup();
        let mut stream = FileStream::new("/opt/data.bin", 4, Cursor::new(b"data".to_vec())).unwrap();
        let nodes = remote
            .upload_stream(&group, &NodeSelector::parse("2,5").unwrap(), &mut stream)
            .await
            .unwrap();
        assert_eq!(nodes, vec![2, 5]);
        assert_eq!(
            backend.uploaded(GroupKind::Cluster, "mydc", 5, "/opt/data.bin"),
            Some(b"data".to_vec())
        );
        assert_eq!(backend.uploaded(GroupKind::Cluster, "mydc", 1, "/opt/data.bin"), None);
    }

    #[tokio::test]
    async fn test_download_names_nodes_without_the_file() {
        let (_, remote, group) = setup();
        remote
            .upload(
                &group,
                &NodeSelector::parse("2,5").unwrap(),
                &[FileUpload::new("/var/log/aerospike.log", b"ready".to_vec()).unwrap()],
            )
            .await
            .unwrap();

        let files = remote
            .download(&group, &NodeSelector::parse("2,5").unwrap(), "/var/log/aerospike.log")
            .await
            .unwrap();
        assert_eq!(files, vec![(2, b"ready".to_vec()), (5, b"ready".to_vec())]);

        let err = remote
            .download(&group, &NodeSelector::All, "/var/log/aerospike.log")
            .await
            .unwrap_err();
        match &err {
            FleetError::PartialFailure(failure) => {
                assert_eq!(failure.attempted, 5);
                assert_eq!(failure.failed_nodes(), vec![1, 3, 4]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
