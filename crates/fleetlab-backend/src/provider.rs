//! Fleet backend trait definition

use crate::error::{FleetError, Result};
use crate::model::{
    ExpirySystemRecord, ExpirySystemSpec, FirewallRule, FirewallSpec, GroupId, GroupKind,
    GroupName, Node, NodeNo, Subnet, Template, TemplateKey, TemplateSpec, Volume, VolumeSpec,
    Expiry,
};
use crate::tags::NodeTags;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::SeekFrom;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Fleet backend abstraction trait
///
/// Every provider (local containers, AWS, GCP) implements this trait. Exactly
/// one implementation is constructed per process and shared behind an
/// `Arc<dyn FleetBackend>`.
///
/// Operations that touch several nodes receive the exact node numbers to act
/// on; resolving selectors is the caller's job.
#[async_trait]
pub trait FleetBackend: Send + Sync {
    /// Returns the provider name (e.g., "docker", "aws")
    fn name(&self) -> &str;

    /// Names of fully provisioned groups in `kind`'s namespace
    async fn list_groups(&self, kind: GroupKind) -> Result<Vec<GroupName>>;

    /// Node numbers of a group; `NotFound` if the group does not exist
    async fn list_nodes(&self, group: &GroupId) -> Result<Vec<NodeNo>>;

    /// Full descriptions of every node in `kind`'s namespace
    async fn describe_nodes(&self, kind: GroupKind) -> Result<Vec<Node>>;

    async fn list_templates(&self) -> Result<Vec<Template>>;
    async fn create_template(&self, spec: &TemplateSpec) -> Result<Template>;
    async fn destroy_template(&self, key: &TemplateKey) -> Result<()>;

    async fn list_firewalls(&self) -> Result<Vec<FirewallRule>>;
    async fn create_firewall(&self, spec: &FirewallSpec) -> Result<()>;
    async fn delete_firewall(&self, name: &str) -> Result<()>;
    async fn list_subnets(&self) -> Result<Vec<Subnet>>;

    async fn list_volumes(&self) -> Result<Vec<Volume>>;
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume>;
    async fn delete_volume(&self, name: &str) -> Result<()>;
    async fn tag_volume(&self, name: &str, key: &str, value: &str) -> Result<()>;

    async fn expiry_system(&self) -> Result<Vec<ExpirySystemRecord>>;
    async fn install_expiry_system(&self, spec: &ExpirySystemSpec) -> Result<()>;
    async fn remove_expiry_system(&self, region: Option<&str>) -> Result<()>;
    async fn set_expiry_frequency(&self, interval_minutes: u32) -> Result<()>;

    /// Creates `request.nodes`. Returns once the provider accepted every node
    /// and its tags are written; does not wait for boot.
    async fn deploy_group(&self, request: &DeployRequest) -> Result<()>;

    async fn start_group(&self, group: &GroupId, nodes: &[NodeNo]) -> Result<()>;
    async fn stop_group(&self, group: &GroupId, nodes: &[NodeNo]) -> Result<()>;

    /// Idempotent: nodes that are already gone are skipped. With `force`,
    /// running nodes are stopped first.
    async fn destroy_group(&self, group: &GroupId, nodes: &[NodeNo], force: bool) -> Result<()>;

    /// Node addresses. An `internal` map may be empty when the provider has
    /// no separate internal network.
    async fn node_ip_map(&self, group: &GroupId, internal: bool) -> Result<BTreeMap<NodeNo, String>>;

    /// Runs `commands` in order on each node. The first failure stops the run
    /// and is returned together with everything collected so far.
    async fn run_commands(
        &self,
        group: &GroupId,
        commands: &[Vec<String>],
        nodes: &[NodeNo],
    ) -> std::result::Result<Vec<NodeOutput>, RunFailure>;

    async fn copy_files(&self, group: &GroupId, files: &[FileUpload], nodes: &[NodeNo]) -> Result<()>;

    /// Streaming variant of [`FleetBackend::copy_files`]. The default
    /// implementation buffers the stream once.
    async fn copy_stream(&self, group: &GroupId, stream: &mut FileStream, nodes: &[NodeNo]) -> Result<()> {
        let contents = stream.read_all().await?;
        let upload = FileUpload::new(stream.path.clone(), contents)?;
        self.copy_files(group, std::slice::from_ref(&upload), nodes).await
    }

    /// Contents of one regular file on one node
    async fn copy_from_node(&self, group: &GroupId, node: NodeNo, path: &str) -> Result<Vec<u8>>;

    /// With `interactive`, local stdio is wired to the remote process and
    /// the returned buffer is empty.
    async fn attach_and_run(
        &self,
        group: &GroupId,
        node: NodeNo,
        args: &[String],
        interactive: bool,
    ) -> Result<Vec<u8>>;

    async fn is_system_arm(&self, instance_type: &str) -> Result<bool>;

    async fn set_label(&self, group: &GroupId, key: &str, value: &str) -> Result<()>;

    /// Rewrites the expiry tag of the given nodes
    async fn set_group_expiry(&self, group: &GroupId, expiry: Expiry, nodes: &[NodeNo]) -> Result<()>;
}

/// Which provider a process talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Aws,
    Gcp,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Docker => "docker",
            BackendKind::Aws => "aws",
            BackendKind::Gcp => "gcp",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "aws" => Ok(BackendKind::Aws),
            "gcp" => Ok(BackendKind::Gcp),
            other => Err(FleetError::validation(format!(
                "unknown backend '{}' (expected docker, aws or gcp)",
                other
            ))),
        }
    }
}

/// Everything an adapter needs to create a batch of nodes
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub group: GroupId,
    pub template: TemplateKey,
    /// Exact node numbers to create, ascending
    pub nodes: Vec<NodeNo>,
    pub tags: NodeTags,
    pub extra: ProviderExtra,
}

/// Provider-specific deploy options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum ProviderExtra {
    Docker(DockerExtra),
    Aws(AwsExtra),
    Gcp(GcpExtra),
}

impl ProviderExtra {
    pub fn backend(&self) -> BackendKind {
        match self {
            ProviderExtra::Docker(_) => BackendKind::Docker,
            ProviderExtra::Aws(_) => BackendKind::Aws,
            ProviderExtra::Gcp(_) => BackendKind::Gcp,
        }
    }

    /// Default options for `backend`
    pub fn default_for(backend: BackendKind) -> Self {
        match backend {
            BackendKind::Docker => ProviderExtra::Docker(DockerExtra::default()),
            BackendKind::Aws => ProviderExtra::Aws(AwsExtra::default()),
            BackendKind::Gcp => ProviderExtra::Gcp(GcpExtra::default()),
        }
    }

    pub(crate) fn mismatch(&self, expected: BackendKind) -> FleetError {
        FleetError::validation(format!(
            "{} backend cannot deploy with {} options",
            expected,
            self.backend()
        ))
    }

    pub fn docker(&self) -> Result<&DockerExtra> {
        match self {
            ProviderExtra::Docker(extra) => Ok(extra),
            other => Err(other.mismatch(BackendKind::Docker)),
        }
    }

    pub fn aws(&self) -> Result<&AwsExtra> {
        match self {
            ProviderExtra::Aws(extra) => Ok(extra),
            other => Err(other.mismatch(BackendKind::Aws)),
        }
    }

    pub fn gcp(&self) -> Result<&GcpExtra> {
        match self {
            ProviderExtra::Gcp(extra) => Ok(extra),
            other => Err(other.mismatch(BackendKind::Gcp)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerExtra {
    /// Image override; defaults to the template image
    pub image: Option<String>,
    pub network: Option<String>,
    /// `host:container` port publications
    pub exposed_ports: Vec<String>,
    pub privileged: bool,
    /// CPU limit in cores
    pub cpus: Option<f64>,
    /// Memory limit in bytes
    pub memory: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsExtra {
    pub instance_type: String,
    /// AMI override; defaults to the template AMI
    pub ami: Option<String>,
    /// Root volume size in GiB
    pub root_volume_gb: Option<u32>,
    pub security_groups: Vec<String>,
    pub subnet_id: Option<String>,
    pub spot: bool,
    pub termination_protection: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcpExtra {
    pub machine_type: String,
    pub zone: Option<String>,
    /// Boot disk size in GB
    pub boot_disk_gb: Option<u32>,
    /// Network tags used as firewall targets
    pub network_tags: Vec<String>,
    pub subnet: Option<String>,
    pub spot: bool,
    pub min_cpu_platform: Option<String>,
}

/// Combined output of one node's command run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutput {
    pub node: NodeNo,
    pub output: Vec<u8>,
}

impl NodeOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// A run that stopped at `node`; `outputs` holds everything gathered before
/// the failure, including the failing node's partial output.
#[derive(Debug, thiserror::Error)]
#[error("command failed on {group} node {node}: {source}")]
pub struct RunFailure {
    pub group: String,
    pub node: NodeNo,
    pub outputs: Vec<NodeOutput>,
    #[source]
    pub source: FleetError,
}

impl From<RunFailure> for FleetError {
    fn from(failure: RunFailure) -> Self {
        FleetError::CommandFailed {
            group: failure.group,
            node: failure.node,
            message: failure.source.to_string(),
        }
    }
}

/// File contents destined for an absolute remote path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub path: String,
    pub contents: Vec<u8>,
    pub mode: u32,
}

impl FileUpload {
    pub fn new(path: impl Into<String>, contents: Vec<u8>) -> Result<Self> {
        let path = path.into();
        check_remote_path(&path)?;
        Ok(Self {
            path,
            contents,
            mode: 0o644,
        })
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

pub trait AsyncReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> AsyncReadSeek for T {}

/// Streaming upload with a declared size. The reader is rewound before each
/// node receives it.
pub struct FileStream {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    reader: Box<dyn AsyncReadSeek>,
}

impl FileStream {
    pub fn new(path: impl Into<String>, size: u64, reader: impl AsyncReadSeek + 'static) -> Result<Self> {
        let path = path.into();
        check_remote_path(&path)?;
        Ok(Self {
            path,
            size,
            mode: 0o644,
            reader: Box::new(reader),
        })
    }

    /// Opens a local file, taking its size from metadata
    pub async fn from_file(local: &std::path::Path, remote: impl Into<String>) -> Result<Self> {
        let file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        Self::new(remote, size, file)
    }

    /// Rewinds and hands out the reader limited to the declared size
    pub async fn rewind(&mut self) -> Result<impl AsyncRead + Send + Unpin + '_> {
        self.reader.seek(SeekFrom::Start(0)).await?;
        Ok((&mut self.reader).take(self.size))
    }

    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let size = self.size;
        let path = self.path.clone();
        let mut buf = Vec::with_capacity(size as usize);
        self.rewind().await?.read_to_end(&mut buf).await?;
        if (buf.len() as u64) < size {
            return Err(FleetError::validation(format!(
                "stream for {} ended after {} of {} bytes",
                path,
                buf.len(),
                size
            )));
        }
        Ok(buf)
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

pub fn check_remote_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(FleetError::validation(format!(
            "remote path '{}' must be absolute",
            path
        )));
    }
    Ok(())
}

/// Retry configuration for provider transports
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    pub initial_delay: Duration,

    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("AWS".parse::<BackendKind>().unwrap(), BackendKind::Aws);
        assert_eq!(" docker ".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert!("azure".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_extra_mismatch_is_validation() {
        let extra = ProviderExtra::default_for(BackendKind::Gcp);
        assert!(extra.gcp().is_ok());
        let err = extra.docker().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("docker backend cannot deploy with gcp options"));
    }

    #[test]
    fn test_file_upload_requires_absolute_path() {
        assert!(FileUpload::new("/etc/hosts", Vec::new()).is_ok());
        assert!(FileUpload::new("etc/hosts", Vec::new()).unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_file_stream_rewinds() {
        let mut stream = FileStream::new("/tmp/x", 5, Cursor::new(b"hello world".to_vec())).unwrap();
        assert_eq!(stream.read_all().await.unwrap(), b"hello");
        assert_eq!(stream.read_all().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_file_stream_short_read() {
        let mut stream = FileStream::new("/tmp/x", 10, Cursor::new(b"abc".to_vec())).unwrap();
        assert!(stream.read_all().await.is_err());
    }

    #[test]
    fn test_file_stream_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("aerospike.conf");
        std::fs::write(&local, b"service {}\n").unwrap();

        let mut stream =
            tokio_test::block_on(FileStream::from_file(&local, "/etc/aerospike/aerospike.conf")).unwrap();
        assert_eq!(stream.size, 11);
        assert_eq!(stream.path, "/etc/aerospike/aerospike.conf");
        assert_eq!(tokio_test::block_on(stream.read_all()).unwrap(), b"service {}\n");

        let missing = dir.path().join("missing.conf");
        assert!(tokio_test::block_on(FileStream::from_file(&missing, "/tmp/x")).is_err());
    }

    #[test]
    fn test_retry_delay() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_run_failure_converts() {
        let failure = RunFailure {
            group: "mydc".to_string(),
            node: 2,
            outputs: Vec::new(),
            source: FleetError::validation("exit status 1"),
        };
        let err: FleetError = failure.into();
        assert_eq!(err.to_string(), "command failed on mydc node 2: exit status 1");
    }
}
