//! `FleetBackend` on Compute Engine
//!
//! Nodes are VM instances. Labels carry lowercased copies of the fleetlab
//! tags for filtering; the exact tag set lives in instance metadata next to
//! the `ssh-keys` entry that lets fleetlab log in with its own key.

use crate::cli::GcloudCli;
use crate::convert::{
    allow_rule, disk_to_volume, firewall_description, firewall_to_rule, image_to_template,
    instance_name, instance_to_node, is_arm_machine, label_value, labels_arg, node_labels,
    sanitize, source_ranges, template_description, template_image_name, template_labels,
    to_subnet,
};
use crate::error::{GcpError, PROVIDER, Result, ignore_not_found};
use crate::expiry;
use crate::types::{Disk, Firewall, GcpSubnet, Image, Instance};
use async_trait::async_trait;
use fleetlab_backend::ssh::{SshTransport, run_on_hosts, stream_to_hosts, upload_to_hosts};
use fleetlab_backend::tags::{TAG_EXPIRES, TAG_GROUP, TAG_KIND, TAG_MANAGED, TAG_NODE, TAG_OWNER, TAG_TEMPLATE, TAG_VOLUME};
use fleetlab_backend::{
    Arch, DeployRequest, Expiry, ExpirySystemRecord, ExpirySystemSpec, FileStream, FileUpload,
    FirewallRule, FirewallSpec, FleetBackend, FleetError, GroupId, GroupKind, GroupName, Node,
    NodeNo, NodeOutput, RunFailure, Subnet, Template, TemplateKey, TemplateSpec, Volume,
    VolumeSpec,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

type FleetResult<T> = fleetlab_backend::Result<T>;

/// Separator for `--metadata`, chosen so values may contain `,` and `=`
const METADATA_DELIM: char = '\u{1e}';
const SSH_KEYS_METADATA: &str = "ssh-keys";
const INSTALL_SCRIPT_PATH: &str = "/tmp/fleetlab-install.sh";
const SSH_READY_ATTEMPTS: u32 = 30;
const SSH_READY_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_DISK_GB: u32 = 10;
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone)]
pub struct GcpSettings {
    pub project: String,
    pub region: String,
    /// Zone for new instances and disks unless a request names one
    pub zone: String,
    pub ssh_user: String,
    /// Private key; `<path>.pub` is published in instance metadata
    pub key_path: PathBuf,
}

pub struct GcpBackend {
    cli: GcloudCli,
    ssh_user: String,
    key_path: PathBuf,
}

/// Public image family for `key`, as `(project, family)`
pub fn base_image_family(key: &TemplateKey) -> Option<(&'static str, String)> {
    let arm = key.arch == Arch::Arm64;
    match key.distribution.as_str() {
        "ubuntu" => Some((
            "ubuntu-os-cloud",
            format!(
                "ubuntu-{}-lts-{}",
                key.distro_version.replace('.', ""),
                key.arch
            ),
        )),
        "debian" => Some((
            "debian-cloud",
            format!("debian-{}{}", key.distro_version, if arm { "-arm64" } else { "" }),
        )),
        "rocky" => Some((
            "rocky-linux-cloud",
            format!("rocky-linux-{}{}", key.distro_version, if arm { "-arm64" } else { "" }),
        )),
        _ => None,
    }
}

pub fn builder_machine_type(arch: Arch) -> &'static str {
    match arch {
        Arch::Amd64 => "e2-medium",
        Arch::Arm64 => "t2a-standard-1",
    }
}

/// `--metadata` argument using an alternate delimiter
pub fn metadata_arg(items: &BTreeMap<String, String>) -> FleetResult<String> {
    if let Some((key, _)) = items
        .iter()
        .find(|(k, v)| k.contains(METADATA_DELIM) || v.contains(METADATA_DELIM))
    {
        return Err(FleetError::validation(format!(
            "tag '{}' contains a control character",
            key
        )));
    }
    let joined = items
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(&METADATA_DELIM.to_string());
    Ok(format!("--metadata=^{}^{}", METADATA_DELIM, joined))
}

fn truncate_name(name: &str) -> String {
    name.chars()
        .take(MAX_NAME_LEN)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

/// Instance names grouped by zone
fn by_zone<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> BTreeMap<String, Vec<String>> {
    let mut zones: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes {
        zones
            .entry(node.zone.clone())
            .or_default()
            .push(node.instance_id.clone());
    }
    zones
}

impl GcpBackend {
    pub fn new(settings: GcpSettings) -> Self {
        Self {
            cli: GcloudCli::new(settings.project, settings.region, settings.zone),
            ssh_user: settings.ssh_user,
            key_path: settings.key_path,
        }
    }

    /// Fails early when the gcloud binary is missing
    pub async fn connect(settings: GcpSettings) -> Result<Self> {
        let backend = Self::new(settings);
        backend.cli.check_installed().await?;
        Ok(backend)
    }

    fn ssh(&self) -> SshTransport {
        SshTransport::new(self.ssh_user.clone()).with_key(self.key_path.clone())
    }

    /// `ssh-keys` metadata value, generating the key pair on first use
    async fn ssh_keys_entry(&self) -> Result<String> {
        let mut public = self.key_path.clone().into_os_string();
        public.push(".pub");
        if !self.key_path.is_file() {
            if let Some(dir) = self.key_path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let output = tokio::process::Command::new("ssh-keygen")
                .args(["-t", "ed25519", "-N", "", "-q", "-C", "fleetlab", "-f"])
                .arg(&self.key_path)
                .output()
                .await?;
            if !output.status.success() {
                return Err(FleetError::backend(
                    PROVIDER,
                    format!(
                        "ssh-keygen failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                )
                .into());
            }
            tracing::info!(path = %self.key_path.display(), "created ssh key");
        }
        let key = tokio::fs::read_to_string(&public).await?;
        Ok(format!("{}:{}", self.ssh_user, key.trim()))
    }

    async fn describe(&self, kind: GroupKind, group: Option<&GroupName>) -> Result<Vec<Node>> {
        let mut filter = format!(
            "labels.{}=true AND labels.{}={}",
            TAG_MANAGED,
            TAG_KIND,
            kind.as_str()
        );
        if let Some(group) = group {
            filter.push_str(&format!(" AND labels.{}={}", TAG_GROUP, sanitize(group.as_str())));
        }
        let instances: Vec<Instance> = self
            .cli
            .run_json(&["compute", "instances", "list", &format!("--filter={}", filter)])
            .await?;
        Ok(instances
            .iter()
            .filter_map(|i| instance_to_node(i, kind))
            .filter(|n| group.is_none_or(|g| &n.group == g))
            .collect())
    }

    async fn group_nodes(&self, group: &GroupId) -> Result<BTreeMap<NodeNo, Node>> {
        Ok(self
            .describe(group.kind, Some(&group.name))
            .await?
            .into_iter()
            .map(|n| (n.node_no, n))
            .collect())
    }

    async fn require_nodes(&self, group: &GroupId, nodes: &[NodeNo]) -> Result<Vec<Node>> {
        let mut existing = self.group_nodes(group).await?;
        nodes
            .iter()
            .map(|n| {
                existing.remove(n).ok_or_else(|| {
                    GcpError::from(FleetError::not_found("node", format!("{} node {}", group, n)))
                })
            })
            .collect()
    }

    async fn hosts(&self, group: &GroupId, nodes: &[NodeNo]) -> Result<Vec<(NodeNo, String)>> {
        self.require_nodes(group, nodes)
            .await?
            .into_iter()
            .map(|n| match n.reachable_ip() {
                Some(ip) => Ok((n.node_no, ip.to_string())),
                None => Err(GcpError::from(FleetError::validation(format!(
                    "{} node {} has no address (is it running?)",
                    group, n.node_no
                )))),
            })
            .collect()
    }

    async fn add_metadata(&self, name: &str, zone: &str, items: &BTreeMap<String, String>) -> Result<()> {
        let metadata = metadata_arg(items)?;
        self.cli
            .run(&["compute", "instances", "add-metadata", name, "--zone", zone, &metadata])
            .await?;
        Ok(())
    }

    /// Runs `compute instances <action>` once per zone
    async fn instance_action(&self, action: &str, nodes: &[Node]) -> Result<()> {
        for (zone, names) in by_zone(nodes) {
            let mut args = vec!["compute", "instances", action];
            args.extend(names.iter().map(String::as_str));
            args.extend(["--zone", zone.as_str()]);
            self.cli.run(&args).await?;
        }
        Ok(())
    }

    async fn template_images(&self) -> Result<Vec<Image>> {
        let filter = format!("--filter=labels.{}=true", TAG_TEMPLATE);
        self.cli
            .run_json(&["compute", "images", "list", "--no-standard-images", &filter])
            .await
    }

    async fn find_template(&self, key: &TemplateKey) -> Result<Option<Image>> {
        Ok(self
            .template_images()
            .await?
            .into_iter()
            .find(|image| image_to_template(image).is_some_and(|t| &t.key == key)))
    }

    async fn deploy(&self, request: &DeployRequest) -> Result<()> {
        let extra = request.extra.gcp()?;
        let Some(first) = request.nodes.first().copied() else {
            return Ok(());
        };
        if extra.machine_type.is_empty() {
            return Err(FleetError::validation("a machine type is required").into());
        }
        let arch = Arch::from_is_arm(is_arm_machine(&extra.machine_type));
        if arch != request.template.arch {
            return Err(FleetError::validation(format!(
                "machine type {} is {} but the template is {}",
                extra.machine_type, arch, request.template.arch
            ))
            .into());
        }

        let existing = self.group_nodes(&request.group).await?;
        if let Some(node) = request.nodes.iter().find(|n| existing.contains_key(n)) {
            return Err(FleetError::validation(format!(
                "{} node {} already exists",
                request.group, node
            ))
            .into());
        }

        let image = self
            .find_template(&request.template)
            .await?
            .ok_or_else(|| {
                FleetError::not_found(
                    "template",
                    format!("{} (create it with 'fleetlab template create')", request.template),
                )
            })?
            .name;
        let zone = extra.zone.clone().unwrap_or_else(|| self.cli.zone().to_string());

        let mut metadata = request.tags.to_map(first);
        metadata.remove(TAG_NODE);
        metadata.insert(SSH_KEYS_METADATA.to_string(), self.ssh_keys_entry().await?);
        let metadata = metadata_arg(&metadata)?;
        let labels = labels_arg(&node_labels(
            request.group.kind,
            request.group.name.as_str(),
            &request.tags.owner,
        ));

        let names: Vec<String> = request
            .nodes
            .iter()
            .map(|n| instance_name(request.group.name.as_str(), request.group.kind, *n))
            .collect();
        let mut args: Vec<String> = vec!["compute".into(), "instances".into(), "create".into()];
        args.extend(names.iter().cloned());
        args.extend([
            format!("--zone={}", zone),
            format!("--machine-type={}", extra.machine_type),
            format!("--image={}", image),
            format!("--labels={}", labels),
            metadata,
        ]);
        if let Some(size) = extra.boot_disk_gb {
            args.push(format!("--boot-disk-size={}GB", size));
        }
        if !extra.network_tags.is_empty() {
            args.push(format!("--tags={}", extra.network_tags.join(",")));
        }
        if let Some(subnet) = &extra.subnet {
            args.push(format!("--subnet={}", subnet));
        }
        if extra.spot {
            args.push("--provisioning-model=SPOT".to_string());
            args.push("--instance-termination-action=STOP".to_string());
        }
        if let Some(platform) = &extra.min_cpu_platform {
            args.push(format!("--min-cpu-platform={}", platform));
        }

        tracing::info!(group = %request.group, count = names.len(), image = %image, zone = %zone, "creating instances");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.cli.run(&args).await?;

        for (name, node_no) in names.iter().zip(&request.nodes) {
            let mut items = BTreeMap::new();
            items.insert(TAG_NODE.to_string(), node_no.to_string());
            self.add_metadata(name, &zone, &items).await?;
            tracing::info!(instance = %name, node = node_no, "node tagged");
        }
        Ok(())
    }

    async fn wait_for_ssh(&self, host: &str) -> Result<()> {
        let ssh = self.ssh();
        for attempt in 1..=SSH_READY_ATTEMPTS {
            match ssh.exec(host, "true").await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::debug!(host = %host, attempt, error = %e, "waiting for ssh");
                    tokio::time::sleep(SSH_READY_DELAY).await;
                }
            }
        }
        Err(FleetError::backend(PROVIDER, format!("{} did not become reachable over ssh", host)).into())
    }

    async fn build_template(&self, spec: &TemplateSpec) -> Result<Template> {
        if self.find_template(&spec.key).await?.is_some() {
            return Err(FleetError::validation(format!("template {} already exists", spec.key)).into());
        }
        let base: Vec<String> = match &spec.base_image {
            Some(image) => vec![format!("--image={}", image)],
            None => {
                let (project, family) = base_image_family(&spec.key).ok_or_else(|| {
                    FleetError::validation(format!(
                        "no default base image for {}; pass a base image",
                        spec.key.distribution
                    ))
                })?;
                vec![
                    format!("--image-family={}", family),
                    format!("--image-project={}", project),
                ]
            }
        };
        let machine_type = spec
            .instance_type
            .clone()
            .unwrap_or_else(|| builder_machine_type(spec.key.arch).to_string());
        let zone = self.cli.zone().to_string();
        let builder = truncate_name(&format!("{}-builder", template_image_name(&spec.key)));

        let mut ssh_keys = BTreeMap::new();
        ssh_keys.insert(SSH_KEYS_METADATA.to_string(), self.ssh_keys_entry().await?);
        let mut args: Vec<String> = vec![
            "compute".into(),
            "instances".into(),
            "create".into(),
            builder.clone(),
            format!("--zone={}", zone),
            format!("--machine-type={}", machine_type),
            metadata_arg(&ssh_keys)?,
        ];
        args.extend(base);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.cli.run(&args).await?;
        tracing::info!(template = %spec.key, builder = %builder, "building template");

        let result = self.provision_and_capture(&builder, &zone, spec).await;
        if let Err(e) = self
            .cli
            .run(&["compute", "instances", "delete", &builder, "--zone", &zone])
            .await
        {
            tracing::warn!(builder = %builder, error = %e, "could not delete template builder");
        }
        result
    }

    async fn provision_and_capture(&self, builder: &str, zone: &str, spec: &TemplateSpec) -> Result<Template> {
        let instance: Instance = self
            .cli
            .run_json(&["compute", "instances", "describe", builder, "--zone", zone])
            .await?;
        let host = instance
            .public_ip()
            .or_else(|| instance.private_ip())
            .ok_or_else(|| GcpError::UnexpectedOutput(format!("builder {} has no address", builder)))?;
        self.wait_for_ssh(&host).await?;

        let ssh = self.ssh();
        for file in &spec.files {
            ssh.upload(&host, file).await?;
        }
        if !spec.install_script.is_empty() {
            let script = FileUpload::new(INSTALL_SCRIPT_PATH, spec.install_script.clone())?.with_mode(0o755);
            ssh.upload(&host, &script).await?;
            ssh.exec(&host, &format!("sudo bash {}", INSTALL_SCRIPT_PATH)).await?;
        }

        self.cli
            .run(&["compute", "instances", "stop", builder, "--zone", zone])
            .await?;

        let name = template_image_name(&spec.key);
        self.cli
            .run(&[
                "compute",
                "images",
                "create",
                &name,
                &format!("--source-disk={}", builder),
                &format!("--source-disk-zone={}", zone),
                &format!("--labels={}", labels_arg(&template_labels(&spec.key))),
                &format!("--description={}", template_description(&spec.key)?),
            ])
            .await?;
        tracing::info!(image = %name, "template created");

        let image: Image = self
            .cli
            .run_json(&["compute", "images", "describe", &name])
            .await?;
        image_to_template(&image)
            .ok_or_else(|| GcpError::UnexpectedOutput(format!("image {} lost its labels", name)))
    }

    async fn disks(&self) -> Result<Vec<Disk>> {
        let filter = format!("--filter=labels.{}=true", TAG_VOLUME);
        self.cli.run_json(&["compute", "disks", "list", &filter]).await
    }

    async fn find_volume(&self, name: &str) -> Result<Volume> {
        self.disks()
            .await?
            .iter()
            .filter_map(disk_to_volume)
            .find(|v| v.name == name || v.id == name)
            .ok_or_else(|| GcpError::from(FleetError::not_found("volume", name)))
    }

    fn expiry_region<'a>(&'a self, region: Option<&'a str>) -> &'a str {
        region.unwrap_or_else(|| self.cli.region())
    }
}

#[async_trait]
impl FleetBackend for GcpBackend {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_groups(&self, kind: GroupKind) -> FleetResult<Vec<GroupName>> {
        let names: BTreeSet<GroupName> = self
            .describe(kind, None)
            .await?
            .into_iter()
            .map(|n| n.group)
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn list_nodes(&self, group: &GroupId) -> FleetResult<Vec<NodeNo>> {
        let nodes: Vec<NodeNo> = self.group_nodes(group).await?.into_keys().collect();
        if nodes.is_empty() {
            return Err(FleetError::not_found(group.kind.as_str(), group.name.to_string()));
        }
        Ok(nodes)
    }

    async fn describe_nodes(&self, kind: GroupKind) -> FleetResult<Vec<Node>> {
        Ok(self.describe(kind, None).await?)
    }

    async fn list_templates(&self) -> FleetResult<Vec<Template>> {
        Ok(self
            .template_images()
            .await?
            .iter()
            .filter_map(image_to_template)
            .collect())
    }

    async fn create_template(&self, spec: &TemplateSpec) -> FleetResult<Template> {
        Ok(self.build_template(spec).await?)
    }

    async fn destroy_template(&self, key: &TemplateKey) -> FleetResult<()> {
        let image = self
            .find_template(key)
            .await?
            .ok_or_else(|| FleetError::not_found("template", key.to_string()))?;
        tracing::info!(image = %image.name, template = %key, "deleting template image");
        self.cli
            .run(&["compute", "images", "delete", &image.name])
            .await
            .map_err(GcpError::from)?;
        Ok(())
    }

    async fn list_firewalls(&self) -> FleetResult<Vec<FirewallRule>> {
        let rules: Vec<Firewall> = self
            .cli
            .run_json(&["compute", "firewall-rules", "list"])
            .await?;
        Ok(rules.iter().map(firewall_to_rule).collect())
    }

    async fn create_firewall(&self, spec: &FirewallSpec) -> FleetResult<()> {
        if spec.allow_ports.is_empty() {
            return Err(FleetError::validation("a firewall rule needs at least one port"));
        }
        let allow = spec
            .allow_ports
            .iter()
            .map(|p| allow_rule(p.as_str()))
            .collect::<FleetResult<Vec<_>>>()?
            .join(",");
        let existing = ignore_not_found(
            self.cli
                .run(&["compute", "firewall-rules", "describe", &spec.name])
                .await,
        )?;
        if existing.is_some() {
            return Err(FleetError::validation(format!(
                "firewall rule '{}' already exists",
                spec.name
            )));
        }

        let network = spec.network.clone().unwrap_or_else(|| "default".to_string());
        tracing::info!(name = %spec.name, network = %network, "creating firewall rule");
        self.cli
            .run(&[
                "compute",
                "firewall-rules",
                "create",
                &spec.name,
                &format!("--network={}", network),
                "--direction=INGRESS",
                &format!("--allow={}", allow),
                &format!("--source-ranges={}", source_ranges(&spec.source_ranges)),
                &format!("--target-tags={}", spec.name),
                &format!("--description={}", firewall_description(&spec.owner)),
            ])
            .await
            .map_err(GcpError::from)?;
        Ok(())
    }

    async fn delete_firewall(&self, name: &str) -> FleetResult<()> {
        match self
            .cli
            .run(&["compute", "firewall-rules", "delete", name])
            .await
        {
            Ok(_) => {
                tracing::info!(name = %name, "firewall rule deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Err(FleetError::not_found("firewall rule", name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_subnets(&self) -> FleetResult<Vec<Subnet>> {
        let subnets: Vec<GcpSubnet> = self
            .cli
            .run_json(&["compute", "networks", "subnets", "list"])
            .await?;
        Ok(subnets.iter().map(to_subnet).collect())
    }

    async fn list_volumes(&self) -> FleetResult<Vec<Volume>> {
        Ok(self.disks().await?.iter().filter_map(disk_to_volume).collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> FleetResult<Volume> {
        if self
            .disks()
            .await?
            .iter()
            .filter_map(disk_to_volume)
            .any(|v| v.name == spec.name)
        {
            return Err(FleetError::validation(format!("volume '{}' already exists", spec.name)));
        }
        let zone = spec.zone.clone().unwrap_or_else(|| self.cli.zone().to_string());
        let mut labels = spec.tags.clone();
        labels.insert(TAG_MANAGED.to_string(), "true".to_string());
        labels.insert(TAG_VOLUME.to_string(), "true".to_string());
        labels.insert(TAG_OWNER.to_string(), spec.owner.clone());
        labels.insert(TAG_EXPIRES.to_string(), spec.expires.to_label());

        tracing::info!(volume = %spec.name, zone = %zone, "creating persistent disk");
        self.cli
            .run(&[
                "compute",
                "disks",
                "create",
                &spec.name,
                &format!("--zone={}", zone),
                &format!("--size={}GB", spec.size_gb.unwrap_or(DEFAULT_DISK_GB)),
                "--type=pd-balanced",
                &format!("--labels={}", labels_arg(&labels)),
            ])
            .await
            .map_err(GcpError::from)?;
        let disk: Disk = self
            .cli
            .run_json(&["compute", "disks", "describe", &spec.name, "--zone", &zone])
            .await?;
        disk_to_volume(&disk).ok_or_else(|| {
            FleetError::backend(PROVIDER, format!("volume '{}' was created without its labels", spec.name))
        })
    }

    async fn delete_volume(&self, name: &str) -> FleetResult<()> {
        let volume = self.find_volume(name).await?;
        self.cli
            .run(&["compute", "disks", "delete", &volume.name, "--zone", &volume.zone])
            .await
            .map_err(GcpError::from)?;
        tracing::info!(volume = %name, zone = %volume.zone, "volume deleted");
        Ok(())
    }

    async fn tag_volume(&self, name: &str, key: &str, value: &str) -> FleetResult<()> {
        let volume = self.find_volume(name).await?;
        let value = if key == TAG_EXPIRES {
            Expiry::parse(value)?.to_label()
        } else {
            label_value(value)
        };
        let label = format!("--labels={}={}", label_value(key), value);
        self.cli
            .run(&["compute", "disks", "add-labels", &volume.name, "--zone", &volume.zone, &label])
            .await
            .map_err(GcpError::from)?;
        Ok(())
    }

    async fn expiry_system(&self) -> FleetResult<Vec<ExpirySystemRecord>> {
        Ok(expiry::inspect(&self.cli, self.cli.region())
            .await?
            .into_iter()
            .collect())
    }

    async fn install_expiry_system(&self, spec: &ExpirySystemSpec) -> FleetResult<()> {
        let source = spec.source.as_deref().ok_or_else(|| {
            FleetError::validation("the GCP expiry system needs a function source directory (expiry.gcp_function_source)")
        })?;
        let region = self.expiry_region(spec.region.as_deref());
        Ok(expiry::install(&self.cli, region, spec.interval_minutes, source).await?)
    }

    async fn remove_expiry_system(&self, region: Option<&str>) -> FleetResult<()> {
        Ok(expiry::remove(&self.cli, self.expiry_region(region)).await?)
    }

    async fn set_expiry_frequency(&self, interval_minutes: u32) -> FleetResult<()> {
        Ok(expiry::set_frequency(&self.cli, self.cli.region(), interval_minutes).await?)
    }

    async fn deploy_group(&self, request: &DeployRequest) -> FleetResult<()> {
        Ok(self.deploy(request).await?)
    }

    async fn start_group(&self, group: &GroupId, nodes: &[NodeNo]) -> FleetResult<()> {
        let targets = self.require_nodes(group, nodes).await?;
        self.instance_action("start", &targets).await?;
        tracing::info!(group = %group, count = targets.len(), "instances running");
        Ok(())
    }

    async fn stop_group(&self, group: &GroupId, nodes: &[NodeNo]) -> FleetResult<()> {
        let targets = self.require_nodes(group, nodes).await?;
        self.instance_action("stop", &targets).await?;
        tracing::info!(group = %group, count = targets.len(), "instances stopped");
        Ok(())
    }

    async fn destroy_group(&self, group: &GroupId, nodes: &[NodeNo], force: bool) -> FleetResult<()> {
        let mut existing = self.group_nodes(group).await?;
        let targets: Vec<Node> = nodes.iter().filter_map(|n| existing.remove(n)).collect();
        if !force && let Some(running) = targets.iter().find(|n| n.state.is_running()) {
            return Err(FleetError::validation(format!(
                "{} node {} is running",
                group, running.node_no
            )));
        }
        if targets.is_empty() {
            return Ok(());
        }
        self.instance_action("delete", &targets).await?;
        tracing::info!(group = %group, count = targets.len(), "instances deleted");
        Ok(())
    }

    async fn node_ip_map(&self, group: &GroupId, internal: bool) -> FleetResult<BTreeMap<NodeNo, String>> {
        Ok(self
            .group_nodes(group)
            .await?
            .into_iter()
            .filter_map(|(no, node)| {
                let ip = if internal {
                    node.private_ip.clone()
                } else {
                    node.reachable_ip().map(str::to_string)
                };
                ip.map(|ip| (no, ip))
            })
            .collect())
    }

    async fn run_commands(
        &self,
        group: &GroupId,
        commands: &[Vec<String>],
        nodes: &[NodeNo],
    ) -> std::result::Result<Vec<NodeOutput>, RunFailure> {
        let hosts = match self.hosts(group, nodes).await {
            Ok(hosts) => hosts,
            Err(e) => {
                return Err(RunFailure {
                    group: group.name.to_string(),
                    node: nodes.first().copied().unwrap_or_default(),
                    outputs: Vec::new(),
                    source: e.into(),
                });
            }
        };
        run_on_hosts(&self.ssh(), group.name.as_str(), commands, &hosts).await
    }

    async fn copy_files(&self, group: &GroupId, files: &[FileUpload], nodes: &[NodeNo]) -> FleetResult<()> {
        let hosts = self.hosts(group, nodes).await?;
        upload_to_hosts(&self.ssh(), group, files, &hosts).await
    }

    async fn copy_stream(&self, group: &GroupId, stream: &mut FileStream, nodes: &[NodeNo]) -> FleetResult<()> {
        let hosts = self.hosts(group, nodes).await?;
        stream_to_hosts(&self.ssh(), group, stream, &hosts).await
    }

    async fn copy_from_node(&self, group: &GroupId, node: NodeNo, path: &str) -> FleetResult<Vec<u8>> {
        let (_, host) = self
            .hosts(group, &[node])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FleetError::not_found("node", format!("{} node {}", group, node)))?;
        self.ssh().download(&host, path).await
    }

    async fn attach_and_run(
        &self,
        group: &GroupId,
        node: NodeNo,
        args: &[String],
        interactive: bool,
    ) -> FleetResult<Vec<u8>> {
        let hosts = self.hosts(group, &[node]).await?;
        let Some((_, host)) = hosts.first() else {
            return Err(FleetError::not_found("node", format!("{} node {}", group, node)));
        };
        let args = if args.is_empty() {
            vec!["bash".to_string(), "-l".to_string()]
        } else {
            args.to_vec()
        };
        self.ssh().attach(host, &args, interactive).await
    }

    async fn is_system_arm(&self, instance_type: &str) -> FleetResult<bool> {
        Ok(is_arm_machine(instance_type))
    }

    async fn set_label(&self, group: &GroupId, key: &str, value: &str) -> FleetResult<()> {
        let nodes: Vec<Node> = self.group_nodes(group).await?.into_values().collect();
        if nodes.is_empty() {
            return Err(FleetError::not_found(group.kind.as_str(), group.name.to_string()));
        }
        let mut items = BTreeMap::new();
        items.insert(key.to_string(), value.to_string());
        for node in &nodes {
            self.add_metadata(&node.instance_id, &node.zone, &items).await?;
        }
        Ok(())
    }

    async fn set_group_expiry(&self, group: &GroupId, expiry: Expiry, nodes: &[NodeNo]) -> FleetResult<()> {
        let targets = self.require_nodes(group, nodes).await?;
        let mut items = BTreeMap::new();
        items.insert(TAG_EXPIRES.to_string(), expiry.to_tag());
        for node in &targets {
            self.add_metadata(&node.instance_id, &node.zone, &items).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, zone: &str) -> Node {
        let instance = Instance {
            name: name.to_string(),
            zone: zone.to_string(),
            status: "RUNNING".to_string(),
            metadata: Some(crate::types::Metadata {
                items: [
                    (TAG_MANAGED, "true"),
                    (TAG_KIND, "cluster"),
                    (TAG_GROUP, "demo"),
                ]
                .iter()
                .map(|(k, v)| crate::types::MetadataItem {
                    key: k.to_string(),
                    value: Some(v.to_string()),
                })
                .collect(),
            }),
            ..Default::default()
        };
        instance_to_node(&instance, GroupKind::Cluster).unwrap()
    }

    #[test]
    fn test_base_image_family() {
        let ubuntu = TemplateKey::new("ubuntu", "24.04", "8.0.0.1", Arch::Arm64);
        assert_eq!(
            base_image_family(&ubuntu).unwrap(),
            ("ubuntu-os-cloud", "ubuntu-2404-lts-arm64".to_string())
        );
        let debian = TemplateKey::client("debian", "12", Arch::Amd64);
        assert_eq!(base_image_family(&debian).unwrap().1, "debian-12");
        assert!(base_image_family(&TemplateKey::client("amazon", "2023", Arch::Amd64)).is_none());
    }

    #[test]
    fn test_metadata_arg() {
        let mut items = BTreeMap::new();
        items.insert("fleetlab-expires".to_string(), "2026-03-01T00:00:00Z".to_string());
        items.insert("note".to_string(), "a,b=c".to_string());
        let arg = metadata_arg(&items).unwrap();
        assert_eq!(
            arg,
            "--metadata=^\u{1e}^fleetlab-expires=2026-03-01T00:00:00Z\u{1e}note=a,b=c"
        );

        items.insert("bad".to_string(), "x\u{1e}y".to_string());
        assert!(metadata_arg(&items).unwrap_err().is_validation());
    }

    #[test]
    fn test_by_zone() {
        let nodes = vec![
            node("fleetlab-demo-s-1", "zones/us-east1-b"),
            node("fleetlab-demo-s-2", "zones/us-east1-c"),
            node("fleetlab-demo-s-3", "zones/us-east1-b"),
        ];
        let zones = by_zone(&nodes);
        assert_eq!(zones["us-east1-b"], vec!["fleetlab-demo-s-1", "fleetlab-demo-s-3"]);
        assert_eq!(zones["us-east1-c"], vec!["fleetlab-demo-s-2"]);
    }

    #[test]
    fn test_builder_names() {
        assert_eq!(builder_machine_type(Arch::Arm64), "t2a-standard-1");
        assert_eq!(truncate_name("fleetlab-builder-x"), "fleetlab-builder-x");

        // cut lands right after a dash
        let long = format!("{}-x", "a".repeat(62));
        assert_eq!(long.len(), MAX_NAME_LEN + 1);
        assert_eq!(truncate_name(&long), "a".repeat(62));

        let dashes = format!("{}--tail", "b".repeat(61));
        assert_eq!(truncate_name(&dashes), "b".repeat(61));

        let exact = "c".repeat(MAX_NAME_LEN);
        assert_eq!(truncate_name(&exact), exact);
    }

    #[tokio::test]
    async fn test_is_system_arm_needs_no_api() {
        let dir = tempfile::tempdir().unwrap();
        let backend = GcpBackend::new(GcpSettings {
            project: "p".to_string(),
            region: "us-central1".to_string(),
            zone: "us-central1-a".to_string(),
            ssh_user: "fleetlab".to_string(),
            key_path: dir.path().join("fleetlab-gcp"),
        });
        assert!(backend.is_system_arm("c4a-standard-8").await.unwrap());
        assert!(!backend.is_system_arm("n2d-standard-8").await.unwrap());
        assert_eq!(backend.name(), "gcp");
        assert_eq!(backend.expiry_region(None), "us-central1");
        assert_eq!(backend.expiry_region(Some("europe-west1")), "europe-west1");
    }
}
