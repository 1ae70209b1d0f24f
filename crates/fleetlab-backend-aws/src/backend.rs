//! `FleetBackend` on EC2
//!
//! Nodes are EC2 instances carrying the fleetlab tag set. Remote commands
//! and file copies go over SSH with a per-region key pair that fleetlab
//! creates on first use.

use crate::cli::{AwsCli, filter};
use crate::convert::{
    TAG_NAME, ec2_arch, file_system_to_volume, image_to_template, ingress_permission,
    instance_name, instance_to_node, security_group_to_firewall, template_image_name,
    template_tags, to_subnets,
};
use crate::error::{AwsError, PROVIDER, Result, ignore_not_found};
use crate::expiry;
use crate::types::{
    CreateImage, CreateSecurityGroup, DescribeFileSystems, DescribeImages, DescribeInstanceTypes,
    DescribeInstances, DescribeMountTargets, DescribeSecurityGroups, DescribeSubnets, DescribeVpcs,
    FileSystem, Image, KeyPair, RunInstances, SsmParameter, Tag, tag_list,
};
use async_trait::async_trait;
use fleetlab_backend::ssh::{SshTransport, run_on_hosts, stream_to_hosts, upload_to_hosts};
use fleetlab_backend::tags::{TAG_BATCH_FIRST, TAG_EXPIRES, TAG_GROUP, TAG_KIND, TAG_MANAGED, TAG_NODE, TAG_OWNER, TAG_TEMPLATE, TAG_VOLUME};
use fleetlab_backend::{
    Arch, DeployRequest, Expiry, ExpirySystemRecord, ExpirySystemSpec, FileStream, FileUpload,
    FirewallRule, FirewallSpec, FleetBackend, FleetError, GroupId, GroupKind, GroupName, Node,
    NodeNo, NodeOutput, RunFailure, Subnet, Template, TemplateKey, TemplateSpec, Volume,
    VolumeSpec,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

type FleetResult<T> = fleetlab_backend::Result<T>;

const LIVE_STATES: [&str; 4] = ["pending", "running", "stopping", "stopped"];
const INSTALL_SCRIPT_PATH: &str = "/tmp/fleetlab-install.sh";
const SSH_READY_ATTEMPTS: u32 = 30;
const SSH_READY_DELAY: Duration = Duration::from_secs(10);
const VOLUME_DELETE_ATTEMPTS: u32 = 12;
const VOLUME_DELETE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AwsSettings {
    pub region: String,
    pub profile: Option<String>,
    pub ssh_user: String,
    /// Where generated private keys are stored
    pub key_dir: PathBuf,
}

pub struct AwsBackend {
    cli: AwsCli,
    ssh_user: String,
    key_dir: PathBuf,
}

/// SSM public parameter holding the latest base AMI for `key`
pub fn base_ami_parameter(key: &TemplateKey) -> Option<String> {
    match key.distribution.as_str() {
        "ubuntu" => Some(format!(
            "/aws/service/canonical/ubuntu/server/{}/stable/current/{}/hvm/ebs-gp2/ami-id",
            key.distro_version, key.arch
        )),
        "debian" => Some(format!(
            "/aws/service/debian/release/{}/latest/{}",
            key.distro_version, key.arch
        )),
        "amazon" => Some(format!(
            "/aws/service/ami-amazon-linux-latest/al{}-ami-kernel-default-{}",
            key.distro_version,
            ec2_arch(key.arch)
        )),
        _ => None,
    }
}

/// Instance type used for template builders when none is given
pub fn builder_instance_type(arch: Arch) -> &'static str {
    match arch {
        Arch::Amd64 => "t3.medium",
        Arch::Arm64 => "t4g.medium",
    }
}

fn tags_json(tags: &BTreeMap<String, String>) -> String {
    serde_json::to_string(&tag_list(tags)).unwrap_or_else(|_| "[]".to_string())
}

/// True when `nodes` is a run of consecutive numbers
fn is_contiguous(nodes: &[NodeNo]) -> bool {
    nodes.windows(2).all(|w| w[0].checked_add(1) == Some(w[1]))
}

fn tag_specification(resource_types: &[&str], tags: &BTreeMap<String, String>) -> String {
    let specs: Vec<_> = resource_types
        .iter()
        .map(|t| json!({"ResourceType": t, "Tags": tag_list(tags)}))
        .collect();
    serde_json::Value::Array(specs).to_string()
}

impl AwsBackend {
    pub fn new(settings: AwsSettings) -> Self {
        Self {
            cli: AwsCli::new(settings.region, settings.profile),
            ssh_user: settings.ssh_user,
            key_dir: settings.key_dir,
        }
    }

    pub fn with_cli(mut self, cli: AwsCli) -> Self {
        self.cli = cli;
        self
    }

    /// Fails early when the aws binary is missing
    pub async fn connect(settings: AwsSettings) -> Result<Self> {
        let backend = Self::new(settings);
        backend.cli.check_installed().await?;
        Ok(backend)
    }

    fn key_name(&self) -> String {
        format!("fleetlab-{}", self.cli.region())
    }

    fn key_path(&self) -> PathBuf {
        self.key_dir.join(format!("{}.pem", self.key_name()))
    }

    fn ssh(&self) -> SshTransport {
        SshTransport::new(self.ssh_user.clone()).with_key(self.key_path())
    }

    /// Key pair name for new instances, creating it and saving the private
    /// key locally on first use
    async fn ensure_key_pair(&self) -> Result<String> {
        let name = self.key_name();
        let path = self.key_path();
        if path.is_file() {
            return Ok(name);
        }

        let existing = ignore_not_found(
            self.cli
                .run(&["ec2", "describe-key-pairs", "--key-names", &name])
                .await,
        )?;
        if existing.is_some() {
            return Err(FleetError::validation(format!(
                "key pair '{}' exists but its private key is missing at {}; delete it with 'aws ec2 delete-key-pair --key-name {}'",
                name,
                path.display(),
                name
            ))
            .into());
        }

        let key: KeyPair = self
            .cli
            .run_json(&["ec2", "create-key-pair", "--key-name", &name, "--key-type", "ed25519"])
            .await?;
        tokio::fs::create_dir_all(&self.key_dir).await?;
        tokio::fs::write(&path, key.key_material.as_bytes()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tracing::info!(key = %key.key_name, path = %path.display(), "created key pair");
        Ok(name)
    }

    async fn describe(&self, kind: GroupKind, group: Option<&GroupName>) -> Result<Vec<Node>> {
        let managed = filter(&format!("tag:{}", TAG_MANAGED), &["true"]);
        let kind_filter = filter(&format!("tag:{}", TAG_KIND), &[kind.as_str()]);
        let states = filter("instance-state-name", &LIVE_STATES);
        let group_filter = group.map(|g| filter(&format!("tag:{}", TAG_GROUP), &[g.as_str()]));

        let mut args = vec![
            "ec2",
            "describe-instances",
            "--filters",
            managed.as_str(),
            kind_filter.as_str(),
            states.as_str(),
        ];
        if let Some(group_filter) = &group_filter {
            args.push(group_filter.as_str());
        }
        let out: DescribeInstances = self.cli.run_json(&args).await?;
        Ok(out
            .reservations
            .iter()
            .flat_map(|r| r.instances.iter())
            .filter_map(|i| instance_to_node(i, kind))
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

    /// The group's instances for `nodes`; `NotFound` if one is missing
    async fn require_nodes(&self, group: &GroupId, nodes: &[NodeNo]) -> Result<Vec<Node>> {
        let mut existing = self.group_nodes(group).await?;
        nodes
            .iter()
            .map(|n| {
                existing.remove(n).ok_or_else(|| {
                    AwsError::from(FleetError::not_found("node", format!("{} node {}", group, n)))
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
                None => Err(AwsError::from(FleetError::validation(format!(
                    "{} node {} has no address (is it running?)",
                    group, n.node_no
                )))),
            })
            .collect()
    }

    async fn instance_ids(&self, group: &GroupId, nodes: &[NodeNo]) -> Result<Vec<String>> {
        Ok(self
            .require_nodes(group, nodes)
            .await?
            .into_iter()
            .map(|n| n.instance_id)
            .collect())
    }

    async fn create_tags(&self, resources: &[String], tags: &BTreeMap<String, String>) -> Result<()> {
        let tags = tags_json(tags);
        let mut args = vec!["ec2", "create-tags", "--resources"];
        args.extend(resources.iter().map(String::as_str));
        args.extend(["--tags", tags.as_str()]);
        self.cli.run(&args).await?;
        Ok(())
    }

    async fn template_images(&self) -> Result<Vec<Image>> {
        let managed = filter(&format!("tag:{}", TAG_TEMPLATE), &["true"]);
        let out: DescribeImages = self
            .cli
            .run_json(&["ec2", "describe-images", "--owners", "self", "--filters", &managed])
            .await?;
        Ok(out.images)
    }

    async fn find_template(&self, key: &TemplateKey) -> Result<Option<Image>> {
        let region = self.cli.region().to_string();
        Ok(self
            .template_images()
            .await?
            .into_iter()
            .find(|image| image_to_template(image, &region).is_some_and(|t| &t.key == key)))
    }

    async fn root_device(&self, ami: &str) -> Result<String> {
        let out: DescribeImages = self
            .cli
            .run_json(&["ec2", "describe-images", "--image-ids", ami])
            .await?;
        Ok(out
            .images
            .first()
            .and_then(|i| i.block_device_mappings.first())
            .and_then(|m| m.device_name.clone())
            .unwrap_or_else(|| "/dev/sda1".to_string()))
    }

    async fn base_ami(&self, key: &TemplateKey) -> Result<String> {
        let parameter = base_ami_parameter(key).ok_or_else(|| {
            FleetError::validation(format!(
                "no default base image for {}; pass a base AMI",
                key.distribution
            ))
        })?;
        let out: SsmParameter = self
            .cli
            .run_json(&["ssm", "get-parameter", "--name", &parameter])
            .await?;
        Ok(out.parameter.value)
    }

    async fn instance_type_is_arm(&self, instance_type: &str) -> Result<bool> {
        let out: DescribeInstanceTypes = self
            .cli
            .run_json(&["ec2", "describe-instance-types", "--instance-types", instance_type])
            .await?;
        let info = out
            .instance_types
            .into_iter()
            .find(|t| t.instance_type == instance_type)
            .ok_or_else(|| FleetError::not_found("instance type", instance_type))?;
        Ok(info
            .processor_info
            .is_some_and(|p| p.supported_architectures.iter().any(|a| a == "arm64")))
    }

    async fn deploy(&self, request: &DeployRequest) -> Result<()> {
        let extra = request.extra.aws()?;
        let Some(first) = request.nodes.first().copied() else {
            return Ok(());
        };
        if extra.instance_type.is_empty() {
            return Err(FleetError::validation("an instance type is required").into());
        }

        let existing = self.group_nodes(&request.group).await?;
        if let Some(node) = request.nodes.iter().find(|n| existing.contains_key(n)) {
            return Err(FleetError::validation(format!(
                "{} node {} already exists",
                request.group, node
            ))
            .into());
        }

        let arch = Arch::from_is_arm(self.instance_type_is_arm(&extra.instance_type).await?);
        if arch != request.template.arch {
            return Err(FleetError::validation(format!(
                "instance type {} is {} but the template is {}",
                extra.instance_type, arch, request.template.arch
            ))
            .into());
        }

        let ami = match &extra.ami {
            Some(ami) => ami.clone(),
            None => {
                self.find_template(&request.template)
                    .await?
                    .ok_or_else(|| {
                        FleetError::not_found(
                            "template",
                            format!("{} (create it with 'fleetlab template create')", request.template),
                        )
                    })?
                    .image_id
            }
        };
        let key_name = self.ensure_key_pair().await?;

        let mut common = request.tags.to_map(first);
        common.remove(TAG_NODE);
        if is_contiguous(&request.nodes) {
            common.insert(TAG_BATCH_FIRST.to_string(), first.to_string());
        }
        let tag_spec = tag_specification(&["instance", "volume"], &common);
        let count = request.nodes.len().to_string();

        let mut args: Vec<String> = [
            "ec2",
            "run-instances",
            "--image-id",
            ami.as_str(),
            "--count",
            count.as_str(),
            "--instance-type",
            extra.instance_type.as_str(),
            "--key-name",
            key_name.as_str(),
            "--tag-specifications",
            tag_spec.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if !extra.security_groups.is_empty() {
            args.push("--security-group-ids".to_string());
            args.extend(extra.security_groups.iter().cloned());
        }
        if let Some(subnet) = &extra.subnet_id {
            args.extend(["--subnet-id".to_string(), subnet.clone()]);
        }
        if let Some(size) = extra.root_volume_gb {
            let device = self.root_device(&ami).await?;
            let mapping = json!([{
                "DeviceName": device,
                "Ebs": {"VolumeSize": size, "VolumeType": "gp3", "DeleteOnTermination": true}
            }]);
            args.extend(["--block-device-mappings".to_string(), mapping.to_string()]);
        }
        if extra.spot {
            args.extend(["--instance-market-options".to_string(), "MarketType=spot".to_string()]);
        }
        if extra.termination_protection {
            args.push("--disable-api-termination".to_string());
        }

        tracing::info!(group = %request.group, count = request.nodes.len(), ami = %ami, "launching instances");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let launched: RunInstances = self.cli.run_json(&args).await?;
        let ids: Vec<String> = launched
            .instances
            .iter()
            .map(|i| i.instance_id.clone())
            .collect();
        if let Err(e) = self.tag_launched(request, launched).await {
            self.rollback_launch(&request.group, &ids, extra.termination_protection)
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Writes the per-node tags onto a fresh `run-instances` batch
    async fn tag_launched(&self, request: &DeployRequest, mut launched: RunInstances) -> Result<()> {
        if launched.instances.len() != request.nodes.len() {
            return Err(AwsError::UnexpectedOutput(format!(
                "requested {} instances, got {}",
                request.nodes.len(),
                launched.instances.len()
            )));
        }
        launched.instances.sort_by_key(|i| i.ami_launch_index.unwrap_or(0));

        for (instance, node_no) in launched.instances.iter().zip(&request.nodes) {
            let mut tags = BTreeMap::new();
            tags.insert(TAG_NODE.to_string(), node_no.to_string());
            tags.insert(
                TAG_NAME.to_string(),
                instance_name(request.group.name.as_str(), request.group.kind, *node_no),
            );
            self.create_tags(std::slice::from_ref(&instance.instance_id), &tags)
                .await?;
            tracing::info!(instance = %instance.instance_id, node = node_no, "node tagged");
        }
        Ok(())
    }

    /// Terminates a launched batch that could not be fully tagged
    async fn rollback_launch(&self, group: &GroupId, ids: &[String], protected: bool) {
        if ids.is_empty() {
            return;
        }
        tracing::warn!(group = %group, count = ids.len(), "deploy failed after launch, terminating the new instances");
        if protected {
            for id in ids {
                let lifted = self
                    .cli
                    .run(&[
                        "ec2",
                        "modify-instance-attribute",
                        "--instance-id",
                        id,
                        "--no-disable-api-termination",
                    ])
                    .await;
                if let Err(e) = lifted {
                    tracing::warn!(instance = %id, error = %e, "could not lift termination protection");
                }
            }
        }
        let mut args = vec!["ec2", "terminate-instances", "--instance-ids"];
        args.extend(ids.iter().map(String::as_str));
        if let Err(e) = self.cli.run(&args).await {
            tracing::warn!(group = %group, error = %e, "could not terminate the new instances");
        }
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
        let base = match &spec.base_image {
            Some(ami) => ami.clone(),
            None => self.base_ami(&spec.key).await?,
        };
        let instance_type = spec
            .instance_type
            .clone()
            .unwrap_or_else(|| builder_instance_type(spec.key.arch).to_string());
        let key_name = self.ensure_key_pair().await?;

        let mut builder_tags = BTreeMap::new();
        builder_tags.insert(TAG_NAME.to_string(), format!("{}-builder", template_image_name(&spec.key)));
        let tag_spec = tag_specification(&["instance"], &builder_tags);
        let launched: RunInstances = self
            .cli
            .run_json(&[
                "ec2",
                "run-instances",
                "--image-id",
                &base,
                "--count",
                "1",
                "--instance-type",
                &instance_type,
                "--key-name",
                &key_name,
                "--tag-specifications",
                &tag_spec,
            ])
            .await?;
        let builder = launched
            .instances
            .first()
            .map(|i| i.instance_id.clone())
            .ok_or_else(|| AwsError::UnexpectedOutput("run-instances returned no instance".to_string()))?;
        tracing::info!(template = %spec.key, builder = %builder, "building template");

        let result = self.provision_and_capture(&builder, spec).await;
        if let Err(e) = self
            .cli
            .run(&["ec2", "terminate-instances", "--instance-ids", &builder])
            .await
        {
            tracing::warn!(builder = %builder, error = %e, "could not terminate template builder");
        }
        result
    }

    async fn provision_and_capture(&self, builder: &str, spec: &TemplateSpec) -> Result<Template> {
        self.cli
            .run(&["ec2", "wait", "instance-running", "--instance-ids", builder])
            .await?;
        let out: DescribeInstances = self
            .cli
            .run_json(&["ec2", "describe-instances", "--instance-ids", builder])
            .await?;
        let host = out
            .reservations
            .iter()
            .flat_map(|r| r.instances.iter())
            .find_map(|i| i.public_ip_address.clone().or_else(|| i.private_ip_address.clone()))
            .ok_or_else(|| AwsError::UnexpectedOutput(format!("builder {} has no address", builder)))?;
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
            .run(&["ec2", "stop-instances", "--instance-ids", builder])
            .await?;
        self.cli
            .run(&["ec2", "wait", "instance-stopped", "--instance-ids", builder])
            .await?;

        let name = template_image_name(&spec.key);
        let tag_spec = tag_specification(&["image", "snapshot"], &template_tags(&spec.key));
        let created: CreateImage = self
            .cli
            .run_json(&[
                "ec2",
                "create-image",
                "--instance-id",
                builder,
                "--name",
                &name,
                "--tag-specifications",
                &tag_spec,
            ])
            .await?;
        self.cli
            .run(&["ec2", "wait", "image-available", "--image-ids", &created.image_id])
            .await?;
        tracing::info!(image = %created.image_id, name = %name, "template created");

        let images: DescribeImages = self
            .cli
            .run_json(&["ec2", "describe-images", "--image-ids", &created.image_id])
            .await?;
        images
            .images
            .first()
            .and_then(|i| image_to_template(i, self.cli.region()))
            .ok_or_else(|| AwsError::UnexpectedOutput(format!("image {} lost its tags", created.image_id)))
    }

    async fn security_groups(&self) -> Result<DescribeSecurityGroups> {
        let managed = filter(&format!("tag:{}", TAG_MANAGED), &["true"]);
        self.cli
            .run_json(&["ec2", "describe-security-groups", "--filters", &managed])
            .await
    }

    async fn file_systems(&self) -> Result<Vec<FileSystem>> {
        let out: DescribeFileSystems = self.cli.run_json(&["efs", "describe-file-systems"]).await?;
        Ok(out.file_systems)
    }

    async fn find_volume(&self, name: &str) -> Result<FileSystem> {
        self.file_systems()
            .await?
            .into_iter()
            .find(|fs| {
                file_system_to_volume(fs).is_some_and(|v| v.name == name || v.id == name)
            })
            .ok_or_else(|| AwsError::from(FleetError::not_found("volume", name)))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let fs = self.find_volume(name).await?;
        let targets: DescribeMountTargets = self
            .cli
            .run_json(&["efs", "describe-mount-targets", "--file-system-id", &fs.file_system_id])
            .await?;
        for target in &targets.mount_targets {
            ignore_not_found(
                self.cli
                    .run(&["efs", "delete-mount-target", "--mount-target-id", &target.mount_target_id])
                    .await,
            )?;
        }

        let mut attempt = 0;
        loop {
            match self
                .cli
                .run(&["efs", "delete-file-system", "--file-system-id", &fs.file_system_id])
                .await
            {
                Ok(_) => break,
                // Mount targets take a while to go away
                Err(e) if e.stderr_contains("FileSystemInUse") && attempt < VOLUME_DELETE_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(volume = %name, attempt, "file system still in use");
                    tokio::time::sleep(VOLUME_DELETE_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(volume = %name, id = %fs.file_system_id, "volume deleted");
        Ok(())
    }

    fn expiry_cli(&self, region: Option<&str>) -> AwsCli {
        match region {
            Some(region) => self.cli.in_region(region),
            None => self.cli.clone(),
        }
    }
}

#[async_trait]
impl FleetBackend for AwsBackend {
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
        let region = self.cli.region().to_string();
        Ok(self
            .template_images()
            .await?
            .iter()
            .filter_map(|i| image_to_template(i, &region))
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
        tracing::info!(image = %image.image_id, template = %key, "deregistering template");
        self.cli
            .run(&["ec2", "deregister-image", "--image-id", &image.image_id])
            .await
            .map_err(AwsError::from)?;
        for snapshot in image
            .block_device_mappings
            .iter()
            .filter_map(|m| m.ebs.as_ref()?.snapshot_id.clone())
        {
            ignore_not_found(
                self.cli
                    .run(&["ec2", "delete-snapshot", "--snapshot-id", &snapshot])
                    .await,
            )?;
        }
        Ok(())
    }

    async fn list_firewalls(&self) -> FleetResult<Vec<FirewallRule>> {
        Ok(self
            .security_groups()
            .await?
            .security_groups
            .iter()
            .map(security_group_to_firewall)
            .collect())
    }

    async fn create_firewall(&self, spec: &FirewallSpec) -> FleetResult<()> {
        let permissions = spec
            .allow_ports
            .iter()
            .map(|p| ingress_permission(p, &spec.source_ranges))
            .collect::<FleetResult<Vec<_>>>()?;
        let existing = self.security_groups().await?;
        if existing.security_groups.iter().any(|g| g.group_name == spec.name) {
            return Err(FleetError::validation(format!(
                "security group '{}' already exists",
                spec.name
            )));
        }

        let mut tags = BTreeMap::new();
        tags.insert(TAG_MANAGED.to_string(), "true".to_string());
        tags.insert(TAG_OWNER.to_string(), spec.owner.clone());
        tags.insert(TAG_NAME.to_string(), spec.name.clone());
        let tag_spec = tag_specification(&["security-group"], &tags);
        let description = format!("fleetlab firewall {}", spec.name);

        let mut args = vec![
            "ec2",
            "create-security-group",
            "--group-name",
            spec.name.as_str(),
            "--description",
            description.as_str(),
            "--tag-specifications",
            tag_spec.as_str(),
        ];
        if let Some(vpc) = &spec.network {
            args.extend(["--vpc-id", vpc.as_str()]);
        }
        tracing::info!(name = %spec.name, "creating security group");
        let created: CreateSecurityGroup = self.cli.run_json(&args).await?;

        if !permissions.is_empty() {
            let permissions = serde_json::to_string(&permissions).map_err(AwsError::from)?;
            self.cli
                .run(&[
                    "ec2",
                    "authorize-security-group-ingress",
                    "--group-id",
                    &created.group_id,
                    "--ip-permissions",
                    &permissions,
                ])
                .await
                .map_err(AwsError::from)?;
        }
        Ok(())
    }

    async fn delete_firewall(&self, name: &str) -> FleetResult<()> {
        let group = self
            .security_groups()
            .await?
            .security_groups
            .into_iter()
            .find(|g| g.group_name == name || g.group_id == name)
            .ok_or_else(|| FleetError::not_found("security group", name))?;
        tracing::info!(name = %name, id = %group.group_id, "deleting security group");
        self.cli
            .run(&["ec2", "delete-security-group", "--group-id", &group.group_id])
            .await
            .map_err(AwsError::from)?;
        Ok(())
    }

    async fn list_subnets(&self) -> FleetResult<Vec<Subnet>> {
        let subnets: DescribeSubnets = self.cli.run_json(&["ec2", "describe-subnets"]).await?;
        let vpcs: DescribeVpcs = self.cli.run_json(&["ec2", "describe-vpcs"]).await?;
        Ok(to_subnets(&subnets.subnets, &vpcs.vpcs))
    }

    async fn list_volumes(&self) -> FleetResult<Vec<Volume>> {
        Ok(self
            .file_systems()
            .await?
            .iter()
            .filter_map(file_system_to_volume)
            .collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> FleetResult<Volume> {
        if self
            .file_systems()
            .await?
            .iter()
            .filter_map(file_system_to_volume)
            .any(|v| v.name == spec.name)
        {
            return Err(FleetError::validation(format!("volume '{}' already exists", spec.name)));
        }
        if spec.size_gb.is_some() {
            tracing::debug!(volume = %spec.name, "EFS volumes grow on demand; size ignored");
        }

        let mut tags = spec.tags.clone();
        tags.insert(TAG_MANAGED.to_string(), "true".to_string());
        tags.insert(TAG_VOLUME.to_string(), "true".to_string());
        tags.insert(TAG_OWNER.to_string(), spec.owner.clone());
        tags.insert(TAG_EXPIRES.to_string(), spec.expires.to_tag());
        tags.insert(TAG_NAME.to_string(), spec.name.clone());
        let tags = tags_json(&tags);

        let mut args = vec![
            "efs",
            "create-file-system",
            "--creation-token",
            spec.name.as_str(),
            "--encrypted",
            "--tags",
            tags.as_str(),
        ];
        if let Some(zone) = &spec.zone {
            args.extend(["--availability-zone-name", zone.as_str()]);
        }
        tracing::info!(volume = %spec.name, "creating EFS volume");
        let created: FileSystem = self.cli.run_json(&args).await?;
        file_system_to_volume(&created).ok_or_else(|| {
            FleetError::backend(PROVIDER, format!("volume '{}' was created without its tags", spec.name))
        })
    }

    async fn delete_volume(&self, name: &str) -> FleetResult<()> {
        Ok(self.remove_volume(name).await?)
    }

    async fn tag_volume(&self, name: &str, key: &str, value: &str) -> FleetResult<()> {
        let fs = self.find_volume(name).await?;
        let tags = serde_json::to_string(&[Tag {
            key: key.to_string(),
            value: value.to_string(),
        }])?;
        self.cli
            .run(&["efs", "tag-resource", "--resource-id", &fs.file_system_id, "--tags", &tags])
            .await
            .map_err(AwsError::from)?;
        Ok(())
    }

    async fn expiry_system(&self) -> FleetResult<Vec<ExpirySystemRecord>> {
        Ok(expiry::inspect(&self.cli).await?.into_iter().collect())
    }

    async fn install_expiry_system(&self, spec: &ExpirySystemSpec) -> FleetResult<()> {
        let package = spec.source.as_deref().ok_or_else(|| {
            FleetError::validation("the AWS expiry system needs a function package (expiry.aws_function_package)")
        })?;
        let cli = self.expiry_cli(spec.region.as_deref());
        Ok(expiry::install(&cli, spec.interval_minutes, package).await?)
    }

    async fn remove_expiry_system(&self, region: Option<&str>) -> FleetResult<()> {
        Ok(expiry::remove(&self.expiry_cli(region)).await?)
    }

    async fn set_expiry_frequency(&self, interval_minutes: u32) -> FleetResult<()> {
        Ok(expiry::set_frequency(&self.cli, interval_minutes).await?)
    }

    async fn deploy_group(&self, request: &DeployRequest) -> FleetResult<()> {
        Ok(self.deploy(request).await?)
    }

    async fn start_group(&self, group: &GroupId, nodes: &[NodeNo]) -> FleetResult<()> {
        let ids = self.instance_ids(group, nodes).await?;
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["ec2", "start-instances", "--instance-ids"];
        args.extend(ids.iter().map(String::as_str));
        self.cli.run(&args).await.map_err(AwsError::from)?;

        let mut wait = vec!["ec2", "wait", "instance-running", "--instance-ids"];
        wait.extend(ids.iter().map(String::as_str));
        self.cli.run(&wait).await.map_err(AwsError::from)?;
        tracing::info!(group = %group, count = ids.len(), "instances running");
        Ok(())
    }

    async fn stop_group(&self, group: &GroupId, nodes: &[NodeNo]) -> FleetResult<()> {
        let ids = self.instance_ids(group, nodes).await?;
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["ec2", "stop-instances", "--instance-ids"];
        args.extend(ids.iter().map(String::as_str));
        self.cli.run(&args).await.map_err(AwsError::from)?;

        let mut wait = vec!["ec2", "wait", "instance-stopped", "--instance-ids"];
        wait.extend(ids.iter().map(String::as_str));
        self.cli.run(&wait).await.map_err(AwsError::from)?;
        tracing::info!(group = %group, count = ids.len(), "instances stopped");
        Ok(())
    }

    async fn destroy_group(&self, group: &GroupId, nodes: &[NodeNo], force: bool) -> FleetResult<()> {
        let existing = self.group_nodes(group).await?;
        let targets: Vec<&Node> = nodes.iter().filter_map(|n| existing.get(n)).collect();
        if !force && let Some(running) = targets.iter().find(|n| n.state.is_running()) {
            return Err(FleetError::validation(format!(
                "{} node {} is running",
                group, running.node_no
            )));
        }
        if targets.is_empty() {
            return Ok(());
        }

        for node in &targets {
            self.cli
                .run(&[
                    "ec2",
                    "modify-instance-attribute",
                    "--instance-id",
                    &node.instance_id,
                    "--no-disable-api-termination",
                ])
                .await
                .map_err(AwsError::from)?;
        }
        let mut args = vec!["ec2", "terminate-instances", "--instance-ids"];
        args.extend(targets.iter().map(|n| n.instance_id.as_str()));
        self.cli.run(&args).await.map_err(AwsError::from)?;
        tracing::info!(group = %group, count = targets.len(), "instances terminated");
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
        Ok(self.instance_type_is_arm(instance_type).await?)
    }

    async fn set_label(&self, group: &GroupId, key: &str, value: &str) -> FleetResult<()> {
        let ids: Vec<String> = self
            .group_nodes(group)
            .await?
            .into_values()
            .map(|n| n.instance_id)
            .collect();
        if ids.is_empty() {
            return Err(FleetError::not_found(group.kind.as_str(), group.name.to_string()));
        }
        let mut tags = BTreeMap::new();
        tags.insert(key.to_string(), value.to_string());
        Ok(self.create_tags(&ids, &tags).await?)
    }

    async fn set_group_expiry(&self, group: &GroupId, expiry: Expiry, nodes: &[NodeNo]) -> FleetResult<()> {
        let ids = self.instance_ids(group, nodes).await?;
        if ids.is_empty() {
            return Ok(());
        }
        let mut tags = BTreeMap::new();
        tags.insert(TAG_EXPIRES.to_string(), expiry.to_tag());
        Ok(self.create_tags(&ids, &tags).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_base_ami_parameter() {
        let ubuntu = TemplateKey::new("ubuntu", "24.04", "8.0.0.1", Arch::Arm64);
        assert_eq!(
            base_ami_parameter(&ubuntu).unwrap(),
            "/aws/service/canonical/ubuntu/server/24.04/stable/current/arm64/hvm/ebs-gp2/ami-id"
        );
        let amazon = TemplateKey::client("amazon", "2023", Arch::Amd64);
        assert_eq!(
            base_ami_parameter(&amazon).unwrap(),
            "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64"
        );
        assert!(base_ami_parameter(&TemplateKey::client("rocky", "9", Arch::Amd64)).is_none());
    }

    #[test]
    fn test_tag_specification() {
        let mut tags = BTreeMap::new();
        tags.insert("fleetlab-group".to_string(), "demo".to_string());
        let spec: Value = serde_json::from_str(&tag_specification(&["instance", "volume"], &tags)).unwrap();
        assert_eq!(spec[0]["ResourceType"], "instance");
        assert_eq!(spec[1]["ResourceType"], "volume");
        assert_eq!(spec[1]["Tags"][0]["Key"], "fleetlab-group");
        assert_eq!(spec[1]["Tags"][0]["Value"], "demo");
    }

    #[test]
    fn test_key_paths() {
        let dir = tempfile::tempdir().unwrap();
        let backend = AwsBackend::new(AwsSettings {
            region: "eu-west-1".to_string(),
            profile: None,
            ssh_user: "ubuntu".to_string(),
            key_dir: dir.path().to_path_buf(),
        });
        assert_eq!(backend.key_name(), "fleetlab-eu-west-1");
        assert_eq!(backend.key_path(), dir.path().join("fleetlab-eu-west-1.pem"));
        assert_eq!(backend.ssh().user, "ubuntu");
        assert_eq!(backend.name(), "aws");
    }

    #[test]
    fn test_is_contiguous() {
        assert!(is_contiguous(&[4, 5, 6]));
        assert!(is_contiguous(&[1]));
        assert!(!is_contiguous(&[1, 3]));
    }

    /// Writes an `aws` stand-in that logs every call and fails `create-tags`
    #[cfg(unix)]
    fn failing_tag_cli(dir: &std::path::Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("aws");
        let body = format!(
            r#"#!/bin/sh
echo "$*" >> "{log}"
case "$1 $2" in
  "ec2 describe-instances") echo '{{"Reservations":[]}}' ;;
  "ec2 describe-instance-types") echo '{{"InstanceTypes":[{{"InstanceType":"t3.large","ProcessorInfo":{{"SupportedArchitectures":["x86_64"]}}}}]}}' ;;
  "ec2 run-instances") echo '{{"Instances":[{{"InstanceId":"i-1","AmiLaunchIndex":0}},{{"InstanceId":"i-2","AmiLaunchIndex":1}}]}}' ;;
  "ec2 create-tags") echo "An error occurred (UnauthorizedOperation)" >&2; exit 1 ;;
esac
"#,
            log = log.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deploy_terminates_untagged_batch() {
        use fleetlab_backend::tags::NodeTags;
        use fleetlab_backend::{AwsExtra, Features, ProviderExtra};

        let dir = tempfile::tempdir().unwrap();
        let (script, log) = failing_tag_cli(dir.path());
        std::fs::write(dir.path().join("fleetlab-eu-west-1.pem"), "key").unwrap();
        let backend = AwsBackend::new(AwsSettings {
            region: "eu-west-1".to_string(),
            profile: None,
            ssh_user: "ubuntu".to_string(),
            key_dir: dir.path().to_path_buf(),
        })
        .with_cli(AwsCli::new("eu-west-1", None).with_program(script.display().to_string()));

        let name = GroupName::new("demo").unwrap();
        let request = DeployRequest {
            group: GroupId::new(GroupKind::Cluster, name.clone()),
            template: TemplateKey::new("ubuntu", "24.04", "8.0.0.1", Arch::Amd64),
            nodes: vec![1, 2],
            tags: NodeTags {
                kind: GroupKind::Cluster,
                group: name,
                owner: "alice".to_string(),
                project: None,
                expires: Expiry::Never,
                features: Features::AEROSPIKE,
                node_seq_high: 2,
                distribution: "ubuntu".to_string(),
                distro_version: "24.04".to_string(),
                aerospike_version: Some("8.0.0.1".to_string()),
                client_type: None,
                arch: Arch::Amd64,
                extra: BTreeMap::new(),
            },
            extra: ProviderExtra::Aws(AwsExtra {
                instance_type: "t3.large".to_string(),
                ami: Some("ami-1".to_string()),
                ..AwsExtra::default()
            }),
        };

        let err = backend.deploy_group(&request).await.unwrap_err();
        assert!(err.to_string().contains("create-tags"), "{}", err);

        let calls = std::fs::read_to_string(&log).unwrap();
        let run = calls.lines().find(|l| l.starts_with("ec2 run-instances")).unwrap();
        assert!(run.contains("fleetlab-batch-first"));
        assert!(
            calls
                .lines()
                .any(|l| l.starts_with("ec2 terminate-instances --instance-ids i-1 i-2")),
            "{}",
            calls
        );
    }

    #[test]
    fn test_builder_instance_type() {
        assert_eq!(builder_instance_type(Arch::Arm64), "t4g.medium");
        assert_eq!(builder_instance_type(Arch::Amd64), "t3.medium");
    }
}
