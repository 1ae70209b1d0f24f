//! `FleetBackend` on a Docker engine
//!
//! Every node is a container; all fleetlab metadata lives in container
//! labels, which Docker cannot change after creation.

// Uses the bollard 0.19 deprecated option structs
#![allow(deprecated)]

use crate::archive::{tar_files, untar_file};
use crate::converter::{self, keepalive_cmd};
use crate::error::{DockerError, PROVIDER, Result, ignore_not_found};
use crate::exec::{exec_collect, exec_interactive};
use crate::naming;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::image::{CommitContainerOptions, CreateImageOptions};
use bollard::models::{ContainerConfig, ContainerSummary, HostConfig, VolumeCreateOptions};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fleetlab_backend::tags::{TAG_EXPIRES, TAG_GROUP, TAG_KIND, TAG_MANAGED, TAG_OWNER, TAG_TEMPLATE, TAG_VOLUME};
use fleetlab_backend::{
    Arch, DEFAULT_PARALLEL_THREADS, DeployRequest, DockerExtra, Expiry, ExpirySystemRecord,
    ExpirySystemSpec, FileUpload, FirewallRule, FirewallSpec, FleetBackend, FleetError, GroupId,
    GroupKind, GroupName, Node, NodeNo, NodeOutput, RunFailure, Subnet, Template, TemplateKey,
    TemplateSpec, Volume, VolumeSpec, for_each_node,
};
use futures_util::stream::{StreamExt, TryStreamExt};
use http_body_util::{Either, Full};
use std::collections::{BTreeMap, BTreeSet, HashMap};

type FleetResult<T> = fleetlab_backend::Result<T>;

const INSTALL_SCRIPT_PATH: &str = "/tmp/fleetlab-install.sh";
const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connects to `host` (`unix://…`, `tcp://…`, `http://…`) or the local
    /// engine, and checks the connection
    pub async fn connect(host: Option<&str>) -> Result<Self> {
        let docker = match host {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_socket(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(host) => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| DockerError::ConnectionFailed(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| DockerError::ConnectionFailed(e.to_string()))?;
        tracing::debug!(host = ?host, "connected to docker");
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn containers(&self, kind: GroupKind, group: Option<&GroupName>) -> Result<Vec<ContainerSummary>> {
        let mut labels = vec![
            format!("{}=true", TAG_MANAGED),
            format!("{}={}", TAG_KIND, kind),
        ];
        if let Some(group) = group {
            labels.push(format!("{}={}", TAG_GROUP, group));
        }
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), labels);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        tracing::debug!(kind = %kind, group = ?group.map(GroupName::as_str), "listing containers");
        Ok(self.docker.list_containers(Some(options)).await?)
    }

    async fn nodes(&self, kind: GroupKind, group: Option<&GroupName>) -> Result<Vec<Node>> {
        Ok(self
            .containers(kind, group)
            .await?
            .iter()
            .filter_map(|c| converter::summary_to_node(c, kind))
            .collect())
    }

    async fn group_nodes(&self, group: &GroupId) -> Result<BTreeMap<NodeNo, Node>> {
        Ok(self
            .nodes(group.kind, Some(&group.name))
            .await?
            .into_iter()
            .map(|n| (n.node_no, n))
            .collect())
    }

    /// The group's containers for `nodes`; `NotFound` if one is missing
    async fn require_nodes(&self, group: &GroupId, nodes: &[NodeNo]) -> Result<BTreeMap<NodeNo, Node>> {
        let mut existing = self.group_nodes(group).await?;
        if let Some(missing) = nodes.iter().find(|n| !existing.contains_key(n)) {
            return Err(FleetError::not_found("node", format!("{} node {}", group, missing)).into());
        }
        existing.retain(|n, _| nodes.contains(n));
        Ok(existing)
    }

    async fn pull_image(&self, image: &str, arch: Arch) -> Result<()> {
        let (repo, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        let platform = naming::platform(arch);
        tracing::info!(image = %image, platform = %platform, "pulling image");

        let options = CreateImageOptions {
            from_image: repo,
            tag,
            platform: platform.as_str(),
            ..Default::default()
        };
        let mut stream = self
            .docker
            .create_image(Some(options), None, None::<bollard::auth::DockerCredentials>);
        while let Some(info) = stream.next().await {
            let info = info?;
            if let Some(status) = info.status {
                tracing::debug!(image = %image, status = %status, "pull");
            }
        }
        Ok(())
    }

    async fn upload(&self, container: &str, files: &[FileUpload]) -> Result<()> {
        let archive = Bytes::from(tar_files(files)?);
        self.upload_archive(container, archive).await
    }

    async fn upload_archive(&self, container: &str, archive: Bytes) -> Result<()> {
        tracing::debug!(container = %container, bytes = archive.len(), "uploading archive");
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(container, Some(options), Either::Left(Full::new(archive)))
            .await?;
        Ok(())
    }

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(container, Some(options))
            .try_collect()
            .await?;
        let archive = chunks.concat();
        tracing::debug!(container = %container, path = %path, bytes = archive.len(), "downloaded archive");
        untar_file(&archive, path)
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: 1 }))
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        ignore_not_found(self.docker.remove_container(name, Some(options)).await)?;
        Ok(())
    }

    async fn deploy(&self, request: &DeployRequest) -> Result<()> {
        let extra = request.extra.docker()?;

        let existing = self.group_nodes(&request.group).await?;
        if let Some(node) = request.nodes.iter().find(|n| existing.contains_key(n)) {
            return Err(FleetError::validation(format!(
                "{} node {} already exists",
                request.group, node
            ))
            .into());
        }

        let image = match &extra.image {
            Some(image) => {
                if ignore_not_found(self.docker.inspect_image(image).await)?.is_none() {
                    self.pull_image(image, request.template.arch).await?;
                }
                image.clone()
            }
            None => {
                let image = naming::image_name(&request.template);
                if ignore_not_found(self.docker.inspect_image(&image).await)?.is_none() {
                    return Err(FleetError::not_found(
                        "template",
                        format!("{} (create it with 'fleetlab template create')", request.template),
                    )
                    .into());
                }
                image
            }
        };

        let mut created = Vec::with_capacity(request.nodes.len());
        if let Err(e) = self.create_nodes(request, extra, &image, &mut created).await {
            self.rollback_deploy(&request.group, &created).await;
            return Err(e);
        }
        Ok(())
    }

    /// Creates and starts one container per requested node, recording each
    /// container name as soon as it exists
    async fn create_nodes(
        &self,
        request: &DeployRequest,
        extra: &DockerExtra,
        image: &str,
        created: &mut Vec<String>,
    ) -> Result<()> {
        for (index, node_no) in request.nodes.iter().enumerate() {
            let (config, options) =
                converter::node_container_config(request, extra, *node_no, index, image)?;
            let name = options.name.clone();
            self.docker.create_container(Some(options), config).await?;
            created.push(name.clone());
            self.docker
                .start_container(&name, None::<bollard::query_parameters::StartContainerOptions>)
                .await?;
            tracing::info!(container = %name, image = %image, "node started");
        }
        Ok(())
    }

    /// Removes the containers of a deploy that did not complete
    async fn rollback_deploy(&self, group: &GroupId, created: &[String]) {
        if created.is_empty() {
            return;
        }
        tracing::warn!(group = %group, count = created.len(), "deploy failed, removing the new containers");
        for name in created {
            if let Err(e) = self.remove_container(name, true).await {
                tracing::warn!(container = %name, error = %e, "could not remove container");
            }
        }
    }

    async fn start_node(&self, group: &GroupId, node: NodeNo) -> Result<()> {
        let name = naming::container_name(group, node);
        match self
            .docker
            .start_container(&name, None::<bollard::query_parameters::StartContainerOptions>)
            .await
        {
            Ok(_) => tracing::info!(container = %name, "started"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => tracing::debug!(container = %name, "already running"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn stop_node(&self, group: &GroupId, node: NodeNo) -> Result<()> {
        let name = naming::container_name(group, node);
        self.stop_container(&name).await?;
        tracing::info!(container = %name, "stopped");
        Ok(())
    }

    async fn remove_node(&self, group: &GroupId, node: NodeNo, force: bool) -> Result<()> {
        let name = naming::container_name(group, node);
        if force {
            self.stop_container(&name).await?;
        }
        self.remove_container(&name, force).await?;
        tracing::info!(container = %name, "removed");
        Ok(())
    }

    async fn build_template(&self, spec: &TemplateSpec) -> Result<Template> {
        let base = spec
            .base_image
            .clone()
            .unwrap_or_else(|| naming::base_image(&spec.key));
        self.pull_image(&base, spec.key.arch).await?;

        let builder = naming::builder_name(&spec.key);
        self.remove_container(&builder, true).await?;

        let config = Config {
            image: Some(base),
            cmd: Some(keepalive_cmd()),
            host_config: Some(HostConfig {
                init: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: builder.clone(),
            platform: Some(naming::platform(spec.key.arch)),
        };
        self.docker.create_container(Some(options), config).await?;
        tracing::info!(template = %spec.key, builder = %builder, "building template");

        let result = match self.provision_builder(&builder, spec).await {
            Ok(()) => self.commit(&builder, &spec.key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = self.remove_container(&builder, true).await {
            tracing::warn!(builder = %builder, error = %e, "could not remove template builder");
        }
        result
    }

    async fn provision_builder(&self, builder: &str, spec: &TemplateSpec) -> Result<()> {
        self.docker
            .start_container(builder, None::<bollard::query_parameters::StartContainerOptions>)
            .await?;

        let mut files = spec.files.clone();
        if !spec.install_script.is_empty() {
            files.push(FileUpload::new(INSTALL_SCRIPT_PATH, spec.install_script.clone())?.with_mode(0o755));
        }
        if !files.is_empty() {
            self.upload(builder, &files).await?;
        }

        if !spec.install_script.is_empty() {
            let out = exec_collect(
                &self.docker,
                builder,
                vec!["/bin/bash".to_string(), INSTALL_SCRIPT_PATH.to_string()],
                Vec::new(),
            )
            .await?;
            if !out.success() {
                return Err(DockerError::ExecFailed {
                    code: out.exit_code,
                    output: tail(&out.output),
                });
            }
        }
        Ok(())
    }

    async fn commit(&self, builder: &str, key: &TemplateKey) -> Result<Template> {
        let mut labels = HashMap::new();
        labels.insert(TAG_TEMPLATE.to_string(), "true".to_string());
        let config = ContainerConfig {
            cmd: Some(keepalive_cmd()),
            labels: Some(labels),
            ..Default::default()
        };
        let options = CommitContainerOptions {
            container: builder.to_string(),
            repo: naming::image_repo(key),
            tag: key.aerospike_version.clone(),
            pause: true,
            ..Default::default()
        };
        self.docker.commit_container(options, config).await?;

        let image = naming::image_name(key);
        let inspect = self.docker.inspect_image(&image).await?;
        tracing::info!(image = %image, "template created");
        Ok(Template {
            key: key.clone(),
            image_id: inspect.id.unwrap_or_default(),
            region: "local".to_string(),
            created: inspect
                .created
                .as_deref()
                .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                .map(|c| c.with_timezone(&Utc)),
            size_bytes: inspect.size.and_then(|s| u64::try_from(s).ok()),
        })
    }

    async fn run_on_nodes(
        &self,
        group: &GroupId,
        commands: &[Vec<String>],
        nodes: &[NodeNo],
    ) -> std::result::Result<Vec<NodeOutput>, RunFailure> {
        let mut outputs = Vec::with_capacity(nodes.len());
        for node in nodes {
            let name = naming::container_name(group, *node);
            let mut output = Vec::new();
            for command in commands {
                let result = exec_collect(
                    &self.docker,
                    &name,
                    command.clone(),
                    vec![format!("NODE={}", node)],
                )
                .await;
                let failure = match result {
                    Ok(out) if out.success() => {
                        output.extend_from_slice(&out.output);
                        continue;
                    }
                    Ok(out) => {
                        output.extend_from_slice(&out.output);
                        DockerError::ExecFailed {
                            code: out.exit_code,
                            output: tail(&out.output),
                        }
                    }
                    Err(e) => e,
                };
                outputs.push(NodeOutput { node: *node, output });
                return Err(RunFailure {
                    group: group.name.to_string(),
                    node: *node,
                    outputs,
                    source: failure.into(),
                });
            }
            outputs.push(NodeOutput { node: *node, output });
        }
        Ok(outputs)
    }

    async fn attach(
        &self,
        group: &GroupId,
        node: NodeNo,
        args: &[String],
        interactive: bool,
    ) -> Result<Vec<u8>> {
        self.require_nodes(group, &[node]).await?;
        let name = naming::container_name(group, node);
        let cmd = if args.is_empty() {
            vec!["/bin/bash".to_string()]
        } else {
            args.to_vec()
        };
        let env = vec![format!("NODE={}", node)];

        if interactive {
            let code = exec_interactive(&self.docker, &name, cmd, env).await?;
            if code != 0 {
                tracing::debug!(container = %name, exit_code = code, "interactive session ended");
            }
            return Ok(Vec::new());
        }

        let out = exec_collect(&self.docker, &name, cmd, env).await?;
        if !out.success() {
            return Err(FleetError::CommandFailed {
                group: group.name.to_string(),
                node,
                message: format!("exit code {}: {}", out.exit_code, tail(&out.output)),
            }
            .into());
        }
        Ok(out.output)
    }
}

/// Last lines of command output, for error messages
fn tail(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let lines: Vec<&str> = text.trim_end().lines().collect();
    lines[lines.len().saturating_sub(10)..].join("\n")
}

#[async_trait]
impl FleetBackend for DockerBackend {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_groups(&self, kind: GroupKind) -> FleetResult<Vec<GroupName>> {
        let names: BTreeSet<GroupName> = self
            .nodes(kind, None)
            .await?
            .into_iter()
            .filter(|n| n.state.is_live())
            .map(|n| n.group)
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn list_nodes(&self, group: &GroupId) -> FleetResult<Vec<NodeNo>> {
        let nodes: Vec<NodeNo> = self
            .group_nodes(group)
            .await?
            .into_values()
            .filter(|n| n.state.is_live())
            .map(|n| n.node_no)
            .collect();
        if nodes.is_empty() {
            return Err(FleetError::not_found(group.kind.as_str(), group.name.to_string()));
        }
        Ok(nodes)
    }

    async fn describe_nodes(&self, kind: GroupKind) -> FleetResult<Vec<Node>> {
        Ok(self.nodes(kind, None).await?)
    }

    async fn list_templates(&self) -> FleetResult<Vec<Template>> {
        let images = self
            .docker
            .list_images(None::<bollard::query_parameters::ListImagesOptions>)
            .await
            .map_err(DockerError::from)?;
        Ok(images.iter().flat_map(converter::image_to_templates).collect())
    }

    async fn create_template(&self, spec: &TemplateSpec) -> FleetResult<Template> {
        Ok(self.build_template(spec).await?)
    }

    async fn destroy_template(&self, key: &TemplateKey) -> FleetResult<()> {
        let image = naming::image_name(key);
        tracing::info!(image = %image, "removing template");
        let removed = ignore_not_found(
            self.docker
                .remove_image(
                    &image,
                    None::<bollard::query_parameters::RemoveImageOptions>,
                    None,
                )
                .await,
        )?;
        if removed.is_none() {
            return Err(FleetError::not_found("template", key.to_string()));
        }
        Ok(())
    }

    async fn list_firewalls(&self) -> FleetResult<Vec<FirewallRule>> {
        let networks = self
            .docker
            .list_networks(None::<bollard::query_parameters::ListNetworksOptions>)
            .await
            .map_err(DockerError::from)?;
        Ok(networks.iter().filter_map(converter::network_to_firewall).collect())
    }

    async fn create_firewall(&self, spec: &FirewallSpec) -> FleetResult<()> {
        tracing::info!(network = %spec.name, "creating network");
        match self.docker.create_network(converter::firewall_request(spec)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Err(FleetError::validation(format!(
                "network '{}' already exists",
                spec.name
            ))),
            Err(e) => Err(DockerError::from(e).into()),
        }
    }

    async fn delete_firewall(&self, name: &str) -> FleetResult<()> {
        tracing::info!(network = %name, "removing network");
        if ignore_not_found(self.docker.remove_network(name).await)?.is_none() {
            return Err(FleetError::not_found("network", name));
        }
        Ok(())
    }

    async fn list_subnets(&self) -> FleetResult<Vec<Subnet>> {
        Ok(Vec::new())
    }

    async fn list_volumes(&self) -> FleetResult<Vec<Volume>> {
        let response = self
            .docker
            .list_volumes(None::<bollard::query_parameters::ListVolumesOptions>)
            .await
            .map_err(DockerError::from)?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .iter()
            .filter_map(converter::to_volume)
            .collect())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> FleetResult<Volume> {
        let mut labels: HashMap<String, String> = spec.tags.clone().into_iter().collect();
        labels.insert(TAG_VOLUME.to_string(), "true".to_string());
        labels.insert(TAG_OWNER.to_string(), spec.owner.clone());
        labels.insert(TAG_EXPIRES.to_string(), spec.expires.to_tag());

        tracing::info!(volume = %spec.name, "creating volume");
        let created = self
            .docker
            .create_volume(VolumeCreateOptions {
                name: Some(spec.name.clone()),
                driver: Some("local".to_string()),
                labels: Some(labels),
                ..Default::default()
            })
            .await
            .map_err(DockerError::from)?;
        converter::to_volume(&created)
            .ok_or_else(|| FleetError::backend(PROVIDER, format!("volume '{}' lost its labels", spec.name)))
    }

    async fn delete_volume(&self, name: &str) -> FleetResult<()> {
        tracing::info!(volume = %name, "removing volume");
        let removed = ignore_not_found(
            self.docker
                .remove_volume(name, None::<bollard::query_parameters::RemoveVolumeOptions>)
                .await,
        )?;
        if removed.is_none() {
            return Err(FleetError::not_found("volume", name));
        }
        Ok(())
    }

    async fn tag_volume(&self, _name: &str, _key: &str, _value: &str) -> FleetResult<()> {
        Err(FleetError::unsupported(PROVIDER, "changing volume labels"))
    }

    async fn expiry_system(&self) -> FleetResult<Vec<ExpirySystemRecord>> {
        Ok(Vec::new())
    }

    async fn install_expiry_system(&self, _spec: &ExpirySystemSpec) -> FleetResult<()> {
        Err(FleetError::unsupported(
            PROVIDER,
            "a scheduled expiry system (run 'fleetlab expiry run' instead)",
        ))
    }

    async fn remove_expiry_system(&self, _region: Option<&str>) -> FleetResult<()> {
        Err(FleetError::unsupported(PROVIDER, "a scheduled expiry system"))
    }

    async fn set_expiry_frequency(&self, _interval_minutes: u32) -> FleetResult<()> {
        Err(FleetError::unsupported(PROVIDER, "a scheduled expiry system"))
    }

    async fn deploy_group(&self, request: &DeployRequest) -> FleetResult<()> {
        Ok(self.deploy(request).await?)
    }

    async fn start_group(&self, group: &GroupId, nodes: &[NodeNo]) -> FleetResult<()> {
        self.require_nodes(group, nodes).await?;
        for_each_node("start", group, nodes, DEFAULT_PARALLEL_THREADS, |node| async move {
            Ok(self.start_node(group, node).await?)
        })
        .await
    }

    async fn stop_group(&self, group: &GroupId, nodes: &[NodeNo]) -> FleetResult<()> {
        self.require_nodes(group, nodes).await?;
        for_each_node("stop", group, nodes, DEFAULT_PARALLEL_THREADS, |node| async move {
            Ok(self.stop_node(group, node).await?)
        })
        .await
    }

    async fn destroy_group(&self, group: &GroupId, nodes: &[NodeNo], force: bool) -> FleetResult<()> {
        let existing = self.group_nodes(group).await?;
        if !force
            && let Some(running) = nodes
                .iter()
                .find(|n| existing.get(n).is_some_and(|node| node.state.is_running()))
        {
            return Err(FleetError::validation(format!(
                "{} node {} is running",
                group, running
            )));
        }

        let targets: Vec<NodeNo> = nodes
            .iter()
            .copied()
            .filter(|n| existing.contains_key(n))
            .collect();
        for_each_node("destroy", group, &targets, DEFAULT_PARALLEL_THREADS, |node| async move {
            Ok(self.remove_node(group, node, force).await?)
        })
        .await
    }

    async fn node_ip_map(&self, group: &GroupId, internal: bool) -> FleetResult<BTreeMap<NodeNo, String>> {
        if internal {
            return Ok(BTreeMap::new());
        }
        Ok(self
            .group_nodes(group)
            .await?
            .into_iter()
            .filter_map(|(no, node)| node.private_ip.map(|ip| (no, ip)))
            .collect())
    }

    async fn run_commands(
        &self,
        group: &GroupId,
        commands: &[Vec<String>],
        nodes: &[NodeNo],
    ) -> std::result::Result<Vec<NodeOutput>, RunFailure> {
        self.run_on_nodes(group, commands, nodes).await
    }

    async fn copy_files(&self, group: &GroupId, files: &[FileUpload], nodes: &[NodeNo]) -> FleetResult<()> {
        self.require_nodes(group, nodes).await?;
        let archive = Bytes::from(tar_files(files)?);
        for_each_node("copy", group, nodes, DEFAULT_PARALLEL_THREADS, |node| {
            let archive = archive.clone();
            async move {
                let name = naming::container_name(group, node);
                Ok(self.upload_archive(&name, archive).await?)
            }
        })
        .await
    }

    async fn copy_from_node(&self, group: &GroupId, node: NodeNo, path: &str) -> FleetResult<Vec<u8>> {
        self.require_nodes(group, &[node]).await?;
        let name = naming::container_name(group, node);
        Ok(self.download(&name, path).await?)
    }

    async fn attach_and_run(
        &self,
        group: &GroupId,
        node: NodeNo,
        args: &[String],
        interactive: bool,
    ) -> FleetResult<Vec<u8>> {
        Ok(self.attach(group, node, args, interactive).await?)
    }

    async fn is_system_arm(&self, _instance_type: &str) -> FleetResult<bool> {
        let info = self.docker.info().await.map_err(DockerError::from)?;
        Ok(info
            .architecture
            .as_deref()
            .is_some_and(|a| matches!(a, "aarch64" | "arm64")))
    }

    async fn set_label(&self, _group: &GroupId, _key: &str, _value: &str) -> FleetResult<()> {
        Err(FleetError::unsupported(PROVIDER, "changing container labels"))
    }

    async fn set_group_expiry(&self, _group: &GroupId, _expiry: Expiry, _nodes: &[NodeNo]) -> FleetResult<()> {
        Err(FleetError::unsupported(PROVIDER, "changing expiry on existing containers"))
    }
}
