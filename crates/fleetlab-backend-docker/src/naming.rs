//! Container and image naming

use fleetlab_backend::{Arch, GroupId, GroupKind, NodeNo, TemplateKey};

const CLUSTER_PREFIX: &str = "fleetlab-";
const CLIENT_PREFIX: &str = "fleetlab_c-";
const IMAGE_PREFIX: &str = "fleetlab-";

/// `fleetlab-<group>_<node>` for clusters, `fleetlab_c-<group>_<node>` for clients
pub fn container_name(group: &GroupId, node: NodeNo) -> String {
    let prefix = match group.kind {
        GroupKind::Cluster => CLUSTER_PREFIX,
        GroupKind::Client => CLIENT_PREFIX,
    };
    format!("{}{}_{}", prefix, group.name, node)
}

/// Kind, group and node encoded in a container name. Docker reports names
/// with a leading `/`.
pub fn parse_container_name(name: &str) -> Option<(GroupKind, String, NodeNo)> {
    let name = name.trim_start_matches('/');
    let (kind, rest) = if let Some(rest) = name.strip_prefix(CLIENT_PREFIX) {
        (GroupKind::Client, rest)
    } else if let Some(rest) = name.strip_prefix(CLUSTER_PREFIX) {
        (GroupKind::Cluster, rest)
    } else {
        return None;
    };
    let (group, node) = rest.rsplit_once('_')?;
    let node: NodeNo = node.parse().ok().filter(|n| *n > 0)?;
    if group.is_empty() {
        return None;
    }
    Some((kind, group.to_string(), node))
}

/// Image repository without tag: `fleetlab-<distro>_<version>_<arch>`
pub fn image_repo(key: &TemplateKey) -> String {
    format!(
        "{}{}_{}_{}",
        IMAGE_PREFIX, key.distribution, key.distro_version, key.arch
    )
}

/// Full image reference: `fleetlab-<distro>_<version>_<arch>:<aerospike-version|client>`
pub fn image_name(key: &TemplateKey) -> String {
    format!("{}:{}", image_repo(key), key.aerospike_version)
}

pub fn parse_image_name(reference: &str) -> Option<TemplateKey> {
    let (repo, tag) = reference.rsplit_once(':')?;
    let rest = repo.strip_prefix(IMAGE_PREFIX)?;
    let mut parts = rest.splitn(3, '_');
    let distribution = parts.next()?;
    let version = parts.next()?;
    let arch: Arch = parts.next()?.parse().ok()?;
    if distribution.is_empty() || version.is_empty() || tag.is_empty() {
        return None;
    }
    Some(TemplateKey::new(distribution, version, tag, arch))
}

/// Base image a template is built from when none is given
pub fn base_image(key: &TemplateKey) -> String {
    format!("{}:{}", key.distribution, key.distro_version)
}

/// Name of the temporary container a template is built in
pub fn builder_name(key: &TemplateKey) -> String {
    format!(
        "fleetlab-builder-{}_{}_{}_{}",
        key.distribution, key.distro_version, key.arch, key.aerospike_version
    )
}

pub fn platform(arch: Arch) -> String {
    format!("linux/{}", arch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlab_backend::GroupName;

    #[test]
    fn test_container_names() {
        let cluster = GroupId::cluster(GroupName::new("my_dc").unwrap());
        let client = GroupId::client(GroupName::new("load").unwrap());

        assert_eq!(container_name(&cluster, 2), "fleetlab-my_dc_2");
        assert_eq!(container_name(&client, 10), "fleetlab_c-load_10");

        assert_eq!(
            parse_container_name("/fleetlab-my_dc_2"),
            Some((GroupKind::Cluster, "my_dc".to_string(), 2))
        );
        assert_eq!(
            parse_container_name("fleetlab_c-load_10"),
            Some((GroupKind::Client, "load".to_string(), 10))
        );
        assert_eq!(parse_container_name("fleetlab-mydc_0"), None);
        assert_eq!(parse_container_name("fleetlab-mydc"), None);
        assert_eq!(parse_container_name("nginx"), None);
    }

    #[test]
    fn test_image_names() {
        let key = TemplateKey::new("ubuntu", "24.04", "8.0.0.1", Arch::Arm64);
        assert_eq!(image_name(&key), "fleetlab-ubuntu_24.04_arm64:8.0.0.1");
        assert_eq!(parse_image_name(&image_name(&key)), Some(key.clone()));
        assert_eq!(base_image(&key), "ubuntu:24.04");
        assert_eq!(platform(key.arch), "linux/arm64");

        let client = TemplateKey::client("rocky", "9", Arch::Amd64);
        assert_eq!(image_name(&client), "fleetlab-rocky_9_amd64:client");
        assert!(parse_image_name("fleetlab-rocky_9_amd64:client").unwrap().is_client());

        assert_eq!(parse_image_name("ubuntu:24.04"), None);
        assert_eq!(parse_image_name("fleetlab-ubuntu_24.04_sparc:1"), None);
    }
}
