use super::print_done;
use anyhow::{Context, anyhow};
use colored::Colorize;
use fleetlab_backend::{FileStream, Fleet, GroupId, GroupKind, GroupName, NodeNo, NodeSelector};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub async fn upload(
    fleet: &Fleet,
    kind: GroupKind,
    name: GroupName,
    nodes: &NodeSelector,
    local: &Path,
    remote: String,
) -> anyhow::Result<()> {
    let id = GroupId::new(kind, name);
    let mut stream = FileStream::from_file(local, remote)
        .await
        .with_context(|| format!("cannot read {}", local.display()))?;
    let size = stream.size;
    let path = stream.path.clone();

    let uploaded = fleet.remote().upload_stream(&id, nodes, &mut stream).await?;
    print_done(format!(
        "uploaded {} ({} bytes) to {}:{} on nodes {:?}",
        local.display(),
        size,
        id,
        path,
        uploaded
    ));
    Ok(())
}

pub async fn download(
    fleet: &Fleet,
    kind: GroupKind,
    name: GroupName,
    nodes: &NodeSelector,
    remote: &str,
    local: &Path,
) -> anyhow::Result<()> {
    let file_name = Path::new(remote)
        .file_name()
        .ok_or_else(|| anyhow!("'{}' does not name a file", remote))?;
    let id = GroupId::new(kind, name);
    let files = fleet.remote().download(&id, nodes, remote).await?;

    let per_node = files.len() > 1;
    for (node, contents) in &files {
        let target = download_target(local, file_name, *node, per_node);
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        tokio::fs::write(&target, contents)
            .await
            .with_context(|| format!("cannot write {}", target.display()))?;
        println!("{:<5} {}", node, target.display().to_string().cyan());
    }

    let downloaded: Vec<NodeNo> = files.iter().map(|(node, _)| *node).collect();
    print_done(format!("downloaded {}:{} from nodes {:?}", id, remote, downloaded));
    Ok(())
}

/// `local/<node>/<file>` for several nodes; otherwise `local`, or
/// `local/<file>` when `local` is a directory
fn download_target(local: &Path, file_name: &OsStr, node: NodeNo, per_node: bool) -> PathBuf {
    if per_node {
        local.join(node.to_string()).join(file_name)
    } else if local.is_dir() {
        local.join(file_name)
    } else {
        local.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_target() {
        let dir = tempfile::tempdir().unwrap();
        let name = OsStr::new("aerospike.log");

        assert_eq!(
            download_target(dir.path(), name, 3, true),
            dir.path().join("3").join("aerospike.log")
        );
        assert_eq!(download_target(dir.path(), name, 3, false), dir.path().join("aerospike.log"));

        let file = dir.path().join("node1.log");
        assert_eq!(download_target(&file, name, 1, false), file);
    }
}
