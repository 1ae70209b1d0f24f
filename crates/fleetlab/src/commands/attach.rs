use super::exec::{print_outputs, shell_argv};
use chrono::{Duration, Utc};
use fleetlab_backend::{Fleet, GroupId, GroupKind, GroupName, NodeSelector};

pub async fn handle(
    fleet: &Fleet,
    kind: GroupKind,
    name: GroupName,
    nodes: &NodeSelector,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let id = GroupId::new(kind, name);
    fleet
        .expiring_soon(&id, Utc::now(), Duration::hours(1))
        .await?;

    let interactive = command.is_empty();
    let args = shell_argv(command);
    let outputs = fleet.remote().attach(&id, nodes, &args, interactive).await?;
    if !interactive {
        print_outputs(&outputs);
    }
    Ok(())
}
