pub mod attach;
pub mod exec;
pub mod expiry;
pub mod files;
pub mod group;
pub mod inventory;
pub mod template;

use colored::Colorize;
use fleetlab_backend::{Node, NodeState};
use serde::Serialize;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Node table shared by inventory and group listings
pub fn print_nodes(nodes: &[Node]) {
    if nodes.is_empty() {
        println!("{}", "none".dimmed());
        return;
    }

    println!(
        "{}",
        format!(
            "{:<24} {:<5} {:<13} {:<16} {:<16} {:<22} {:<12} {:<24}",
            "GROUP", "NODE", "STATE", "PUBLIC IP", "PRIVATE IP", "TEMPLATE", "OWNER", "EXPIRES"
        )
        .bold()
    );
    println!("{}", "─".repeat(138).dimmed());

    for node in nodes {
        let state = node.state.to_string();
        let state = match node.state {
            NodeState::Running => state.green(),
            NodeState::Stopped => state.yellow(),
            NodeState::Provisioning => state.blue(),
            NodeState::Terminated => state.red(),
        };
        let template = format!(
            "{}:{}/{}",
            node.distribution,
            node.distro_version,
            node.aerospike_version
                .as_deref()
                .or(node.client_type.as_deref())
                .unwrap_or("-")
        );
        println!(
            "{:<24} {:<5} {:<13} {:<16} {:<16} {:<22} {:<12} {:<24}",
            node.group.as_str().cyan(),
            node.node_no,
            state,
            node.public_ip.as_deref().unwrap_or("-"),
            node.private_ip.as_deref().unwrap_or("-"),
            template,
            node.owner,
            node.expires.to_string().dimmed()
        );
    }
}

pub fn print_done(message: impl AsRef<str>) {
    println!("{}", format!("✓ {}", message.as_ref()).green().bold());
}
