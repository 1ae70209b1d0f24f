use colored::Colorize;
use fleetlab_backend::{
    Fleet, FleetError, GroupId, GroupKind, GroupName, NodeFailure, NodeOutput, NodeSelector,
    PartialFailure,
};

/// A lone argument containing whitespace is treated as a shell snippet
pub fn shell_argv(command: Vec<String>) -> Vec<String> {
    if let [single] = command.as_slice()
        && single.contains(char::is_whitespace)
    {
        return vec!["bash".to_string(), "-c".to_string(), single.clone()];
    }
    command
}

pub fn print_outputs(outputs: &[NodeOutput]) {
    let multi = outputs.len() > 1;
    for output in outputs {
        if multi {
            println!("{}", format!("=== node {} ===", output.node).cyan().bold());
        }
        print!("{}", output.text());
    }
}

pub async fn handle(
    fleet: &Fleet,
    kind: GroupKind,
    name: GroupName,
    nodes: &NodeSelector,
    threads: Option<usize>,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let id = GroupId::new(kind, name);
    let threads = threads.unwrap_or(fleet.context().parallel_threads);
    let remote = fleet.remote_with(threads);
    let commands = vec![shell_argv(command)];

    let results = remote.run_parallel(&id, nodes, &commands).await?;
    let attempted = results.len();
    let mut failures = Vec::new();
    for (node, result) in results {
        println!("{}", format!("=== node {} ===", node).cyan().bold());
        match result {
            Ok(output) => print!("{}", output.text()),
            Err(e) => {
                println!("{}", e.to_string().red());
                failures.push(NodeFailure {
                    group: id.to_string(),
                    node,
                    message: e.to_string(),
                });
            }
        }
    }

    if !failures.is_empty() {
        return Err(FleetError::from(PartialFailure {
            operation: "exec".to_string(),
            attempted,
            failures,
        })
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_shell_argv() {
        assert_eq!(shell_argv(argv(&["ls", "-la"])), argv(&["ls", "-la"]));
        assert_eq!(
            shell_argv(argv(&["ls /tmp | wc -l"])),
            argv(&["bash", "-c", "ls /tmp | wc -l"])
        );
        assert_eq!(shell_argv(argv(&["uptime"])), argv(&["uptime"]));
        assert!(shell_argv(Vec::new()).is_empty());
    }
}
