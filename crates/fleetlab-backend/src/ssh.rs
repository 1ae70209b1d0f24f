//! SSH transport shared by the cloud backends
//!
//! Wraps the system `ssh` client. Files are written by piping their content
//! into `sudo tee` on the remote side, so no scp/sftp is needed on the node.

use crate::error::{FleetError, Result};
use crate::executor::{DEFAULT_PARALLEL_THREADS, collect_node_results, map_limit};
use crate::model::{GroupId, NodeNo};
use crate::provider::{FileStream, FileUpload, NodeOutput, RetryConfig, RunFailure};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_ERROR: i32 = 255;

/// Quotes `s` for a POSIX shell
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// One shell command line from an argument vector
pub fn remote_command(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_escape(a))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct SshTransport {
    pub user: String,
    pub key_path: Option<PathBuf>,
    pub port: u16,
    pub connect_timeout_secs: u32,
    pub retry: RetryConfig,
}

impl SshTransport {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key_path: None,
            port: 22,
            connect_timeout_secs: 10,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn base_args(&self, host: &str, tty: bool) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if tty {
            args.push("-t".to_string());
        } else {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.user, host));
        args
    }

    fn command(&self, host: &str, tty: bool, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args(host, tty)).arg(remote);
        cmd
    }

    /// Runs one remote command line, retrying while the connection fails.
    /// Returns stdout followed by stderr; a nonzero exit is an error.
    pub async fn exec(&self, host: &str, remote: &str) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            tracing::debug!(host = %host, command = %remote, attempt, "ssh exec");
            let output = self
                .command(host, false, remote)
                .stdin(Stdio::null())
                .output()
                .await?;

            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);

            if output.status.success() {
                return Ok(combined);
            }
            let code = output.status.code();
            attempt += 1;
            if code == Some(SSH_CONNECTION_ERROR) && attempt < self.retry.max_attempts {
                let delay = self.retry.delay_for_attempt(attempt - 1);
                tracing::warn!(host = %host, attempt, delay_ms = delay.as_millis() as u64, "ssh connection failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(FleetError::backend(
                "ssh",
                format!(
                    "{}@{}: exit code {}: {}",
                    self.user,
                    host,
                    code.unwrap_or(-1),
                    String::from_utf8_lossy(&combined).trim()
                ),
            ));
        }
    }

    /// Runs `args` on the host. Interactive sessions inherit the local
    /// terminal and return no output.
    pub async fn attach(&self, host: &str, args: &[String], interactive: bool) -> Result<Vec<u8>> {
        let remote = remote_command(args);
        if !interactive {
            return self.exec(host, &remote).await;
        }
        let status = self
            .command(host, true, &remote)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        if !status.success() {
            return Err(FleetError::backend(
                "ssh",
                format!("session on {} ended with exit code {}", host, status.code().unwrap_or(-1)),
            ));
        }
        Ok(Vec::new())
    }

    pub async fn upload(&self, host: &str, file: &FileUpload) -> Result<()> {
        self.upload_reader(host, &file.path, file.mode, file.contents.as_slice())
            .await
    }

    /// Streams `reader` into `path` on the host
    pub async fn upload_reader<R>(&self, host: &str, path: &str, mode: u32, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let remote = format!(
            "sudo mkdir -p \"$(dirname {path})\" && sudo tee {path} >/dev/null && sudo chmod {mode:o} {path}",
            path = shell_escape(path),
            mode = mode,
        );
        tracing::debug!(host = %host, path = %path, "ssh upload");
        let mut child = self
            .command(host, false, &remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::io::copy(&mut reader, &mut stdin).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(FleetError::backend(
                "ssh",
                format!(
                    "upload of {} to {} failed: {}",
                    path,
                    host,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }

    /// Reads `path` from the host; only stdout is returned
    pub async fn download(&self, host: &str, path: &str) -> Result<Vec<u8>> {
        let remote = format!("sudo cat {}", shell_escape(path));
        tracing::debug!(host = %host, path = %path, "ssh download");
        let output = self
            .command(host, false, &remote)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(FleetError::backend(
                "ssh",
                format!(
                    "download of {} from {} failed: {}",
                    path,
                    host,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(output.stdout)
    }
}

/// Writes every file to every host. All hosts are attempted; failures are
/// reported per node.
pub async fn upload_to_hosts(
    ssh: &SshTransport,
    group: &GroupId,
    files: &[FileUpload],
    hosts: &[(NodeNo, String)],
) -> Result<()> {
    let results = map_limit(hosts, DEFAULT_PARALLEL_THREADS, |(_, host)| async move {
        for file in files {
            ssh.upload(host, file).await?;
        }
        Ok::<(), FleetError>(())
    })
    .await;
    let nodes: Vec<NodeNo> = hosts.iter().map(|(node, _)| *node).collect();
    collect_node_results("copy", &group.to_string(), &nodes, results)?;
    Ok(())
}

/// Streams one file to each host in turn, rewinding between hosts
pub async fn stream_to_hosts(
    ssh: &SshTransport,
    group: &GroupId,
    stream: &mut FileStream,
    hosts: &[(NodeNo, String)],
) -> Result<()> {
    let (path, mode) = (stream.path.clone(), stream.mode);
    let mut results = Vec::with_capacity(hosts.len());
    for (_, host) in hosts {
        let result = match stream.rewind().await {
            Ok(reader) => ssh.upload_reader(host, &path, mode, reader).await,
            Err(e) => Err(e),
        };
        results.push(result);
    }
    let nodes: Vec<NodeNo> = hosts.iter().map(|(node, _)| *node).collect();
    collect_node_results("copy", &group.to_string(), &nodes, results)?;
    Ok(())
}

/// Runs `commands` node by node, stopping at the first failure. The failing
/// node's output so far is part of the returned failure.
pub async fn run_on_hosts(
    ssh: &SshTransport,
    group: &str,
    commands: &[Vec<String>],
    hosts: &[(NodeNo, String)],
) -> std::result::Result<Vec<NodeOutput>, RunFailure> {
    let mut outputs = Vec::with_capacity(hosts.len());
    for (node, host) in hosts {
        let mut output = Vec::new();
        for command in commands {
            match ssh.exec(host, &remote_command(command)).await {
                Ok(out) => output.extend_from_slice(&out),
                Err(e) => {
                    if let FleetError::Backend { message, .. } = &e {
                        output.extend_from_slice(message.as_bytes());
                    }
                    outputs.push(NodeOutput { node: *node, output });
                    return Err(RunFailure {
                        group: group.to_string(),
                        node: *node,
                        outputs,
                        source: e,
                    });
                }
            }
        }
        outputs.push(NodeOutput { node: *node, output });
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("hello"), "'hello'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_remote_command_quotes_every_arg() {
        let args = vec!["echo".to_string(), "a b".to_string()];
        assert_eq!(remote_command(&args), "'echo' 'a b'");
    }

    #[test]
    fn test_base_args() {
        let ssh = SshTransport::new("ubuntu").with_key("/keys/fleet.pem");
        let args = ssh.base_args("192.0.2.1", false);
        assert_eq!(args.last().unwrap(), "ubuntu@192.0.2.1");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/fleet.pem"));

        let tty = ssh.base_args("192.0.2.1", true);
        assert!(tty.contains(&"-t".to_string()));
        assert!(!tty.contains(&"BatchMode=yes".to_string()));
    }

    #[tokio::test]
    async fn test_upload_attempts_every_host() {
        let mut ssh = SshTransport::new("root");
        ssh.port = 1;
        ssh.connect_timeout_secs = 1;
        let group = GroupId::new(
            crate::model::GroupKind::Cluster,
            crate::model::GroupName::new("mydc").unwrap(),
        );
        let files = [FileUpload {
            path: "/etc/motd".to_string(),
            mode: 0o644,
            contents: b"hi".to_vec(),
        }];
        let hosts = [(1, "127.0.0.1".to_string()), (2, "127.0.0.1".to_string())];

        let err = upload_to_hosts(&ssh, &group, &files, &hosts).await.unwrap_err();
        match &err {
            FleetError::PartialFailure(failure) => {
                assert_eq!(failure.attempted, 2);
                assert_eq!(failure.failed_nodes(), vec![1, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("cluster 'mydc' node 2: "), "{}", err);
    }

    #[tokio::test]
    async fn test_run_on_no_hosts() {
        let ssh = SshTransport::new("root");
        let outputs = run_on_hosts(&ssh, "mydc", &[vec!["true".to_string()]], &[])
            .await
            .unwrap();
        assert!(outputs.is_empty());
    }
}
