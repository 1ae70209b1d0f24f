//! Command execution inside node containers

use crate::error::Result;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use futures_util::stream::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const RESIZE_POLL: Duration = Duration::from_millis(250);

/// Interleaved stdout/stderr and exit code of one exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: Vec<u8>,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs `cmd` to completion and collects its output
pub async fn exec_collect(
    docker: &Docker,
    container: &str,
    cmd: Vec<String>,
    env: Vec<String>,
) -> Result<ExecOutput> {
    tracing::debug!(container = %container, cmd = ?cmd, "docker exec");
    let exec_config = CreateExecOptions {
        cmd: Some(cmd),
        env: Some(env),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };
    let message = docker.create_exec(container, exec_config).await?;

    let mut collected = Vec::new();
    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&message.id, Some(StartExecOptions::default()))
        .await?
    {
        while let Some(msg) = output.next().await {
            match msg? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => collected.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
    }

    let inspect = docker.inspect_exec(&message.id).await?;
    Ok(ExecOutput {
        output: collected,
        exit_code: inspect.exit_code.unwrap_or(0),
    })
}

/// Restores the terminal mode when dropped
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Attaches the local terminal to `cmd` in a TTY and returns its exit code.
///
/// Local stdin is forwarded until EOF, which closes the remote stdin, and
/// terminal size changes are propagated while the session runs.
pub async fn exec_interactive(
    docker: &Docker,
    container: &str,
    cmd: Vec<String>,
    env: Vec<String>,
) -> Result<i64> {
    tracing::debug!(container = %container, cmd = ?cmd, "docker exec (interactive)");
    let exec_config = CreateExecOptions {
        cmd: Some(cmd),
        env: Some(env),
        tty: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };
    let message = docker.create_exec(container, exec_config).await?;
    let exec_id = message.id;

    let start_config = StartExecOptions {
        tty: true,
        ..Default::default()
    };
    let StartExecResults::Attached {
        mut output,
        mut input,
    } = docker.start_exec(&exec_id, Some(start_config)).await?
    else {
        return Ok(0);
    };

    let guard = RawModeGuard::enable()?;

    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if input.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = input.shutdown().await;
    });

    let resize_docker = docker.clone();
    let resize_id = exec_id.clone();
    let resize_task = tokio::spawn(async move {
        let mut last = None;
        loop {
            if let Ok((width, height)) = crossterm::terminal::size()
                && last != Some((width, height))
            {
                last = Some((width, height));
                if let Err(e) = resize_docker
                    .resize_exec(&resize_id, ResizeExecOptions { height, width })
                    .await
                {
                    tracing::debug!(error = %e, "terminal resize failed");
                }
            }
            tokio::time::sleep(RESIZE_POLL).await;
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(msg) = output.next().await {
        match msg {
            Ok(LogOutput::StdIn { .. }) => {}
            Ok(out) => {
                stdout.write_all(&out.into_bytes()).await?;
                stdout.flush().await?;
            }
            Err(e) => {
                tracing::debug!(error = %e, "exec stream ended");
                break;
            }
        }
    }

    stdin_task.abort();
    resize_task.abort();
    drop(guard);

    let inspect = docker.inspect_exec(&exec_id).await?;
    Ok(inspect.exit_code.unwrap_or(0))
}
