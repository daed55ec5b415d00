use std::{io::ErrorKind, process::Stdio};

use async_trait::async_trait;
use crypt_core::command::{CommandError, CommandOutput, CommandRunner};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// Runs real programs with `tokio::process`, capturing stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, CommandError> {
        debug!(program, "running command");
        let spawn_err = |reason: String| CommandError::Spawn {
            program: program.to_string(),
            reason,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_err(e.to_string()))?;

        let pipe = match stdin {
            Some(_) => Some(
                child
                    .stdin
                    .take()
                    .ok_or_else(|| spawn_err("stdin was not captured".to_string()))?,
            ),
            None => None,
        };
        // The pipe is dropped when `feed` finishes, so the child sees EOF.
        let feed = async move {
            let (Some(mut pipe), Some(input)) = (pipe, stdin) else {
                return Ok(());
            };
            match pipe.write_all(input).await {
                // The child exited without reading all of its input.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };

        let (fed, out) = tokio::join!(feed, child.wait_with_output());
        let out = out.map_err(|e| spawn_err(e.to_string()))?;
        fed.map_err(|e| spawn_err(format!("failed to write stdin: {e}")))?;
        Ok(CommandOutput {
            status: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}
