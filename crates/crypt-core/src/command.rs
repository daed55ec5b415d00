use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced while running external programs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The program could not be started at all.
    #[error("failed to launch {program}: {reason}")]
    Spawn { program: String, reason: String },
    /// The program ran but reported failure.
    #[error("{program} exited with status {status:?}: stdout: {stdout} stderr: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

/// Captured result of a finished program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }

    /// Convert a non-zero exit into a [`CommandError::Failed`].
    pub fn into_result(self, program: &str) -> Result<String, CommandError> {
        if self.succeeded() {
            return Ok(self.stdout);
        }
        Err(CommandError::Failed {
            program: program.to_string(),
            status: self.status,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// Executes external programs (system utilities, the HTTP client, hooks).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, optionally feeding `stdin`, and capture its output.
    /// A non-zero exit is not an error at this level; callers decide.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, CommandError>;

    /// Run and return stdout, treating a non-zero exit as [`CommandError::Failed`].
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        self.run(program, args, None).await?.into_result(program)
    }
}

/// One recorded invocation of a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

#[derive(Debug, Clone)]
struct Script {
    program: String,
    args_prefix: Vec<String>,
    output: CommandOutput,
}

/// Runner that replays canned outputs and records every call, for tests and dry runs.
/// Unscripted programs fail to launch.
#[derive(Debug, Default, Clone)]
pub struct ScriptedRunner {
    scripts: Arc<Mutex<Vec<Script>>>,
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer calls to `program` whose arguments start with `args_prefix`.
    /// Later scripts for the same command take precedence.
    pub fn respond(self, program: &str, args_prefix: &[&str], output: CommandOutput) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push(Script {
                program: program.to_string(),
                args_prefix: args_prefix.iter().map(|a| a.to_string()).collect(),
                output,
            });
        }
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls made to `program`, in order.
    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, CommandError> {
        let lock_err = |err: String| CommandError::Spawn {
            program: program.to_string(),
            reason: format!("lock poisoned: {err}"),
        };

        self.calls
            .lock()
            .map_err(|e| lock_err(e.to_string()))?
            .push(Invocation {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                stdin: stdin.map(|s| String::from_utf8_lossy(s).into_owned()),
            });

        let scripts = self.scripts.lock().map_err(|e| lock_err(e.to_string()))?;
        scripts
            .iter()
            .rev()
            .find(|s| {
                s.program == program
                    && s.args_prefix.len() <= args.len()
                    && s.args_prefix.iter().zip(args).all(|(want, got)| want == got)
            })
            .map(|s| s.output.clone())
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_string(),
                reason: "no scripted response".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_runner_matches_on_argument_prefix() {
        let runner = ScriptedRunner::new()
            .respond("/usr/bin/fdesetup", &["list"], CommandOutput::success("alice,ABC"))
            .respond(
                "/usr/bin/fdesetup",
                &["validaterecovery"],
                CommandOutput::success("true"),
            );

        let out = runner
            .run("/usr/bin/fdesetup", &["validaterecovery", "-inputplist"], Some(b"x"))
            .await
            .expect("scripted");
        assert_eq!(out.stdout, "true");

        let calls = runner.calls_to("/usr/bin/fdesetup");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stdin.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn unscripted_program_fails_to_launch() {
        let runner = ScriptedRunner::new();
        let err = runner
            .run("/usr/bin/true", &[], None)
            .await
            .expect_err("nothing scripted");
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn run_checked_surfaces_non_zero_exit() {
        let runner = ScriptedRunner::new().respond(
            "/usr/sbin/scutil",
            &[],
            CommandOutput::failure(1, "", "no such key"),
        );
        let err = runner
            .run_checked("/usr/sbin/scutil", &["--get", "ComputerName"])
            .await
            .expect_err("non-zero exit");
        match err {
            CommandError::Failed { stderr, status, .. } => {
                assert_eq!(status, Some(1));
                assert_eq!(stderr, "no such key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
