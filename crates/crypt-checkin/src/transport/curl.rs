use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use crypt_core::command::CommandRunner;
use tracing::{debug, info, instrument};

use super::Transport;
use crate::{error::CheckinError, form::EscrowForm};

pub const CURL: &str = "/usr/bin/curl";

/// Fail on HTTP errors, stay quiet unless something breaks, follow redirects.
const BASE_ARGS: [&str; 4] = ["--fail", "--silent", "--show-error", "--location"];

/// Sends the check-in through the system `curl`, feeding the URL and body as a config
/// file on stdin so the recovery key never appears in the process table.
pub struct CurlTransport {
    runner: Arc<dyn CommandRunner>,
    extra_args: Vec<String>,
}

impl CurlTransport {
    /// `extra_args` are appended verbatim after the built-in flags.
    pub fn new(runner: Arc<dyn CommandRunner>, extra_args: Vec<String>) -> Self {
        Self { runner, extra_args }
    }

    fn args(&self) -> Vec<&str> {
        let mut args: Vec<&str> = BASE_ARGS.to_vec();
        if !self.extra_args.is_empty() {
            debug!(count = self.extra_args.len(), "adding additional curl options");
        }
        args.extend(self.extra_args.iter().map(String::as_str));
        args.extend(["--config", "-"]);
        args
    }
}

#[async_trait]
impl Transport for CurlTransport {
    fn name(&self) -> &'static str {
        "curl"
    }

    #[instrument(skip_all, fields(transport = "curl", url = %url))]
    async fn send(&self, url: &str, form: &EscrowForm) -> Result<String> {
        let body = form.encode().context("failed to encode escrow form")?;
        let config = curl_config(&[("url", url), ("data", &body)]);

        let out = self
            .runner
            .run(CURL, &self.args(), Some(config.as_bytes()))
            .await
            .context("failed to launch curl")?;

        if !out.succeeded() || !out.stderr.trim().is_empty() {
            return Err(CheckinError::Curl {
                status: out.status,
                stdout: out.stdout,
                stderr: out.stderr,
            })
            .context("failed to run curl");
        }
        info!("key escrow request accepted");
        Ok(out.stdout)
    }
}

/// One `name = "value"` line per option, quoting values the way curl's config parser
/// expects.
pub fn curl_config(options: &[(&str, &str)]) -> String {
    options
        .iter()
        .map(|(name, value)| format!("{name} = \"{}\"", curl_escape(value)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn curl_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use crypt_core::{
        command::{CommandOutput, ScriptedRunner},
        record::EscrowRecord,
    };

    use super::*;

    fn form() -> EscrowForm {
        let record = EscrowRecord {
            serial_number: "S1".into(),
            recovery_key: "K1".into(),
            enabled_user: "U1".into(),
            ..EscrowRecord::default()
        };
        EscrowForm::new(&record, "Mac1")
    }

    #[test]
    fn config_lines_escape_quotes_and_backslashes() {
        let config = curl_config(&[("url", "http://test.com/checkin/"), ("data", r#"a"b\c"#)]);
        let lines: Vec<&str> = config.lines().collect();
        assert_eq!(
            lines,
            vec![r#"url = "http://test.com/checkin/""#, r#"data = "a\"b\\c""#]
        );
    }

    #[tokio::test]
    async fn passes_flags_and_config_on_stdin() {
        let runner = ScriptedRunner::new().respond(
            CURL,
            &[],
            CommandOutput::success(r#"{"rotation_required": false}"#),
        );
        let transport = CurlTransport::new(
            Arc::new(runner.clone()),
            vec!["--cacert".into(), "/tmp/ca.pem".into()],
        );

        let body = transport
            .send("http://test.com/checkin/", &form())
            .await
            .expect("send");
        assert_eq!(body, r#"{"rotation_required": false}"#);

        let calls = runner.calls_to(CURL);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].args,
            vec![
                "--fail",
                "--silent",
                "--show-error",
                "--location",
                "--cacert",
                "/tmp/ca.pem",
                "--config",
                "-"
            ]
        );
        let stdin = calls[0].stdin.as_deref().expect("config on stdin");
        assert!(stdin.contains(r#"url = "http://test.com/checkin/""#));
        assert!(stdin.contains("recovery_password=K1"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error_with_output() {
        let runner = ScriptedRunner::new().respond(
            CURL,
            &[],
            CommandOutput::failure(22, "", "The requested URL returned error: 500"),
        );
        let transport = CurlTransport::new(Arc::new(runner), Vec::new());

        let err = transport
            .send("http://test.com/checkin/", &form())
            .await
            .expect_err("curl failed");
        let curl = err.downcast_ref::<CheckinError>().expect("curl error");
        assert!(matches!(curl, CheckinError::Curl { status: Some(22), .. }));
        assert!(format!("{err:#}").contains("returned error: 500"));
    }

    #[tokio::test]
    async fn stderr_output_is_an_error() {
        let runner = ScriptedRunner::new().respond(
            CURL,
            &[],
            CommandOutput {
                status: Some(0),
                stdout: "{}".into(),
                stderr: "warning: something odd".into(),
            },
        );
        let transport = CurlTransport::new(Arc::new(runner), Vec::new());
        assert!(transport
            .send("http://test.com/checkin/", &form())
            .await
            .is_err());
    }
}
