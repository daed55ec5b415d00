use std::path::Path;

use anyhow::{Context, Result};
use crypt_core::{
    command::CommandRunner,
    prefs::{keys, Preferences},
};
use tracing::{info, instrument};

/// Run the configured post-run command with the record path as its last argument.
///
/// The hook reacts to the record being gone, so it only runs while nothing exists at
/// `OutputPath`. Returns whether the command ran.
#[instrument(skip_all)]
pub async fn run_post_run_command(
    runner: &dyn CommandRunner,
    prefs: &dyn Preferences,
) -> Result<bool> {
    let Some(command) = prefs
        .get_post_run_command()
        .context("failed to get post run command")?
    else {
        return Ok(false);
    };
    let output_path = prefs
        .get_string(keys::OUTPUT_PATH)
        .context("failed to get output path")?;

    if Path::new(&output_path).exists() {
        return Ok(false);
    }

    let args: Vec<&str> = command
        .args()
        .iter()
        .map(String::as_str)
        .chain([output_path.as_str()])
        .collect();
    info!(program = command.program(), "running post run command");
    runner
        .run_checked(command.program(), &args)
        .await
        .context("failed to run post run command")?;
    info!("post run command successful");
    Ok(true)
}
