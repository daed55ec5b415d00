use anyhow::{Context, Result};
use crypt_core::{
    command::CommandRunner,
    host::{Host, OsVersion, FDESETUP},
    prefs::Preferences,
    storage::RecordStore,
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{error::CheckinError, post_run::run_post_run_command};

/// Releases before this one corrupt FileVault state when a key is validated repeatedly
/// before a reboot.
pub const MIN_VALIDATION_VERSION: [u64; 3] = [10, 12, 5];

/// What the pre-escrow key check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValidation {
    Skipped(&'static str),
    Valid,
    /// The key was rejected by the OS and removed from its store.
    Rotated,
}

#[derive(Serialize)]
struct ValidationInput<'a> {
    #[serde(rename = "Password")]
    password: &'a str,
}

/// Ask `fdesetup` whether `recovery_key` still unlocks the volume.
///
/// `Ok(false)` means the OS explicitly rejected it; output other than `true`/`false` is an
/// error.
#[instrument(skip_all)]
pub async fn validate_recovery_key(runner: &dyn CommandRunner, recovery_key: &str) -> Result<bool> {
    let mut input = Vec::new();
    plist::to_writer_xml(
        &mut input,
        &ValidationInput {
            password: recovery_key,
        },
    )
    .context("failed to encode validation input")?;

    let out = runner
        .run(FDESETUP, &["validaterecovery", "-inputplist"], Some(input.as_slice()))
        .await
        .context("failed to run fdesetup validaterecovery")?;

    match out.stdout.trim() {
        "false" => Ok(false),
        "true" if out.succeeded() => Ok(true),
        _ => {
            warn!("recovery key could not be validated");
            let output = format!("{}{}", out.stdout.trim(), out.stderr.trim());
            Err(CheckinError::AmbiguousValidation { output }.into())
        }
    }
}

/// Validate the stored key and, if the OS rejects it, delete it and run the post-run
/// command so a new key gets generated.
#[instrument(skip_all, fields(location = %store.location()))]
pub async fn validate_and_rotate(
    host: &Host,
    store: &dyn RecordStore,
    prefs: &dyn Preferences,
) -> Result<KeyValidation> {
    // Validating at the login window burns through the limited retry budget.
    match host.logged_in_user().await {
        Ok(Some(_)) => {}
        Ok(None) => return Ok(KeyValidation::Skipped("no console user")),
        Err(err) => {
            warn!(error = %err, "could not determine console user, skipping key validation");
            return Ok(KeyValidation::Skipped("no console user"));
        }
    }

    let version = host
        .os_version()
        .await
        .context("failed to get macOS version")?;
    if version < OsVersion::new(&MIN_VALIDATION_VERSION) {
        info!(%version, "OS too old, skipping key validation");
        return Ok(KeyValidation::Skipped("OS version below 10.12.5"));
    }

    if !store
        .has_record()
        .await
        .context("failed to check for stored record")?
    {
        return Ok(KeyValidation::Skipped("no stored record"));
    }

    let key = store
        .load_key()
        .await
        .context("failed to get recovery key")?;
    if validate_recovery_key(host.runner().as_ref(), &key).await? {
        return Ok(KeyValidation::Valid);
    }

    info!("removing invalid recovery key");
    store
        .delete()
        .await
        .context("failed to remove invalid key")?;
    run_post_run_command(host.runner().as_ref(), prefs).await?;
    Ok(KeyValidation::Rotated)
}
