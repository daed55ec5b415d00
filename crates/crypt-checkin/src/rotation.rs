use anyhow::{Context, Result};
use crypt_core::{
    command::CommandRunner,
    prefs::{keys, Preferences},
    storage::RecordStore,
};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::post_run::run_post_run_command;

/// The server's answer to a check-in.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RotationDirective {
    pub rotation_required: bool,
}

impl RotationDirective {
    /// Only a JSON object is accepted, never the sequence form `[true]`.
    pub fn parse(body: &str) -> Result<Self> {
        let object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(body).context("failed to parse server response")?;
        serde_json::from_value(serde_json::Value::Object(object))
            .context("failed to parse server response")
    }
}

/// Act on the server's rotation directive. Returns `true` when the stored key was removed.
///
/// Nothing happens when `RotateUsedKey` is off or `RemovePlist` is on, or when there is no
/// stored record to rotate.
#[instrument(skip_all)]
pub async fn apply_server_rotation(
    body: &str,
    prefs: &dyn Preferences,
    store: &dyn RecordStore,
    runner: &dyn CommandRunner,
) -> Result<bool> {
    let directive = RotationDirective::parse(body)?;

    let rotate_used_key = prefs
        .get_bool(keys::ROTATE_USED_KEY)
        .context("failed to get rotate used key preference")?;
    let remove_plist = prefs
        .get_bool(keys::REMOVE_PLIST)
        .context("failed to get remove plist preference")?;
    if !rotate_used_key || remove_plist {
        return Ok(false);
    }

    if !store
        .has_record()
        .await
        .context("failed to check for stored record")?
    {
        return Ok(false);
    }

    if !directive.rotation_required {
        return Ok(false);
    }

    info!(location = %store.location(), "server requested key rotation, removing used key");
    store
        .delete()
        .await
        .context("failed to remove rotated key")?;
    run_post_run_command(runner, prefs).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_directive() {
        assert_eq!(
            RotationDirective::parse(r#"{"rotation_required": true}"#).unwrap(),
            RotationDirective {
                rotation_required: true
            }
        );
        assert!(
            !RotationDirective::parse(r#"{"rotation_required": false, "status": "ok"}"#)
                .unwrap()
                .rotation_required
        );
    }

    #[test]
    fn other_shapes_are_parse_errors() {
        for body in [
            "",
            "not json",
            "{}",
            r#"{"rotation_required": "yes"}"#,
            "[true]",
            "[false]",
            "true",
        ] {
            assert!(RotationDirective::parse(body).is_err(), "{body:?} should fail");
        }
    }
}
