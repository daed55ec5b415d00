//! Maintains the Crypt entries in the `system.login.console` authorization right.

use std::{io::Cursor, sync::Arc};

use async_trait::async_trait;
use crypt_core::{
    command::CommandRunner,
    mechanisms::{MechanismEnsurer, MechanismError},
};
use plist::{Dictionary, Value};
use tracing::{info, instrument};

pub const SECURITY: &str = "/usr/bin/security";
const RIGHT: &str = "system.login.console";
const MECHANISMS_KEY: &str = "mechanisms";

/// Mechanisms that must sit directly before [`ANCHOR_MECHANISM`].
pub const CHECK_MECHANISMS: [&str; 1] = ["Crypt:Check,privileged"];
/// Everything Crypt has ever installed, cleared before re-inserting.
pub const CRYPT_MECHANISMS: [&str; 3] = [
    "Crypt:Check,privileged",
    "Crypt:CryptGUI",
    "Crypt:Enablement,privileged",
];
pub const ANCHOR_MECHANISM: &str = "loginwindow:done";

/// Reads and rewrites the login right through `security authorizationdb`.
pub struct AuthorizationDb {
    runner: Arc<dyn CommandRunner>,
}

impl AuthorizationDb {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn read(&self) -> Result<Dictionary, MechanismError> {
        let out = self
            .runner
            .run_checked(SECURITY, &["authorizationdb", "read", RIGHT])
            .await?;
        Value::from_reader(Cursor::new(out.as_bytes()))
            .map_err(|e| MechanismError::Malformed {
                reason: e.to_string(),
            })?
            .into_dictionary()
            .ok_or_else(|| MechanismError::Malformed {
                reason: "right definition is not a dictionary".to_string(),
            })
    }

    async fn write(&self, right: &Dictionary) -> Result<(), MechanismError> {
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, right).map_err(|e| MechanismError::Malformed {
            reason: e.to_string(),
        })?;
        self.runner
            .run(SECURITY, &["authorizationdb", "write", RIGHT], Some(body.as_slice()))
            .await?
            .into_result(SECURITY)?;
        Ok(())
    }

    async fn edit(&self, add: bool) -> Result<(), MechanismError> {
        let mut right = self.read().await?;
        let current = mechanisms(&right)?;
        let updated = set_mechanisms(current, add);
        right.insert(
            MECHANISMS_KEY.to_string(),
            Value::Array(updated.into_iter().map(Value::String).collect()),
        );
        self.write(&right).await
    }

    #[instrument(skip_all)]
    pub async fn install(&self) -> Result<(), MechanismError> {
        info!("installing login mechanisms");
        self.edit(true).await
    }

    #[instrument(skip_all)]
    pub async fn uninstall(&self) -> Result<(), MechanismError> {
        info!("removing login mechanisms");
        self.edit(false).await
    }

    /// Whether the check mechanism is in place.
    pub async fn check(&self) -> Result<bool, MechanismError> {
        let right = self.read().await?;
        Ok(mechanisms_in_place(&mechanisms(&right)?))
    }
}

#[async_trait]
impl MechanismEnsurer for AuthorizationDb {
    #[instrument(skip_all)]
    async fn ensure(&self) -> Result<(), MechanismError> {
        if self.check().await? {
            return Ok(());
        }
        info!("mechanisms are not set correctly, adding to authorization database");
        self.edit(true).await
    }
}

fn mechanisms(right: &Dictionary) -> Result<Vec<String>, MechanismError> {
    let Some(list) = right.get(MECHANISMS_KEY) else {
        return Ok(Vec::new());
    };
    list.as_array()
        .ok_or_else(|| MechanismError::Malformed {
            reason: "mechanisms is not an array".to_string(),
        })?
        .iter()
        .map(|v| {
            v.as_string()
                .map(str::to_string)
                .ok_or_else(|| MechanismError::Malformed {
                    reason: "mechanism entry is not a string".to_string(),
                })
        })
        .collect()
}

/// True when [`CHECK_MECHANISMS`] immediately precede the anchor.
pub fn mechanisms_in_place(mechs: &[String]) -> bool {
    let Some(anchor) = mechs.iter().position(|m| m == ANCHOR_MECHANISM) else {
        return false;
    };
    let Some(start) = anchor.checked_sub(CHECK_MECHANISMS.len()) else {
        return false;
    };
    mechs[start..anchor]
        .iter()
        .zip(CHECK_MECHANISMS)
        .all(|(have, want)| have == want)
}

/// Strip every Crypt mechanism and, when `add` is set, re-insert the check mechanisms
/// before the anchor. A right without the anchor is left without Crypt entries.
pub fn set_mechanisms(mechs: Vec<String>, add: bool) -> Vec<String> {
    let mut mechs: Vec<String> = mechs
        .into_iter()
        .filter(|m| !CRYPT_MECHANISMS.contains(&m.as_str()))
        .collect();
    if add {
        if let Some(anchor) = mechs.iter().position(|m| m == ANCHOR_MECHANISM) {
            for (offset, mech) in CHECK_MECHANISMS.iter().enumerate() {
                mechs.insert(anchor + offset, mech.to_string());
            }
        }
    }
    mechs
}
