use std::sync::Arc;

use async_trait::async_trait;
use crypt_core::{
    host::Host,
    prefs::{keys, PrefValue, Preferences},
    record::{normalize_last_run, EscrowRecord},
    storage::{RecordStore, RecordStoreError, SecretStore, SecretStoreError, StoreKind},
};
use tracing::{info, instrument};

/// Account name paired with the service when talking to the keychain.
const KEYCHAIN_ACCOUNT: &str = "crypt";

/// OS keychain-backed secret store. Uses the `keyring` crate.
pub struct KeyringSecretStore {
    account: String,
}

impl KeyringSecretStore {
    pub fn new() -> Self {
        Self {
            account: KEYCHAIN_ACCOUNT.to_string(),
        }
    }

    fn entry(&self, service: &str) -> Result<keyring::Entry, SecretStoreError> {
        keyring::Entry::new(service, &self.account).map_err(|e| SecretStoreError::Storage {
            reason: e.to_string(),
        })
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for KeyringSecretStore {
    async fn put(&self, service: &str, secret: &str) -> Result<(), SecretStoreError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(SecretStoreError::Storage {
                reason: "secret cannot be empty".to_string(),
            });
        }
        // Keyring operations are synchronous; wrap in async for trait compatibility.
        self.entry(service)?
            .set_password(secret)
            .map_err(|e| keyring_err(service, e))
    }

    async fn get(&self, service: &str) -> Result<String, SecretStoreError> {
        self.entry(service)?
            .get_password()
            .map_err(|e| keyring_err(service, e))
    }

    async fn delete(&self, service: &str) -> Result<(), SecretStoreError> {
        self.entry(service)?
            .delete_credential()
            .map_err(|e| keyring_err(service, e))
    }
}

fn keyring_err(service: &str, err: keyring::Error) -> SecretStoreError {
    match err {
        keyring::Error::NoEntry => SecretStoreError::NotFound {
            service: service.to_string(),
        },
        other => SecretStoreError::Storage {
            reason: other.to_string(),
        },
    }
}

/// Record store for keychain mode: only the recovery key is stored (in a [`SecretStore`]);
/// serial number and user come from the live system and the last escrow time is kept in
/// preferences.
pub struct KeychainRecordStore<S: SecretStore> {
    secrets: S,
    service: String,
    host: Arc<Host>,
    prefs: Arc<dyn Preferences>,
}

impl<S: SecretStore> KeychainRecordStore<S> {
    pub fn new(
        secrets: S,
        service: impl Into<String>,
        host: Arc<Host>,
        prefs: Arc<dyn Preferences>,
    ) -> Self {
        Self {
            secrets,
            service: service.into(),
            host,
            prefs,
        }
    }
}

#[async_trait]
impl<S: SecretStore> RecordStore for KeychainRecordStore<S> {
    fn kind(&self) -> StoreKind {
        StoreKind::Keychain
    }

    fn location(&self) -> String {
        format!("keychain service {}", self.service)
    }

    async fn has_record(&self) -> Result<bool, RecordStoreError> {
        // Presence is decided when the key is read; a missing secret is an error there.
        Ok(true)
    }

    #[instrument(skip_all, fields(service = %self.service))]
    async fn load_key(&self) -> Result<String, RecordStoreError> {
        let key = self.secrets.get(&self.service).await.map_err(|e| match e {
            SecretStoreError::NotFound { .. } => RecordStoreError::NotFound {
                location: self.location(),
            },
            SecretStoreError::Storage { reason } => RecordStoreError::Storage { reason },
        })?;
        if key.trim().is_empty() {
            return Err(RecordStoreError::EmptyKey {
                location: self.location(),
            });
        }
        info!("found recovery key in keychain");
        Ok(key)
    }

    #[instrument(skip_all, fields(service = %self.service))]
    async fn load(&self) -> Result<Option<EscrowRecord>, RecordStoreError> {
        let recovery_key = self.load_key().await?;
        let serial_number = self.host.serial_number().await.map_err(storage_err)?;
        let enabled_user = self.host.console_user().await.map_err(storage_err)?;
        let last_run = self
            .prefs
            .get_date(keys::LAST_ESCROW)
            .map_err(storage_err)?;

        Ok(Some(EscrowRecord {
            serial_number,
            recovery_key,
            enabled_user,
            last_run: normalize_last_run(last_run),
            ..EscrowRecord::default()
        }))
    }

    async fn save(&self, record: &EscrowRecord) -> Result<(), RecordStoreError> {
        let Some(last_run) = record.last_run else {
            return Ok(());
        };
        self.prefs
            .set(keys::LAST_ESCROW, PrefValue::Date(last_run))
            .map_err(storage_err)
    }

    #[instrument(skip_all, fields(service = %self.service))]
    async fn delete(&self) -> Result<(), RecordStoreError> {
        info!("removing recovery key from keychain");
        self.secrets
            .delete(&self.service)
            .await
            .map_err(|e| RecordStoreError::Storage {
                reason: format!("failed to delete recovery key from keychain: {e}"),
            })
    }
}

fn storage_err<E: ToString>(err: E) -> RecordStoreError {
    RecordStoreError::Storage {
        reason: err.to_string(),
    }
}
