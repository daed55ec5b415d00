use std::sync::Arc;

use color_eyre::Result;
use crypt_core::{
    host::Host,
    prefs::{keys, Preferences},
    storage::{RecordStore, SecretStore},
};
use crypt_storage::{FileRecordStore, KeychainRecordStore, KeyringSecretStore};
use tracing::debug;

/// Build the record store `StoreRecoveryKeyInKeychain` selects, backed by the OS keychain.
pub fn production_store(
    prefs: Arc<dyn Preferences>,
    host: Arc<Host>,
) -> Result<Arc<dyn RecordStore>> {
    store_with_secrets(prefs, host, KeyringSecretStore::new())
}

/// Same selection with an explicit secret store.
pub fn store_with_secrets<S: SecretStore + 'static>(
    prefs: Arc<dyn Preferences>,
    host: Arc<Host>,
    secrets: S,
) -> Result<Arc<dyn RecordStore>> {
    if prefs.get_bool(keys::STORE_RECOVERY_KEY_IN_KEYCHAIN)? {
        let service = prefs.get_string(keys::KEYCHAIN_SERVICE)?;
        debug!(%service, "configured to use keychain for recovery key storage");
        return Ok(Arc::new(KeychainRecordStore::new(
            secrets, service, host, prefs,
        )));
    }

    let path = prefs.get_string(keys::OUTPUT_PATH)?;
    debug!(%path, "configured to use record file for recovery key storage");
    Ok(Arc::new(FileRecordStore::new(path)))
}
