use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced by secret store implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretStoreError {
    /// Requested secret does not exist.
    #[error("secret not found for service: {service}")]
    NotFound { service: String },
    /// Underlying storage failure.
    #[error("secret storage failure: {reason}")]
    Storage { reason: String },
}

/// Access-controlled storage for small secrets (the OS keychain in production).
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Persist a secret under a service name, overwriting any existing entry.
    async fn put(&self, service: &str, secret: &str) -> Result<(), SecretStoreError>;

    /// Retrieve the secret for a service name.
    async fn get(&self, service: &str) -> Result<String, SecretStoreError>;

    /// Remove the secret for a service name.
    async fn delete(&self, service: &str) -> Result<(), SecretStoreError>;
}

/// In-memory secret store for tests and smoke runs.
#[derive(Debug, Default, Clone)]
pub struct InMemorySecretStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(service))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn put(&self, service: &str, secret: &str) -> Result<(), SecretStoreError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(SecretStoreError::Storage {
                reason: "secret cannot be empty".to_string(),
            });
        }
        let mut map = self.inner.lock().map_err(|err| SecretStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        map.insert(service.to_string(), secret.to_string());
        Ok(())
    }

    async fn get(&self, service: &str) -> Result<String, SecretStoreError> {
        let map = self.inner.lock().map_err(|err| SecretStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;

        map.get(service)
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound {
                service: service.to_string(),
            })
    }

    async fn delete(&self, service: &str) -> Result<(), SecretStoreError> {
        let mut map = self.inner.lock().map_err(|err| SecretStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        map.remove(service)
            .map(|_| ())
            .ok_or_else(|| SecretStoreError::NotFound {
                service: service.to_string(),
            })
    }
}
