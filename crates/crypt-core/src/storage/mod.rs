//! Storage contracts for the recovery key and its escrow record.

pub mod record_store;
pub mod secret_store;

pub use record_store::{RecordStore, RecordStoreError, StoreKind};
pub use secret_store::{InMemorySecretStore, SecretStore, SecretStoreError};
