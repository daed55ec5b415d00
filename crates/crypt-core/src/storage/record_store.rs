use async_trait::async_trait;
use thiserror::Error;

use crate::record::EscrowRecord;

/// Which backend is authoritative for the recovery key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// The key lives in the OS keychain; metadata is synthesized per run.
    Keychain,
    /// The whole record lives in a property-list file.
    File,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordStoreError {
    #[error("no recovery key found in {location}")]
    NotFound { location: String },
    #[error("recovery key in {location} is empty")]
    EmptyKey { location: String },
    #[error("record at {location} is malformed: {reason}")]
    Malformed { location: String, reason: String },
    #[error("record storage failure: {reason}")]
    Storage { reason: String },
}

/// Persistence for the escrow record. Exactly one implementation is used per run.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Human-readable location for logs (a path or a keychain service).
    fn location(&self) -> String;

    /// Whether there is a record worth validating or rotating.
    async fn has_record(&self) -> Result<bool, RecordStoreError>;

    /// Only the recovery key. An empty key is [`RecordStoreError::EmptyKey`].
    async fn load_key(&self) -> Result<String, RecordStoreError>;

    /// The full record, or `None` when there is nothing to escrow.
    async fn load(&self) -> Result<Option<EscrowRecord>, RecordStoreError>;

    /// Persist escrow bookkeeping for `record`.
    async fn save(&self, record: &EscrowRecord) -> Result<(), RecordStoreError>;

    /// Destroy the stored key so a new one is generated.
    async fn delete(&self) -> Result<(), RecordStoreError>;
}
