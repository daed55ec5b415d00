//! Concrete record storage: the OS keychain and the property-list record file.

pub mod file_record;
pub mod keychain;

pub use file_record::FileRecordStore;
pub use keychain::{KeychainRecordStore, KeyringSecretStore};
