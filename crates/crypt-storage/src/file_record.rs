use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crypt_core::{
    record::{normalize_last_run, EscrowRecord},
    storage::{RecordStore, RecordStoreError, StoreKind},
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, instrument};

/// Record store backed by a property-list file, the format the login mechanism writes
/// when it enables FileVault.
///
/// Plist dates carry whole seconds only, and a `last_run` at or before the epoch reads
/// back as `None`, so only whole-second timestamps after 1970 survive a round trip.
pub struct FileRecordStore {
    path: PathBuf,
}

impl FileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// On-disk layout. Unknown keys written by other tools are ignored.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(rename = "SerialNumber", default)]
    serial_number: String,
    #[serde(rename = "RecoveryKey", default)]
    recovery_key: String,
    #[serde(rename = "EnabledUser", default)]
    enabled_user: String,
    #[serde(rename = "last_run", default, skip_serializing_if = "Option::is_none")]
    last_run: Option<plist::Date>,
    #[serde(rename = "escrow_success", default)]
    escrow_success: bool,
    #[serde(rename = "HardwareUUID", default, skip_serializing_if = "Option::is_none")]
    hardware_uuid: Option<String>,
    #[serde(rename = "EnabledDate", default, skip_serializing_if = "Option::is_none")]
    enabled_date: Option<String>,
}

impl From<StoredRecord> for EscrowRecord {
    fn from(stored: StoredRecord) -> Self {
        let last_run = stored
            .last_run
            .map(|date| DateTime::<Utc>::from(SystemTime::from(date)));
        EscrowRecord {
            serial_number: stored.serial_number,
            recovery_key: stored.recovery_key,
            enabled_user: stored.enabled_user,
            last_run: normalize_last_run(last_run),
            escrow_success: stored.escrow_success,
            hardware_uuid: stored.hardware_uuid,
            enabled_date: stored.enabled_date,
        }
    }
}

impl From<&EscrowRecord> for StoredRecord {
    fn from(record: &EscrowRecord) -> Self {
        StoredRecord {
            serial_number: record.serial_number.clone(),
            recovery_key: record.recovery_key.clone(),
            enabled_user: record.enabled_user.clone(),
            last_run: record
                .last_run
                .map(|ts| plist::Date::from(SystemTime::from(ts))),
            escrow_success: record.escrow_success,
            hardware_uuid: record.hardware_uuid.clone(),
            enabled_date: record.enabled_date.clone(),
        }
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    fn kind(&self) -> StoreKind {
        StoreKind::File
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn has_record(&self) -> Result<bool, RecordStoreError> {
        match fs::metadata(&self.path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(storage_err(err)),
        }
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn load_key(&self) -> Result<String, RecordStoreError> {
        let record = read_record(&self.path)?.ok_or_else(|| RecordStoreError::NotFound {
            location: self.location(),
        })?;
        if record.recovery_key.trim().is_empty() {
            return Err(RecordStoreError::EmptyKey {
                location: self.location(),
            });
        }
        Ok(record.recovery_key)
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Option<EscrowRecord>, RecordStoreError> {
        Ok(read_record(&self.path)?.map(EscrowRecord::from))
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn save(&self, record: &EscrowRecord) -> Result<(), RecordStoreError> {
        write_record(&self.path, &StoredRecord::from(record))
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn delete(&self) -> Result<(), RecordStoreError> {
        info!("removing record file");
        match fs::remove_file(&self.path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }
}

fn read_record(path: &Path) -> Result<Option<StoredRecord>, RecordStoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(storage_err(err)),
    };
    plist::from_bytes(&bytes)
        .map(Some)
        .map_err(|e| RecordStoreError::Malformed {
            location: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn write_record(path: &Path, record: &StoredRecord) -> Result<(), RecordStoreError> {
    let parent = path.parent().ok_or_else(|| RecordStoreError::Storage {
        reason: "invalid record path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    plist::to_writer_xml(&mut tmp, record).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn storage_err<E: ToString>(err: E) -> RecordStoreError {
    RecordStoreError::Storage {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const FDESETUP_OUTPUT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>EnabledDate</key>
	<string>2024-01-05 10:11:12 -0800</string>
	<key>EnabledUser</key>
	<string>alice</string>
	<key>HardwareUUID</key>
	<string>0A1B2C3D-0000-1111-2222-333344445555</string>
	<key>LVGUUID</key>
	<string>D1E2F3A4-5555-6666-7777-888899990000</string>
	<key>RecoveryKey</key>
	<string>ABCD-EFGH-IJKL-MNOP-QRST-UVWX</string>
	<key>SerialNumber</key>
	<string>C02XYZ123ABC</string>
</dict>
</plist>
"#;

    #[tokio::test]
    async fn round_trip_preserves_every_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileRecordStore::new(dir.path().join("crypt_output.plist"));

        let record = EscrowRecord {
            serial_number: "S1".into(),
            recovery_key: "K1".into(),
            enabled_user: "U1".into(),
            last_run: Some(Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 59).unwrap()),
            escrow_success: true,
            hardware_uuid: Some("HW-UUID".into()),
            enabled_date: Some("2024-03-01 09:00:00 +0000".into()),
        };
        store.save(&record).await.expect("save");
        let loaded = store.load().await.expect("load").expect("present");

        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn last_run_keeps_whole_seconds_after_the_epoch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileRecordStore::new(dir.path().join("crypt_output.plist"));

        let precise = Utc.timestamp_opt(1_700_000_000, 987_654_321).unwrap();
        let mut record = EscrowRecord {
            last_run: Some(precise),
            ..EscrowRecord::default()
        };
        store.save(&record).await.expect("save");
        let loaded = store.load().await.expect("load").expect("present");
        assert_eq!(
            loaded.last_run,
            Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
        );

        record.last_run = Some(Utc.timestamp_opt(0, 0).unwrap());
        store.save(&record).await.expect("save");
        let loaded = store.load().await.expect("load").expect("present");
        assert_eq!(loaded.last_run, None);
    }

    #[tokio::test]
    async fn reads_mechanism_output_and_ignores_unknown_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crypt_output.plist");
        fs::write(&path, FDESETUP_OUTPUT).expect("write fixture");

        let record = FileRecordStore::new(&path)
            .load()
            .await
            .expect("load")
            .expect("present");
        assert_eq!(record.serial_number, "C02XYZ123ABC");
        assert_eq!(record.recovery_key, "ABCD-EFGH-IJKL-MNOP-QRST-UVWX");
        assert_eq!(record.enabled_user, "alice");
        assert_eq!(record.last_run, None);
        assert!(!record.escrow_success);
        assert_eq!(
            record.hardware_uuid.as_deref(),
            Some("0A1B2C3D-0000-1111-2222-333344445555")
        );
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileRecordStore::new(dir.path().join("absent.plist"));
        assert!(!store.has_record().await.unwrap());
        assert_eq!(store.load().await.unwrap(), None);
        let err = store.load_key().await.expect_err("no key without a file");
        assert!(matches!(err, RecordStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn empty_key_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileRecordStore::new(dir.path().join("crypt_output.plist"));
        store
            .save(&EscrowRecord {
                serial_number: "S1".into(),
                ..EscrowRecord::default()
            })
            .await
            .unwrap();
        let err = store.load_key().await.expect_err("empty key");
        assert!(matches!(err, RecordStoreError::EmptyKey { .. }));
    }

    #[tokio::test]
    async fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crypt_output.plist");
        fs::write(&path, "definitely not a plist").unwrap();
        let err = FileRecordStore::new(&path).load().await.expect_err("garbage");
        assert!(matches!(err, RecordStoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileRecordStore::new(dir.path().join("crypt_output.plist"));
        store.save(&EscrowRecord::default()).await.expect("save");
        assert!(store.has_record().await.unwrap());
        store.delete().await.expect("delete");
        store.delete().await.expect("delete again");
        assert!(!store.has_record().await.unwrap());
    }
}
