use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use color_eyre::Result;
use crypt_core::prefs::{default_value, PrefValue, PreferenceError, Preferences};
use dirs::config_dir;
use tempfile::NamedTempFile;
use toml::{Table, Value};
use tracing::debug;

/// Preferences stored in a TOML file, keyed by the documented preference names:
///
/// ```toml
/// ServerURL = "https://crypt.example.org"
/// RemovePlist = false
/// KeyEscrowInterval = 24
/// SkipUsers = ["admin"]
/// PostRunCommand = ["/usr/local/bin/notify", "--new-key"]
/// ```
///
/// A missing file means every key takes its default.
pub struct TomlPreferences {
    path: PathBuf,
    table: Mutex<Table>,
}

impl TomlPreferences {
    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => default_path()?,
        };
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                Table::new()
            } else {
                toml::from_str(&contents)?
            }
        } else {
            Table::new()
        };
        debug!(path = %path.display(), keys = table.len(), "loaded preferences");
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }
}

/// Resolve the default preferences path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("crypt").join("config.toml"))
}

impl Preferences for TomlPreferences {
    fn get(&self, key: &str) -> Result<Option<PrefValue>, PreferenceError> {
        let table = self.table.lock().map_err(|e| PreferenceError::Storage {
            reason: format!("lock poisoned: {e}"),
        })?;
        match table.get(key) {
            Some(value) => from_toml(key, value).map(Some),
            None => Ok(default_value(key)),
        }
    }

    fn set(&self, key: &str, value: PrefValue) -> Result<(), PreferenceError> {
        let mut table = self.table.lock().map_err(|e| PreferenceError::Storage {
            reason: format!("lock poisoned: {e}"),
        })?;
        table.insert(key.to_string(), to_toml(key, value)?);
        write_atomically(&self.path, &table).map_err(|e| PreferenceError::Storage {
            reason: format!("failed to write {}: {e}", self.path.display()),
        })
    }
}

fn from_toml(key: &str, value: &Value) -> Result<PrefValue, PreferenceError> {
    let invalid = |reason: String| PreferenceError::Invalid {
        key: key.to_string(),
        reason,
    };
    match value {
        Value::Boolean(b) => Ok(PrefValue::Bool(*b)),
        Value::Integer(i) => Ok(PrefValue::Int(*i)),
        Value::String(s) => Ok(PrefValue::String(s.clone())),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    invalid(format!(
                        "list entries must be strings, found {}",
                        item.type_str()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(PrefValue::StringList),
        Value::Datetime(dt) => parse_datetime(&dt.to_string())
            .map(PrefValue::Date)
            .ok_or_else(|| invalid(format!("unsupported date {dt}"))),
        other => Err(invalid(format!("unsupported value type {}", other.type_str()))),
    }
}

/// Offset date-times are taken as given; local date-times are read as UTC.
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn to_toml(key: &str, value: PrefValue) -> Result<Value, PreferenceError> {
    let value = match value {
        PrefValue::Bool(b) => Value::Boolean(b),
        PrefValue::Int(i) => Value::Integer(i),
        PrefValue::String(s) => Value::String(s),
        PrefValue::StringList(list) => Value::Array(list.into_iter().map(Value::String).collect()),
        PrefValue::Date(d) => {
            let stamp = d.to_rfc3339_opts(SecondsFormat::Secs, true);
            let parsed = stamp.parse().map_err(|e| PreferenceError::Invalid {
                key: key.to_string(),
                reason: format!("cannot store date {stamp}: {e}"),
            })?;
            Value::Datetime(parsed)
        }
    };
    Ok(value)
}

fn write_atomically(path: &Path, table: &Table) -> std::io::Result<()> {
    let body = toml::to_string_pretty(table)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(body.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
