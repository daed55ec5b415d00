use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Preference key names, as written by administrators and configuration profiles.
pub mod keys {
    pub const STORE_RECOVERY_KEY_IN_KEYCHAIN: &str = "StoreRecoveryKeyInKeychain";
    pub const MANAGE_AUTH_MECHS: &str = "ManageAuthMechs";
    pub const REMOVE_PLIST: &str = "RemovePlist";
    pub const OUTPUT_PATH: &str = "OutputPath";
    pub const ROTATE_USED_KEY: &str = "RotateUsedKey";
    pub const VALIDATE_KEY: &str = "ValidateKey";
    pub const COMMON_NAME_FOR_ESCROW: &str = "CommonNameForEscrow";
    pub const KEY_ESCROW_INTERVAL: &str = "KeyEscrowInterval";
    pub const SERVER_URL: &str = "ServerURL";
    pub const ADDITIONAL_CURL_OPTS: &str = "AdditionalCurlOpts";
    pub const SKIP_USERS: &str = "SkipUsers";
    pub const POST_RUN_COMMAND: &str = "PostRunCommand";
    pub const LAST_ESCROW: &str = "LastEscrow";
    pub const KEYCHAIN_SERVICE: &str = "KeychainService";
    pub const CLIENT_IDENTITY_DIRECTORY: &str = "ClientIdentityDirectory";
}

pub const DEFAULT_OUTPUT_PATH: &str = "/private/var/root/crypt_output.plist";
pub const DEFAULT_KEYCHAIN_SERVICE: &str = "com.grahamgilbert.crypt.recovery";
pub const DEFAULT_IDENTITY_DIRECTORY: &str = "/Library/Crypt/identities";

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefValue {
    Bool(bool),
    Int(i64),
    String(String),
    StringList(Vec<String>),
    Date(DateTime<Utc>),
}

impl PrefValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PrefValue::Bool(_) => "bool",
            PrefValue::Int(_) => "integer",
            PrefValue::String(_) => "string",
            PrefValue::StringList(_) => "string list",
            PrefValue::Date(_) => "date",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreferenceError {
    #[error("preference {key} should be a {expected}, found {found}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("preference {key} is invalid: {reason}")]
    Invalid { key: String, reason: String },
    #[error("preference storage failure: {reason}")]
    Storage { reason: String },
}

/// Built-in value for a key the administrator has not set.
pub fn default_value(key: &str) -> Option<PrefValue> {
    let value = match key {
        keys::REMOVE_PLIST => PrefValue::Bool(true),
        keys::ROTATE_USED_KEY => PrefValue::Bool(true),
        keys::VALIDATE_KEY => PrefValue::Bool(true),
        keys::STORE_RECOVERY_KEY_IN_KEYCHAIN => PrefValue::Bool(true),
        keys::OUTPUT_PATH => PrefValue::String(DEFAULT_OUTPUT_PATH.to_string()),
        keys::KEY_ESCROW_INTERVAL => PrefValue::Int(1),
        keys::ADDITIONAL_CURL_OPTS => PrefValue::StringList(Vec::new()),
        keys::SKIP_USERS => PrefValue::StringList(Vec::new()),
        keys::KEYCHAIN_SERVICE => PrefValue::String(DEFAULT_KEYCHAIN_SERVICE.to_string()),
        keys::CLIENT_IDENTITY_DIRECTORY => {
            PrefValue::String(DEFAULT_IDENTITY_DIRECTORY.to_string())
        }
        _ => return None,
    };
    Some(value)
}

/// Command to run once the record file is gone. Accepted either as a single program path
/// or as a list holding the program followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostRunCommand {
    Single(String),
    Multiple(Vec<String>),
}

impl PostRunCommand {
    /// Decode a raw preference; strings and string lists are the only accepted shapes.
    pub fn from_value(key: &str, value: PrefValue) -> Result<Self, PreferenceError> {
        match value {
            PrefValue::String(s) => Ok(PostRunCommand::Single(s)),
            PrefValue::StringList(parts) => Ok(PostRunCommand::Multiple(parts)),
            other => Err(PreferenceError::Invalid {
                key: key.to_string(),
                reason: format!(
                    "expected a string or a list of strings, found {}",
                    other.type_name()
                ),
            }),
        }
    }

    pub fn program(&self) -> &str {
        match self {
            PostRunCommand::Single(s) => s,
            PostRunCommand::Multiple(parts) => parts.first().map_or("", String::as_str),
        }
    }

    /// Arguments that precede the record path.
    pub fn args(&self) -> &[String] {
        match self {
            PostRunCommand::Single(_) => &[],
            PostRunCommand::Multiple(parts) => parts.get(1..).unwrap_or_default(),
        }
    }
}

/// Typed access to the agent's configuration.
///
/// Implementations apply [`default_value`] for unset keys. Keys without a default read as
/// `false`, `0`, `""`, an empty list, or `None`; a value of the wrong type is an error.
pub trait Preferences: Send + Sync {
    /// Raw value for `key`, defaults applied.
    fn get(&self, key: &str) -> Result<Option<PrefValue>, PreferenceError>;

    /// Persist `value` under `key`.
    fn set(&self, key: &str, value: PrefValue) -> Result<(), PreferenceError>;

    fn get_bool(&self, key: &str) -> Result<bool, PreferenceError> {
        match self.get(key)? {
            None => Ok(false),
            Some(PrefValue::Bool(b)) => Ok(b),
            Some(other) => Err(wrong_type(key, "bool", &other)),
        }
    }

    fn get_int(&self, key: &str) -> Result<i64, PreferenceError> {
        match self.get(key)? {
            None => Ok(0),
            Some(PrefValue::Int(i)) => Ok(i),
            Some(other) => Err(wrong_type(key, "integer", &other)),
        }
    }

    fn get_string(&self, key: &str) -> Result<String, PreferenceError> {
        match self.get(key)? {
            None => Ok(String::new()),
            Some(PrefValue::String(s)) => Ok(s),
            Some(other) => Err(wrong_type(key, "string", &other)),
        }
    }

    fn get_string_list(&self, key: &str) -> Result<Vec<String>, PreferenceError> {
        match self.get(key)? {
            None => Ok(Vec::new()),
            Some(PrefValue::StringList(list)) => Ok(list),
            Some(other) => Err(wrong_type(key, "string list", &other)),
        }
    }

    fn get_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, PreferenceError> {
        match self.get(key)? {
            None => Ok(None),
            Some(PrefValue::Date(d)) => Ok(Some(d)),
            Some(other) => Err(wrong_type(key, "date", &other)),
        }
    }

    /// `None` when unset or set to an empty command.
    fn get_post_run_command(&self) -> Result<Option<PostRunCommand>, PreferenceError> {
        let Some(raw) = self.get(keys::POST_RUN_COMMAND)? else {
            return Ok(None);
        };
        let command = PostRunCommand::from_value(keys::POST_RUN_COMMAND, raw)?;
        if command.program().trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(command))
    }
}

fn wrong_type(key: &str, expected: &'static str, found: &PrefValue) -> PreferenceError {
    PreferenceError::WrongType {
        key: key.to_string(),
        expected,
        found: found.type_name(),
    }
}

/// Preferences held in memory; used by tests and as an override layer.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPreferences {
    inner: Arc<Mutex<HashMap<String, PrefValue>>>,
}

impl InMemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter for test fixtures.
    pub fn with(self, key: &str, value: PrefValue) -> Self {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Value explicitly stored under `key`, ignoring defaults.
    pub fn stored(&self, key: &str) -> Option<PrefValue> {
        self.inner.lock().ok().and_then(|map| map.get(key).cloned())
    }
}

impl Preferences for InMemoryPreferences {
    fn get(&self, key: &str) -> Result<Option<PrefValue>, PreferenceError> {
        let map = self.inner.lock().map_err(|err| PreferenceError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        Ok(map.get(key).cloned().or_else(|| default_value(key)))
    }

    fn set(&self, key: &str, value: PrefValue) -> Result<(), PreferenceError> {
        let mut map = self.inner.lock().map_err(|err| PreferenceError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        map.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_unset_keys() {
        let prefs = InMemoryPreferences::new();
        assert!(prefs.get_bool(keys::REMOVE_PLIST).unwrap());
        assert!(prefs.get_bool(keys::ROTATE_USED_KEY).unwrap());
        assert_eq!(prefs.get_int(keys::KEY_ESCROW_INTERVAL).unwrap(), 1);
        assert_eq!(
            prefs.get_string(keys::OUTPUT_PATH).unwrap(),
            DEFAULT_OUTPUT_PATH
        );
        assert!(!prefs.get_bool(keys::MANAGE_AUTH_MECHS).unwrap());
        assert_eq!(prefs.get_string(keys::COMMON_NAME_FOR_ESCROW).unwrap(), "");
        assert!(prefs.get_date(keys::LAST_ESCROW).unwrap().is_none());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let prefs = InMemoryPreferences::new().with(keys::REMOVE_PLIST, PrefValue::Bool(false));
        assert!(!prefs.get_bool(keys::REMOVE_PLIST).unwrap());
    }

    #[test]
    fn wrong_type_is_a_read_failure() {
        let prefs =
            InMemoryPreferences::new().with(keys::VALIDATE_KEY, PrefValue::String("yes".into()));
        let err = prefs.get_bool(keys::VALIDATE_KEY).expect_err("string is not a bool");
        assert!(matches!(err, PreferenceError::WrongType { expected: "bool", .. }));
    }

    #[test]
    fn post_run_command_accepts_string_or_list() {
        let single = InMemoryPreferences::new().with(
            keys::POST_RUN_COMMAND,
            PrefValue::String("/usr/local/bin/notify".into()),
        );
        assert_eq!(
            single.get_post_run_command().unwrap(),
            Some(PostRunCommand::Single("/usr/local/bin/notify".into()))
        );

        let list = InMemoryPreferences::new().with(
            keys::POST_RUN_COMMAND,
            PrefValue::StringList(vec!["test".into(), "command".into()]),
        );
        let command = list.get_post_run_command().unwrap().expect("configured");
        assert_eq!(command.program(), "test");
        assert_eq!(command.args(), ["command".to_string()]);
    }

    #[test]
    fn post_run_command_rejects_other_shapes() {
        let prefs = InMemoryPreferences::new().with(keys::POST_RUN_COMMAND, PrefValue::Int(3));
        let err = prefs.get_post_run_command().expect_err("integer is not a command");
        assert!(matches!(err, PreferenceError::Invalid { .. }));
    }

    #[test]
    fn unset_or_blank_post_run_command_is_none() {
        assert_eq!(InMemoryPreferences::new().get_post_run_command().unwrap(), None);
        let blank =
            InMemoryPreferences::new().with(keys::POST_RUN_COMMAND, PrefValue::String("  ".into()));
        assert_eq!(blank.get_post_run_command().unwrap(), None);
        let empty = InMemoryPreferences::new()
            .with(keys::POST_RUN_COMMAND, PrefValue::StringList(Vec::new()));
        assert_eq!(empty.get_post_run_command().unwrap(), None);
    }
}
