use std::fmt;

use crypt_core::record::EscrowRecord;
use serde::Serialize;

use crate::error::CheckinError;

/// Form body posted to the check-in endpoint.
#[derive(Clone, Serialize, PartialEq, Eq)]
pub struct EscrowForm {
    pub serial: String,
    pub recovery_password: String,
    pub username: String,
    pub macname: String,
}

impl EscrowForm {
    pub fn new(record: &EscrowRecord, computer_name: impl Into<String>) -> Self {
        Self {
            serial: record.serial_number.clone(),
            recovery_password: record.recovery_key.clone(),
            username: record.enabled_user.clone(),
            macname: computer_name.into(),
        }
    }

    /// `application/x-www-form-urlencoded` encoding of the four fields.
    pub fn encode(&self) -> Result<String, serde_urlencoded::ser::Error> {
        serde_urlencoded::to_string(self)
    }
}

impl fmt::Debug for EscrowForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowForm")
            .field("serial", &self.serial)
            .field("recovery_password", &"<redacted>")
            .field("username", &self.username)
            .field("macname", &self.macname)
            .finish()
    }
}

/// `<server>/checkin/`, adding the separating slash only when it is missing.
pub fn checkin_url(server_url: &str) -> Result<String, CheckinError> {
    let server_url = server_url.trim();
    if server_url.is_empty() {
        return Err(CheckinError::MissingServerUrl);
    }
    let base = if server_url.ends_with('/') {
        server_url.to_string()
    } else {
        format!("{server_url}/")
    };
    Ok(format!("{base}checkin/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_checkin_path() {
        assert_eq!(
            checkin_url("http://test.com").unwrap(),
            "http://test.com/checkin/"
        );
        assert_eq!(
            checkin_url("http://test.com/").unwrap(),
            "http://test.com/checkin/"
        );
        assert_eq!(
            checkin_url("https://crypt.example.org/escrow").unwrap(),
            "https://crypt.example.org/escrow/checkin/"
        );
    }

    #[test]
    fn missing_server_url_is_an_error() {
        assert_eq!(checkin_url("  "), Err(CheckinError::MissingServerUrl));
    }

    #[test]
    fn encodes_exactly_the_four_fields() {
        let record = EscrowRecord {
            serial_number: "S1".into(),
            recovery_key: "K1".into(),
            enabled_user: "U1".into(),
            ..EscrowRecord::default()
        };
        let encoded = EscrowForm::new(&record, "Mac1").encode().unwrap();

        let mut pairs: Vec<(String, String)> = serde_urlencoded::from_str(&encoded).unwrap();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("macname".to_string(), "Mac1".to_string()),
                ("recovery_password".to_string(), "K1".to_string()),
                ("serial".to_string(), "S1".to_string()),
                ("username".to_string(), "U1".to_string()),
            ]
        );
    }

    #[test]
    fn escapes_reserved_characters() {
        let record = EscrowRecord {
            serial_number: "S 1".into(),
            recovery_key: "A+B&C=D".into(),
            enabled_user: "first last".into(),
            ..EscrowRecord::default()
        };
        let encoded = EscrowForm::new(&record, "Jane's Mac").encode().unwrap();
        assert!(encoded.contains("recovery_password=A%2BB%26C%3DD"));
        assert!(!encoded.contains(' '));
    }

    #[test]
    fn debug_output_hides_the_key() {
        let record = EscrowRecord {
            recovery_key: "SECRET-KEY".into(),
            ..EscrowRecord::default()
        };
        let rendered = format!("{:?}", EscrowForm::new(&record, "Mac1"));
        assert!(!rendered.contains("SECRET-KEY"));
    }
}
