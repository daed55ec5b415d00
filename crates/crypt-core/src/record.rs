use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Accounts that never own a FileVault recovery key.
pub const RESERVED_USERS: [&str; 2] = ["root", "_mbsetupuser"];

/// Persistent state for one device's recovery key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscrowRecord {
    /// Hardware serial number.
    pub serial_number: String,
    /// The recovery key itself. Never logged.
    pub recovery_key: String,
    /// Account the key was generated for.
    pub enabled_user: String,
    /// Last successful escrow; `None` means never escrowed.
    pub last_run: Option<DateTime<Utc>>,
    pub escrow_success: bool,
    pub hardware_uuid: Option<String>,
    pub enabled_date: Option<String>,
}

impl EscrowRecord {
    /// Whether the key should be sent to the server again.
    ///
    /// A record that was never escrowed is always due. Otherwise the key is due once
    /// strictly more than `interval_hours` have elapsed since the last escrow. An interval
    /// too large to represent is never reached.
    pub fn escrow_due(&self, now: DateTime<Utc>, interval_hours: i64) -> bool {
        let Some(last) = self.last_run else {
            return true;
        };
        Duration::try_hours(interval_hours)
            .and_then(|interval| now.checked_sub_signed(interval))
            .is_some_and(|threshold| last < threshold)
    }

    /// Mark a successful escrow at `now` (whole-second precision, matching the record file).
    pub fn mark_escrowed(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now.trunc_subsecs(0));
        self.escrow_success = true;
    }
}

/// Reserved accounts are never reported as the enabled user.
pub fn user_should_be_skipped(user: &str) -> bool {
    RESERVED_USERS.contains(&user)
}

/// Timestamps at or before the Unix epoch are written by installers and other tools to
/// mean "never"; collapse them to `None`.
pub fn normalize_last_run(value: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    value.filter(|ts| ts.timestamp() > 0)
}
