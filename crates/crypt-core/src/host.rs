//! Facts about the machine, gathered through the [`CommandRunner`] so they stay testable.

use std::{cmp::Ordering, fmt, str::FromStr, sync::Arc, sync::OnceLock};

use thiserror::Error;
use tracing::debug;

use crate::command::{CommandError, CommandRunner};

pub const IOREG: &str = "/usr/sbin/ioreg";
pub const STAT: &str = "/usr/bin/stat";
pub const SW_VERS: &str = "/usr/bin/sw_vers";
pub const SCUTIL: &str = "/usr/sbin/scutil";
pub const FDESETUP: &str = "/usr/bin/fdesetup";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("could not parse {what} from {output:?}")]
    Parse { what: &'static str, output: String },
}

/// Dotted numeric OS version such as `10.12.5` or `14`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsVersion(Vec<u64>);

impl OsVersion {
    pub fn new(parts: &[u64]) -> Self {
        Self(parts.to_vec())
    }

    fn component(&self, idx: usize) -> u64 {
        self.0.get(idx).copied().unwrap_or(0)
    }
}

impl FromStr for OsVersion {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts = trimmed
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| HostError::Parse {
                what: "OS version",
                output: trimmed.to_string(),
            })?;
        if parts.is_empty() {
            return Err(HostError::Parse {
                what: "OS version",
                output: trimmed.to_string(),
            });
        }
        Ok(Self(parts))
    }
}

impl Ord for OsVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for OsVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&joined.join("."))
    }
}

/// System queries shared by the record stores and the escrow engine.
///
/// The hardware serial never changes while the process runs, so it is looked up once and
/// cached on this value rather than in a global.
pub struct Host {
    runner: Arc<dyn CommandRunner>,
    serial: OnceLock<String>,
}

impl Host {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            serial: OnceLock::new(),
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub async fn serial_number(&self) -> Result<String, HostError> {
        if let Some(serial) = self.serial.get() {
            return Ok(serial.clone());
        }
        let out = self
            .runner
            .run_checked(IOREG, &["-c", "IOPlatformExpertDevice", "-d", "2"])
            .await?;
        let serial = parse_ioreg_serial(&out).ok_or_else(|| HostError::Parse {
            what: "serial number",
            output: out.clone(),
        })?;
        debug!("resolved hardware serial");
        Ok(self.serial.get_or_init(|| serial).clone())
    }

    /// Raw owner of the console; may be empty, `root`, or `loginwindow` when nobody is
    /// logged in.
    pub async fn console_user(&self) -> Result<String, HostError> {
        let out = self
            .runner
            .run_checked(STAT, &["-f", "%Su", "/dev/console"])
            .await?;
        Ok(out.trim().to_string())
    }

    /// The logged-in user, or `None` at the login window.
    pub async fn logged_in_user(&self) -> Result<Option<String>, HostError> {
        let user = self.console_user().await?;
        match user.as_str() {
            "" | "root" | "loginwindow" => Ok(None),
            _ => Ok(Some(user)),
        }
    }

    pub async fn os_version(&self) -> Result<OsVersion, HostError> {
        let out = self
            .runner
            .run_checked(SW_VERS, &["-productVersion"])
            .await?;
        out.parse()
    }

    pub async fn computer_name(&self) -> Result<String, HostError> {
        let out = self
            .runner
            .run_checked(SCUTIL, &["--get", "ComputerName"])
            .await?;
        Ok(out.trim().to_string())
    }

    /// Accounts enrolled in FileVault, in the order `fdesetup list` reports them.
    pub async fn filevault_users(&self) -> Result<Vec<String>, HostError> {
        let out = self.runner.run_checked(FDESETUP, &["list"]).await?;
        Ok(parse_fdesetup_list(&out))
    }
}

fn parse_ioreg_serial(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("\"IOPlatformSerialNumber\""))
        .and_then(|line| line.split('=').nth(1))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|serial| !serial.is_empty())
}

fn parse_fdesetup_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split(',').next())
        .map(|user| user.trim().to_string())
        .filter(|user| !user.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, ScriptedRunner};

    const IOREG_OUTPUT: &str = r#"+-o Root  <class IORegistryEntry, id 0x100000100, retain 32>
  +-o J314sAP  <class IOPlatformExpertDevice, id 0x10000020f, registered>
      {
        "IOPlatformUUID" = "0A1B2C3D-0000-1111-2222-333344445555"
        "IOPlatformSerialNumber" = "C02XYZ123ABC"
        "manufacturer" = <"Apple Inc.">
      }
"#;

    #[test]
    fn versions_compare_numerically_with_padding() {
        let threshold = OsVersion::new(&[10, 12, 5]);
        assert!("10.12.4".parse::<OsVersion>().unwrap() < threshold);
        assert!("10.9".parse::<OsVersion>().unwrap() < threshold);
        assert!("10.12.5".parse::<OsVersion>().unwrap() == threshold);
        assert!("10.13".parse::<OsVersion>().unwrap() > threshold);
        assert!("14".parse::<OsVersion>().unwrap() > threshold);
        assert_eq!(OsVersion::new(&[14, 0]).cmp(&OsVersion::new(&[14])), Ordering::Equal);
    }

    #[test]
    fn rejects_non_numeric_versions() {
        assert!("fourteen".parse::<OsVersion>().is_err());
        assert!("".parse::<OsVersion>().is_err());
    }

    #[tokio::test]
    async fn serial_is_parsed_and_cached() {
        let runner = ScriptedRunner::new().respond(
            IOREG,
            &[],
            CommandOutput::success(IOREG_OUTPUT),
        );
        let host = Host::new(Arc::new(runner.clone()));

        assert_eq!(host.serial_number().await.unwrap(), "C02XYZ123ABC");
        assert_eq!(host.serial_number().await.unwrap(), "C02XYZ123ABC");
        assert_eq!(runner.calls_to(IOREG).len(), 1);
    }

    #[tokio::test]
    async fn login_window_has_no_logged_in_user() {
        for owner in ["root\n", "", "loginwindow"] {
            let runner = ScriptedRunner::new().respond(STAT, &[], CommandOutput::success(owner));
            let host = Host::new(Arc::new(runner));
            assert_eq!(host.logged_in_user().await.unwrap(), None);
        }

        let runner = ScriptedRunner::new().respond(STAT, &[], CommandOutput::success("alice\n"));
        let host = Host::new(Arc::new(runner));
        assert_eq!(host.logged_in_user().await.unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn computer_name_is_trimmed() {
        let runner =
            ScriptedRunner::new().respond(SCUTIL, &["--get"], CommandOutput::success("Mac1\n"));
        let host = Host::new(Arc::new(runner));
        assert_eq!(host.computer_name().await.unwrap(), "Mac1");
    }

    #[test]
    fn fdesetup_list_yields_user_names() {
        let users = parse_fdesetup_list(
            "test_user1,19F18F252-781C-4754-820D-C49346C386C4\ntest_user2,4A4E62FE-D022-4964-A3B7-CF4CE0C91650\n",
        );
        assert_eq!(users, vec!["test_user1", "test_user2"]);
        assert!(parse_fdesetup_list("").is_empty());
    }
}
