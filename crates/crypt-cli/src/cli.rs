use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface for the escrow agent. Runs a check-in when no subcommand is given.
#[derive(Parser, Debug)]
#[command(
    name = "crypt-checkin",
    about = "Escrow the FileVault recovery key and keep the escrow current",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Preferences file to use instead of the default location.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Validate, escrow, and rotate the recovery key as configured.
    Checkin,
    /// Install the Crypt login mechanisms into the authorization database.
    Install,
    /// Remove the Crypt login mechanisms from the authorization database.
    Uninstall,
    /// Exit non-zero unless the login mechanisms are in place.
    CheckAuthMechs,
    /// Print version and exit.
    Version,
}

impl Command {
    /// Everything except printing the version touches root-only state.
    pub fn requires_root(&self) -> bool {
        !matches!(self, Command::Version)
    }
}
