mod authmechs;
mod cli;
mod config;
mod runner;
mod storage;

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use crypt_checkin::{identity::PemIdentityProvider, EscrowEngine, EscrowOutcome};
use crypt_core::{
    command::CommandRunner,
    host::Host,
    prefs::{keys, Preferences},
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{authmechs::AuthorizationDb, config::TomlPreferences, runner::SystemRunner};

/// Entry point: parse the command line, check privileges, and dispatch.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let command = cli.command.unwrap_or(cli::Command::Checkin);
    if command.requires_root() && !running_as_root() {
        color_eyre::eyre::bail!("crypt-checkin must be run as root");
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    match command {
        cli::Command::Version => print_version(),
        cli::Command::Checkin => run_checkin(cli.config, runner).await?,
        cli::Command::Install => AuthorizationDb::new(runner).install().await?,
        cli::Command::Uninstall => AuthorizationDb::new(runner).uninstall().await?,
        cli::Command::CheckAuthMechs => check_auth_mechs(runner).await?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("crypt-checkin {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(unix)]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

async fn run_checkin(config_path: Option<PathBuf>, runner: Arc<dyn CommandRunner>) -> Result<()> {
    let prefs: Arc<dyn Preferences> = Arc::new(TomlPreferences::load(config_path)?);
    let host = Arc::new(Host::new(Arc::clone(&runner)));
    let store = storage::production_store(Arc::clone(&prefs), Arc::clone(&host))?;
    let identities = PemIdentityProvider::new(prefs.get_string(keys::CLIENT_IDENTITY_DIRECTORY)?);

    let engine = EscrowEngine::new(
        host,
        prefs,
        store,
        Arc::new(AuthorizationDb::new(runner)),
        Arc::new(identities),
    );
    let outcome = engine
        .run_escrow()
        .await
        .map_err(|e| eyre!("{e:#}"))?;
    info!("{}", describe_outcome(outcome));
    Ok(())
}

async fn check_auth_mechs(runner: Arc<dyn CommandRunner>) -> Result<()> {
    if !AuthorizationDb::new(runner).check().await? {
        return Err(crypt_core::mechanisms::MechanismError::Missing.into());
    }
    println!("Login mechanisms are in place");
    Ok(())
}

fn describe_outcome(outcome: EscrowOutcome) -> &'static str {
    match outcome {
        EscrowOutcome::NothingToEscrow => "no recovery key to escrow",
        EscrowOutcome::NotDue => "escrow not required",
        EscrowOutcome::Escrowed { rotated: false } => "recovery key escrowed",
        EscrowOutcome::Escrowed { rotated: true } => {
            "recovery key escrowed and removed for rotation"
        }
    }
}

#[cfg(test)]
mod tests {
    use crypt_core::command::{CommandOutput, ScriptedRunner};

    use super::*;

    #[test]
    fn outcomes_have_distinct_messages() {
        let messages = [
            describe_outcome(EscrowOutcome::NothingToEscrow),
            describe_outcome(EscrowOutcome::NotDue),
            describe_outcome(EscrowOutcome::Escrowed { rotated: false }),
            describe_outcome(EscrowOutcome::Escrowed { rotated: true }),
        ];
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[tokio::test]
    async fn check_auth_mechs_fails_when_missing() {
        let runner = ScriptedRunner::new().respond(
            authmechs::SECURITY,
            &["authorizationdb", "read"],
            CommandOutput::success(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>mechanisms</key><array><string>loginwindow:done</string></array></dict></plist>"#,
            ),
        );
        let err = check_auth_mechs(Arc::new(runner))
            .await
            .expect_err("mechanisms missing");
        assert!(err.to_string().contains("not set correctly"));
    }
}
