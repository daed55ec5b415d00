use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crypt_core::{
    host::Host,
    identity::ClientIdentityProvider,
    mechanisms::MechanismEnsurer,
    prefs::{keys, Preferences},
    record::{user_should_be_skipped, EscrowRecord},
    storage::{RecordStore, RecordStoreError, StoreKind},
};
use tracing::{debug, info, instrument};

use crate::{
    error::CheckinError,
    form::{checkin_url, EscrowForm},
    rotation::apply_server_rotation,
    transport::{CurlTransport, MtlsTransport, Transport},
    validation::{validate_and_rotate, KeyValidation},
};

/// Which path a completed run took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowOutcome {
    /// No record exists yet; the login mechanism has not produced a key.
    NothingToEscrow,
    /// The key was escrowed within the configured interval.
    NotDue,
    /// The key was sent. `rotated` is set when the server asked for a new key and the
    /// stored one was removed.
    Escrowed { rotated: bool },
}

/// Preferences the workflow reads up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowSettings {
    pub manage_auth_mechs: bool,
    pub remove_plist: bool,
    pub rotate_used_key: bool,
    pub validate_key: bool,
    /// Empty disables mutual TLS.
    pub common_name: String,
    pub escrow_interval_hours: i64,
    pub server_url: String,
    pub additional_curl_opts: Vec<String>,
    pub skip_users: Vec<String>,
}

impl EscrowSettings {
    pub fn from_prefs(prefs: &dyn Preferences) -> Result<Self> {
        Ok(Self {
            manage_auth_mechs: prefs
                .get_bool(keys::MANAGE_AUTH_MECHS)
                .context("failed to get manage auth mechs preference")?,
            remove_plist: prefs
                .get_bool(keys::REMOVE_PLIST)
                .context("failed to get remove plist preference")?,
            rotate_used_key: prefs
                .get_bool(keys::ROTATE_USED_KEY)
                .context("failed to get rotate used key preference")?,
            validate_key: prefs
                .get_bool(keys::VALIDATE_KEY)
                .context("failed to get validate key preference")?,
            common_name: prefs
                .get_string(keys::COMMON_NAME_FOR_ESCROW)
                .context("failed to get mTLS common name for escrow")?,
            escrow_interval_hours: prefs
                .get_int(keys::KEY_ESCROW_INTERVAL)
                .context("failed to get escrow interval")?,
            server_url: prefs
                .get_string(keys::SERVER_URL)
                .context("failed to get server URL")?,
            additional_curl_opts: prefs
                .get_string_list(keys::ADDITIONAL_CURL_OPTS)
                .context("failed to get additional curl options")?,
            skip_users: prefs
                .get_string_list(keys::SKIP_USERS)
                .context("failed to get skip users")?,
        })
    }

    fn should_validate(&self) -> bool {
        self.rotate_used_key && self.validate_key && !self.remove_plist
    }
}

/// Runs one check-in: validate, load, decide, send, and keep the stored record in step
/// with what the server said.
pub struct EscrowEngine {
    host: Arc<Host>,
    prefs: Arc<dyn Preferences>,
    store: Arc<dyn RecordStore>,
    mechanisms: Arc<dyn MechanismEnsurer>,
    identities: Arc<dyn ClientIdentityProvider>,
}

impl EscrowEngine {
    pub fn new(
        host: Arc<Host>,
        prefs: Arc<dyn Preferences>,
        store: Arc<dyn RecordStore>,
        mechanisms: Arc<dyn MechanismEnsurer>,
        identities: Arc<dyn ClientIdentityProvider>,
    ) -> Self {
        Self {
            host,
            prefs,
            store,
            mechanisms,
            identities,
        }
    }

    pub async fn run_escrow(&self) -> Result<EscrowOutcome> {
        self.run_escrow_at(Utc::now()).await
    }

    #[instrument(skip_all, fields(store = ?self.store.kind()))]
    pub async fn run_escrow_at(&self, now: DateTime<Utc>) -> Result<EscrowOutcome> {
        let settings = EscrowSettings::from_prefs(self.prefs.as_ref())?;

        if settings.manage_auth_mechs {
            self.mechanisms
                .ensure()
                .await
                .context("failed to ensure auth mechs")?;
        }

        let mut rotated_invalid_key = false;
        if settings.should_validate() {
            info!("checking that current key is valid");
            let validation =
                validate_and_rotate(&self.host, self.store.as_ref(), self.prefs.as_ref())
                    .await
                    .context("failed to validate recovery key")?;
            match validation {
                KeyValidation::Skipped(reason) => debug!(reason, "key validation skipped"),
                KeyValidation::Valid => debug!("recovery key is valid"),
                KeyValidation::Rotated => {
                    info!("invalid recovery key removed");
                    rotated_invalid_key = true;
                }
            }
        }

        let Some(mut record) = self.load_record(rotated_invalid_key).await? else {
            info!(location = %self.store.location(), "no recovery key to escrow");
            return Ok(EscrowOutcome::NothingToEscrow);
        };

        if record.enabled_user.is_empty() || user_should_be_skipped(&record.enabled_user) {
            record.enabled_user = self
                .resolve_enabled_user(&settings.skip_users)
                .await
                .context("failed to get enabled user")?;
        }

        if !record.escrow_due(now, settings.escrow_interval_hours) {
            info!(
                interval_hours = settings.escrow_interval_hours,
                "escrowed within the interval, skipping"
            );
            return Ok(EscrowOutcome::NotDue);
        }

        let rotated = self
            .escrow(&record, &settings)
            .await
            .context("escrow operation failed")?;

        if !rotated {
            record.mark_escrowed(now);
            self.store
                .save(&record)
                .await
                .context("failed to save escrow record")?;
        }

        if settings.remove_plist && self.store.kind() == StoreKind::File {
            self.store
                .delete()
                .await
                .context("failed to remove record file")?;
        }

        Ok(EscrowOutcome::Escrowed { rotated })
    }

    async fn load_record(&self, rotated_invalid_key: bool) -> Result<Option<EscrowRecord>> {
        match self.store.load().await {
            Ok(record) => Ok(record),
            // The key validation just deleted the only copy.
            Err(RecordStoreError::NotFound { .. }) if rotated_invalid_key => Ok(None),
            Err(err) => Err(err).context("failed to load escrow record"),
        }
    }

    /// First FileVault user not in `skip_users`; empty when there is none.
    async fn resolve_enabled_user(&self, skip_users: &[String]) -> Result<String> {
        let users = self.host.filevault_users().await?;
        let user = users
            .into_iter()
            .find(|user| !skip_users.contains(user))
            .unwrap_or_default();
        debug!(user = %user, "resolved enabled user from FileVault users");
        Ok(user)
    }

    fn transport(&self, settings: &EscrowSettings) -> Box<dyn Transport> {
        if settings.common_name.is_empty() {
            Box::new(CurlTransport::new(
                Arc::clone(self.host.runner()),
                settings.additional_curl_opts.clone(),
            ))
        } else {
            Box::new(MtlsTransport::new(
                Arc::clone(&self.identities),
                settings.common_name.clone(),
            ))
        }
    }

    /// Send the key and apply any rotation the server asks for.
    async fn escrow(&self, record: &EscrowRecord, settings: &EscrowSettings) -> Result<bool> {
        if record.recovery_key.trim().is_empty() {
            return Err(CheckinError::EmptyRecoveryKey.into());
        }
        let url = checkin_url(&settings.server_url).context("failed to build checkin URL")?;
        let computer_name = self
            .host
            .computer_name()
            .await
            .context("failed to get computer name")?;
        let form = EscrowForm::new(record, computer_name);

        let transport = self.transport(settings);
        info!(transport = transport.name(), "attempting to escrow key");
        let body = transport.send(&url, &form).await?;
        info!("key escrow successful");

        apply_server_rotation(
            &body,
            self.prefs.as_ref(),
            self.store.as_ref(),
            self.host.runner().as_ref(),
        )
        .await
        .context("failed to apply server initiated rotation")
    }
}
