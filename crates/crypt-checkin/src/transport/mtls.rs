use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use crypt_core::identity::{ClientIdentity, ClientIdentityProvider, IdentityError};
use reqwest::StatusCode;
use rustls::{
    client::ResolvesClientCert, sign::CertifiedKey, ClientConfig, RootCertStore, SignatureScheme,
};
use tracing::{info, instrument, warn};

use super::Transport;
use crate::{error::CheckinError, form::EscrowForm};

/// Sends the check-in over HTTPS, presenting a client certificate looked up by common name.
///
/// Each call builds its own client; the identity lives only as long as that client.
pub struct MtlsTransport {
    identities: Arc<dyn ClientIdentityProvider>,
    common_name: String,
}

impl MtlsTransport {
    pub fn new(
        identities: Arc<dyn ClientIdentityProvider>,
        common_name: impl Into<String>,
    ) -> Self {
        Self {
            identities,
            common_name: common_name.into(),
        }
    }

    async fn load_identity(&self) -> Result<ClientIdentity> {
        let identity = match self.identities.identity(&self.common_name).await {
            Ok(identity) => identity,
            Err(IdentityError::EmptyChain { common_name }) => {
                return Err(CheckinError::EmptyCertificateChain { common_name }.into())
            }
            Err(err) => return Err(err).context("failed to get client identity"),
        };
        if identity.certificate_chain.is_empty() {
            return Err(CheckinError::EmptyCertificateChain {
                common_name: self.common_name.clone(),
            }
            .into());
        }
        Ok(identity)
    }
}

#[async_trait]
impl Transport for MtlsTransport {
    fn name(&self) -> &'static str {
        "mtls"
    }

    #[instrument(skip_all, fields(transport = "mtls", url = %url, common_name = %self.common_name))]
    async fn send(&self, url: &str, form: &EscrowForm) -> Result<String> {
        let identity = self.load_identity().await?;
        let tls = client_tls_config(identity)?;

        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .build()
            .context("failed to build mTLS client")?;

        let resp = client
            .post(url)
            .form(form)
            .send()
            .await
            .context("failed to execute request")?;
        let status = resp.status();
        let body = resp.text().await.context("failed to read response")?;

        if status != StatusCode::OK {
            return Err(CheckinError::HttpStatus {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        info!("key escrow request accepted");
        Ok(body)
    }
}

/// Presents the same identity to every server that asks for one.
#[derive(Debug)]
struct IdentityResolver {
    key: Arc<CertifiedKey>,
}

impl ResolvesClientCert for IdentityResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// rustls client configuration trusting the platform roots and answering certificate
/// requests with `identity`.
pub fn client_tls_config(identity: ClientIdentity) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "skipping unreadable platform certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        warn!(added, ignored, "some platform root certificates were ignored");
    }

    let key = CertifiedKey::new(identity.certificate_chain, identity.signing_key);
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("failed to select TLS protocol versions")?
    .with_root_certificates(roots)
    .with_client_cert_resolver(Arc::new(IdentityResolver { key: Arc::new(key) }));
    Ok(config)
}
