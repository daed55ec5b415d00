//! Client identity used for mutual TLS escrow.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::{pki_types::CertificateDer, sign::SigningKey};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no client identity found for common name {common_name}")]
    NotFound { common_name: String },
    #[error("client identity for {common_name} has no certificates")]
    EmptyChain { common_name: String },
    #[error("client identity for {common_name} is unusable: {reason}")]
    Invalid { common_name: String, reason: String },
}

/// A certificate chain plus a handle that can sign with the matching private key.
///
/// The key handle is released when the last clone of this value is dropped.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub certificate_chain: Vec<CertificateDer<'static>>,
    pub signing_key: Arc<dyn SigningKey>,
}

/// Looks up the identity to present for a given certificate common name.
#[async_trait]
pub trait ClientIdentityProvider: Send + Sync {
    async fn identity(&self, common_name: &str) -> Result<ClientIdentity, IdentityError>;
}
