use anyhow::Result;
use async_trait::async_trait;

use crate::form::EscrowForm;

pub mod curl;
pub mod mtls;

pub use curl::CurlTransport;
pub use mtls::MtlsTransport;

/// Delivery contract for one escrow check-in.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs (e.g., "curl", "mtls").
    fn name(&self) -> &'static str;

    /// POST `form` to `url` and return the raw response body.
    async fn send(&self, url: &str, form: &EscrowForm) -> Result<String>;
}
