use async_trait::async_trait;
use thiserror::Error;

use crate::command::CommandError;

#[derive(Debug, Error)]
pub enum MechanismError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("authorization database is malformed: {reason}")]
    Malformed { reason: String },
    #[error("login mechanisms are not set correctly")]
    Missing,
}

/// Keeps the login authorization mechanisms in the state the agent expects.
#[async_trait]
pub trait MechanismEnsurer: Send + Sync {
    /// Install the mechanisms if they are missing or misplaced.
    async fn ensure(&self) -> Result<(), MechanismError>;
}
