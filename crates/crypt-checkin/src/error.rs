use thiserror::Error;

/// Failures specific to the escrow workflow. Wrapped in `anyhow` context at each stage.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckinError {
    #[error("ServerURL is not configured")]
    MissingServerUrl,
    #[error("recovery key is empty")]
    EmptyRecoveryKey,
    #[error("recovery key could not be validated: {output}")]
    AmbiguousValidation { output: String },
    #[error("curl failed with status {status:?}: stdout: {stdout} stderr: {stderr}")]
    Curl {
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("server returned non-200 status: {status}, body: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("no certificates found in chain for {common_name}")]
    EmptyCertificateChain { common_name: String },
}
