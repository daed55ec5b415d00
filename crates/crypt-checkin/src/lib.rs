//! Recovery-key escrow: decides whether the key needs validating or sending, sends it to
//! the escrow server, and applies server-requested rotation.

pub mod engine;
pub mod error;
pub mod form;
pub mod identity;
pub mod post_run;
pub mod rotation;
pub mod transport;
pub mod validation;

pub use engine::{EscrowEngine, EscrowOutcome, EscrowSettings};
pub use error::CheckinError;
