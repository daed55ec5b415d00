//! Core abstractions for Crypt: the escrow record, configuration access, and the
//! collaborator contracts (commands, secret storage, record storage, client identity).
//! This crate is intentionally small to keep dependency surface minimal.

pub mod command;
pub mod host;
pub mod identity;
pub mod mechanisms;
pub mod prefs;
pub mod record;
pub mod storage;
