//! Error types for the sync core.

use thiserror::Error;

/// Errors surfaced by the pin store, protocol, and engine.
///
/// Nothing here is fatal to a running client: store failures are returned to
/// the mutating caller, protocol failures cause the offending message to be
/// dropped, and the transport retries on its own.
#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid pin: {0}")]
    InvalidPin(String),

    #[error("pin not found: {0}")]
    NotFound(String),

    #[error("malformed sync message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
