//! Errors from setting up listeners and clients.

use actmesh_types::{ConfigError, PatternError, TransportError};
use thiserror::Error;

/// Errors from the wire layer's setup paths.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Bind to {addr} failed: {reason}")]
    BindFailed { addr: String, reason: String },
}

impl From<PatternError> for WireError {
    fn from(e: PatternError) -> Self {
        Self::Config(ConfigError::Pattern(e))
    }
}
