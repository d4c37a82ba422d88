//! Core types for the actmesh action transport.
//!
//! This crate defines the data shared by every actmesh component: the wire
//! [`envelope::Envelope`], action [`pattern::Pattern`]s and pin sets, the
//! error taxonomy, and the transport configuration. It performs no I/O.

pub mod config;
pub mod envelope;
pub mod error;
pub mod pattern;
pub mod serde_compat;

pub use config::{CheckConfig, ClientConfig, ListenConfig, TransportConfig, TransportKind, WarnConfig};
pub use envelope::{Envelope, EnvelopeKind, ErrorCode, ErrorInfo, InstanceId, Trace};
pub use error::{
    ActionError, AppError, CloseError, ConfigError, CorrelationError, DecodeError, Failure,
    PatternError, TransportError, ERROR_NAMESPACE,
};
pub use pattern::{Pattern, PinSet};
