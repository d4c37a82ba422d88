//! actmesh transport: remote action dispatch between processes.
//!
//! A process exposes actions through [`Listener`]s and reaches remote
//! actions through [`Client`]s. Requests and responses travel as JSON
//! [`actmesh_types::Envelope`]s, either length-prefixed over a long-lived
//! TCP socket or one per HTTP POST.
//!
//! ## Architecture
//!
//! - Each [`Client`] owns a [`CorrelationTable`] mapping correlation ids to
//!   waiting callers, plus a sweeper that times out stale entries
//! - The [`ConnectionManager`] writes requests and routes responses back
//!   into the table purely by correlation id, so replies may arrive in
//!   any order
//! - Each [`Listener`] runs the [`LoopGuard`] on every inbound request
//!   before handing it to the host's [`LocalDispatch`]
//! - Forwarded calls carry their origin and hop path, which is how the
//!   guard detects own-message returns and message loops

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod correlation;
pub mod dispatch;
pub mod endpoints;
pub mod error;
pub mod listener;
pub mod loop_guard;

pub use client::{client, CallOptions, Client, ClientState, CloseReport};
pub use config::load_config;
pub use connection::ConnectionManager;
pub use context::TransportContext;
pub use correlation::{CorrelationTable, Outcome};
pub use dispatch::{dispatch_fn, FnDispatch, InboundCall, LocalDispatch};
pub use endpoints::{start_endpoints, Endpoints};
pub use error::WireError;
pub use listener::{listen, Listener, ListenerState};
pub use loop_guard::{LoopGuard, Policy, Verdict, Violation};
