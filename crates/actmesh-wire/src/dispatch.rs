//! The seam between the transport and the local dispatch layer.
//!
//! The listener hands every admitted request to a [`LocalDispatch`]
//! implementation owned by the host process. That implementation resolves
//! the pattern to a handler, or forwards it onward through a
//! [`crate::client::Client`] using the call's [`Trace`].

use actmesh_types::{AppError, Pattern, Trace};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;

/// A request admitted by a listener.
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub pattern: Pattern,
    pub args: Map<String, Value>,
    /// Origin and path, already extended with the local instance.
    pub trace: Trace,
}

/// Trait for the host process to execute inbound actions.
#[async_trait]
pub trait LocalDispatch: Send + Sync + 'static {
    /// Run the action and report its result or application error.
    async fn dispatch(&self, call: InboundCall) -> Result<Value, AppError>;
}

/// Adapter turning an async closure into a [`LocalDispatch`].
pub struct FnDispatch<F>(F);

/// Wrap `f` as a [`LocalDispatch`].
pub fn dispatch_fn<F, Fut>(f: F) -> FnDispatch<F>
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
{
    FnDispatch(f)
}

#[async_trait]
impl<F, Fut> LocalDispatch for FnDispatch<F>
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
{
    async fn dispatch(&self, call: InboundCall) -> Result<Value, AppError> {
        (self.0)(call).await
    }
}
