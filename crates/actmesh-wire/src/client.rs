//! Client: sends local dispatches for its pinned patterns to one remote
//! listener and waits for the correlated response.
//!
//! Each client owns its correlation table and a background sweeper that
//! fails entries past their deadline. The sweep period bounds how late a
//! timeout can fire.

use crate::connection::ConnectionManager;
use crate::context::TransportContext;
use crate::correlation::CorrelationTable;
use crate::error::WireError;
use actmesh_types::{
    ActionError, ClientConfig, CloseError, Envelope, Failure, InstanceId, Pattern, PinSet, Trace,
    TransportError, TransportKind,
};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Connecting,
    Ready,
    Closing,
    Closed,
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
    /// Continue an existing call chain instead of starting a new one.
    pub trace: Option<Trace>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// Outcome of [`Client::close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Calls still pending at close, resolved with a closed error.
    pub rejected: usize,
}

/// A connection to one remote listener, forwarding the patterns in its pin set.
pub struct Client {
    local: InstanceId,
    peer: String,
    kind: TransportKind,
    pins: PinSet,
    timeout: Duration,
    close_grace: Duration,
    table: Arc<CorrelationTable>,
    connections: ConnectionManager,
    state: watch::Sender<ClientState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Connect to the listener described by `config`.
    pub async fn connect(config: ClientConfig, context: &TransportContext) -> Result<Self, WireError> {
        let settings = context.settings();
        let pins = config.pins()?;
        let table = Arc::new(CorrelationTable::new());
        let connections = ConnectionManager::new(Arc::clone(&table), settings.max_frame_bytes);
        let (state, _) = watch::channel(ClientState::Created);

        state.send_replace(ClientState::Connecting);
        let peer = match connections.connect(&config).await {
            Ok(peer) => peer,
            Err(e) => {
                state.send_replace(ClientState::Closed);
                warn!(peer = %config.address(), kind = %config.kind, error = %e, "Client connect failed");
                return Err(e.into());
            }
        };

        let sweeper = spawn_sweeper(Arc::clone(&table), settings.sweep_interval());
        let client = Self {
            local: context.instance().clone(),
            peer,
            kind: config.kind,
            pins,
            timeout: settings.client_timeout(&config),
            close_grace: settings.close_grace(),
            table,
            connections,
            state,
            sweeper: Mutex::new(Some(sweeper)),
        };
        client.state.send_replace(ClientState::Ready);
        info!(
            peer = %client.peer,
            kind = %client.kind,
            timeout_ms = client.timeout.as_millis() as u64,
            "Client ready"
        );
        Ok(client)
    }

    pub fn local(&self) -> &InstanceId {
        &self.local
    }

    /// `host:port` of the remote listener.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn pins(&self) -> &PinSet {
        &self.pins
    }

    /// Whether this client forwards `pattern`.
    pub fn handles(&self, pattern: &Pattern) -> bool {
        self.pins.matches(pattern)
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Number of calls awaiting a response.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    /// Wait until the client is ready. Fails if it closed instead.
    pub async fn ready(&self) -> Result<(), TransportError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, ClientState::Created | ClientState::Connecting))
            .await
            .map(|s| *s)
            .map_err(|_| TransportError::Closed)?;
        if state == ClientState::Ready {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Start a new call chain at this instance.
    pub async fn dispatch(
        &self,
        pattern: Pattern,
        args: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        self.dispatch_with(pattern, args, CallOptions::default()).await
    }

    /// Continue the call chain described by `trace`, typically the trace of
    /// an inbound call being forwarded.
    pub async fn forward(
        &self,
        pattern: Pattern,
        args: Map<String, Value>,
        trace: &Trace,
    ) -> Result<Value, ActionError> {
        self.dispatch_with(pattern, args, CallOptions::default().with_trace(trace.clone()))
            .await
    }

    pub async fn dispatch_with(
        &self,
        pattern: Pattern,
        args: Map<String, Value>,
        options: CallOptions,
    ) -> Result<Value, ActionError> {
        if self.state() != ClientState::Ready {
            return Err(ActionError::new(pattern, Failure::Closed));
        }
        if !self.handles(&pattern) {
            let failure = Failure::App {
                message: format!("Action {pattern} is not pinned for peer {}", self.peer),
                retryable: false,
            };
            return Err(ActionError::new(pattern, failure));
        }

        let timeout = options.timeout.unwrap_or(self.timeout);
        let trace = options.trace.unwrap_or_else(|| Trace::start(&self.local));
        let correlation_id = uuid::Uuid::new_v4().to_string();

        let rx = match self
            .table
            .register(&correlation_id, &self.peer, &pattern, timeout)
        {
            Ok(rx) => rx,
            Err(e) => {
                let failure = Failure::App {
                    message: e.to_string(),
                    retryable: true,
                };
                return Err(ActionError::new(pattern, failure));
            }
        };

        let envelope = Envelope::request(correlation_id.clone(), &trace, pattern.clone(), args);
        debug!(
            peer = %self.peer,
            correlation_id = %correlation_id,
            pattern = %pattern,
            hops = trace.path().len(),
            "Dispatching remote action"
        );

        if let Err(e) = self.connections.send(&self.peer, envelope).await {
            warn!(peer = %self.peer, correlation_id = %correlation_id, error = %e, "Send failed");
            self.table.resolve(&correlation_id, Err(Failure::Transport(e)));
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(ActionError::new(pattern, failure)),
            Err(_) => Err(ActionError::new(pattern, Failure::Closed)),
        }
    }

    /// Close the client.
    ///
    /// New dispatches fail immediately. Pending calls get the grace period
    /// to complete, then resolve with a closed error. A second call waits
    /// for the first to finish.
    pub async fn close(&self) -> Result<CloseReport, CloseError> {
        let first = self.state.send_if_modified(|state| match state {
            ClientState::Closing | ClientState::Closed => false,
            _ => {
                *state = ClientState::Closing;
                true
            }
        });
        if !first {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|s| *s == ClientState::Closed).await;
            return Ok(CloseReport::default());
        }

        info!(peer = %self.peer, pending = self.table.len(), "Closing client");
        if !self.close_grace.is_zero()
            && tokio::time::timeout(self.close_grace, self.table.wait_drained())
                .await
                .is_err()
        {
            debug!(peer = %self.peer, "Grace period elapsed with calls pending");
        }

        let rejected = self.table.reject_all(Failure::Closed);
        let result = self.connections.close().await;
        if let Some(sweeper) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            sweeper.abort();
        }
        self.state.send_replace(ClientState::Closed);

        if rejected > 0 {
            warn!(peer = %self.peer, rejected, "Client closed with calls pending");
        } else {
            info!(peer = %self.peer, "Client closed");
        }
        result.map(|()| CloseReport { rejected })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            sweeper.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

fn spawn_sweeper(table: Arc<CorrelationTable>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            table.sweep(Instant::now());
        }
    })
}

/// Connect a client. See [`Client::connect`].
pub async fn client(config: ClientConfig, context: &TransportContext) -> Result<Client, WireError> {
    Client::connect(config, context).await
}
