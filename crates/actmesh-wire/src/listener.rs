//! Listener: accepts inbound requests over TCP or HTTP, runs the loop
//! guard, and hands admitted requests to the local dispatch layer.
//!
//! Both transports share one [`RequestHandler`]; they differ only in how
//! envelopes arrive and leave. On TCP every frame is handled in its own
//! task so a slow handler never blocks later frames on the same
//! connection, and responses are written back in completion order.

use crate::codec::{self, FrameError};
use crate::context::TransportContext;
use crate::dispatch::{InboundCall, LocalDispatch};
use crate::error::WireError;
use crate::loop_guard::{LoopGuard, Verdict};
use actmesh_types::{
    CloseError, DecodeError, Envelope, EnvelopeKind, ErrorCode, ErrorInfo, Failure, InstanceId,
    ListenConfig, Pattern, PinSet, Trace, TransportError, TransportKind,
};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures::FutureExt;
use serde_json::Map;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// How long a drained listener waits for its server task to exit before
/// aborting it.
const SERVER_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Binding,
    Ready,
    Closing,
    Closed,
}

/// Transport-independent request processing.
struct RequestHandler {
    local: InstanceId,
    guard: LoopGuard,
    pins: PinSet,
    dispatch: Arc<dyn LocalDispatch>,
    active: AtomicUsize,
    idle: Notify,
    closing: AtomicBool,
}

/// Marks one request in flight for the lifetime of the value.
struct ActiveRequest<'a>(&'a RequestHandler);

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl RequestHandler {
    fn enter(&self) -> ActiveRequest<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveRequest(self)
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Decode and handle one payload. Always yields a response envelope.
    async fn handle_bytes(&self, body: &[u8]) -> Envelope {
        match codec::decode(body) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => {
                let correlation_id = codec::salvage_correlation_id(body).unwrap_or_default();
                warn!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Malformed request"
                );
                let trace = Trace::start(&self.local);
                Envelope::request(correlation_id, &trace, Pattern::new(), Map::new())
                    .respond(&trace, Err(Failure::Decode(e).to_error_info()))
            }
        }
    }

    async fn handle(&self, mut envelope: Envelope) -> Envelope {
        let trace = envelope.trace().extended(&self.local);

        if !envelope.is_request() {
            warn!(
                correlation_id = %envelope.correlation_id,
                kind = ?envelope.kind,
                "Listener received a non-request envelope"
            );
            let failure = Failure::Decode(DecodeError::new("expected a request envelope"));
            return envelope.respond(&trace, Err(failure.to_error_info()));
        }

        if self.closing.load(Ordering::SeqCst) {
            let failure = Failure::Transport(TransportError::Closed);
            return envelope.respond(&trace, Err(failure.to_error_info()));
        }

        match self.guard.inspect(&envelope) {
            Verdict::Accept => {}
            Verdict::Warn(violations) => {
                for violation in violations {
                    warn!(
                        correlation_id = %envelope.correlation_id,
                        origin = %envelope.instance_id,
                        hops = envelope.path.len(),
                        %violation,
                        "Processing request despite routing violation"
                    );
                }
            }
            Verdict::Reject(violation) => {
                let failure = self.guard.failure(violation, &envelope);
                warn!(
                    correlation_id = %envelope.correlation_id,
                    origin = %envelope.instance_id,
                    %violation,
                    "Rejected request: {failure}"
                );
                return envelope.respond(&trace, Err(failure.to_error_info()));
            }
        }

        if !self.pins.matches(&envelope.pattern) {
            debug!(pattern = %envelope.pattern, "Pattern not exposed by this listener");
            let info = ErrorInfo::app(format!(
                "Action {} is not exposed by this listener",
                envelope.pattern
            ));
            return envelope.respond(&trace, Err(info));
        }

        let call = InboundCall {
            pattern: envelope.pattern.clone(),
            args: std::mem::take(&mut envelope.args),
            trace: trace.clone(),
        };
        debug!(
            correlation_id = %envelope.correlation_id,
            pattern = %call.pattern,
            "Dispatching inbound request"
        );

        let outcome = match AssertUnwindSafe(self.dispatch.dispatch(call))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(app)) => Err(app.into_error_info()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    correlation_id = %envelope.correlation_id,
                    pattern = %envelope.pattern,
                    "Action handler panicked: {message}"
                );
                Err(ErrorInfo::app(format!("handler panicked: {message}")))
            }
        };
        envelope.respond(&trace, outcome)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// An inbound endpoint bound to one address.
pub struct Listener {
    config: ListenConfig,
    handler: Arc<RequestHandler>,
    max_frame_bytes: u32,
    close_grace: Duration,
    state: watch::Sender<ListenerState>,
    shutdown: watch::Sender<bool>,
    server: Mutex<Option<JoinHandle<()>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl Listener {
    pub fn new(
        config: ListenConfig,
        context: &TransportContext,
        dispatch: Arc<dyn LocalDispatch>,
    ) -> Result<Self, WireError> {
        let settings = context.settings();
        let handler = RequestHandler {
            local: context.instance().clone(),
            guard: LoopGuard::new(context.instance().clone(), &settings.check, &settings.warn),
            pins: config.pins()?,
            dispatch,
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            closing: AtomicBool::new(false),
        };
        Ok(Self {
            config,
            handler: Arc::new(handler),
            max_frame_bytes: settings.max_frame_bytes,
            close_grace: settings.close_grace(),
            state: watch::channel(ListenerState::Created).0,
            shutdown: watch::channel(false).0,
            server: Mutex::new(None),
            local_addr: OnceLock::new(),
        })
    }

    /// Bind and start serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, WireError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ListenerState::Created {
                *state = ListenerState::Binding;
                true
            } else {
                false
            }
        });
        if !started {
            return self.local_addr().ok_or(WireError::Transport(TransportError::Closed));
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let socket = match TcpListener::bind(&addr).await {
            Ok(socket) => socket,
            Err(e) => {
                self.state.send_replace(ListenerState::Closed);
                error!(addr = %addr, error = %e, "Listener bind failed");
                return Err(WireError::BindFailed {
                    addr,
                    reason: e.to_string(),
                });
            }
        };
        let local_addr = socket.local_addr().map_err(|e| WireError::BindFailed {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
        let _ = self.local_addr.set(local_addr);

        let handler = Arc::clone(&self.handler);
        let shutdown = self.shutdown.subscribe();
        let task = match self.config.kind {
            TransportKind::Tcp => {
                tokio::spawn(serve_tcp(socket, handler, self.max_frame_bytes, shutdown))
            }
            TransportKind::Http => tokio::spawn(serve_http(
                socket,
                handler,
                self.config.path.clone(),
                self.max_frame_bytes as usize,
                shutdown,
            )),
        };
        *self.server.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        self.state.send_replace(ListenerState::Ready);
        info!(
            addr = %local_addr,
            kind = %self.config.kind,
            instance = %self.handler.local,
            "Listener ready"
        );
        Ok(local_addr)
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn kind(&self) -> TransportKind {
        self.config.kind
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Requests currently being handled.
    pub fn in_flight(&self) -> usize {
        self.handler.active()
    }

    /// Wait until the listener accepts connections.
    pub async fn ready(&self) -> Result<SocketAddr, TransportError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, ListenerState::Created | ListenerState::Binding))
            .await
            .map(|s| *s)
            .map_err(|_| TransportError::Closed)?;
        match (state, self.local_addr()) {
            (ListenerState::Ready, Some(addr)) => Ok(addr),
            _ => Err(TransportError::Closed),
        }
    }

    /// Stop accepting, let in-flight requests finish within the grace
    /// period, then abort what remains.
    pub async fn close(&self) -> Result<(), CloseError> {
        let first = self.state.send_if_modified(|state| match state {
            ListenerState::Closing | ListenerState::Closed => false,
            _ => {
                *state = ListenerState::Closing;
                true
            }
        });
        if !first {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|s| *s == ListenerState::Closed).await;
            return Ok(());
        }

        self.handler.closing.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let drained = tokio::time::timeout(self.close_grace, self.handler.wait_idle())
            .await
            .is_ok();
        let mut failures = Vec::new();
        if !drained {
            failures.push(format!(
                "{} request(s) still in flight on {} listener",
                self.handler.active(),
                self.config.kind
            ));
        }

        let task = self.server.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut task) = task {
            if !drained || tokio::time::timeout(SERVER_EXIT_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        self.state.send_replace(ListenerState::Closed);
        if failures.is_empty() {
            info!(addr = ?self.local_addr(), kind = %self.config.kind, "Listener closed");
            Ok(())
        } else {
            warn!(addr = ?self.local_addr(), failures = failures.len(), "Listener closed with requests in flight");
            Err(CloseError { failures })
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.config.kind)
            .field("local_addr", &self.local_addr())
            .field("state", &self.state())
            .finish()
    }
}

/// Create and start a listener. See [`Listener::start`].
pub async fn listen(
    config: ListenConfig,
    context: &TransportContext,
    dispatch: Arc<dyn LocalDispatch>,
) -> Result<Listener, WireError> {
    let listener = Listener::new(config, context, dispatch)?;
    listener.start().await?;
    Ok(listener)
}

async fn serve_tcp(
    socket: TcpListener,
    handler: Arc<RequestHandler>,
    max_frame_bytes: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&handler),
                        max_frame_bytes,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
        while connections.try_join_next().is_some() {}
    }
    drop(socket);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<RequestHandler>,
    max_frame_bytes: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut inflight = JoinSet::new();

    loop {
        let frame = tokio::select! {
            frame = codec::read_frame(&mut reader, max_frame_bytes) => frame,
            _ = shutdown.changed() => break,
        };
        let body = match frame {
            Ok(body) => body,
            Err(FrameError::Closed) => {
                debug!(peer = %peer, "Connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Framing error, dropping connection");
                break;
            }
        };

        let handler = Arc::clone(&handler);
        let writer = Arc::clone(&writer);
        inflight.spawn(async move {
            let _active = handler.enter();
            let response = handler.handle_bytes(&body).await;
            let frame = match codec::encode_frame(&response) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(peer = %peer, error = %e, "Failed to encode response");
                    return;
                }
            };
            let mut writer = writer.lock().await;
            if let Err(e) = codec::write_frame(&mut *writer, &frame).await {
                debug!(
                    peer = %peer,
                    correlation_id = %response.correlation_id,
                    error = %e,
                    "Response write failed"
                );
            }
        });
        while inflight.try_join_next().is_some() {}
    }

    while inflight.join_next().await.is_some() {}
}

async fn serve_http(
    socket: TcpListener,
    handler: Arc<RequestHandler>,
    path: String,
    max_body_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let route = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };
    let app = axum::Router::new()
        .route(&route, post(handle_http))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(handler);

    let server = axum::serve(socket, app).with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    if let Err(e) = server.await {
        error!(error = %e, "HTTP listener failed");
    }
    debug!(route = %route, "HTTP listener stopped");
}

async fn handle_http(State(handler): State<Arc<RequestHandler>>, body: Bytes) -> Response {
    let _active = handler.enter();
    let response = handler.handle_bytes(&body).await;
    let status = match (response.kind, response.error_info.as_ref().map(|i| i.code)) {
        (EnvelopeKind::ResponseOk, _) => StatusCode::OK,
        (_, Some(ErrorCode::Decode)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    match codec::encode(&response) {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
