//! In-process mesh node used by the integration tests.
//!
//! A [`Node`] has a table of local handlers, any number of listeners, and a
//! list of pinned clients. Inbound calls run a matching local handler,
//! otherwise they are forwarded through the first client that handles the
//! pattern, carrying the inbound trace.

#![allow(dead_code)]

use actmesh_types::{
    ActionError, AppError, ClientConfig, Failure, InstanceId, ListenConfig, Pattern, TransportConfig,
    TransportKind,
};
use actmesh_wire::{Client, InboundCall, Listener, LocalDispatch, TransportContext};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub type Handler = Arc<dyn Fn(&Pattern, &Map<String, Value>) -> Result<Value, AppError> + Send + Sync>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Settings with a short sweep so timeout tests stay quick.
pub fn settings() -> TransportConfig {
    TransportConfig {
        timeout_ms: 5_000,
        sweep_interval_ms: 10,
        ..TransportConfig::default()
    }
}

pub fn pattern(text: &str) -> Pattern {
    Pattern::parse(text).unwrap()
}

pub fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => panic!("args must be an object, got {other}"),
    }
}

/// Look a field up in the pattern, then in the args, as plain text.
pub fn field(pattern: &Pattern, args: &Map<String, Value>, key: &str) -> String {
    match pattern.get(key).or_else(|| args.get(key)) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

pub struct Node {
    pub name: String,
    pub context: TransportContext,
    handlers: RwLock<Vec<(Pattern, Handler)>>,
    clients: RwLock<Vec<Arc<Client>>>,
    listeners: Mutex<Vec<Arc<Listener>>>,
    calls: Mutex<HashMap<String, usize>>,
    inbound: AtomicUsize,
    forwarded: AtomicUsize,
}

impl Node {
    pub fn new(name: &str, settings: TransportConfig) -> Arc<Self> {
        let context = TransportContext::new(InstanceId::generate(name), settings).unwrap();
        Arc::new(Self {
            name: name.to_string(),
            context,
            handlers: RwLock::new(Vec::new()),
            clients: RwLock::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            inbound: AtomicUsize::new(0),
            forwarded: AtomicUsize::new(0),
        })
    }

    pub fn instance(&self) -> &InstanceId {
        self.context.instance()
    }

    /// Register a local handler for `pin`.
    pub fn add<F>(&self, pin: &str, handler: F)
    where
        F: Fn(&Pattern, &Map<String, Value>) -> Result<Value, AppError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap()
            .push((pattern(pin), Arc::new(handler)));
    }

    /// Times the local handler registered for `pin` ran.
    pub fn calls(&self, pin: &str) -> usize {
        let key = pattern(pin).to_string();
        self.calls.lock().unwrap().get(&key).copied().unwrap_or(0)
    }

    /// Calls admitted by this node's listeners.
    pub fn inbound(&self) -> usize {
        self.inbound.load(Ordering::SeqCst)
    }

    /// Inbound calls sent onward through a client.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }

    pub async fn listen(self: &Arc<Self>, kind: TransportKind) -> u16 {
        self.listen_with(listen_config(kind)).await
    }

    pub async fn listen_with(self: &Arc<Self>, config: ListenConfig) -> u16 {
        let dispatch: Arc<dyn LocalDispatch> = Arc::clone(self) as Arc<dyn LocalDispatch>;
        let listener = actmesh_wire::listen(config, &self.context, dispatch)
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        self.listeners.lock().unwrap().push(Arc::new(listener));
        port
    }

    pub fn listener(&self, index: usize) -> Arc<Listener> {
        Arc::clone(&self.listeners.lock().unwrap()[index])
    }

    pub async fn client(&self, kind: TransportKind, port: u16, pins: &[&str]) -> Arc<Client> {
        let mut config = client_config(kind, port);
        for pin in pins {
            config = config.with_pin(*pin);
        }
        self.client_with(config).await
    }

    pub async fn client_with(&self, config: ClientConfig) -> Arc<Client> {
        let client = Arc::new(
            actmesh_wire::client(config, &self.context)
                .await
                .unwrap(),
        );
        self.clients.write().unwrap().push(Arc::clone(&client));
        client
    }

    fn local_handler(&self, pattern: &Pattern) -> Option<(Pattern, Handler)> {
        self.handlers
            .read()
            .unwrap()
            .iter()
            .find(|(pin, _)| pattern.matches(pin))
            .map(|(pin, h)| (pin.clone(), Arc::clone(h)))
    }

    fn client_for(&self, pattern: &Pattern) -> Option<Arc<Client>> {
        self.clients
            .read()
            .unwrap()
            .iter()
            .find(|c| c.handles(pattern))
            .cloned()
    }

    fn run_local(
        &self,
        pin: &Pattern,
        handler: &Handler,
        pattern: &Pattern,
        args: &Map<String, Value>,
    ) -> Result<Value, AppError> {
        *self.calls.lock().unwrap().entry(pin.to_string()).or_insert(0) += 1;
        handler(pattern, args)
    }

    /// Run locally if a handler matches, otherwise send to a remote peer.
    pub async fn act(&self, text: &str, args: Value) -> Result<Value, ActionError> {
        let pattern = pattern(text);
        let args = self::args(args);
        if let Some((pin, handler)) = self.local_handler(&pattern) {
            return self
                .run_local(&pin, &handler, &pattern, &args)
                .map_err(|e| {
                    let failure = Failure::App {
                        message: e.message,
                        retryable: e.retryable,
                    };
                    ActionError::new(pattern, failure)
                });
        }
        self.remote(text, Value::Object(args)).await
    }

    /// Send to a remote peer even if a local handler exists.
    pub async fn remote(&self, text: &str, args: Value) -> Result<Value, ActionError> {
        let pattern = pattern(text);
        let client = self
            .client_for(&pattern)
            .unwrap_or_else(|| panic!("{}: no client for {text}", self.name));
        client.dispatch(pattern, self::args(args)).await
    }

    pub async fn close(&self) {
        let clients: Vec<Arc<Client>> = self.clients.write().unwrap().drain(..).collect();
        for client in clients {
            let _ = client.close().await;
        }
        let listeners: Vec<Arc<Listener>> = self.listeners.lock().unwrap().drain(..).collect();
        for listener in listeners {
            let _ = listener.close().await;
        }
    }
}

#[async_trait]
impl LocalDispatch for Node {
    async fn dispatch(&self, call: InboundCall) -> Result<Value, AppError> {
        self.inbound.fetch_add(1, Ordering::SeqCst);
        if let Some(ms) = call.args.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        if let Some((pin, handler)) = self.local_handler(&call.pattern) {
            return self.run_local(&pin, &handler, &call.pattern, &call.args);
        }

        match self.client_for(&call.pattern) {
            Some(client) => {
                self.forwarded.fetch_add(1, Ordering::SeqCst);
                client
                    .forward(call.pattern, call.args, &call.trace)
                    .await
                    .map_err(AppError::from)
            }
            None => Err(AppError::new(format!(
                "{}: no handler for {}",
                self.name, call.pattern
            ))),
        }
    }
}

pub fn listen_config(kind: TransportKind) -> ListenConfig {
    let config = match kind {
        TransportKind::Tcp => ListenConfig::tcp(0),
        TransportKind::Http => ListenConfig::http(0),
    };
    config.with_host("127.0.0.1")
}

pub fn client_config(kind: TransportKind, port: u16) -> ClientConfig {
    match kind {
        TransportKind::Tcp => ClientConfig::tcp(port),
        TransportKind::Http => ClientConfig::http(port),
    }
}

/// A port with nothing listening on it.
pub async fn dead_port() -> u16 {
    let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}
