//! Connection manager: owns the transport for each peer.
//!
//! TCP peers keep one long-lived socket. Requests are queued to a writer
//! task that owns the write half, so a frame is always written whole even
//! when its caller gives up, and a reader task resolves responses in the
//! [`CorrelationTable`] purely by correlation id. HTTP peers post one
//! envelope per exchange through a pooled `reqwest` client; the response
//! body is the response envelope. An exchange is abandoned at its call's
//! deadline.
//!
//! Every failure ends up as a resolution of the affected correlation
//! entries. Nothing is reconnected: a closed peer stays closed.

use crate::codec::{self, FrameError};
use crate::correlation::CorrelationTable;
use actmesh_types::{
    ClientConfig, CloseError, DecodeError, Envelope, Failure, TransportError, TransportKind,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// A connection to one peer.
struct PeerConnection {
    address: String,
    kind: TransportKind,
    transport: Transport,
}

enum Transport {
    Tcp(TcpPeer),
    Http(HttpPeer),
}

struct TcpPeer {
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Reader and writer tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
}

/// A framed request waiting for the writer task.
struct Outbound {
    correlation_id: String,
    frame: Vec<u8>,
}

struct HttpPeer {
    http: reqwest::Client,
    url: String,
    /// In-flight exchanges by correlation id.
    exchanges: Arc<DashMap<String, AbortHandle>>,
}

/// Owns 0..N peer connections and routes their responses into one
/// correlation table.
pub struct ConnectionManager {
    table: Arc<CorrelationTable>,
    max_frame_bytes: u32,
    peers: RwLock<HashMap<String, Arc<PeerConnection>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(table: Arc<CorrelationTable>, max_frame_bytes: u32) -> Self {
        Self {
            table,
            max_frame_bytes,
            peers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Set up the transport for the peer described by `config`.
    ///
    /// TCP connects immediately. HTTP only prepares a pooled client; connect
    /// failures surface on each send.
    pub async fn connect(&self, config: &ClientConfig) -> Result<String, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let address = config.address();

        let transport = match config.kind {
            TransportKind::Tcp => {
                info!(peer = %address, "Connecting over TCP");
                let stream = TcpStream::connect(&address).await.map_err(|e| {
                    TransportError::ConnectFailed {
                        addr: address.clone(),
                        reason: e.to_string(),
                    }
                })?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %address, error = %e, "Failed to set TCP_NODELAY");
                }
                let (reader, writer) = stream.into_split();
                let alive = Arc::new(AtomicBool::new(true));
                let (outbound, queue) = mpsc::unbounded_channel();
                let reader = tokio::spawn(read_responses(
                    reader,
                    address.clone(),
                    Arc::clone(&self.table),
                    self.max_frame_bytes,
                    Arc::clone(&alive),
                ));
                let writer = tokio::spawn(write_requests(
                    writer,
                    queue,
                    address.clone(),
                    Arc::clone(&self.table),
                    Arc::clone(&alive),
                ));
                Transport::Tcp(TcpPeer {
                    outbound,
                    tasks: Mutex::new(vec![reader, writer]),
                    alive,
                })
            }
            TransportKind::Http => {
                let http = reqwest::Client::builder()
                    .no_proxy()
                    .pool_max_idle_per_host(8)
                    .build()
                    .map_err(|e| TransportError::ConnectFailed {
                        addr: address.clone(),
                        reason: e.to_string(),
                    })?;
                let url = format!("http://{}{}", address, normalize_path(&config.path));
                info!(peer = %address, url = %url, "Prepared HTTP transport");
                Transport::Http(HttpPeer {
                    http,
                    url,
                    exchanges: Arc::new(DashMap::new()),
                })
            }
        };

        let peer = Arc::new(PeerConnection {
            address: address.clone(),
            kind: config.kind,
            transport,
        });
        let previous = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.clone(), peer);
        if let Some(old) = previous {
            warn!(peer = %address, "Replacing existing connection");
            self.release(&old).await;
        }
        Ok(address)
    }

    /// Send a request envelope to `peer`. The response is delivered through
    /// the correlation table, not through this call.
    ///
    /// The request must already be registered in the table. This never
    /// waits on the network: TCP frames are queued, HTTP exchanges spawned.
    /// A request over `max_frame_bytes` fails here and leaves the
    /// connection usable.
    pub async fn send(&self, peer: &str, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let connection = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::ConnectFailed {
                addr: peer.to_string(),
                reason: "not connected".to_string(),
            })?;

        match &connection.transport {
            Transport::Tcp(tcp) => {
                if !tcp.alive.load(Ordering::SeqCst) {
                    return Err(TransportError::PeerClosed);
                }
                let frame =
                    codec::encode_frame(&envelope).map_err(|e| TransportError::WriteFailed {
                        reason: e.to_string(),
                    })?;
                self.check_size(frame.len() - 4)?;
                tcp.outbound
                    .send(Outbound {
                        correlation_id: envelope.correlation_id,
                        frame,
                    })
                    .map_err(|_| TransportError::PeerClosed)
            }
            Transport::Http(http) => {
                let body = codec::encode(&envelope).map_err(|e| TransportError::WriteFailed {
                    reason: e.to_string(),
                })?;
                self.check_size(body.len())?;
                self.spawn_exchange(&connection.address, http, envelope.correlation_id, body);
                Ok(())
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_frame_bytes as usize {
            return Err(TransportError::WriteFailed {
                reason: format!(
                    "request of {len} bytes exceeds the {} byte frame limit",
                    self.max_frame_bytes
                ),
            });
        }
        Ok(())
    }

    fn spawn_exchange(&self, peer: &str, http: &HttpPeer, correlation_id: String, body: Vec<u8>) {
        // Nobody is waiting for an unregistered request.
        let Some(deadline) = self.table.deadline(&correlation_id) else {
            debug!(peer, correlation_id = %correlation_id, "Request not pending, not posted");
            return;
        };
        let client = http.http.clone();
        let url = http.url.clone();
        let exchanges = Arc::clone(&http.exchanges);
        let table = Arc::clone(&self.table);
        let peer = peer.to_string();
        let id = correlation_id.clone();

        // The task waits until its abort handle is registered so that its
        // own removal can never run before the insert.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = registered_rx.await;
            let exchange = post_exchange(&client, &url, &peer, body);
            let deadline = tokio::time::Instant::from_std(deadline);
            let outcome = tokio::time::timeout_at(deadline, exchange).await;
            exchanges.remove(&id);
            // Dropping the exchange future releases its socket.
            let Ok(outcome) = outcome else {
                debug!(peer = %peer, correlation_id = %id, "HTTP exchange abandoned at deadline");
                table.expire(&id);
                return;
            };
            let outcome = match outcome {
                Ok(response) => {
                    if response.correlation_id != id {
                        warn!(
                            peer = %peer,
                            expected = %id,
                            got = %response.correlation_id,
                            "HTTP response carries a different correlation id"
                        );
                    }
                    response.into_outcome()
                }
                Err(failure) => {
                    warn!(peer = %peer, correlation_id = %id, error = %failure, "HTTP exchange failed");
                    Err(failure)
                }
            };
            table.resolve(&id, outcome);
        });
        http.exchanges.insert(correlation_id, task.abort_handle());
        let _ = registered_tx.send(());
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// HTTP exchanges still awaiting a response, across all peers.
    pub fn in_flight_exchanges(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|p| match &p.transport {
                Transport::Http(http) => http.exchanges.len(),
                Transport::Tcp(_) => 0,
            })
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reject new sends, terminate every peer's pending work, and release
    /// the sockets. Work still pending on a peer is reported as a failure.
    pub async fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let peers: Vec<Arc<PeerConnection>> = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, p)| p)
            .collect();

        let mut failures = Vec::new();
        for peer in peers {
            failures.extend(self.release(&peer).await);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError { failures })
        }
    }

    async fn release(&self, peer: &PeerConnection) -> Vec<String> {
        let mut failures = Vec::new();
        match &peer.transport {
            Transport::Tcp(tcp) => {
                tcp.alive.store(false, Ordering::SeqCst);
                // Dropping both halves closes the socket.
                let tasks = std::mem::take(&mut *tcp.tasks.lock().unwrap_or_else(|e| e.into_inner()));
                for task in tasks {
                    task.abort();
                }
            }
            Transport::Http(http) => {
                let ids: Vec<String> = http.exchanges.iter().map(|e| e.key().clone()).collect();
                for id in ids {
                    if let Some((_, handle)) = http.exchanges.remove(&id) {
                        handle.abort();
                    }
                }
            }
        }

        let rejected = self
            .table
            .reject_peer(&peer.address, Failure::Transport(TransportError::Closed));
        if rejected > 0 {
            failures.push(format!(
                "{rejected} request(s) to {} ({}) still pending",
                peer.address, peer.kind
            ));
        }
        info!(peer = %peer.address, kind = %peer.kind, rejected, "Connection released");
        failures
    }
}

/// Read response frames until the socket closes, then fail whatever is
/// still pending on this peer.
async fn read_responses(
    mut reader: OwnedReadHalf,
    peer: String,
    table: Arc<CorrelationTable>,
    max_frame_bytes: u32,
    alive: Arc<AtomicBool>,
) {
    loop {
        let body = match codec::read_frame(&mut reader, max_frame_bytes).await {
            Ok(body) => body,
            Err(FrameError::Closed) => {
                debug!(peer = %peer, "Peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Framing error, dropping connection");
                break;
            }
        };

        match codec::decode(&body) {
            Ok(envelope) if envelope.is_request() => {
                warn!(
                    peer = %peer,
                    correlation_id = %envelope.correlation_id,
                    "Unexpected request on a client connection"
                );
            }
            Ok(envelope) => {
                let id = envelope.correlation_id.clone();
                if !table.resolve(&id, envelope.into_outcome()) {
                    debug!(peer = %peer, correlation_id = %id, "Late response discarded");
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed response frame");
                if let Some(id) = codec::salvage_correlation_id(&body) {
                    table.resolve(&id, Err(Failure::Decode(e)));
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    let rejected = table.reject_peer(&peer, Failure::Transport(TransportError::PeerClosed));
    if rejected > 0 {
        warn!(peer = %peer, rejected, "Pending requests failed: peer closed");
    }
}

/// Write queued frames in order until the queue closes or a write fails.
///
/// Frames for calls that resolved while queued are skipped. A write failure
/// kills the connection and fails everything pending on the peer.
async fn write_requests(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    peer: String,
    table: Arc<CorrelationTable>,
    alive: Arc<AtomicBool>,
) {
    while let Some(Outbound {
        correlation_id,
        frame,
    }) = queue.recv().await
    {
        if !table.contains(&correlation_id) {
            debug!(peer = %peer, correlation_id = %correlation_id, "Skipping frame for a resolved call");
            continue;
        }
        if let Err(e) = codec::write_frame(&mut writer, &frame).await {
            warn!(peer = %peer, error = %e, "Write failed, dropping connection");
            alive.store(false, Ordering::SeqCst);
            queue.close();
            let failure = Failure::Transport(TransportError::WriteFailed {
                reason: e.to_string(),
            });
            let rejected = table.reject_peer(&peer, failure);
            if rejected > 0 {
                warn!(peer = %peer, rejected, "Pending requests failed: write error");
            }
            return;
        }
        debug!(peer = %peer, correlation_id = %correlation_id, bytes = frame.len(), "Sent request frame");
    }
    if let Err(e) = writer.shutdown().await {
        debug!(peer = %peer, error = %e, "Socket shutdown failed");
    }
}

/// One HTTP exchange: post the request body, decode the response body.
async fn post_exchange(
    client: &reqwest::Client,
    url: &str,
    peer: &str,
    body: Vec<u8>,
) -> Result<Envelope, Failure> {
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_connect() {
                TransportError::ConnectFailed {
                    addr: peer.to_string(),
                    reason: e.to_string(),
                }
            } else {
                TransportError::WriteFailed {
                    reason: e.to_string(),
                }
            }
        })?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|_| TransportError::PeerClosed)?;

    codec::decode(&bytes).map_err(|e| {
        Failure::Decode(DecodeError::new(format!("HTTP {status}: {}", e.reason)))
    })
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
