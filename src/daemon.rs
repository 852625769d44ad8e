//! TCP sidecar server: accept loop, per-connection protocol driver and
//! request routing.
//!
//! Each accepted connection carries exactly one NDJSON request and receives
//! exactly one response before the server closes it. Shutdown is
//! cooperative: a `shutdown` request (answered first, then signaled) or a
//! process signal stops the accept loop; in-flight connections finish
//! naturally.

use crate::engine::SessionFactory;
use crate::protocol::{unknown_id, Response};
use crate::query::{run_query, QueryPayload};
use crate::registry::SessionRegistry;
use crate::scanner::ProjectScanner;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use tracing::{debug, error, info, warn};

/// A client gets this long to send its single request line.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state threaded through every connection handler. Explicitly
/// constructed and singly owned so tests can run independent instances.
pub struct ServiceState {
    pub registry: SessionRegistry,
    pub scanner: ProjectScanner,
    connections: DashMap<Uuid, Instant>,
    request_count: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl ServiceState {
    fn new(factory: Arc<dyn SessionFactory>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: SessionRegistry::new(factory),
            scanner: ProjectScanner::new(),
            connections: DashMap::new(),
            request_count: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Stop accepting new connections and let the serve loop return.
    /// In-flight connection handlers are not aborted.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn requests_served(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}

/// TCP server implementing the hologram NDJSON sidecar protocol: bind,
/// accept, one request/response per connection, close.
pub struct SidecarServer {
    host: String,
    port: u16,
    listener: Option<TcpListener>,
    state: Arc<ServiceState>,
}

impl SidecarServer {
    /// `port` 0 asks the OS to assign one.
    pub fn new(host: &str, port: u16, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            host: host.to_string(),
            port,
            listener: None,
            state: Arc::new(ServiceState::new(factory)),
        }
    }

    /// Bind the listening socket. Returns the assigned port.
    pub async fn start(&mut self) -> Result<u16> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("failed to bind {}:{}", self.host, self.port))?;
        self.listener = Some(listener);
        let port = self.assigned_port();
        info!("Sidecar server listening on {}:{}", self.host, port);
        Ok(port)
    }

    /// The bound port. Calling this before a successful `start()` is a
    /// programming error and panics.
    pub fn assigned_port(&self) -> u16 {
        self.listener
            .as_ref()
            .expect("server not started")
            .local_addr()
            .expect("listener has no bound address")
            .port()
    }

    pub fn state(&self) -> Arc<ServiceState> {
        self.state.clone()
    }

    pub fn request_shutdown(&self) {
        self.state.request_shutdown();
    }

    /// Run the accept loop until shutdown is requested. Dropping the
    /// listener on return makes later connection attempts be refused.
    pub async fn serve(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .context("call start() before serve()")?;
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = self.state.clone();
                        tokio::spawn(async move {
                            handle_connection(state, stream, peer).await;
                        });
                    }
                    Err(e) => error!("Error accepting connection: {}", e),
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        info!("Sidecar server shut down");
        Ok(())
    }
}

/// Per-connection protocol driver: read one line with a timeout, decode,
/// route, write one response, close. Every path closes the connection.
async fn handle_connection(state: Arc<ServiceState>, stream: TcpStream, peer: SocketAddr) {
    let client_id = Uuid::new_v4();
    debug!("Connection from {} ({})", peer, client_id);
    state.connections.insert(client_id, Instant::now());

    if let Err(e) = serve_one(&state, stream, peer).await {
        error!("Error handling connection from {}: {}", peer, e);
    }

    state.connections.remove(&client_id);
}

async fn serve_one(state: &Arc<ServiceState>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    let read = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        // Timeout: the peer gets nothing, distinct from an error response.
        Err(_) => {
            warn!("Connection from {} timed out reading request", peer);
            return Ok(());
        }
        Ok(read) => read,
    };

    match read {
        Ok(0) => return Ok(()), // client closed without sending
        Ok(_) => {}
        Err(e) => {
            debug!("Read error from {}: {}", peer, e);
            return Ok(());
        }
    }

    let text = line.trim();
    if text.is_empty() {
        return Ok(());
    }

    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            let resp = Response::error(unknown_id(), format!("Malformed JSON: {e}"));
            return write_response(&mut writer, &resp).await;
        }
    };

    let request = match parsed.as_object() {
        Some(object) => object,
        None => {
            return write_response(&mut writer, &Response::bad_request()).await;
        }
    };

    state.request_count.fetch_add(1, Ordering::Relaxed);

    let started = Instant::now();
    let mut response = route_request(state, request).await;
    response.timing_ms = Some(round_ms(started.elapsed().as_secs_f64() * 1000.0));

    write_response(&mut writer, &response).await?;

    // Respond first, then signal exit.
    if request.get("type").and_then(Value::as_str) == Some("shutdown") {
        info!("Shutdown requested by client {}", peer);
        state.request_shutdown();
    }

    Ok(())
}

/// Route a decoded request to its handler. Structural validation happens
/// here; handler failures are converted to error responses and never
/// propagate past this function.
pub async fn route_request(state: &Arc<ServiceState>, request: &Map<String, Value>) -> Response {
    let id = match request.get("id") {
        Some(id) if !id.is_null() => id.clone(),
        _ => return Response::error(unknown_id(), "Missing 'id' field"),
    };

    let kind = match request.get("type") {
        Some(kind) if !kind.is_null() => kind,
        _ => return Response::error(id, "Missing 'type' field"),
    };
    let kind = match kind.as_str() {
        Some(kind) => kind,
        None => return Response::error(id, format!("Unknown request type: {kind}")),
    };

    match kind {
        "ping" => Response::pong(id),
        // File discovery is pull-based via the scanner; acknowledge only.
        "update" => Response::result(id, json!({})),
        // The connection handler triggers the actual shutdown after the
        // response has been flushed.
        "shutdown" => Response::result(id, json!({})),
        "query" => {
            let payload: QueryPayload = match request.get("payload") {
                Some(raw) => match serde_json::from_value(raw.clone()) {
                    Ok(payload) => payload,
                    Err(e) => return Response::error(id, format!("Invalid query payload: {e}")),
                },
                None => QueryPayload::default(),
            };
            match run_query(&state.registry, &state.scanner, payload).await {
                Ok(result) => Response::result(id, result),
                Err(e) => {
                    error!("Error handling query: {:#}", e);
                    Response::error(id, e.to_string())
                }
            }
        }
        other => Response::error(id, format!("Unknown request type: {other}")),
    }
}

// Write failures are logged by the connection boundary and the connection
// closes either way; there is no retry.
async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    writer
        .write_all(response.to_line().as_bytes())
        .await
        .context("failed to send response")?;
    writer.flush().await.context("failed to flush response")?;
    Ok(())
}

fn round_ms(ms: f64) -> f64 {
    (ms * 10.0).round() / 10.0
}
