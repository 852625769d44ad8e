//! Shared fixtures: a mock context engine and a live-server harness.

#![allow(dead_code)]

use hologram_sidecar::{
    EngineError, EngineSession, ServiceState, SessionFactory, SidecarServer, TurnOutcome,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Default)]
pub struct MockFile {
    pub content: String,
    pub raw_pressure: f64,
    pub pressure_bucket: i64,
}

/// Observable state of one mock session, shared with the test body.
#[derive(Default)]
pub struct MockSessionState {
    pub files: Mutex<HashMap<String, MockFile>>,
    pub rebuilds: AtomicUsize,
    pub turns: AtomicUsize,
    pub saves: AtomicUsize,
    /// Incremented when a turn begins, before any gate or delay.
    pub turns_entered: AtomicUsize,
    in_flight: AtomicBool,
    pub overlaps: AtomicUsize,
    /// When set, the next turn blocks until the sender fires (or drops).
    pub turn_gate: Mutex<Option<mpsc::Receiver<()>>>,
    pub turn_delay: Mutex<Duration>,
}

impl MockSessionState {
    pub fn file(&self, key: &str) -> Option<MockFile> {
        self.files.lock().unwrap().get(key).cloned()
    }

    pub fn set_pressure(&self, key: &str, raw: f64, bucket: i64) {
        let mut files = self.files.lock().unwrap();
        let record = files.get_mut(key).expect("file present");
        record.raw_pressure = raw;
        record.pressure_bucket = bucket;
    }
}

pub struct MockFactory {
    pub opened: AtomicUsize,
    pub fail_open: AtomicBool,
    states: Mutex<HashMap<String, Arc<MockSessionState>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Session state for a canonical config root, created on demand so
    /// tests can configure gates before the daemon opens the session.
    pub fn state_for(&self, config_root: &str) -> Arc<MockSessionState> {
        self.states
            .lock()
            .unwrap()
            .entry(config_root.to_string())
            .or_default()
            .clone()
    }

    /// The only session state opened so far.
    pub fn single_state(&self) -> Arc<MockSessionState> {
        let states = self.states.lock().unwrap();
        assert_eq!(states.len(), 1, "expected exactly one session");
        states.values().next().unwrap().clone()
    }
}

impl SessionFactory for MockFactory {
    fn open(&self, config_root: &str) -> Result<Box<dyn EngineSession>, EngineError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(EngineError::Failure("mock engine exploded".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            state: self.state_for(config_root),
        }))
    }
}

pub struct MockSession {
    state: Arc<MockSessionState>,
}

impl EngineSession for MockSession {
    fn has_file(&self, key: &str) -> bool {
        self.state.files.lock().unwrap().contains_key(key)
    }

    fn file_content(&self, key: &str) -> Option<String> {
        self.state
            .files
            .lock()
            .unwrap()
            .get(key)
            .map(|f| f.content.clone())
    }

    fn add_file(&mut self, key: &str, content: &str) {
        self.state.files.lock().unwrap().insert(
            key.to_string(),
            MockFile {
                content: content.to_string(),
                ..MockFile::default()
            },
        );
    }

    fn update_file(&mut self, key: &str, content: &str) {
        if let Some(record) = self.state.files.lock().unwrap().get_mut(key) {
            record.content = content.to_string();
        }
    }

    fn rebuild(&mut self) {
        self.state.rebuilds.fetch_add(1, Ordering::SeqCst);
    }

    fn pressure(&self, key: &str) -> Option<(f64, i64)> {
        self.state
            .files
            .lock()
            .unwrap()
            .get(key)
            .map(|f| (f.raw_pressure, f.pressure_bucket))
    }

    fn set_pressure(&mut self, key: &str, raw: f64, bucket: i64) {
        if let Some(record) = self.state.files.lock().unwrap().get_mut(key) {
            record.raw_pressure = raw;
            record.pressure_bucket = bucket;
        }
    }

    fn turn(&mut self, prompt: &str) -> Result<TurnOutcome, EngineError> {
        self.state.turns_entered.fetch_add(1, Ordering::SeqCst);
        if self.state.in_flight.swap(true, Ordering::SeqCst) {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let gate = self.state.turn_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        let delay = *self.state.turn_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        self.state.in_flight.store(false, Ordering::SeqCst);
        let turn_number = self.state.turns.fetch_add(1, Ordering::SeqCst) + 1;
        let cluster_size = self.state.files.lock().unwrap().len() as u64;
        Ok(TurnOutcome {
            hot: json!([format!("prompt:{}", prompt.len())]),
            warm: json!([]),
            cold: json!([]),
            turn_number: turn_number as u64,
            tension: 0.5,
            cluster_size,
        })
    }

    fn save(&mut self) -> Result<(), EngineError> {
        self.state.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A sidecar server bound to an ephemeral port, serving in a background
/// task.
pub struct TestServer {
    pub port: u16,
    pub state: Arc<ServiceState>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn(factory: Arc<dyn SessionFactory>) -> Self {
        let mut server = SidecarServer::new("127.0.0.1", 0, factory);
        let port = server.start().await.expect("bind ephemeral port");
        let state = server.state();
        let handle = tokio::spawn(async move {
            let _ = server.serve().await;
        });
        Self {
            port,
            state,
            handle,
        }
    }

    /// Request shutdown and wait for the serve loop to return.
    pub async fn shutdown(self) {
        self.state.request_shutdown();
        let _ = self.handle.await;
    }

    pub async fn wait_stopped(self) {
        let _ = self.handle.await;
    }
}

/// Send one newline-terminated request and read the single response line.
/// Returns `None` when the server closes the connection without replying.
pub async fn send_line(port: u16, line: &str) -> Option<Value> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to sidecar");
    stream.write_all(line.as_bytes()).await.expect("write");
    stream.write_all(b"\n").await.expect("write newline");

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    let read = reader.read_line(&mut response).await.expect("read");
    if read == 0 {
        None
    } else {
        Some(serde_json::from_str(response.trim()).expect("response is JSON"))
    }
}

pub async fn send_request(port: u16, request: Value) -> Option<Value> {
    send_line(port, &request.to_string()).await
}
