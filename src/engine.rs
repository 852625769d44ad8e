//! Boundary to the hologram context engine.
//!
//! The sidecar never interprets ranking semantics. It owns session
//! lifetimes, injects project files, applies pressure floors and forwards
//! `turn()` results verbatim. The engine itself is an injected collaborator
//! behind the traits below, bound lazily on the first query for a key so
//! the daemon can start and answer `ping` even when no engine is available.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// No engine implementation is reachable; the daemon keeps running and
    /// only the requesting query fails.
    #[error("context engine unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Failure(String),
}

/// Ranked context produced by one engine turn. Opaque to the sidecar
/// beyond forwarding the fields to the client.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub hot: Value,
    pub warm: Value,
    pub cold: Value,
    pub turn_number: u64,
    pub tension: f64,
    pub cluster_size: u64,
}

/// One resident engine session. Implementations may block and do their own
/// I/O; the daemon always drives them from the blocking worker pool while
/// holding the per-key lock.
pub trait EngineSession: Send {
    fn has_file(&self, key: &str) -> bool;
    fn file_content(&self, key: &str) -> Option<String>;
    /// Add a new file to the session's table, deferring any internal
    /// index rebuild until [`EngineSession::rebuild`] is called.
    fn add_file(&mut self, key: &str, content: &str);
    fn update_file(&mut self, key: &str, content: &str);
    /// Rebuild internal indexes after a batch of add/update calls.
    fn rebuild(&mut self);
    /// Current `(raw_pressure, pressure_bucket)` for a file, if known.
    fn pressure(&self, key: &str) -> Option<(f64, i64)>;
    fn set_pressure(&mut self, key: &str, raw_pressure: f64, pressure_bucket: i64);
    fn turn(&mut self, prompt: &str) -> Result<TurnOutcome, EngineError>;
    fn save(&mut self) -> Result<(), EngineError>;
}

/// Constructs engine sessions rooted at a canonical config directory.
/// Consulted on first query for a key; construction failures fail that
/// query only.
pub trait SessionFactory: Send + Sync {
    fn open(&self, config_root: &str) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// Factory used when no engine implementation has been wired in. Every
/// query fails with a descriptive error while `ping`, `update` and
/// `shutdown` keep working, matching the lazy-binding behavior of the
/// protocol.
pub struct UnavailableFactory;

impl SessionFactory for UnavailableFactory {
    fn open(&self, config_root: &str) -> Result<Box<dyn EngineSession>, EngineError> {
        Err(EngineError::Unavailable(format!(
            "no engine implementation linked into this build (config root: {config_root})"
        )))
    }
}
