// Hologram Sidecar Library
// Exports the daemon, the engine collaborator traits and the cache layers
// for embedded and test use.

pub mod canonical;
pub mod daemon;
pub mod engine;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod scanner;

// Re-export commonly used types
pub use canonical::canonical_dir;
pub use daemon::{ServiceState, SidecarServer, READ_TIMEOUT};
pub use engine::{EngineError, EngineSession, SessionFactory, TurnOutcome, UnavailableFactory};
pub use protocol::Response;
pub use query::QueryPayload;
pub use registry::{SessionKey, SessionRegistry, SESSION_CACHE_CAPACITY};
pub use scanner::{ProjectScanner, ScanConfig, DEFAULT_MAX_FILES, SCAN_CACHE_CAPACITY};
