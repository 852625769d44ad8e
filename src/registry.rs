//! Bounded registry of resident engine sessions.
//!
//! Sessions are expensive and stateful, so at most [`SESSION_CACHE_CAPACITY`]
//! stay resident, keyed by the canonical (config root, project root) pair.
//! Each slot is wrapped in a `tokio::sync::Mutex` that doubles as the
//! per-key serialization lock: holding it guarantees at most one in-flight
//! mutating sequence (inject, boost, turn, save) per key while unrelated
//! keys proceed concurrently.

use crate::canonical::canonical_dir;
use crate::engine::{EngineSession, SessionFactory};
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// At most this many engine sessions stay resident.
pub const SESSION_CACHE_CAPACITY: usize = 3;

/// Canonicalized (config root, project root) pair identifying one resident
/// session. An empty project root means a global session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub config_root: String,
    pub project_root: String,
}

impl SessionKey {
    pub fn new(config_dir: &str, project_dir: &str) -> Self {
        Self {
            config_root: canonical_dir(config_dir),
            project_root: canonical_dir(project_dir),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let project = if self.project_root.is_empty() {
            "(global)"
        } else {
            &self.project_root
        };
        write!(f, "({}, {})", self.config_root, project)
    }
}

/// Slot owning one engine session. The session is constructed lazily on
/// first query for its key, while the slot's lock is held.
pub struct SessionSlot {
    pub session: Option<Box<dyn EngineSession>>,
}

pub struct SessionRegistry {
    slots: Mutex<LruCache<SessionKey, Arc<tokio::sync::Mutex<SessionSlot>>>>,
    factory: Arc<dyn SessionFactory>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        let capacity = NonZeroUsize::new(SESSION_CACHE_CAPACITY).expect("capacity is nonzero");
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
            factory,
        }
    }

    /// Get or create the slot for `key`, marking it most-recently-used.
    ///
    /// Eviction drops both the session handle and its lock. A request still
    /// holding the returned `Arc` at eviction time keeps its own session
    /// alive until it finishes; only the registry's reference is dropped.
    pub fn checkout(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<SessionSlot>> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(key) {
            return slot.clone();
        }

        let slot = Arc::new(tokio::sync::Mutex::new(SessionSlot { session: None }));
        if let Some((evicted, _)) = slots.push(key.clone(), slot.clone()) {
            if evicted != *key {
                debug!("Evicted session cache entry: {}", evicted);
            }
        }
        slot
    }

    pub fn factory(&self) -> Arc<dyn SessionFactory> {
        self.factory.clone()
    }

    /// Whether a session slot is resident for `key`. Does not affect
    /// recency.
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.slots.lock().unwrap().peek(key).is_some()
    }

    pub fn resident_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::UnavailableFactory;
    use tempfile::TempDir;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(UnavailableFactory))
    }

    fn key(n: usize) -> SessionKey {
        SessionKey {
            config_root: format!("/cfg/{n}"),
            project_root: String::new(),
        }
    }

    #[test]
    fn same_key_returns_same_slot() {
        let registry = registry();
        let a = registry.checkout(&key(1));
        let b = registry.checkout(&key(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.resident_count(), 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let registry = registry();
        for n in 0..5 {
            registry.checkout(&key(n));
        }
        assert_eq!(registry.resident_count(), SESSION_CACHE_CAPACITY);
        assert!(!registry.contains(&key(0)));
        assert!(!registry.contains(&key(1)));
        for n in 2..5 {
            assert!(registry.contains(&key(n)));
        }
    }

    #[test]
    fn touching_a_key_protects_it_from_eviction() {
        let registry = registry();
        registry.checkout(&key(0));
        registry.checkout(&key(1));
        registry.checkout(&key(2));

        // Re-touch the oldest, then insert a new key: the next-oldest goes.
        registry.checkout(&key(0));
        registry.checkout(&key(3));

        assert!(registry.contains(&key(0)));
        assert!(!registry.contains(&key(1)));
        assert!(registry.contains(&key(2)));
        assert!(registry.contains(&key(3)));
    }

    #[test]
    fn evicted_slot_stays_alive_for_inflight_holders() {
        let registry = registry();
        let held = registry.checkout(&key(0));
        for n in 1..=SESSION_CACHE_CAPACITY {
            registry.checkout(&key(n));
        }
        assert!(!registry.contains(&key(0)));
        // The registry dropped its reference, ours still works.
        assert!(held.try_lock().is_ok());
    }

    #[test]
    fn aliased_paths_share_a_key() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().to_str().unwrap().to_string();
        let slashed = format!("{plain}/");

        let a = SessionKey::new(&plain, "");
        let b = SessionKey::new(&slashed, "");
        assert_eq!(a, b);

        let registry = registry();
        registry.checkout(&a);
        registry.checkout(&b);
        assert_eq!(registry.resident_count(), 1);
    }
}
