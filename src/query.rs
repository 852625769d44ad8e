//! The `query` pipeline: scan, lock, inject, boost, turn, save.
//!
//! The scan runs outside the per-key lock (directory I/O only, no session
//! mutation); everything after the lock is session mutation only. Engine
//! `turn`/`save` and session construction run on the blocking worker pool
//! so they never stall unrelated connections, but stay serialized by the
//! key's lock.

use crate::engine::{EngineSession, TurnOutcome};
use crate::registry::{SessionKey, SessionRegistry};
use crate::scanner::{ProjectScanner, ScanConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// One-time pressure assigned to a file the first time it enters a
/// session: "this file is now known and moderately relevant". The values
/// sit inside the engine's WARM tier and must be preserved exactly.
pub const BOOTSTRAP_RAW_PRESSURE: f64 = 0.45;
pub const BOOTSTRAP_PRESSURE_BUCKET: i64 = 22;

/// Monotonic floors applied to caller-boosted files.
pub const BOOST_RAW_PRESSURE: f64 = 0.6;
pub const BOOST_PRESSURE_BUCKET: i64 = 30;

/// Query payload, deserialized from the request's `payload` field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryPayload {
    pub prompt: String,
    pub claude_dir: String,
    pub project_dir: String,
    pub project_config: ScanConfig,
    pub boost_files: Vec<String>,
}

/// Run a full query: returns the result payload to send to the client.
pub async fn run_query(
    registry: &SessionRegistry,
    scanner: &ProjectScanner,
    payload: QueryPayload,
) -> Result<Value> {
    let claude_dir = if payload.claude_dir.is_empty() {
        default_config_dir()
    } else {
        payload.claude_dir.clone()
    };

    debug!(
        "Query received (prompt length: {} chars, claude_dir: {}, project_dir: {})",
        payload.prompt.len(),
        claude_dir,
        if payload.project_dir.is_empty() {
            "(global)"
        } else {
            &payload.project_dir
        }
    );

    // Step 1: scan project files outside the lock.
    let project_files = if !payload.project_dir.is_empty() && Path::new(&payload.project_dir).is_dir()
    {
        let scanner = scanner.clone();
        let project_dir = payload.project_dir.clone();
        let config = payload.project_config.clone();
        tokio::task::spawn_blocking(move || scanner.scan(&project_dir, &config))
            .await
            .context("project scan task failed")?
    } else {
        HashMap::new()
    };

    // Step 2: lock, construct if needed, inject, boost, turn, save.
    let key = SessionKey::new(&claude_dir, &payload.project_dir);
    let slot = registry.checkout(&key);
    let mut slot = slot.lock().await;

    if slot.session.is_none() {
        let factory = registry.factory();
        let config_root = key.config_root.clone();
        let session = tokio::task::spawn_blocking(move || factory.open(&config_root))
            .await
            .context("session construction task failed")??;
        debug!("Opened new engine session for {}", key);
        slot.session = Some(session);
    }
    let session = slot.session.as_mut().expect("session populated above");

    if !project_files.is_empty() {
        inject_project_files(session.as_mut(), &project_files);
    }
    apply_boosts(session.as_mut(), &payload.boost_files);

    // Turn and save are potentially CPU-heavy; move the session to the
    // blocking pool and put it back afterwards, lock still held.
    let mut session = slot.session.take().expect("session populated above");
    let prompt = payload.prompt.clone();
    let (session, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = session
            .turn(&prompt)
            .and_then(|outcome| session.save().map(|()| outcome));
        (session, outcome)
    })
    .await
    .context("engine turn task failed")?;
    slot.session = Some(session);

    let outcome = outcome?;
    Ok(result_payload(outcome))
}

/// Inject scanned project files into the session's file table. Runs while
/// the key's lock is held. Files new to the session are bootstrapped to
/// warm pressure exactly once; later content changes update the content
/// but leave pressure to the engine and boost logic.
pub fn inject_project_files(session: &mut dyn EngineSession, files: &HashMap<String, String>) {
    let mut newly_added: Vec<String> = Vec::new();
    let mut content_changed = false;

    for (key, content) in files {
        if !session.has_file(key) {
            session.add_file(key, content);
            newly_added.push(key.clone());
        } else if session.file_content(key).as_deref() != Some(content.as_str()) {
            session.update_file(key, content);
            content_changed = true;
        }
    }

    // Rebuild once per pass, and only when something actually changed.
    if !newly_added.is_empty() || content_changed {
        session.rebuild();
    }

    for key in &newly_added {
        session.set_pressure(key, BOOTSTRAP_RAW_PRESSURE, BOOTSTRAP_PRESSURE_BUCKET);
    }

    if !newly_added.is_empty() {
        debug!(
            "Injected {} new project files (bootstrapped to warm)",
            newly_added.len()
        );
    }
}

/// Raise each boosted file's pressure to at least the boost floor. Unknown
/// files are ignored; pressure never decreases.
pub fn apply_boosts(session: &mut dyn EngineSession, boost_files: &[String]) {
    for boost in boost_files {
        let key = if boost.starts_with("project:") {
            boost.clone()
        } else {
            format!("project:{boost}")
        };
        if let Some((raw, bucket)) = session.pressure(&key) {
            session.set_pressure(
                &key,
                raw.max(BOOST_RAW_PRESSURE),
                bucket.max(BOOST_PRESSURE_BUCKET),
            );
        }
    }
}

fn result_payload(outcome: TurnOutcome) -> Value {
    json!({
        "hot": outcome.hot,
        "warm": outcome.warm,
        "cold": outcome.cold,
        "turn": outcome.turn_number,
        "tension": outcome.tension,
        "cluster_size": outcome.cluster_size,
    })
}

fn default_config_dir() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| Path::new("/").to_path_buf())
        .join(".claude")
        .to_string_lossy()
        .into_owned()
}
