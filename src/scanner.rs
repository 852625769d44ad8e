//! Incremental project file scanner.
//!
//! Walks a project directory on every query, applying include/exclude glob
//! rules and a file-count cap, and returns the current map of logical file
//! keys (`project:<relative posix path>`) to content. A bounded per-project
//! mtime/content cache avoids re-reading unchanged files across requests.
//! Scanning never mutates session state and runs outside the per-key lock.

use crate::canonical::canonical_dir;
use glob::Pattern;
use ignore::WalkBuilder;
use lru::LruCache;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Default include patterns: docs plus TypeScript and Python sources, at
/// the project root and nested.
pub const DEFAULT_PATTERNS: &[&str] = &["*.md", "*.ts", "*.py", "**/*.md", "**/*.ts", "**/*.py"];

/// Default exclude patterns: build output, dependency installs, VCS
/// metadata and test-file naming conventions.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules/**",
    ".git/**",
    "dist/**",
    "build/**",
    "coverage/**",
    "**/*.test.ts",
    "**/*.spec.ts",
    "**/*.test.tsx",
    "**/*.spec.tsx",
    "**/test_*.py",
    "**/*_test.py",
    "**/tests/**",
];

pub const DEFAULT_MAX_FILES: usize = 200;

/// At most this many project roots keep scan state resident.
pub const SCAN_CACHE_CAPACITY: usize = 10;

/// Directories never descended into, regardless of configured excludes.
const NOISE_DIRS: &[&str] = &["node_modules", "__pycache__", ".git"];

/// Per-query scanner configuration, deserialized from the `project_config`
/// field of a query payload. Missing fields fall back to the defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub patterns: Vec<String>,
    pub exclude: Vec<String>,
    pub max_files: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.iter().map(|s| s.to_string()).collect(),
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

/// Scan state retained per project root.
#[derive(Debug, Clone, Default)]
struct ScanEntry {
    mtimes: HashMap<String, SystemTime>,
    contents: HashMap<String, String>,
}

/// Scanner with a bounded LRU cache of per-project scan state. Cloning is
/// cheap and shares the cache.
#[derive(Clone)]
pub struct ProjectScanner {
    cache: Arc<Mutex<LruCache<String, ScanEntry>>>,
}

impl Default for ProjectScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectScanner {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(SCAN_CACHE_CAPACITY).expect("capacity is nonzero");
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Scan `project_dir` and return the current logical-key -> content map.
    ///
    /// Files whose mtime is unchanged since the previous scan of this root
    /// are served from cached content without a re-read. Individual
    /// unreadable files are skipped; a failed directory walk yields an
    /// empty result. The cache entry for this root is replaced wholesale,
    /// so files no longer present on disk are dropped.
    pub fn scan(&self, project_dir: &str, config: &ScanConfig) -> HashMap<String, String> {
        let root = canonical_dir(project_dir);
        let root_path = Path::new(&root).to_path_buf();

        let previous = {
            let mut cache = self.cache.lock().unwrap();
            cache.get(&root).cloned().unwrap_or_default()
        };

        let mut new_mtimes: HashMap<String, SystemTime> = HashMap::new();
        let mut result: HashMap<String, String> = HashMap::new();
        let mut file_count = 0usize;

        let filter_root = root_path.clone();
        let excludes = config.exclude.clone();
        let mut builder = WalkBuilder::new(&root_path);
        builder
            .standard_filters(false)
            .follow_links(false)
            // Prune excluded and well-known noise directories before
            // descending, so large trees stay cheap to walk.
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if !is_dir {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                if name.starts_with('.') || NOISE_DIRS.contains(&name.as_ref()) {
                    return false;
                }
                match relative_posix(entry.path(), &filter_root) {
                    // Directory excludes like `dist/**` need a child path to
                    // match against, so probe with a placeholder leaf.
                    Some(rel) => !matches_any(&format!("{rel}/dummy"), &excludes),
                    None => false,
                }
            });

        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Error scanning project directory {}: {}", project_dir, err);
                    continue;
                }
            };

            if file_count >= config.max_files {
                // Partial result, not an error.
                debug!("File cap ({}) reached scanning {}", config.max_files, root);
                break;
            }

            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let rel = match relative_posix(entry.path(), &root_path) {
                Some(rel) => rel,
                None => continue,
            };
            if !matches_any(&rel, &config.patterns) {
                continue;
            }
            if matches_any(&rel, &config.exclude) {
                continue;
            }

            let mtime = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(mtime) => mtime,
                None => continue,
            };

            let key = format!("project:{rel}");
            new_mtimes.insert(key.clone(), mtime);

            let cached = previous
                .mtimes
                .get(&key)
                .filter(|prev| **prev == mtime)
                .and_then(|_| previous.contents.get(&key));

            match cached {
                Some(content) => {
                    result.insert(key, content.clone());
                }
                None => match std::fs::read(entry.path()) {
                    Ok(bytes) => {
                        result.insert(key, String::from_utf8_lossy(&bytes).into_owned());
                    }
                    // Unreadable file: skip it, not the whole scan.
                    Err(_) => continue,
                },
            }

            file_count += 1;
        }

        debug!("Scanned {} project files from {}", result.len(), project_dir);

        let entry = ScanEntry {
            mtimes: new_mtimes,
            contents: result.clone(),
        };
        let mut cache = self.cache.lock().unwrap();
        if let Some((evicted, _)) = cache.push(root.clone(), entry) {
            if evicted != root {
                debug!("Evicted scan cache entry: {}", evicted);
            }
        }

        result
    }

    /// Whether scan state is resident for this canonical root. Does not
    /// affect recency.
    pub fn is_cached(&self, canonical_root: &str) -> bool {
        self.cache.lock().unwrap().peek(canonical_root).is_some()
    }

    pub fn cached_root_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    #[cfg(test)]
    fn seed(&self, root: &str, mtimes: HashMap<String, SystemTime>, contents: HashMap<String, String>) {
        self.cache
            .lock()
            .unwrap()
            .push(root.to_string(), ScanEntry { mtimes, contents });
    }
}

/// Whether a relative posix path matches any of the given glob patterns.
/// Separator-free patterns like `*.md` are also matched against the bare
/// filename so they behave the same at any depth.
fn matches_any(rel_path: &str, patterns: &[String]) -> bool {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    patterns.iter().any(|raw| match Pattern::new(raw) {
        Ok(pattern) => {
            pattern.matches(rel_path) || (!raw.contains('/') && pattern.matches(name))
        }
        // Invalid pattern: fall back to substring matching.
        Err(_) => rel_path.contains(raw.as_str()),
    })
}

/// Relative path from `root` to `path` with `/` separators.
fn relative_posix(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    Some(out)
}
