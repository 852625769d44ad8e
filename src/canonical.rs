use std::path::{Component, Path, PathBuf};

/// Normalize a directory path into the stable identity used for cache keys.
///
/// Empty input stays empty (meaning "no project / global session") and is
/// never resolved against the current working directory. `~` is expanded
/// against the user's home directory, symlinks are resolved, and the result
/// is absolute, so different spellings of the same directory collapse to a
/// single key. Canonicalizing an already-canonical path returns it
/// unchanged.
pub fn canonical_dir(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    let expanded = expand_home(path);
    match std::fs::canonicalize(&expanded) {
        Ok(resolved) => resolved.to_string_lossy().into_owned(),
        // Paths that do not exist can still serve as keys; normalize them
        // lexically so trailing slashes and `.`/`..` segments don't alias.
        Err(_) => normalize_lexically(&expanded).to_string_lossy().into_owned(),
    }
}

/// Expand a leading `~` or `~/` against the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Make a path absolute and collapse `.`/`..` components without touching
/// the filesystem. Used only for paths that cannot be resolved on disk.
fn normalize_lexically(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
