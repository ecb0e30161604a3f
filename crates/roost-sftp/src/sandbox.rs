//! Path confinement for tenant data directories.
//!
//! All client-supplied paths are resolved lexically against the tenant root:
//! no filesystem access, no symlink resolution. That avoids TOCTOU games on
//! symlinks, at the cost of requiring that the control plane never plants
//! symlinks escaping a root. A path that cleans to anything outside the root
//! is a hard error, never clamped back inside.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Resolve a client-supplied path against `root`.
///
/// The requested path is treated as relative even when it begins with `/`;
/// the tenant root is the apparent filesystem root of the session. Returns
/// the cleaned absolute path, or [`Error::PathEscape`] when the result is
/// neither `root` itself nor a descendant of it.
pub fn resolve(root: &Path, requested: &str) -> Result<PathBuf> {
    if requested.contains('\0') {
        return Err(Error::PathEscape(requested.to_string()));
    }

    let root = lexical_clean(root);
    let joined = root.join(requested.trim_start_matches('/'));
    let cleaned = lexical_clean(&joined);

    if cleaned == root || cleaned.starts_with(&root) {
        Ok(cleaned)
    } else {
        Err(Error::PathEscape(requested.to_string()))
    }
}

/// The virtual `Realpath` answer: the requested path cleaned against the
/// apparent root `/`, without consulting the filesystem. Cannot escape.
pub fn virtual_realpath(requested: &str) -> String {
    let joined = Path::new("/").join(requested.trim_start_matches('/'));
    let cleaned = lexical_clean(&joined);

    let s = cleaned.to_string_lossy().into_owned();
    if s.is_empty() {
        "/".to_string()
    } else {
        s
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
/// A `..` at the top of an absolute path stays at `/`, matching the usual
/// lexical-clean semantics.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }

    cleaned
}
