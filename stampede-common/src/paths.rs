//! Path canonicalization for the wire format.
//!
//! Every path that crosses the wire is cell-relative and uses forward
//! slashes regardless of platform, so the coordinator sees identical
//! job state from any client host. Absolute paths (entries flagged
//! `path_is_absolute`) keep their leading slash.

use std::path::{Component, Path, PathBuf};

/// Render a path with forward-slash separators.
pub fn to_wire(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push('/'),
            Component::Prefix(prefix) => {
                out.push_str(&prefix.as_os_str().to_string_lossy());
            }
            other => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&other.as_os_str().to_string_lossy());
            }
        }
    }
    out
}

/// Parse a wire path back into a platform path.
pub fn from_wire(wire: &str) -> PathBuf {
    let (mut path, rest) = match wire.strip_prefix('/') {
        Some(rest) => (PathBuf::from("/"), rest),
        None => (PathBuf::new(), wire),
    };
    for segment in rest.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

/// Relativize `path` against `root`, or `None` if `path` is not under it.
pub fn strip_root(root: &Path, path: &Path) -> Option<PathBuf> {
    path.strip_prefix(root).ok().map(Path::to_path_buf)
}
