//! Client version identification.
//!
//! The coordinator must run the same client version the submitting host
//! used. Release builds carry a git commit in the environment; ad-hoc
//! builds pin an explicit binary whose content hash becomes the tag.

use crate::protocol::ClientVersion;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Process-wide property carrying the release git commit. Read once at
/// startup; the resolved version is passed down as a value.
pub const GIT_COMMIT_ENV: &str = "STAMPEDE_GIT_COMMIT";

#[derive(Debug, Error)]
pub enum VersionError {
    #[error(
        "property [{GIT_COMMIT_ENV}] is not set and the command line flag \
         [--client-binary] was not passed"
    )]
    NoGitCommit,

    #[error("client binary [{path}] passed under flag [--client-binary] does not exist")]
    BinaryNotFound { path: PathBuf },

    #[error("failed to hash client binary [{path}]: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Resolve the version tag from an explicit binary path or the git
/// commit property (in that priority order).
pub fn resolve_client_version(
    binary: Option<&Path>,
    git_commit: Option<&str>,
) -> Result<ClientVersion, VersionError> {
    match binary {
        Some(path) => from_local_binary(path),
        None => match git_commit {
            Some(commit) if !commit.is_empty() => Ok(ClientVersion::Git(commit.to_string())),
            _ => Err(VersionError::NoGitCommit),
        },
    }
}

fn from_local_binary(path: &Path) -> Result<ClientVersion, VersionError> {
    if !path.is_file() {
        return Err(VersionError::BinaryNotFound {
            path: path.to_path_buf(),
        });
    }
    let bytes = std::fs::read(path).map_err(|source| VersionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ClientVersion::Binary(
        blake3::hash(&bytes).to_hex().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_wins_when_no_binary() {
        let v = resolve_client_version(None, Some("abc123")).unwrap();
        assert_eq!(v, ClientVersion::Git("abc123".to_string()));
    }

    #[test]
    fn test_missing_both_is_a_readable_error() {
        let err = resolve_client_version(None, None).unwrap_err();
        assert!(err.to_string().contains(GIT_COMMIT_ENV));
        assert!(err.to_string().contains("--client-binary"));
    }

    #[test]
    fn test_empty_commit_counts_as_missing() {
        assert!(matches!(
            resolve_client_version(None, Some("")),
            Err(VersionError::NoGitCommit)
        ));
    }

    #[test]
    fn test_binary_flag_overrides_git_commit() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("client");
        std::fs::write(&bin, b"binary-bytes").unwrap();

        let v = resolve_client_version(Some(&bin), Some("ignored")).unwrap();
        let expected = blake3::hash(b"binary-bytes").to_hex().to_string();
        assert_eq!(v, ClientVersion::Binary(expected));
    }

    #[test]
    fn test_binary_must_be_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_client_version(Some(dir.path()), None),
            Err(VersionError::BinaryNotFound { .. })
        ));
    }
}
