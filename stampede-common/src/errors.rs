//! Error kinds and exit codes for the build client.

use thiserror::Error;

/// Exit code of a remote step that failed (intermediate, pre-mapping).
pub const DIST_REMOTE_STEP_FAILED_EXIT_CODE: i32 = 1;
/// Exit code of a local step that failed (intermediate, pre-mapping).
pub const DIST_LOCAL_STEP_FAILED_EXIT_CODE: i32 = 2;

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    BuildError,
    CommandLineError,
    ParseError,
    Fatal,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::BuildError => 1,
            Self::CommandLineError => 3,
            Self::ParseError => 5,
            Self::Fatal => 10,
        }
    }

    /// Map a sub-build exit code onto the process exit code.
    pub fn from_build_code(code: i32) -> Self {
        if code == 0 {
            Self::Success
        } else {
            Self::BuildError
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::BuildError => write!(f, "build_error"),
            Self::CommandLineError => write!(f, "commandline_error"),
            Self::ParseError => write!(f, "parse_error"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failures surfaced to the user by the build client.
#[derive(Debug, Error)]
pub enum BuildClientError {
    /// Missing or malformed flags / arguments.
    #[error("{0}")]
    CommandLine(String),

    /// Target-graph or action-graph construction failed.
    #[error("{0}")]
    Parse(String),

    /// `--out` named a target whose output cannot be copied.
    #[error("{target} does not have an output that is compatible with `--out`")]
    OutputIncompatible { target: String },

    /// The remote build returned non-zero and no fallback applies.
    #[error("distributed build failed with exit code {exit_code}")]
    RemoteFailed { exit_code: i32 },

    /// The local build returned non-zero.
    #[error("local build failed with exit code {exit_code}")]
    LocalFailed { exit_code: i32 },

    /// Unexpected failure inside the client itself.
    #[error("internal error: {0}")]
    Fatal(String),
}

impl BuildClientError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::CommandLine(_) => ExitCode::CommandLineError,
            Self::Parse(_) => ExitCode::ParseError,
            Self::OutputIncompatible { .. } => ExitCode::BuildError,
            Self::RemoteFailed { .. } | Self::LocalFailed { .. } => ExitCode::BuildError,
            Self::Fatal(_) => ExitCode::Fatal,
        }
    }
}

/// The "no targets" console message, suggesting up to ten configured
/// aliases when any exist.
pub fn missing_targets_message<'a>(aliases: impl Iterator<Item = &'a str>) -> String {
    let mut message = "Must specify at least one build target.".to_string();
    let suggestions: Vec<&str> = aliases.take(10).collect();
    if !suggestions.is_empty() {
        message.push_str("\nTry building one of the following targets:\n");
        message.push_str(&suggestions.join(" "));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::BuildError.code(), 1);
        assert_eq!(ExitCode::CommandLineError.code(), 3);
        assert_eq!(ExitCode::ParseError.code(), 5);
        assert_eq!(ExitCode::Fatal.code(), 10);
    }

    #[test]
    fn test_from_build_code() {
        assert_eq!(ExitCode::from_build_code(0), ExitCode::Success);
        assert_eq!(ExitCode::from_build_code(1), ExitCode::BuildError);
        assert_eq!(ExitCode::from_build_code(2), ExitCode::BuildError);
    }

    #[test]
    fn test_error_to_exit_code() {
        assert_eq!(
            BuildClientError::CommandLine("x".into()).exit_code(),
            ExitCode::CommandLineError
        );
        assert_eq!(
            BuildClientError::Parse("x".into()).exit_code(),
            ExitCode::ParseError
        );
        assert_eq!(
            BuildClientError::OutputIncompatible {
                target: "//a:a".into()
            }
            .exit_code(),
            ExitCode::BuildError
        );
        assert_eq!(
            BuildClientError::Fatal("boom".into()).exit_code(),
            ExitCode::Fatal
        );
    }

    #[test]
    fn test_missing_targets_message_without_aliases() {
        let message = missing_targets_message(std::iter::empty());
        assert_eq!(message, "Must specify at least one build target.");
    }

    #[test]
    fn test_missing_targets_message_limits_suggestions() {
        let aliases: Vec<String> = (0..15).map(|i| format!("alias{i}")).collect();
        let message = missing_targets_message(aliases.iter().map(String::as_str));
        assert!(message.contains("alias0"));
        assert!(message.contains("alias9"));
        assert!(!message.contains("alias10"));
    }
}
