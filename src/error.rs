//! Unified error type hierarchy for rpmforge
//!
//! `BuildError` is the session-level taxonomy every pipeline stage reports through.
//! Stage-internal errors such as `GitError` are mapped into it at the stage
//! boundary. `ConfigError` covers server configuration loading.

use std::io;
use thiserror::Error;

use crate::models::FailureCause;

/// Configuration file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid TOML in config: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// Build session errors.
///
/// Every variant except `InvalidInput` terminates a session in `Failed`.
/// `InvalidInput` is raised before any session exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Request rejected during synchronous validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Remote unreachable, network or authentication failure
    #[error("Clone failed: {0}")]
    CloneFailure(String),

    /// Ref missing on the remote or checkout failed
    #[error("Checkout failed: {0}")]
    CheckoutFailure(String),

    /// Toolchain exited nonzero. `None` when terminated by a signal
    #[error("Build failed with exit code {}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    BuildFailure { exit_code: Option<i32> },

    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(String),

    #[error("Timed out: {0}")]
    TimeoutFailure(String),

    #[error("Build reported success but produced no packages")]
    NoArtifactsProduced,

    #[error("Artifact expired: {0}")]
    ArtifactExpired(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Build cancelled")]
    Cancelled,

    /// Unexpected defect. Detail is logged server-side only
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl BuildError {
    /// Client-facing message. Never exposes `InternalError` detail.
    pub fn user_message(&self) -> String {
        match self {
            BuildError::InvalidInput(msg) => format!("[invalid request] {}", msg),
            BuildError::CloneFailure(msg) => format!("[clone failed] {}", msg),
            BuildError::CheckoutFailure(msg) => format!("[checkout failed] {}", msg),
            BuildError::BuildFailure { exit_code: Some(code) } => {
                format!("[build failed] exit code {}", code)
            }
            BuildError::BuildFailure { exit_code: None } => {
                "[build failed] terminated by signal".to_string()
            }
            BuildError::ResourceExceeded(msg) => format!("[resource limit exceeded] {}", msg),
            BuildError::TimeoutFailure(msg) => format!("[timed out] {}", msg),
            BuildError::NoArtifactsProduced => "[no RPM packages found]".to_string(),
            BuildError::ArtifactExpired(_) => "[artifact expired]".to_string(),
            BuildError::ArtifactNotFound(_) => "[artifact not found]".to_string(),
            BuildError::Cancelled => "[build cancelled]".to_string(),
            BuildError::InternalError(_) => "[internal error] the build could not be completed".to_string(),
        }
    }

    /// Stable machine-readable name, as used in `rejected` and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::InvalidInput(_) => "invalid_input",
            BuildError::CloneFailure(_) => "clone_failure",
            BuildError::CheckoutFailure(_) => "checkout_failure",
            BuildError::BuildFailure { .. } => "build_failure",
            BuildError::ResourceExceeded(_) => "resource_exceeded",
            BuildError::TimeoutFailure(_) => "timeout_failure",
            BuildError::NoArtifactsProduced => "no_artifacts_produced",
            BuildError::ArtifactExpired(_) => "artifact_expired",
            BuildError::ArtifactNotFound(_) => "artifact_not_found",
            BuildError::Cancelled => "cancelled",
            BuildError::InternalError(_) => "internal_error",
        }
    }

    /// Serializable projection stored on the session.
    pub fn cause(&self) -> FailureCause {
        match self {
            BuildError::InvalidInput(_) => FailureCause::InvalidInput,
            BuildError::CloneFailure(_) => FailureCause::CloneFailure,
            BuildError::CheckoutFailure(_) => FailureCause::CheckoutFailure,
            BuildError::BuildFailure { exit_code } => FailureCause::BuildFailure {
                exit_code: *exit_code,
            },
            BuildError::ResourceExceeded(_) => FailureCause::ResourceExceeded,
            BuildError::TimeoutFailure(_) => FailureCause::TimeoutFailure,
            BuildError::NoArtifactsProduced => FailureCause::NoArtifactsProduced,
            BuildError::ArtifactExpired(_) => FailureCause::ArtifactExpired,
            BuildError::ArtifactNotFound(_) => FailureCause::ArtifactNotFound,
            BuildError::Cancelled => FailureCause::Cancelled,
            BuildError::InternalError(_) => FailureCause::InternalError,
        }
    }
}

impl From<io::Error> for BuildError {
    fn from(e: io::Error) -> Self {
        BuildError::InternalError(e.to_string())
    }
}

/// Top-level result type for session operations.
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::FileNotFound("/etc/rpmforge.toml".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration file not found: /etc/rpmforge.toml"
        );
    }

    #[test]
    fn test_build_failure_display() {
        let err = BuildError::BuildFailure { exit_code: Some(2) };
        assert_eq!(err.to_string(), "Build failed with exit code 2");
        let err = BuildError::BuildFailure { exit_code: None };
        assert_eq!(err.to_string(), "Build failed with exit code signal");
    }

    #[test]
    fn test_internal_error_is_not_leaked() {
        let err = BuildError::InternalError("/srv/rpmforge/work: permission denied".to_string());
        let msg = err.user_message();
        assert!(!msg.contains("/srv"));
        assert!(!msg.contains("permission"));
    }

    #[test]
    fn test_cause_projection() {
        assert_eq!(BuildError::Cancelled.cause(), FailureCause::Cancelled);
        assert_eq!(
            BuildError::BuildFailure { exit_code: Some(1) }.cause(),
            FailureCause::BuildFailure { exit_code: Some(1) }
        );
    }

    #[test]
    fn test_kind_matches_failure_cause_tag() {
        let errors = [
            BuildError::CloneFailure(String::new()),
            BuildError::BuildFailure { exit_code: None },
            BuildError::NoArtifactsProduced,
            BuildError::Cancelled,
            BuildError::InternalError(String::new()),
        ];
        for err in errors {
            let tagged = serde_json::to_value(err.cause()).unwrap();
            assert_eq!(tagged["kind"], err.kind());
        }
    }
}
