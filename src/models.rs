//! Core data types for rpmforge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::orchestrator::state::SessionState;

/// Opaque session identifier, generated at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|e| format!("Invalid session id '{}': {}", s, e))
    }
}

/// Supported build target operating systems.
///
/// Wire spellings are `CentOS7`, `CentOS8` and `CentOS9`. Parsing is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OsTarget {
    #[serde(rename = "CentOS7")]
    CentOs7,
    #[serde(rename = "CentOS8")]
    CentOs8,
    #[serde(rename = "CentOS9")]
    CentOs9,
}

impl OsTarget {
    pub const ALL: [OsTarget; 3] = [OsTarget::CentOs7, OsTarget::CentOs8, OsTarget::CentOs9];

    pub fn as_str(&self) -> &'static str {
        match self {
            OsTarget::CentOs7 => "CentOS7",
            OsTarget::CentOs8 => "CentOS8",
            OsTarget::CentOs9 => "CentOS9",
        }
    }

    /// Lowercase slug used in container names.
    pub fn slug(&self) -> &'static str {
        match self {
            OsTarget::CentOs7 => "centos7",
            OsTarget::CentOs8 => "centos8",
            OsTarget::CentOs9 => "centos9",
        }
    }
}

impl fmt::Display for OsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "centos7" => Ok(OsTarget::CentOs7),
            "centos8" => Ok(OsTarget::CentOs8),
            "centos9" => Ok(OsTarget::CentOs9),
            _ => Err(format!("Unsupported OS: {}", s)),
        }
    }
}

impl<'de> Deserialize<'de> for OsTarget {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        OsTarget::from_str(&raw).map_err(|_| {
            serde::de::Error::unknown_variant(&raw, &["CentOS7", "CentOS8", "CentOS9"])
        })
    }
}

/// Raw build request as received from a client, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub os: String,
}

impl BuildRequest {
    pub fn new(repo_url: impl Into<String>, branch: impl Into<String>, os: impl Into<String>) -> Self {
        BuildRequest {
            repo_url: repo_url.into(),
            branch: branch.into(),
            os: os.into(),
        }
    }
}

/// Validated, immutable build inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSpec {
    pub repo_url: String,
    pub git_ref: String,
    pub os_target: OsTarget,
}

impl BuildSpec {
    /// Archive label: last path segment of the repository address without `.git`.
    pub fn package_label(&self) -> String {
        let trimmed = self.repo_url.trim().trim_end_matches('/');
        let last = trimmed
            .rsplit(|c| c == '/' || c == ':')
            .next()
            .unwrap_or(trimmed);
        let label = last.trim_end_matches(".git");
        let cleaned: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
            "package".to_string()
        } else {
            cleaned
        }
    }
}

/// Serializable failure classification stored on a failed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    InvalidInput,
    CloneFailure,
    CheckoutFailure,
    BuildFailure { exit_code: Option<i32> },
    ResourceExceeded,
    TimeoutFailure,
    NoArtifactsProduced,
    ArtifactExpired,
    ArtifactNotFound,
    Cancelled,
    InternalError,
}

/// Reference to a stored archive. Resolves to `/artifacts/<session>/<file>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub session_id: SessionId,
    pub file_name: String,
}

impl ArtifactRef {
    pub fn url_path(&self) -> String {
        format!("/artifacts/{}/{}", self.session_id, self.file_name)
    }
}

/// Status view of a session, returned by the status route.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub repo_url: String,
    pub branch: String,
    pub os: OsTarget,
    pub state: SessionState,
    pub failure: Option<FailureCause>,
    pub zip_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
