//! Server configuration.
//!
//! `ServerConfig` is deserialized from TOML (see `loader`). Every section carries
//! `#[serde(default)]`, so a partial file or no file at all yields a usable config.
//! Request-level input validation lives in `validator`.

pub mod loader;
pub mod validator;

pub use loader::{apply_env_overrides, load_config, validate_config_path};
pub use validator::{validate_config, validate_git_ref, validate_repo_url, validate_request};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::OsTarget;

/// Root of all default on-disk locations: `<data_local_dir>/rpmforge`, or `./rpmforge-data`.
fn default_data_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("rpmforge"))
        .unwrap_or_else(|| PathBuf::from("rpmforge-data"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
    pub sandbox: SandboxSection,
    pub artifacts: ArtifactSection,
    pub validation: ValidationSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address, e.g. `0.0.0.0:5000`
    pub bind: String,
    /// Prefix for `zip_url` values. Empty means server-relative paths.
    pub public_base_url: String,
    /// Cancel a session when its owning WebSocket disconnects
    pub cancel_on_disconnect: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            bind: "0.0.0.0:5000".to_string(),
            public_base_url: String::new(),
            cancel_on_disconnect: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub work_root: PathBuf,
    pub artifact_root: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        let root = default_data_root();
        PathsSection {
            work_root: root.join("work"),
            artifact_root: root.join("artifacts"),
            log_dir: root.join("logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_concurrent_builds: usize,
    pub fetch_timeout_secs: u64,
    pub fetch_retries: u32,
    pub fetch_backoff_ms: u64,
    pub build_timeout_secs: u64,
    pub cancel_grace_ms: u64,
    pub kill_grace_ms: u64,
    pub session_grace_secs: u64,
    pub max_session_log_bytes: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        LimitsSection {
            max_concurrent_builds: num_cpus::get().max(1),
            fetch_timeout_secs: 300,
            fetch_retries: 3,
            fetch_backoff_ms: 500,
            build_timeout_secs: 3600,
            cancel_grace_ms: 5000,
            kill_grace_ms: 2000,
            session_grace_secs: 600,
            max_session_log_bytes: 16 * 1024 * 1024,
        }
    }
}

impl LimitsSection {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_secs(self.session_grace_secs)
    }
}

/// Where builds run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
    /// No container; resource limits via setrlimit. Development and tests only.
    Host,
}

impl RuntimeKind {
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            RuntimeKind::Docker => Some("docker"),
            RuntimeKind::Podman => Some("podman"),
            RuntimeKind::Host => None,
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(RuntimeKind::Docker),
            "podman" => Ok(RuntimeKind::Podman),
            "host" => Ok(RuntimeKind::Host),
            other => Err(format!("Unknown sandbox runtime: {}", other)),
        }
    }
}

/// Per-OS build environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub image: String,
    /// Build script override. `None` uses the built-in rpmbuild driver.
    #[serde(default)]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub runtime: RuntimeKind,
    /// Container network mode. Dependency installation needs a network.
    pub network: String,
    /// 0 disables the memory ceiling
    pub memory_limit_mb: u64,
    /// 0.0 disables the CPU quota
    pub cpu_limit: f64,
    pub pids_limit: u64,
    /// CPU-seconds ceiling applied in host mode. 0 disables it.
    pub cpu_time_limit_secs: u64,
    /// Keyed by OS wire name (`CentOS7`, ...)
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            OsTarget::CentOs7.as_str().to_string(),
            ProfileConfig { image: "centos:7".to_string(), script: None },
        );
        profiles.insert(
            OsTarget::CentOs8.as_str().to_string(),
            ProfileConfig { image: "quay.io/centos/centos:stream8".to_string(), script: None },
        );
        profiles.insert(
            OsTarget::CentOs9.as_str().to_string(),
            ProfileConfig { image: "quay.io/centos/centos:stream9".to_string(), script: None },
        );
        SandboxSection {
            runtime: RuntimeKind::Docker,
            network: "bridge".to_string(),
            memory_limit_mb: 4096,
            cpu_limit: 2.0,
            pids_limit: 4096,
            cpu_time_limit_secs: 0,
            profiles,
        }
    }
}

impl SandboxSection {
    pub fn profile(&self, os: OsTarget) -> Option<&ProfileConfig> {
        self.profiles.get(os.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSection {
    pub ttl_secs: u64,
    pub max_store_bytes: u64,
    pub reap_interval_secs: u64,
    pub max_tombstones: usize,
    pub include_srpms: bool,
}

impl Default for ArtifactSection {
    fn default() -> Self {
        ArtifactSection {
            ttl_secs: 24 * 3600,
            max_store_bytes: 10 * 1024 * 1024 * 1024,
            reap_interval_secs: 60,
            max_tombstones: 10_000,
            include_srpms: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub allowed_schemes: Vec<String>,
}

impl Default for ValidationSection {
    fn default() -> Self {
        ValidationSection {
            allowed_schemes: ["https", "http", "ssh", "git"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection { level: "info".to_string() }
    }
}

impl LoggingSection {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
