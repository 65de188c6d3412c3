//! rpmforge: RPM build orchestration service
//!
//! A client sends `start_build{repo_url, branch, os}` over a WebSocket. The
//! service clones the repository, runs rpmbuild inside a sandbox matching the
//! requested OS, streams the output back as `log` events and finishes with
//! `done{zip_url}` pointing at an archive of the produced packages.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Core data structures and types
//! - **config**: Server configuration, loading and input validation
//! - **log_collector**: Process-wide logger backing the `log` facade
//! - **broadcast**: Per-session ordered output fan-out
//! - **repo**: Repository fetch and checkout
//! - **sandbox**: Isolated, OS-matched build execution
//! - **artifact**: Package archiving and the expiring artifact store
//! - **orchestrator**: Session lifecycle and pipeline driving
//! - **server**: HTTP and WebSocket front end

// Core foundational modules
pub mod error;
pub mod models;

pub mod config;

// Decoupled process logging
pub mod log_collector;

// Pipeline components, leaves first
pub mod broadcast;
pub mod repo;
pub mod sandbox;
pub mod artifact;

pub mod orchestrator;
pub mod server;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{init_global_logger, LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{BuildError, ConfigError, Result};

pub use models::{
    ArtifactRef, BuildRequest, BuildSpec, FailureCause, OsTarget, SessionId, SessionSnapshot,
};

pub use config::ServerConfig;
pub use orchestrator::{Orchestrator, ServerContext, SessionState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
