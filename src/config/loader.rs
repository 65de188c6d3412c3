//! Config file loader and environment overrides.

use crate::config::{validator, RuntimeKind, ServerConfig};
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/rpmforge.toml";

/// Resolve the config path: `RPMFORGE_CONFIG` or `config/rpmforge.toml`.
pub fn config_path_from_env() -> PathBuf {
    std::env::var("RPMFORGE_CONFIG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load, override from the environment, and validate.
///
/// A missing file is not an error: defaults are used.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    validate_config_path(path)?;

    let mut config = match fs::read_to_string(path) {
        Ok(content) => {
            log::info!("[Config] Loading configuration from {}", path.display());
            toml::from_str::<ServerConfig>(&content)?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!(
                "[Config] No configuration at {}, using defaults",
                path.display()
            );
            ServerConfig::default()
        }
        Err(e) => return Err(ConfigError::IoError(e)),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validator::validate_config(&config)?;
    Ok(config)
}

/// Apply `RPMFORGE_*` overrides. `lookup` is injectable for tests.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(bind) = get("RPMFORGE_BIND") {
        config.server.bind = bind;
    }
    if let Some(dir) = get("RPMFORGE_WORK_ROOT") {
        config.paths.work_root = PathBuf::from(dir);
    }
    if let Some(dir) = get("RPMFORGE_ARTIFACT_ROOT") {
        config.paths.artifact_root = PathBuf::from(dir);
    }
    if let Some(dir) = get("RPMFORGE_LOG_DIR") {
        config.paths.log_dir = PathBuf::from(dir);
    }
    if let Some(raw) = get("RPMFORGE_MAX_BUILDS") {
        config.limits.max_concurrent_builds = raw.trim().parse().map_err(|_| {
            ConfigError::ValidationFailed(format!("RPMFORGE_MAX_BUILDS is not a number: {}", raw))
        })?;
    }
    if let Some(raw) = get("RPMFORGE_RUNTIME") {
        config.sandbox.runtime = raw
            .parse::<RuntimeKind>()
            .map_err(ConfigError::ValidationFailed)?;
    }
    if let Some(level) = get("RPMFORGE_LOG") {
        config.logging.level = level;
    }
    Ok(())
}

/// Validate config path (.toml extension required).
pub fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "toml" => {}
        Some(ext) => {
            return Err(ConfigError::ValidationFailed(format!(
                "Configuration file must have .toml extension, got .{}",
                ext.to_string_lossy()
            )))
        }
        None => {
            return Err(ConfigError::ValidationFailed(
                "Configuration file must have .toml extension".to_string(),
            ))
        }
    }

    if path.to_str().is_none() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path contains invalid characters".to_string(),
        ));
    }

    Ok(())
}
