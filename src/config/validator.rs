//! Config and request validation.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::config::{RuntimeKind, ServerConfig, ValidationSection};
use crate::error::{BuildError, ConfigError};
use crate::models::{BuildRequest, BuildSpec, OsTarget};

/// Maximum accepted ref length.
pub const MAX_REF_LEN: usize = 200;

static REF_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._/-]+$").expect("static ref charset regex")
});

/// `user@host:path`, the scp-like form git accepts for ssh remotes.
static SCP_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[A-Za-z0-9._~/-]+$").expect("static scp regex")
});

/// Validate the server config after loading.
pub fn validate_config(config: &ServerConfig) -> Result<(), ConfigError> {
    let limits = &config.limits;
    let nonzero = [
        ("limits.max_concurrent_builds", limits.max_concurrent_builds as u64),
        ("limits.fetch_timeout_secs", limits.fetch_timeout_secs),
        ("limits.fetch_retries", limits.fetch_retries as u64),
        ("limits.build_timeout_secs", limits.build_timeout_secs),
        ("limits.max_session_log_bytes", limits.max_session_log_bytes as u64),
        ("artifacts.ttl_secs", config.artifacts.ttl_secs),
        ("artifacts.max_store_bytes", config.artifacts.max_store_bytes),
        ("artifacts.reap_interval_secs", config.artifacts.reap_interval_secs),
    ];
    for (name, value) in nonzero {
        if value == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "{} must be greater than zero",
                name
            )));
        }
    }

    if config.sandbox.cpu_limit < 0.0 {
        return Err(ConfigError::ValidationFailed(
            "sandbox.cpu_limit cannot be negative".to_string(),
        ));
    }

    for os in OsTarget::ALL {
        match config.sandbox.profile(os) {
            None => {
                return Err(ConfigError::ValidationFailed(format!(
                    "sandbox.profiles is missing an entry for {}",
                    os
                )))
            }
            Some(p) if p.image.trim().is_empty() && config.sandbox.runtime != RuntimeKind::Host => {
                return Err(ConfigError::ValidationFailed(format!(
                    "sandbox.profiles.{}.image cannot be empty",
                    os
                )))
            }
            Some(_) => {}
        }
    }

    if config.validation.allowed_schemes.is_empty() {
        return Err(ConfigError::ValidationFailed(
            "validation.allowed_schemes cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validate a raw request and produce immutable build inputs.
pub fn validate_request(
    request: &BuildRequest,
    validation: &ValidationSection,
) -> Result<BuildSpec, BuildError> {
    validate_repo_url(&request.repo_url, &validation.allowed_schemes)?;
    validate_git_ref(&request.branch)?;
    let os_target = request
        .os
        .parse::<OsTarget>()
        .map_err(BuildError::InvalidInput)?;

    Ok(BuildSpec {
        repo_url: request.repo_url.clone(),
        git_ref: request.branch.clone(),
        os_target,
    })
}

/// Accepts `scheme://` URLs whose scheme is allowed, and scp-like `user@host:path`
/// when `ssh` is allowed.
pub fn validate_repo_url(raw: &str, allowed_schemes: &[String]) -> Result<(), BuildError> {
    let invalid = |why: &str| BuildError::InvalidInput(format!("repository URL {}", why));

    if raw.is_empty() {
        return Err(invalid("is empty"));
    }
    if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("contains whitespace or control characters"));
    }
    if raw.starts_with('-') {
        return Err(invalid("cannot start with '-'"));
    }

    let allowed = |scheme: &str| allowed_schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme));

    if !raw.contains("://") {
        if SCP_LIKE.is_match(raw) && allowed("ssh") {
            return Ok(());
        }
        return Err(invalid("is not a well-formed repository address"));
    }

    let url = Url::parse(raw).map_err(|e| invalid(&format!("is malformed: {}", e)))?;
    let scheme = url.scheme();
    if !allowed(scheme) {
        return Err(invalid(&format!("uses unsupported scheme '{}'", scheme)));
    }

    if scheme != "file" && url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("has no host"));
    }
    let path = url.path().trim_matches('/');
    if path.is_empty() {
        return Err(invalid("has no repository path"));
    }
    if (scheme == "http" || scheme == "https") && (url.password().is_some() || !url.username().is_empty()) {
        return Err(invalid("must not embed credentials"));
    }

    Ok(())
}

/// Safe branch/tag name grammar, mirroring `git check-ref-format --branch`.
pub fn validate_git_ref(name: &str) -> Result<(), BuildError> {
    let invalid = |why: &str| BuildError::InvalidInput(format!("branch '{}' {}", name, why));

    if name.is_empty() {
        return Err(BuildError::InvalidInput("branch cannot be empty".to_string()));
    }
    if name.len() > MAX_REF_LEN {
        return Err(BuildError::InvalidInput(format!(
            "branch exceeds {} characters",
            MAX_REF_LEN
        )));
    }
    if !REF_CHARSET.is_match(name) {
        return Err(invalid("contains unsupported characters"));
    }
    if name.starts_with('-') || name.starts_with('/') || name.starts_with('.') {
        return Err(invalid("has an invalid leading character"));
    }
    if name.ends_with('/') || name.ends_with('.') || name.ends_with(".lock") {
        return Err(invalid("has an invalid ending"));
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return Err(invalid("contains a forbidden sequence"));
    }
    if name.split('/').any(|c| c.starts_with('.') || c.ends_with(".lock")) {
        return Err(invalid("has a component starting with '.' or ending with '.lock'"));
    }
    Ok(())
}
