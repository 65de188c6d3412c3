//! Build Sandbox Executor
//!
//! Runs the RPM toolchain against a session workspace inside the isolated
//! environment matching the requested OS. Each build gets its own container
//! (`rpmforge-<os>-<session>`), so concurrent builds never share toolchain state.
//! The workspace is the only host path visible to the build.
//!
//! The `host` runtime skips containers and applies limits with setrlimit. It is
//! intended for development and tests.

pub mod process;
pub mod profiles;

pub use process::{HostLimits, RunOutcome, RunSpec};
pub use profiles::{ProfileRegistry, SandboxProfile, DEFAULT_BUILD_SCRIPT};

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::broadcast::SessionLogSink;
use crate::config::{RuntimeKind, SandboxSection, ServerConfig};
use crate::error::BuildError;
use crate::models::{OsTarget, SessionId};

/// Mount point of the workspace inside containers.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Workspace layout shared by the fetcher, the executor and the packager.
pub fn src_dir(workspace: &Path) -> std::path::PathBuf {
    workspace.join("src")
}

pub fn topdir(workspace: &Path) -> std::path::PathBuf {
    workspace.join("rpmbuild")
}

/// Outcome of a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Paths announced by `Wrote:` lines, as seen inside the sandbox
    pub reported_packages: Vec<String>,
    pub lines: u64,
    pub duration: Duration,
}

/// Extract the package path from an rpmbuild `Wrote:` line (or its zh_CN form).
pub fn parse_written_line(line: &str) -> Option<String> {
    const MARKERS: [&str; 2] = ["Wrote:", "已写至："];
    MARKERS.iter().find_map(|marker| {
        line.split_once(marker)
            .map(|(_, rest)| rest.trim().to_string())
            .filter(|path| !path.is_empty())
    })
}

/// Runs builds inside per-OS sandboxes.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    settings: SandboxSection,
    registry: ProfileRegistry,
    timeout: Duration,
    kill_grace: Duration,
}

impl SandboxExecutor {
    pub fn from_config(config: &ServerConfig) -> Self {
        SandboxExecutor {
            settings: config.sandbox.clone(),
            registry: ProfileRegistry::from_section(&config.sandbox),
            timeout: config.limits.build_timeout(),
            kill_grace: config.limits.kill_grace(),
        }
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.settings.runtime
    }

    pub fn container_name(os: OsTarget, session: SessionId) -> String {
        format!("rpmforge-{}-{}", os.slug(), session)
    }

    /// Resolve the command line for one build.
    pub fn plan(
        &self,
        session: SessionId,
        workspace: &Path,
        os: OsTarget,
    ) -> Result<RunSpec, BuildError> {
        let profile = self.registry.get(os).ok_or_else(|| {
            BuildError::InternalError(format!("No sandbox profile configured for {}", os))
        })?;

        match self.settings.runtime.binary() {
            None => Ok(self.plan_host(workspace, os, profile)),
            Some(binary) => Ok(self.plan_container(binary, session, workspace, os, profile)),
        }
    }

    fn plan_host(&self, workspace: &Path, os: OsTarget, profile: &SandboxProfile) -> RunSpec {
        let limits = HostLimits {
            address_space: (self.settings.memory_limit_mb > 0)
                .then(|| self.settings.memory_limit_mb * 1024 * 1024),
            cpu_seconds: (self.settings.cpu_time_limit_secs > 0)
                .then_some(self.settings.cpu_time_limit_secs),
        };
        RunSpec {
            program: "bash".to_string(),
            args: vec!["-c".to_string(), format!("exec 2>&1\n{}", profile.script)],
            envs: vec![
                ("RPMFORGE_WORKSPACE".to_string(), workspace.display().to_string()),
                ("RPMFORGE_SRC".to_string(), src_dir(workspace).display().to_string()),
                ("RPMFORGE_TOPDIR".to_string(), topdir(workspace).display().to_string()),
                ("RPMFORGE_OS".to_string(), os.as_str().to_string()),
            ],
            cwd: workspace.to_path_buf(),
            limits,
        }
    }

    fn plan_container(
        &self,
        binary: &str,
        session: SessionId,
        workspace: &Path,
        os: OsTarget,
        profile: &SandboxProfile,
    ) -> RunSpec {
        let owner = format!(
            "{}:{}",
            nix::unistd::Uid::current(),
            nix::unistd::Gid::current()
        );
        let mut args: Vec<String> = vec!["run".to_string(), "-i".to_string()];
        args.push("--name".to_string());
        args.push(Self::container_name(os, session));
        if !self.settings.network.is_empty() {
            args.push("--network".to_string());
            args.push(self.settings.network.clone());
        }
        if self.settings.memory_limit_mb > 0 {
            args.push("--memory".to_string());
            args.push(format!("{}m", self.settings.memory_limit_mb));
            args.push("--memory-swap".to_string());
            args.push(format!("{}m", self.settings.memory_limit_mb));
        }
        if self.settings.cpu_limit > 0.0 {
            args.push("--cpus".to_string());
            args.push(format!("{}", self.settings.cpu_limit));
        }
        if self.settings.pids_limit > 0 {
            args.push("--pids-limit".to_string());
            args.push(self.settings.pids_limit.to_string());
        }
        args.push("--security-opt".to_string());
        args.push("no-new-privileges".to_string());
        args.push("--cap-drop".to_string());
        args.push("ALL".to_string());
        // package installation and rpmbuild file ownership
        for cap in ["CHOWN", "DAC_OVERRIDE", "FOWNER", "SETUID", "SETGID"] {
            args.push("--cap-add".to_string());
            args.push(cap.to_string());
        }
        args.push("--tmpfs".to_string());
        args.push("/tmp".to_string());
        args.push("-v".to_string());
        args.push(format!("{}:{}:rw", workspace.display(), CONTAINER_WORKSPACE));
        args.push("-w".to_string());
        args.push(CONTAINER_WORKSPACE.to_string());

        let envs = [
            ("RPMFORGE_WORKSPACE", CONTAINER_WORKSPACE.to_string()),
            ("RPMFORGE_SRC", format!("{}/src", CONTAINER_WORKSPACE)),
            ("RPMFORGE_TOPDIR", format!("{}/rpmbuild", CONTAINER_WORKSPACE)),
            ("RPMFORGE_OS", os.as_str().to_string()),
            ("RPMFORGE_OWNER", owner),
        ];
        for (key, value) in envs {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(profile.image.clone());
        args.push("/bin/bash".to_string());
        args.push("-c".to_string());
        args.push(format!(
            "exec 2>&1\ntrap 'chown -R \"$RPMFORGE_OWNER\" {} 2>/dev/null || true' EXIT\n{}",
            CONTAINER_WORKSPACE, profile.script
        ));

        RunSpec {
            program: binary.to_string(),
            args,
            envs: vec![],
            cwd: workspace.to_path_buf(),
            limits: HostLimits::default(),
        }
    }

    /// Run the build for `os` against `workspace`, streaming output to `sink`.
    pub async fn build(
        &self,
        session: SessionId,
        workspace: &Path,
        os: OsTarget,
        sink: &SessionLogSink,
        cancel: watch::Receiver<bool>,
    ) -> Result<BuildReport, BuildError> {
        let spec = self.plan(session, workspace, os)?;
        let started = Instant::now();

        sink.line(format!(
            "[build] {} in {} sandbox",
            os,
            match self.settings.runtime {
                RuntimeKind::Host => "host".to_string(),
                _ => self.registry.get(os).map(|p| p.image.clone()).unwrap_or_default(),
            }
        ));
        log::info!("[Sandbox] [{}] [BUILD] {}", session, spec.preview());

        let mut reported = Vec::new();
        let mut lines = 0u64;
        let mut on_line = |line: &str| {
            lines += 1;
            if let Some(path) = parse_written_line(line) {
                reported.push(path);
            }
            sink.line(line);
        };

        let cpu_before = children_cpu_time();
        let outcome = process::run_streaming(&spec, &mut on_line, cancel, self.timeout, self.kill_grace).await;
        let cpu_used = children_cpu_time().saturating_sub(cpu_before);

        let container = self
            .settings
            .runtime
            .binary()
            .map(|binary| (binary, Self::container_name(os, session)));
        let oom_killed = match &container {
            Some((binary, name)) => {
                let oom = container_oom_killed(binary, name).await;
                remove_container(binary, name).await;
                oom
            }
            None => false,
        };

        let status = match outcome? {
            RunOutcome::Cancelled => return Err(BuildError::Cancelled),
            RunOutcome::TimedOut => {
                return Err(BuildError::TimeoutFailure(format!(
                    "build exceeded {}s",
                    self.timeout.as_secs()
                )))
            }
            RunOutcome::Exited(status) => status,
        };

        log::info!("[Sandbox] [{}] [EXIT] {}", session, status);

        if oom_killed {
            return Err(BuildError::ResourceExceeded(format!(
                "memory limit of {} MB reached",
                self.settings.memory_limit_mb
            )));
        }
        if let Some(limit) = spec.limits.cpu_seconds {
            if cpu_limit_exceeded(status, limit, cpu_used) {
                return Err(BuildError::ResourceExceeded(format!(
                    "CPU time limit of {}s reached",
                    limit
                )));
            }
        }
        if !status.success() {
            return Err(BuildError::BuildFailure {
                exit_code: status.code(),
            });
        }

        Ok(BuildReport {
            reported_packages: reported,
            lines,
            duration: started.elapsed(),
        })
    }
}

/// Whether a host build that ended with `status` was stopped by RLIMIT_CPU.
///
/// `cpu_used` is how much this process's reaped-children CPU time grew while
/// the build ran. Concurrent builds add to it, so it only rules a limit kill
/// out: a SIGKILL after less CPU than the limit came from somewhere else.
/// A shell reports a command killed by SIGXCPU as exit code 128 + SIGXCPU.
fn cpu_limit_exceeded(status: ExitStatus, limit_secs: u64, cpu_used: Duration) -> bool {
    if limit_secs == 0 {
        return false;
    }
    match status.signal() {
        Some(libc::SIGXCPU) => true,
        Some(libc::SIGKILL) => cpu_used >= Duration::from_secs(limit_secs),
        Some(_) => false,
        None => status.code() == Some(128 + libc::SIGXCPU),
    }
}

/// User plus system time of every child this process has reaped.
fn children_cpu_time() -> Duration {
    use nix::sys::resource::{getrusage, UsageWho};
    use nix::sys::time::TimeVal;

    let duration = |tv: TimeVal| {
        Duration::from_secs(tv.tv_sec().max(0) as u64)
            + Duration::from_micros(tv.tv_usec().max(0) as u64)
    };
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => duration(usage.user_time()) + duration(usage.system_time()),
        Err(e) => {
            log::debug!("[Sandbox] getrusage failed: {}", e);
            Duration::ZERO
        }
    }
}

async fn container_oom_killed(binary: &str, name: &str) -> bool {
    tokio::process::Command::new(binary)
        .args(["inspect", "-f", "{{.State.OOMKilled}}", name])
        .output()
        .await
        .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "true")
        .unwrap_or(false)
}

/// `<runtime> rm -f <name>`; a container that never started is not an error.
pub async fn remove_container(binary: &str, name: &str) {
    let result = tokio::process::Command::new(binary)
        .args(["rm", "-f", name])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        log::warn!("[Sandbox] Failed to remove container {}: {}", name, e);
    }
}
