//! Child process supervision for sandboxed builds.
//!
//! Spawns the build in its own process group, streams both pipes line by line,
//! and enforces the wall-clock deadline and cancellation by signalling the
//! whole group (SIGTERM, then SIGKILL after the grace period).

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::error::BuildError;
use crate::repo::wait_cancelled;

/// Resource ceilings applied with setrlimit in the child (host runtime).
///
/// An RLIMIT_AS breach shows up as an allocation failure inside the build and
/// ends in an ordinary nonzero exit; nothing in the exit status tells it apart
/// from a failed build. RLIMIT_CPU ends the process with SIGXCPU (or SIGKILL at
/// the hard limit), which can be classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostLimits {
    /// RLIMIT_AS in bytes
    pub address_space: Option<u64>,
    /// RLIMIT_CPU in seconds
    pub cpu_seconds: Option<u64>,
}

/// A fully resolved command line
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub limits: HostLimits,
}

impl RunSpec {
    /// Shell-quoted preview for logs.
    pub fn preview(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_escape)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How the supervised process ended
#[derive(Debug)]
pub enum RunOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

fn spawn(spec: &RunSpec) -> Result<Child, BuildError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);
    for (key, value) in &spec.envs {
        command.env(key, value);
    }

    let limits = spec.limits;
    if limits != HostLimits::default() {
        // SAFETY: only async-signal-safe setrlimit calls between fork and exec.
        unsafe {
            command.pre_exec(move || {
                use nix::sys::resource::{setrlimit, Resource};
                let to_io = |e: nix::errno::Errno| std::io::Error::from_raw_os_error(e as i32);
                if let Some(bytes) = limits.address_space {
                    setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(to_io)?;
                }
                if let Some(secs) = limits.cpu_seconds {
                    // SIGXCPU at the soft limit, SIGKILL at the hard one
                    setrlimit(Resource::RLIMIT_CPU, secs, secs + 2).map_err(to_io)?;
                }
                Ok(())
            });
        }
    }

    command.spawn().map_err(|e| {
        BuildError::InternalError(format!("Failed to spawn {}: {}", spec.program, e))
    })
}

/// Read one line (lossy UTF-8). `Ok(None)` at EOF.
///
/// Partial data stays in `buf` if the future is dropped, so this is safe to
/// race in `select!` as long as `buf` outlives the loop.
async fn next_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 && buf.is_empty() {
        return Ok(None);
    }
    let mut line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    Ok(Some(line))
}

/// SIGTERM the group, wait up to `grace` for every member to exit, then
/// SIGKILL whatever is left of the group.
///
/// The leader exiting does not end the group: members that ignore SIGTERM
/// keep the group id alive and are only reached through it.
pub async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);
        let drained = tokio::time::timeout(grace, async {
            let _ = child.wait().await;
            while killpg(pgid, None::<Signal>).is_ok() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("[Sandbox] Process group {} ignored SIGTERM, sending SIGKILL", pid);
        }
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Run `spec`, forwarding every output line to `on_line` in arrival order.
pub async fn run_streaming(
    spec: &RunSpec,
    on_line: &mut (dyn FnMut(&str) + Send),
    mut cancel: watch::Receiver<bool>,
    timeout: Duration,
    kill_grace: Duration,
) -> Result<RunOutcome, BuildError> {
    log::debug!("[Sandbox] [SPAWN] {}", spec.preview());
    let mut child = spawn(spec)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BuildError::InternalError("Failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BuildError::InternalError("Failed to capture stderr".to_string()))?;

    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_closed = false;
    let mut stderr_closed = false;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while !(stdout_closed && stderr_closed) {
        tokio::select! {
            line = next_line(&mut stdout_reader, &mut stdout_buf), if !stdout_closed => {
                match line {
                    Ok(Some(line)) => on_line(&line),
                    Ok(None) => stdout_closed = true,
                    Err(e) => {
                        on_line(&format!("[sandbox] stdout read error: {}\n", e));
                        stdout_closed = true;
                    }
                }
            }
            line = next_line(&mut stderr_reader, &mut stderr_buf), if !stderr_closed => {
                match line {
                    Ok(Some(line)) => on_line(&line),
                    Ok(None) => stderr_closed = true,
                    Err(e) => {
                        on_line(&format!("[sandbox] stderr read error: {}\n", e));
                        stderr_closed = true;
                    }
                }
            }
            _ = &mut deadline => {
                terminate(&mut child, kill_grace).await;
                return Ok(RunOutcome::TimedOut);
            }
            _ = wait_cancelled(&mut cancel) => {
                terminate(&mut child, kill_grace).await;
                return Ok(RunOutcome::Cancelled);
            }
        }
    }

    let leader = child.id();
    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| {
                BuildError::InternalError(format!("Failed to wait for build process: {}", e))
            })?;
            // Stragglers that outlived the leader
            if let Some(pid) = leader {
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            Ok(RunOutcome::Exited(status))
        }
        _ = &mut deadline => {
            terminate(&mut child, kill_grace).await;
            Ok(RunOutcome::TimedOut)
        }
        _ = wait_cancelled(&mut cancel) => {
            terminate(&mut child, kill_grace).await;
            Ok(RunOutcome::Cancelled)
        }
    }
}
