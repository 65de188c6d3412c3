//! Repository Fetcher: clone a remote and check out one ref into a workspace.
//!
//! `Fetcher::fetch` wraps the blocking `git` module with an overall deadline,
//! cancellation, and bounded retries for transient network failures.

pub mod git;

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broadcast::SessionLogSink;
use crate::config::LimitsSection;
use crate::error::BuildError;

pub use git::{AbortReason, AbortSignal, FetchedRef, GitError, RemoteRef};

/// Repository fetcher with retry and timeout policy.
#[derive(Debug, Clone)]
pub struct Fetcher {
    timeout: Duration,
    attempts: u32,
    backoff: Duration,
    abort_grace: Duration,
}

impl Fetcher {
    pub fn new(timeout: Duration, attempts: u32, backoff: Duration) -> Self {
        Fetcher {
            timeout,
            attempts: attempts.max(1),
            backoff,
            abort_grace: Duration::from_secs(5),
        }
    }

    /// How long an aborted fetch waits for the git worker to notice.
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    pub fn from_limits(limits: &LimitsSection) -> Self {
        Self::new(
            limits.fetch_timeout(),
            limits.fetch_retries,
            Duration::from_millis(limits.fetch_backoff_ms),
        )
        .with_abort_grace(limits.cancel_grace())
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff
            .checked_mul(1u32 << (attempt.saturating_sub(1)).min(16))
            .unwrap_or(self.backoff)
    }

    /// Fetch `git_ref` from `repo_url` and check it out into `dest`.
    ///
    /// `dest` is recreated before every attempt.
    pub async fn fetch(
        &self,
        repo_url: &str,
        git_ref: &str,
        dest: &Path,
        sink: SessionLogSink,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<FetchedRef, BuildError> {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0u32;

        loop {
            if *cancel.borrow() {
                return Err(BuildError::Cancelled);
            }
            attempt += 1;
            sink.line(format!(
                "[fetch] {} @ {} (attempt {}/{})",
                repo_url, git_ref, attempt, self.attempts
            ));
            log::info!(
                "[Fetcher] [{}] attempt {}/{} for {} @ {}",
                sink.session_id(),
                attempt,
                self.attempts,
                repo_url,
                git_ref
            );

            reset_dir(dest).await?;

            let result = self
                .attempt(repo_url, git_ref, dest, &sink, &mut cancel, deadline)
                .await;

            let err = match result {
                Ok(fetched) => {
                    sink.line(format!(
                        "[fetch] checked out {} at {}{}",
                        fetched.remote_ref.remote_name(),
                        fetched.commit,
                        if fetched.shallow { "" } else { " (full history)" }
                    ));
                    return Ok(fetched);
                }
                Err(err) => err,
            };

            if err.is_transient() && attempt < self.attempts {
                let delay = self.backoff_for(attempt);
                sink.line(format!("[fetch] {}; retrying in {} ms", err, delay.as_millis()));
                log::warn!("[Fetcher] [{}] transient failure: {}", sink.session_id(), err);
                if Instant::now() + delay >= deadline {
                    return Err(BuildError::TimeoutFailure(format!(
                        "fetch exceeded {}s",
                        self.timeout.as_secs()
                    )));
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_cancelled(&mut cancel) => return Err(BuildError::Cancelled),
                }
                continue;
            }

            return Err(self.map_error(err));
        }
    }

    async fn attempt(
        &self,
        repo_url: &str,
        git_ref: &str,
        dest: &Path,
        sink: &SessionLogSink,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<FetchedRef, GitError> {
        let abort = AbortSignal::new(cancel.clone(), deadline.into_std());
        let url = repo_url.to_string();
        let name = git_ref.to_string();
        let target: PathBuf = dest.to_path_buf();
        let progress_sink = sink.clone();

        let mut task = tokio::task::spawn_blocking(move || {
            let progress = |line: &str| progress_sink.line(line);
            git::fetch_and_checkout(&url, &name, &target, &abort, &progress)
        });

        // The blocking task observes the same deadline and cancel flag through
        // its callbacks and stops at its next check.
        let reason = tokio::select! {
            joined = &mut task => return match joined {
                Ok(result) => result,
                Err(e) => Err(GitError::Remote(format!("fetch task failed: {}", e))),
            },
            _ = tokio::time::sleep_until(deadline) => AbortReason::Deadline,
            _ = wait_cancelled(cancel) => AbortReason::Cancelled,
        };

        settle_abandoned(task, self.abort_grace, dest.to_path_buf()).await;
        Err(GitError::Aborted(reason))
    }

    fn map_error(&self, err: GitError) -> BuildError {
        match err {
            GitError::Aborted(AbortReason::Cancelled) => BuildError::Cancelled,
            GitError::Aborted(AbortReason::Deadline) => BuildError::TimeoutFailure(format!(
                "fetch exceeded {}s",
                self.timeout.as_secs()
            )),
            GitError::RefNotFound(name) => {
                BuildError::CheckoutFailure(format!("ref '{}' does not exist on the remote", name))
            }
            GitError::Checkout(msg) => BuildError::CheckoutFailure(msg),
            GitError::Network(msg) => BuildError::CloneFailure(format!("network error: {}", msg)),
            GitError::Auth(msg) => BuildError::CloneFailure(format!("authentication failed: {}", msg)),
            GitError::Remote(msg) => BuildError::CloneFailure(msg),
            GitError::Io(e) => BuildError::InternalError(e.to_string()),
        }
    }
}

/// Resolves once the cancel flag is set. Pends forever if the sender is gone.
pub async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Wait up to `grace` for an aborted git worker to return. A worker that is
/// still running after that gets a watcher that removes `dest` once it exits,
/// so nothing it writes outlives the session's workspace cleanup.
async fn settle_abandoned<T: Send + 'static>(
    mut task: JoinHandle<T>,
    grace: Duration,
    dest: PathBuf,
) {
    if tokio::time::timeout(grace, &mut task).await.is_ok() {
        return;
    }
    log::warn!(
        "[Fetcher] git worker still busy {} ms after abort; {} is removed when it returns",
        grace.as_millis(),
        dest.display()
    );
    tokio::spawn(async move {
        let _ = task.await;
        match tokio::fs::remove_dir_all(&dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("[Fetcher] Failed to remove {}: {}", dest.display(), e),
        }
    });
}

async fn reset_dir(dir: &Path) -> Result<(), BuildError> {
    if tokio::fs::try_exists(dir).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}
