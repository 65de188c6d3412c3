//! Session Orchestrator: admits build requests and drives each session through
//! Cloning -> Building -> Packaging on a worker-pool-gated tokio task.
//!
//! Every session ends with exactly one terminal transition. Its log stream is
//! flushed and closed before the terminal state is published, so listeners
//! always see the last chunk before `done`.

pub mod session;
pub mod state;

pub use session::{BuildSession, SessionHandle};
pub use state::SessionState;

use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

use crate::artifact::{self, ArtifactStore};
use crate::broadcast::{LogBroadcaster, LogItem, SessionLogSink};
use crate::config::{validate_request, ServerConfig};
use crate::error::{BuildError, Result};
use crate::models::{ArtifactRef, BuildRequest, SessionId, SessionSnapshot};
use crate::repo::{wait_cancelled, Fetcher};
use crate::sandbox::{self, SandboxExecutor};

/// Everything a pipeline needs, owned in one place and passed explicitly.
pub struct ServerContext {
    pub config: ServerConfig,
    pub store: Arc<ArtifactStore>,
    pub broadcaster: LogBroadcaster,
    pub fetcher: Fetcher,
    pub executor: SandboxExecutor,
    workers: Arc<Semaphore>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
    shutting_down: AtomicBool,
}

impl ServerContext {
    /// Build the context, creating the work, artifact and log directories.
    pub fn from_config(config: ServerConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.paths.work_root)?;
        let store = ArtifactStore::new(config.paths.artifact_root.clone(), &config.artifacts)?;
        let broadcaster = LogBroadcaster::new(
            config.limits.max_session_log_bytes,
            Some(config.paths.log_dir.join("sessions")),
        );
        Ok(ServerContext {
            store: Arc::new(store),
            broadcaster,
            fetcher: Fetcher::from_limits(&config.limits),
            executor: SandboxExecutor::from_config(&config),
            workers: Arc::new(Semaphore::new(config.limits.max_concurrent_builds.max(1))),
            sessions: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            config,
        })
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionHandle>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Session counts for health reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionCounts {
    /// Holding a worker permit
    pub active: usize,
    /// Waiting in `Pending`
    pub queued: usize,
    /// Finished, still inside the grace period
    pub finished: usize,
}

/// Keeps a session reachable after it leaves the table.
pub struct SessionWatcher {
    handle: Arc<SessionHandle>,
    base_url: String,
}

impl SessionWatcher {
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.handle.snapshot(&self.base_url)
    }

    /// Final snapshot, once the session is `Done` or `Failed`.
    pub async fn finished(&self) -> SessionSnapshot {
        let mut states = self.handle.watch_state();
        // The sender lives in `handle`, so this only returns on a terminal state
        let _ = states.wait_for(|s| s.is_terminal()).await;
        self.snapshot()
    }
}

/// A session followed by one listener.
pub struct AttachedSession {
    pub id: SessionId,
    pub logs: BoxStream<'static, LogItem>,
    pub watcher: SessionWatcher,
}

/// Cheap-to-clone front door to the session table.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<ServerContext>,
}

impl Orchestrator {
    pub fn new(ctx: ServerContext) -> Self {
        Orchestrator { ctx: Arc::new(ctx) }
    }

    pub fn from_config(config: ServerConfig) -> std::io::Result<Self> {
        Ok(Self::new(ServerContext::from_config(config)?))
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.ctx.store
    }

    /// Remove workspaces and archives left behind by a previous process.
    pub fn startup_sweep(&self) -> usize {
        let mut removed = self.ctx.store.startup_sweep();
        let work_root = &self.ctx.config.paths.work_root;
        if let Ok(dir) = std::fs::read_dir(work_root) {
            for entry in dir.flatten() {
                let path = entry.path();
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(e) => log::warn!("[Orchestrator] Sweep could not remove {}: {}", path.display(), e),
                }
            }
        }
        if removed > 0 {
            log::info!("[Orchestrator] Startup sweep removed {} stale entries", removed);
        }
        removed
    }

    /// Validate the request, create the session and queue its pipeline.
    ///
    /// Invalid input is rejected here and no session, log or workspace exists
    /// for it.
    pub fn start_build(&self, request: &BuildRequest) -> Result<SessionId> {
        self.launch(request, false).map(|(handle, _)| handle.id())
    }

    /// `start_build` for a caller that follows the session it started. The log
    /// subscription exists before the pipeline runs.
    pub fn start_attached(&self, request: &BuildRequest) -> Result<AttachedSession> {
        let (handle, logs) = self.launch(request, true)?;
        let logs = logs.ok_or_else(|| BuildError::InternalError("session log missing".to_string()))?;
        Ok(self.attached(handle, logs))
    }

    /// Follow an existing session: replay, live output, then its final state.
    pub fn attach(&self, id: SessionId) -> Option<AttachedSession> {
        let handle = self.handle(id)?;
        let logs = self.ctx.broadcaster.subscribe(id)?;
        Some(self.attached(handle, logs))
    }

    fn attached(&self, handle: Arc<SessionHandle>, logs: BoxStream<'static, LogItem>) -> AttachedSession {
        AttachedSession {
            id: handle.id(),
            logs,
            watcher: SessionWatcher {
                handle,
                base_url: self.ctx.config.server.public_base_url.clone(),
            },
        }
    }

    fn launch(
        &self,
        request: &BuildRequest,
        subscribe: bool,
    ) -> Result<(Arc<SessionHandle>, Option<BoxStream<'static, LogItem>>)> {
        if self.ctx.shutting_down.load(Ordering::SeqCst) {
            return Err(BuildError::InternalError("server is shutting down".to_string()));
        }
        let spec = validate_request(request, &self.ctx.config.validation)?;

        let id = SessionId::new();
        let workspace = self.ctx.config.paths.work_root.join(id.to_string());
        let handle = Arc::new(SessionHandle::new(BuildSession::new(id, spec.clone(), workspace)));

        self.ctx.broadcaster.open(id);
        let logs = if subscribe {
            self.ctx.broadcaster.subscribe(id)
        } else {
            None
        };
        self.ctx.sessions().insert(id, Arc::clone(&handle));
        log::info!(
            "[Orchestrator] [{}] [PENDING] {} @ {} for {}",
            id,
            spec.repo_url,
            spec.git_ref,
            spec.os_target
        );

        tokio::spawn(self.clone().supervise(Arc::clone(&handle)));
        Ok((handle, logs))
    }

    fn handle(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.ctx.sessions().get(&id).cloned()
    }

    /// Request cancellation. False for unknown or finished sessions.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.handle(id) {
            Some(handle) => {
                let signalled = handle.cancel();
                if signalled {
                    log::info!("[Orchestrator] [{}] Cancellation requested", id);
                }
                signalled
            }
            None => false,
        }
    }

    pub fn snapshot(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.handle(id)
            .map(|h| h.snapshot(&self.ctx.config.server.public_base_url))
    }

    /// Replay plus live output for a session.
    pub fn subscribe(&self, id: SessionId) -> Option<BoxStream<'static, LogItem>> {
        self.ctx.broadcaster.subscribe(id)
    }

    /// Resolve with the final snapshot once the session is `Done` or `Failed`.
    pub async fn wait_terminal(&self, id: SessionId) -> Option<SessionSnapshot> {
        let watcher = SessionWatcher {
            handle: self.handle(id)?,
            base_url: self.ctx.config.server.public_base_url.clone(),
        };
        Some(watcher.finished().await)
    }

    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for handle in self.ctx.sessions().values() {
            match handle.state() {
                SessionState::Pending => counts.queued += 1,
                s if s.is_terminal() => counts.finished += 1,
                _ => counts.active += 1,
            }
        }
        counts
    }

    /// Cancel every live session and wait, bounded, for them to finish.
    pub async fn shutdown(&self) {
        self.ctx.shutting_down.store(true, Ordering::SeqCst);
        let live: Vec<Arc<SessionHandle>> = self
            .ctx
            .sessions()
            .values()
            .filter(|h| !h.state().is_terminal())
            .cloned()
            .collect();
        log::info!("[Orchestrator] Shutting down, cancelling {} sessions", live.len());

        for handle in &live {
            handle.cancel();
        }
        let grace = self.ctx.config.limits.cancel_grace() + self.ctx.config.limits.kill_grace();
        let all_done = futures::future::join_all(live.iter().map(|h| {
            let mut states = h.watch_state();
            async move {
                let _ = states.wait_for(|s| s.is_terminal()).await;
            }
        }));
        if tokio::time::timeout(grace, all_done).await.is_err() {
            log::warn!("[Orchestrator] Some sessions did not finish within {:?}", grace);
        }
        if let Err(e) = self.ctx.broadcaster.flush().await {
            log::warn!("[Orchestrator] Final log flush failed: {}", e);
        }
    }

    /// Run the pipeline on its own task so a panic surfaces at the join,
    /// then clean up and publish the terminal state.
    async fn supervise(self, handle: Arc<SessionHandle>) {
        let id = handle.id();
        let pipeline = tokio::spawn({
            let orchestrator = self.clone();
            let handle = Arc::clone(&handle);
            async move { orchestrator.run_pipeline(&handle).await }
        });

        let result = match pipeline.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(BuildError::InternalError("pipeline task panicked".to_string()))
            }
            Err(join_err) => Err(BuildError::InternalError(join_err.to_string())),
        };

        remove_workspace(&handle.workspace()).await;

        // No stage result survives a cancellation that got in before the seal
        let cancelled_first = handle.seal();
        let result = match result {
            Ok(artifact) if cancelled_first => {
                self.ctx.store.discard(&artifact);
                Err(BuildError::Cancelled)
            }
            other => other,
        };

        self.finish(&handle, result).await;

        let cancelled = handle.is_cancelled();
        let grace = self.ctx.config.limits.session_grace();
        if cancelled || grace.is_zero() {
            self.evict(id);
        } else {
            let orchestrator = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                orchestrator.evict(id);
            });
        }
    }

    async fn run_pipeline(&self, handle: &SessionHandle) -> Result<ArtifactRef> {
        let id = handle.id();
        let spec = handle.spec();
        let workspace = handle.workspace();
        let sink = SessionLogSink::new(self.ctx.broadcaster.clone(), id);
        let mut cancel = handle.cancel_signal();

        if self.ctx.workers.available_permits() == 0 {
            sink.line("[queue] waiting for a free build slot");
        }
        let _permit = tokio::select! {
            permit = Arc::clone(&self.ctx.workers).acquire_owned() => permit
                .map_err(|_| BuildError::InternalError("worker pool closed".to_string()))?,
            _ = wait_cancelled(&mut cancel) => return Err(BuildError::Cancelled),
        };

        tokio::fs::create_dir_all(&workspace).await?;

        self.advance(handle, SessionState::Cloning)?;
        self.ctx
            .fetcher
            .fetch(
                &spec.repo_url,
                &spec.git_ref,
                &sandbox::src_dir(&workspace),
                sink.clone(),
                handle.cancel_signal(),
            )
            .await?;
        ensure_live(handle)?;

        self.advance(handle, SessionState::Building)?;
        let report = self
            .ctx
            .executor
            .build(id, &workspace, spec.os_target, &sink, handle.cancel_signal())
            .await?;
        ensure_live(handle)?;
        log::info!(
            "[Orchestrator] [{}] Build finished in {:.1}s ({} lines)",
            id,
            report.duration.as_secs_f64(),
            report.lines
        );

        self.advance(handle, SessionState::Packaging)?;
        let artifact = artifact::package(
            &self.ctx.store,
            id,
            &sandbox::topdir(&workspace),
            &spec.package_label(),
            &report.reported_packages,
            self.ctx.config.artifacts.include_srpms,
            &sink,
        )
        .await?;

        Ok(artifact)
    }

    fn advance(&self, handle: &SessionHandle, next: SessionState) -> Result<()> {
        handle.transition(next)?;
        log::info!(
            "[Orchestrator] [{}] [{}]",
            handle.id(),
            next.as_str().to_uppercase()
        );
        Ok(())
    }

    /// Final log line, flush, close, then the terminal transition.
    async fn finish(&self, handle: &SessionHandle, result: Result<ArtifactRef>) {
        let id = handle.id();
        let sink = SessionLogSink::new(self.ctx.broadcaster.clone(), id);

        match &result {
            Ok(artifact) => sink.line(format!("[done] {}", artifact.file_name)),
            Err(err) => {
                match err {
                    BuildError::InternalError(detail) => {
                        log::error!("[Orchestrator] [{}] Internal error: {}", id, detail)
                    }
                    other => log::warn!("[Orchestrator] [{}] [FAILED] {}", id, other),
                }
                sink.line(err.user_message());
            }
        }

        if let Err(e) = self.ctx.broadcaster.flush().await {
            log::warn!("[Orchestrator] [{}] Log flush failed: {}", id, e);
        }
        self.ctx.broadcaster.close(id);
        if let Err(e) = self.ctx.broadcaster.flush().await {
            log::warn!("[Orchestrator] [{}] Log flush failed: {}", id, e);
        }

        let transition = match result {
            Ok(artifact) => handle.complete(artifact),
            Err(err) => handle.fail(&err),
        };
        match transition {
            Ok(()) => log::info!("[Orchestrator] [{}] [{}]", id, handle.state().as_str().to_uppercase()),
            Err(e) => log::error!("[Orchestrator] [{}] Terminal transition rejected: {}", id, e),
        }
    }

    fn evict(&self, id: SessionId) {
        self.ctx.sessions().remove(&id);
        self.ctx.broadcaster.remove(id);
        log::debug!("[Orchestrator] [{}] Evicted", id);
    }
}

fn ensure_live(handle: &SessionHandle) -> Result<()> {
    if handle.is_cancelled() {
        Err(BuildError::Cancelled)
    } else {
        Ok(())
    }
}

async fn remove_workspace(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[Orchestrator] Failed to remove workspace {}: {}", path.display(), e),
    }
}
