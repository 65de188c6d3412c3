//! Per-request build session record and its shared handle.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

use super::state::SessionState;
use crate::error::BuildError;
use crate::models::{ArtifactRef, BuildSpec, FailureCause, SessionId, SessionSnapshot};

/// One build request and everything the pipeline learned about it.
#[derive(Debug, Clone)]
pub struct BuildSession {
    pub id: SessionId,
    pub spec: BuildSpec,
    state: SessionState,
    artifact: Option<ArtifactRef>,
    failure: Option<FailureCause>,
    workspace: PathBuf,
    /// Set once the pipeline's result is final; cancellation is refused after
    sealed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl BuildSession {
    pub fn new(id: SessionId, spec: BuildSpec, workspace: PathBuf) -> Self {
        let now = Utc::now();
        BuildSession {
            id,
            spec,
            state: SessionState::Pending,
            artifact: None,
            failure: None,
            workspace,
            sealed: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.artifact.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureCause> {
        self.failure.as_ref()
    }

    /// Move to `next`. Illegal edges are defects and leave the state untouched.
    pub fn transition_to(&mut self, next: SessionState) -> Result<(), BuildError> {
        if !self.state.can_transition_to(next) {
            return Err(BuildError::InternalError(format!(
                "Invalid session transition: {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Enter `Done` with the issued artifact.
    pub fn complete(&mut self, artifact: ArtifactRef) -> Result<(), BuildError> {
        self.transition_to(SessionState::Done)?;
        self.artifact = Some(artifact);
        Ok(())
    }

    /// Enter `Failed` recording the cause.
    pub fn fail(&mut self, error: &BuildError) -> Result<(), BuildError> {
        self.transition_to(SessionState::Failed)?;
        self.failure = Some(error.cause());
        Ok(())
    }

    /// Status view. `zip_url` is prefixed with `base_url`.
    pub fn snapshot(&self, base_url: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            repo_url: self.spec.repo_url.clone(),
            branch: self.spec.git_ref.clone(),
            os: self.spec.os_target,
            state: self.state,
            failure: self.failure.clone(),
            zip_url: self
                .artifact
                .as_ref()
                .map(|a| format!("{}{}", base_url.trim_end_matches('/'), a.url_path())),
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        }
    }
}

/// Shared handle to a live session.
///
/// The record is only mutated by the pipeline task. Everything else reads
/// snapshots, watches the state, or raises the cancel flag.
pub struct SessionHandle {
    id: SessionId,
    session: Mutex<BuildSession>,
    state_tx: watch::Sender<SessionState>,
    cancel_tx: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn new(session: BuildSession) -> Self {
        let (state_tx, _) = watch::channel(session.state());
        let (cancel_tx, _) = watch::channel(false);
        SessionHandle {
            id: session.id,
            session: Mutex::new(session),
            state_tx,
            cancel_tx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, BuildSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn spec(&self) -> BuildSpec {
        self.lock().spec.clone()
    }

    pub fn workspace(&self) -> PathBuf {
        self.lock().workspace().to_path_buf()
    }

    /// Apply `f` to the record and publish the resulting state.
    fn update<F>(&self, f: F) -> Result<(), BuildError>
    where
        F: FnOnce(&mut BuildSession) -> Result<(), BuildError>,
    {
        let mut session = self.lock();
        f(&mut session)?;
        self.state_tx.send_replace(session.state());
        Ok(())
    }

    pub fn transition(&self, next: SessionState) -> Result<(), BuildError> {
        self.update(|s| s.transition_to(next))
    }

    pub fn complete(&self, artifact: ArtifactRef) -> Result<(), BuildError> {
        self.update(|s| s.complete(artifact))
    }

    pub fn fail(&self, error: &BuildError) -> Result<(), BuildError> {
        self.update(|s| s.fail(error))
    }

    /// Raise the cancel flag. False when the session already finished or its
    /// result was sealed.
    pub fn cancel(&self) -> bool {
        let session = self.lock();
        if session.sealed || session.state.is_terminal() {
            return false;
        }
        self.cancel_tx.send_replace(true);
        true
    }

    /// Close the session to cancellation before its result is published.
    /// Returns whether a cancel got in first, in which case no stage result
    /// may stand.
    pub fn seal(&self) -> bool {
        let mut session = self.lock();
        session.sealed = true;
        *self.cancel_tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self, base_url: &str) -> SessionSnapshot {
        self.lock().snapshot(base_url)
    }
}
