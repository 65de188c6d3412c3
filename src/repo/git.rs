//! Native git fetching using the `git2` crate.
//!
//! Everything here is blocking and runs on a `spawn_blocking` worker. The
//! async wrapper with retries and timeouts lives in `repo::Fetcher`.

use git2::{
    build::CheckoutBuilder, CheckoutNotificationType, Cred, CredentialType, Direction, ErrorClass,
    ErrorCode, FetchOptions, RemoteCallbacks, Repository,
};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;

/// Why a transfer was stopped from inside a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    Deadline,
}

/// Errors that can occur during git operations
#[derive(Debug, Error)]
pub enum GitError {
    /// Transient transport failure; eligible for retry
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Reference not found on remote: {0}")]
    RefNotFound(String),

    #[error("Checkout error: {0}")]
    Checkout(String),

    #[error("Transfer aborted: {0:?}")]
    Aborted(AbortReason),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GitError::Network(_))
    }
}

/// Result type for git operations
pub type GitResult<T> = Result<T, GitError>;

/// Checked from every git2 callback; a `true` answer stops the transfer.
#[derive(Clone)]
pub struct AbortSignal {
    cancel: watch::Receiver<bool>,
    deadline: Instant,
}

impl AbortSignal {
    pub fn new(cancel: watch::Receiver<bool>, deadline: Instant) -> Self {
        AbortSignal { cancel, deadline }
    }

    pub fn reason(&self) -> Option<AbortReason> {
        if *self.cancel.borrow() {
            Some(AbortReason::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(AbortReason::Deadline)
        } else {
            None
        }
    }
}

/// Where the ref lives on the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRef {
    Branch(String),
    Tag(String),
}

impl RemoteRef {
    pub fn remote_name(&self) -> String {
        match self {
            RemoteRef::Branch(b) => format!("refs/heads/{}", b),
            RemoteRef::Tag(t) => format!("refs/tags/{}", t),
        }
    }

    fn local_name(&self) -> String {
        match self {
            RemoteRef::Branch(b) => format!("refs/remotes/origin/{}", b),
            RemoteRef::Tag(t) => format!("refs/tags/{}", t),
        }
    }

    fn refspec(&self) -> String {
        format!("+{}:{}", self.remote_name(), self.local_name())
    }
}

/// Outcome of a successful fetch + checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRef {
    pub remote_ref: RemoteRef,
    pub commit: String,
    pub shallow: bool,
}

fn classify(e: git2::Error, abort: &AbortSignal) -> GitError {
    if let Some(reason) = abort.reason() {
        return GitError::Aborted(reason);
    }
    if e.code() == ErrorCode::Auth {
        return GitError::Auth(e.message().to_string());
    }
    if e.code() == ErrorCode::NotFound {
        return GitError::Remote(e.message().to_string());
    }
    match e.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl | ErrorClass::Os => {
            GitError::Network(e.message().to_string())
        }
        _ => GitError::Remote(e.message().to_string()),
    }
}

/// Callbacks shared by the connect and fetch phases.
fn make_callbacks<'a>(abort: &'a AbortSignal, progress: &'a (dyn Fn(&str) + 'a)) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();

    let mut credential_attempts = 0u32;
    callbacks.credentials(move |_url, username, allowed| {
        credential_attempts += 1;
        if credential_attempts > 1 {
            return Err(git2::Error::from_str("credentials rejected"));
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            Cred::ssh_key_from_agent(username.unwrap_or("git"))
        } else if allowed.contains(CredentialType::DEFAULT) {
            Cred::default()
        } else {
            Err(git2::Error::from_str("no usable credentials"))
        }
    });

    let mut last_percent: Option<u32> = None;
    callbacks.transfer_progress(move |stats| {
        let total = stats.total_objects();
        if total > 0 {
            let percent = (stats.received_objects() as u64 * 100 / total as u64) as u32;
            let bucket = percent / 10 * 10;
            if last_percent != Some(bucket) {
                last_percent = Some(bucket);
                progress(&format!(
                    "[fetch] received {}/{} objects ({}%), {} bytes",
                    stats.received_objects(),
                    total,
                    percent,
                    stats.received_bytes()
                ));
            }
        }
        abort.reason().is_none()
    });

    callbacks.sideband_progress(move |data| {
        let text = String::from_utf8_lossy(data);
        for piece in text.split(|c| c == '\r' || c == '\n') {
            let piece = piece.trim();
            if !piece.is_empty() {
                progress(&format!("remote: {}", piece));
            }
        }
        abort.reason().is_none()
    });

    callbacks
}

/// List the remote's advertised refs and locate `git_ref` among heads, then tags.
pub fn resolve_remote_ref(
    repo: &Repository,
    url: &str,
    git_ref: &str,
    abort: &AbortSignal,
    progress: &dyn Fn(&str),
) -> GitResult<RemoteRef> {
    let mut remote = repo
        .remote_anonymous(url)
        .map_err(|e| classify(e, abort))?;

    let callbacks = make_callbacks(abort, progress);
    let connection = remote
        .connect_auth(Direction::Fetch, Some(callbacks), None)
        .map_err(|e| classify(e, abort))?;

    let heads = connection.list().map_err(|e| classify(e, abort))?;
    let branch = format!("refs/heads/{}", git_ref);
    let tag = format!("refs/tags/{}", git_ref);

    let mut found_tag = false;
    for head in heads {
        if head.name() == branch {
            return Ok(RemoteRef::Branch(git_ref.to_string()));
        }
        if head.name() == tag {
            found_tag = true;
        }
    }
    if found_tag {
        return Ok(RemoteRef::Tag(git_ref.to_string()));
    }

    Err(GitError::RefNotFound(git_ref.to_string()))
}

fn fetch_refspec(
    repo: &Repository,
    url: &str,
    remote_ref: &RemoteRef,
    depth: Option<i32>,
    abort: &AbortSignal,
    progress: &dyn Fn(&str),
) -> GitResult<()> {
    let mut remote = repo
        .remote_anonymous(url)
        .map_err(|e| classify(e, abort))?;

    let mut fetch_options = FetchOptions::new();
    if let Some(depth) = depth {
        fetch_options.depth(depth);
    }
    fetch_options.remote_callbacks(make_callbacks(abort, progress));
    fetch_options.download_tags(git2::AutotagOption::None);

    remote
        .fetch(&[remote_ref.refspec().as_str()], Some(&mut fetch_options), None)
        .map_err(|e| classify(e, abort))
}

/// Fetch `git_ref` from `url` into a fresh repository at `dest` and check it out.
///
/// Tries a depth-1 fetch first and falls back to a full fetch of the same
/// refspec when the transport rejects shallow fetches.
pub fn fetch_and_checkout(
    url: &str,
    git_ref: &str,
    dest: &Path,
    abort: &AbortSignal,
    progress: &dyn Fn(&str),
) -> GitResult<FetchedRef> {
    let repo = Repository::init(dest)
        .map_err(|e| GitError::Checkout(format!("Failed to initialise {}: {}", dest.display(), e)))?;

    let remote_ref = resolve_remote_ref(&repo, url, git_ref, abort, progress)?;
    log::debug!("[Git] [FETCH] {} resolved to {}", git_ref, remote_ref.remote_name());

    let shallow = match fetch_refspec(&repo, url, &remote_ref, Some(1), abort, progress) {
        Ok(()) => true,
        Err(GitError::Aborted(reason)) => return Err(GitError::Aborted(reason)),
        Err(GitError::Auth(msg)) => return Err(GitError::Auth(msg)),
        Err(shallow_err) => {
            log::info!("[Git] [FETCH] Shallow fetch failed ({}), falling back to full fetch", shallow_err);
            progress("[fetch] shallow fetch unavailable, fetching full history");
            fetch_refspec(&repo, url, &remote_ref, None, abort, progress)?;
            false
        }
    };

    if let Some(reason) = abort.reason() {
        return Err(GitError::Aborted(reason));
    }

    let commit = repo
        .find_reference(&remote_ref.local_name())
        .and_then(|r| r.peel_to_commit())
        .map_err(|e| GitError::Checkout(format!("Fetched ref {} unusable: {}", git_ref, e)))?;

    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    // Returning false from the notify callback stops the checkout
    checkout.notify_on(CheckoutNotificationType::UPDATED);
    checkout.notify(|_, _, _, _, _| abort.reason().is_none());
    if let Err(e) = repo.checkout_tree(commit.as_object(), Some(&mut checkout)) {
        return Err(match abort.reason() {
            Some(reason) => GitError::Aborted(reason),
            None => GitError::Checkout(format!("Failed to check out {}: {}", git_ref, e)),
        });
    }
    repo.set_head_detached(commit.id())
        .map_err(|e| GitError::Checkout(format!("Failed to set HEAD: {}", e)))?;

    Ok(FetchedRef {
        remote_ref,
        commit: commit.id().to_string(),
        shallow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_refspecs() {
        let branch = RemoteRef::Branch("release/1.0".to_string());
        assert_eq!(branch.refspec(), "+refs/heads/release/1.0:refs/remotes/origin/release/1.0");
        let tag = RemoteRef::Tag("v2".to_string());
        assert_eq!(tag.refspec(), "+refs/tags/v2:refs/tags/v2");
    }

    #[test]
    fn test_abort_signal_reasons() {
        let (tx, rx) = watch::channel(false);
        let signal = AbortSignal::new(rx.clone(), Instant::now() + Duration::from_secs(60));
        assert_eq!(signal.reason(), None);
        tx.send(true).unwrap();
        assert_eq!(signal.reason(), Some(AbortReason::Cancelled));

        let expired = AbortSignal::new(watch::channel(false).1, Instant::now());
        assert_eq!(expired.reason(), Some(AbortReason::Deadline));
    }

    #[test]
    fn test_git_error_transience() {
        assert!(GitError::Network("reset".to_string()).is_transient());
        assert!(!GitError::Auth("denied".to_string()).is_transient());
        assert!(!GitError::RefNotFound("main".to_string()).is_transient());
    }
}
