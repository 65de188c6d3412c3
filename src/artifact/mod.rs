//! Packager / Artifact Store
//!
//! Archives live at `<artifact_root>/<session id>/<file>` and are immutable once
//! registered. The in-memory index tracks expiry. Reclaimed references leave a
//! tombstone so retrieval can tell "expired" apart from "never existed".
//!
//! Reclamation happens when the TTL elapses or, under storage pressure, oldest
//! first. Expiry is checked lazily on every lookup and by a periodic reaper.

pub mod packager;

pub use packager::{collect_packages, package, write_archive};

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ArtifactSection;
use crate::error::BuildError;
use crate::models::{ArtifactRef, SessionId};

type Key = (SessionId, String);

struct Entry {
    path: PathBuf,
    size: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct StoreIndex {
    entries: HashMap<Key, Entry>,
    /// Registration order, oldest first
    order: VecDeque<Key>,
    tombstones: HashSet<Key>,
    tombstone_order: VecDeque<Key>,
    total_bytes: u64,
}

/// Why an entry left the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reclaim {
    Expired,
    Pressure,
    Discarded,
}

/// Stored archives with TTL and size-bounded retention.
pub struct ArtifactStore {
    root: PathBuf,
    ttl: Duration,
    max_bytes: u64,
    max_tombstones: usize,
    index: Mutex<StoreIndex>,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, settings: &ArtifactSection) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(ArtifactStore {
            root,
            ttl: Duration::from_secs(settings.ttl_secs),
            max_bytes: settings.max_store_bytes,
            max_tombstones: settings.max_tombstones,
            index: Mutex::new(StoreIndex::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, StoreIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove leftovers of a previous process. Nothing on disk is indexed yet.
    pub fn startup_sweep(&self) -> usize {
        let indexed: HashSet<PathBuf> = self
            .lock()
            .entries
            .keys()
            .map(|(session, _)| self.root.join(session.to_string()))
            .collect();
        let mut removed = 0;
        if let Ok(dir) = std::fs::read_dir(&self.root) {
            for entry in dir.flatten() {
                let path = entry.path();
                if indexed.contains(&path) {
                    continue;
                }
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(e) => log::warn!("[Artifacts] Sweep could not remove {}: {}", path.display(), e),
                }
            }
        }
        if removed > 0 {
            log::info!("[Artifacts] Startup sweep removed {} orphaned entries", removed);
        }
        removed
    }

    /// Directory for one session's archive, created on demand.
    pub fn session_dir(&self, session: SessionId) -> std::io::Result<PathBuf> {
        let dir = self.root.join(session.to_string());
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Adopt a finished archive at `<session dir>/<file_name>` into the index.
    pub fn register(&self, session: SessionId, file_name: &str) -> Result<ArtifactRef, BuildError> {
        let path = self.root.join(session.to_string()).join(file_name);
        let size = std::fs::metadata(&path)
            .map_err(|e| BuildError::InternalError(format!("archive {} missing: {}", path.display(), e)))?
            .len();

        let key: Key = (session, file_name.to_string());
        let mut index = self.lock();
        index.tombstones.remove(&key);
        index.entries.insert(
            key.clone(),
            Entry {
                path,
                size,
                expires_at: Instant::now() + self.ttl,
            },
        );
        index.order.push_back(key.clone());
        index.total_bytes += size;

        // Oldest first, never the archive just registered
        while index.total_bytes > self.max_bytes {
            let Some(oldest) = index.order.front().cloned() else {
                break;
            };
            if oldest == key {
                log::warn!(
                    "[Artifacts] Archive {} alone exceeds the store budget of {} bytes",
                    file_name,
                    self.max_bytes
                );
                break;
            }
            self.reclaim(&mut index, &oldest, Reclaim::Pressure);
        }

        log::info!("[Artifacts] Registered {}/{} ({} bytes)", session, file_name, size);
        Ok(ArtifactRef {
            session_id: session,
            file_name: file_name.to_string(),
        })
    }

    fn reclaim(&self, index: &mut StoreIndex, key: &Key, why: Reclaim) {
        if let Some(entry) = index.entries.remove(key) {
            index.total_bytes = index.total_bytes.saturating_sub(entry.size);
            index.order.retain(|k| k != key);
            if let Some(dir) = entry.path.parent() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    log::warn!("[Artifacts] Failed to delete {}: {}", dir.display(), e);
                }
            }
            log::info!("[Artifacts] Reclaimed {}/{} ({:?})", key.0, key.1, why);
        }
        if index.tombstones.insert(key.clone()) {
            index.tombstone_order.push_back(key.clone());
        }
        while index.tombstone_order.len() > self.max_tombstones {
            if let Some(old) = index.tombstone_order.pop_front() {
                index.tombstones.remove(&old);
            }
        }
    }

    /// Resolve a reference to its file.
    ///
    /// `ArtifactExpired` for reclaimed references, `ArtifactNotFound` for ones
    /// that were never issued.
    pub fn resolve(&self, session: SessionId, file_name: &str) -> Result<PathBuf, BuildError> {
        let key: Key = (session, file_name.to_string());
        let mut index = self.lock();

        let expired = match index.entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => return Ok(entry.path.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.reclaim(&mut index, &key, Reclaim::Expired);
        }

        if index.tombstones.contains(&key) {
            Err(BuildError::ArtifactExpired(format!("{}/{}", session, file_name)))
        } else {
            Err(BuildError::ArtifactNotFound(format!("{}/{}", session, file_name)))
        }
    }

    /// Drop an archive whose session did not finish successfully.
    pub fn discard(&self, artifact: &ArtifactRef) {
        let key: Key = (artifact.session_id, artifact.file_name.clone());
        let mut index = self.lock();
        self.reclaim(&mut index, &key, Reclaim::Discarded);
    }

    /// Reclaim everything past its TTL. Returns how many entries were removed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut index = self.lock();
        let expired: Vec<Key> = index
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.reclaim(&mut index, key, Reclaim::Expired);
        }
        expired.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic TTL reaper.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = store.reap_expired();
                if reaped > 0 {
                    log::info!("[Artifacts] Reaper reclaimed {} expired archives", reaped);
                }
            }
        })
    }
}
