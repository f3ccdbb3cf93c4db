//! Persisted bisection progress and the single-session lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{KvStore, Namespace, StorageError, WorkflowKey};

/// Lifecycle of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Complete,
    Abandoned,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "ACTIVE"),
            SessionStatus::Complete => write!(f, "COMPLETE"),
            SessionStatus::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

/// Durable record of one bisection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub repository: String,
    pub workflow: String,
    pub job: Option<String>,
    pub good_boundary: String,
    pub bad_boundary: String,
    /// Commit SHAs from the good boundary to the bad boundary, as seen at session start.
    pub commit_range_snapshot: Vec<String>,
    pub lo: usize,
    pub hi: usize,
    pub status: SessionStatus,
    /// Candidate whose test was dispatched when the process stopped.
    #[serde(default)]
    pub in_flight: Option<String>,
    #[serde(default)]
    pub abandon_reason: Option<String>,
    #[serde(default)]
    pub tester_invocations: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    /// A fresh ACTIVE session spanning the whole snapshot.
    pub fn new(key: &WorkflowKey, snapshot: Vec<String>) -> Self {
        let now = Utc::now();
        let hi = snapshot.len().saturating_sub(1);
        Self {
            repository: key.repository.clone(),
            workflow: key.workflow.clone(),
            job: key.job.clone(),
            good_boundary: snapshot.first().cloned().unwrap_or_default(),
            bad_boundary: snapshot.last().cloned().unwrap_or_default(),
            commit_range_snapshot: snapshot,
            lo: 0,
            hi,
            status: SessionStatus::Active,
            in_flight: None,
            abandon_reason: None,
            tester_invocations: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> WorkflowKey {
        WorkflowKey::new(self.repository.clone(), self.workflow.clone(), self.job.clone())
    }

    pub fn window(&self) -> (usize, usize) {
        (self.lo, self.hi)
    }

    /// The window must satisfy `lo < hi < snapshot.len()`.
    pub fn window_is_valid(&self) -> bool {
        self.lo < self.hi && self.hi < self.commit_range_snapshot.len()
    }
}

/// Holder of a session lock as stored in the lock namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub token: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another bisection of {key} is running (pid {pid}, since {acquired_at}); use `session unlock` if it is gone")]
    Held {
        key: String,
        pid: u32,
        acquired_at: DateTime<Utc>,
    },

    #[error("the session lock for {key} kept changing hands; try again")]
    Contended { key: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

const LOCK_ATTEMPTS: usize = 3;

fn held(key: &WorkflowKey, holder: &LockRecord) -> LockError {
    LockError::Held {
        key: key.to_string(),
        pid: holder.pid,
        acquired_at: holder.acquired_at,
    }
}

/// Exclusive claim on one `(repository, workflow, job?)` key.
///
/// Released explicitly with [`SessionLock::release`]; dropping it releases on a
/// best-effort basis.
pub struct SessionLock {
    store: Arc<dyn KvStore>,
    key: String,
    token: Uuid,
    released: bool,
}

impl SessionLock {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn release(mut self) -> Result<(), StorageError> {
        self.released = true;
        release_if_owner(self.store.as_ref(), &self.key, self.token)
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release_if_owner(self.store.as_ref(), &self.key, self.token) {
            warn!(error = %e, "failed to release session lock");
        }
    }
}

fn release_if_owner(store: &dyn KvStore, key: &str, token: Uuid) -> Result<(), StorageError> {
    if let Some(raw) = store.get(Namespace::Lock, key)? {
        let record: LockRecord = serde_json::from_str(&raw)?;
        if record.token == token {
            store.delete(Namespace::Lock, key)?;
            debug!(%token, "released session lock");
        } else {
            warn!(%token, holder = %record.token, "session lock was taken over; leaving it in place");
        }
    }
    Ok(())
}

/// Whether `pid` is still running on this host. `None` when it cannot be determined.
fn process_alive(pid: u32) -> Option<bool> {
    if pid == std::process::id() {
        return Some(true);
    }
    if cfg!(target_os = "linux") {
        Some(std::path::Path::new(&format!("/proc/{}", pid)).exists())
    } else {
        None
    }
}

/// Session records and locks over any [`KvStore`].
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, key: &WorkflowKey) -> Result<Option<SessionState>, StorageError> {
        match self.store.get(Namespace::Session, &key.encode())? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist the session. Called after every change of window or status.
    pub fn save(&self, state: &mut SessionState) -> Result<(), StorageError> {
        state.updated_at = Utc::now();
        let raw = serde_json::to_string(state)?;
        self.store.put(Namespace::Session, &state.key().encode(), &raw)?;
        debug!(lo = state.lo, hi = state.hi, status = %state.status, "saved session");
        Ok(())
    }

    /// Mark the session ABANDONED, keeping the record for inspection.
    pub fn abandon(&self, state: &mut SessionState, reason: impl Into<String>) -> Result<(), StorageError> {
        let reason = reason.into();
        warn!(key = %state.key(), lo = state.lo, hi = state.hi, %reason, "abandoning session");
        state.status = SessionStatus::Abandoned;
        state.abandon_reason = Some(reason);
        self.save(state)
    }

    /// Delete the record. Returns whether one existed.
    pub fn clear(&self, key: &WorkflowKey) -> Result<bool, StorageError> {
        let removed = self.store.delete(Namespace::Session, &key.encode())?;
        if removed {
            info!(%key, "cleared session record");
        }
        Ok(removed)
    }

    pub fn lock_holder(&self, key: &WorkflowKey) -> Result<Option<LockRecord>, StorageError> {
        match self.store.get(Namespace::Lock, &key.encode())? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Claim the key for this process.
    ///
    /// A lock left behind by a process that no longer exists is taken over. With
    /// `force`, any existing lock is taken over.
    pub fn lock(&self, key: &WorkflowKey, force: bool) -> Result<SessionLock, LockError> {
        let encoded = key.encode();
        let record = LockRecord {
            token: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let raw = serde_json::to_string(&record).map_err(StorageError::from)?;

        let mut displaced = None;
        let mut acquired = false;
        for _ in 0..LOCK_ATTEMPTS {
            if self.store.insert_if_absent(Namespace::Lock, &encoded, &raw)? {
                acquired = true;
                break;
            }
            // Released between the insert and the read: try the insert again.
            let Some(current) = self.store.get(Namespace::Lock, &encoded)? else {
                continue;
            };
            let holder: LockRecord = serde_json::from_str(&current).map_err(StorageError::from)?;

            let takeover = if force {
                warn!(%key, pid = holder.pid, "forcing session lock");
                true
            } else {
                match process_alive(holder.pid) {
                    Some(false) => {
                        warn!(%key, pid = holder.pid, since = %holder.acquired_at, "previous session crashed; taking over its lock");
                        true
                    }
                    _ => false,
                }
            };
            if !takeover {
                return Err(held(key, &holder));
            }

            // Only replace the exact record that was judged; another process may be
            // taking it over at the same time.
            if self.store.replace_if(Namespace::Lock, &encoded, &current, &raw)? {
                acquired = true;
                break;
            }
            debug!(%key, pid = holder.pid, "lost the race to take over the session lock");
            displaced = Some(holder);
        }

        if !acquired {
            return Err(match self.lock_holder(key)?.or(displaced) {
                Some(holder) => held(key, &holder),
                None => LockError::Contended { key: key.to_string() },
            });
        }

        debug!(%key, token = %record.token, "acquired session lock");
        Ok(SessionLock {
            store: self.store.clone(),
            key: encoded,
            token: record.token,
            released: false,
        })
    }

    /// Remove any lock on `key`, whoever holds it.
    pub fn unlock(&self, key: &WorkflowKey) -> Result<bool, StorageError> {
        self.store.delete(Namespace::Lock, &key.encode())
    }
}
