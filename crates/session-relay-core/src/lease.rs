//! Origin-side lease cache: which sessions are checked out for writing.
//!
//! At most one lease exists per session id. A lease ends in one of two ways:
//! a commit through [`LeaseCache::save`], or the [`LeaseHandle`] being
//! released (peer disconnect, timeout, shutdown). Either way the release
//! callback fires exactly once and the id becomes leasable again.
//!
//! Ids committed recently are remembered for a short retention window so a
//! retried PUT is answered with [`SaveResult::AlreadyUpdated`] instead of
//! [`SaveResult::SessionNotFound`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::concurrent_map::ShardedMap;
use crate::error::LeaseError;
use crate::serializer::SessionSerializer;
use crate::session::{SessionRecord, SessionStore};

/// How long a committed id answers duplicate commits with `AlreadyUpdated`.
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(60);

/// Completed-id markers kept before a sweep of stale ones.
const COMPLETED_SWEEP_THRESHOLD: usize = 1024;

/// Outcome of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    Success,
    /// No lease for this id (never created, expired, or released).
    SessionNotFound,
    /// The lease was already completed by an earlier commit.
    AlreadyUpdated,
    /// The payload could not be decoded, or named another session.
    DeserializationError,
}

impl SaveResult {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Stable code for the wire error envelope.
    pub fn error_code(self) -> Option<&'static str> {
        match self {
            Self::Success => None,
            Self::SessionNotFound => Some("session_not_found"),
            Self::AlreadyUpdated => Some("already_updated"),
            Self::DeserializationError => Some("deserialization_error"),
        }
    }

    /// Short human-readable reason.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Success => "ok",
            Self::SessionNotFound => "A session with the supplied id is not leased",
            Self::AlreadyUpdated => "The session has already been updated",
            Self::DeserializationError => "The session payload could not be deserialized",
        }
    }
}

type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

struct ActiveLease {
    record: SessionRecord,
    on_released: ReleaseCallback,
}

/// Holds the live lease until it completes.
struct LeaseSlot {
    active: Mutex<Option<ActiveLease>>,
}

impl LeaseSlot {
    fn take(&self) -> Option<ActiveLease> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

struct LeaseCacheInner {
    leases: ShardedMap<String, Arc<LeaseSlot>>,
    completed: ShardedMap<String, Instant>,
    completed_retention: Duration,
    serializer: SessionSerializer,
    store: Arc<dyn SessionStore>,
}

/// Tracks leased sessions. Cheap to clone.
#[derive(Clone)]
pub struct LeaseCache {
    inner: Arc<LeaseCacheInner>,
}

impl std::fmt::Debug for LeaseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCache")
            .field("leased", &self.inner.leases.len())
            .field("completed_retention", &self.inner.completed_retention)
            .finish_non_exhaustive()
    }
}

impl LeaseCache {
    pub fn new(serializer: SessionSerializer, store: Arc<dyn SessionStore>) -> Self {
        Self::with_completed_retention(serializer, store, DEFAULT_COMPLETED_RETENTION)
    }

    pub fn with_completed_retention(
        serializer: SessionSerializer,
        store: Arc<dyn SessionStore>,
        completed_retention: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(LeaseCacheInner {
                leases: ShardedMap::new(),
                completed: ShardedMap::new(),
                completed_retention,
                serializer,
                store,
            }),
        }
    }

    pub fn serializer(&self) -> &SessionSerializer {
        &self.inner.serializer
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    /// Lease `record` for writing.
    ///
    /// Fails immediately if the id is already leased; never blocks.
    pub fn register<F>(&self, record: SessionRecord, on_released: F) -> Result<LeaseHandle, LeaseError>
    where
        F: FnOnce() + Send + 'static,
    {
        let session_id = record.session_id().to_string();
        let slot = Arc::new(LeaseSlot {
            active: Mutex::new(Some(ActiveLease {
                record,
                on_released: Box::new(on_released),
            })),
        });

        if !self
            .inner
            .leases
            .insert_if_absent(session_id.clone(), Arc::clone(&slot))
        {
            debug!(target: "session_relay.lease", session_id = %session_id, "lease rejected, already leased");
            return Err(LeaseError::AlreadyLeased(session_id));
        }
        self.inner.completed.remove(session_id.as_str());
        debug!(target: "session_relay.lease", session_id = %session_id, "lease registered");

        Ok(LeaseHandle {
            session_id,
            slot,
            cache: Arc::clone(&self.inner),
        })
    }

    /// Commit `payload` to the leased session.
    ///
    /// The lease completes whatever the outcome. An empty payload releases
    /// the lease without touching the session.
    ///
    /// Runs [`SessionStore::commit`] on the calling thread; async callers
    /// should go through `spawn_blocking`.
    pub fn save(&self, session_id: &str, payload: &[u8]) -> SaveResult {
        let Some(slot) = self.inner.leases.get(session_id) else {
            return if self.recently_completed(session_id) {
                SaveResult::AlreadyUpdated
            } else {
                SaveResult::SessionNotFound
            };
        };
        let Some(mut active) = slot.take() else {
            return SaveResult::AlreadyUpdated;
        };

        let result = self.apply(session_id, &mut active.record, payload);

        self.inner.leases.remove_if(session_id, |s| Arc::ptr_eq(s, &slot));
        self.mark_completed(session_id);
        (active.on_released)();

        debug!(
            target: "session_relay.lease",
            session_id = %session_id,
            result = ?result,
            "lease completed by commit"
        );
        result
    }

    fn apply(&self, session_id: &str, record: &mut SessionRecord, payload: &[u8]) -> SaveResult {
        if payload.iter().all(u8::is_ascii_whitespace) {
            debug!(target: "session_relay.lease", session_id = %session_id, "released without update");
            return SaveResult::Success;
        }

        match self.inner.serializer.decode(payload) {
            Ok(decoded) if decoded.session_id() != session_id => {
                warn!(
                    target: "session_relay.lease",
                    session_id = %session_id,
                    payload_session_id = %decoded.session_id(),
                    "commit payload names a different session"
                );
                SaveResult::DeserializationError
            }
            Ok(decoded) => {
                decoded.apply_to(record);
                self.inner.store.commit(record);
                SaveResult::Success
            }
            Err(err) => {
                warn!(
                    target: "session_relay.lease",
                    session_id = %session_id,
                    error = %err,
                    "failed to decode commit payload"
                );
                SaveResult::DeserializationError
            }
        }
    }

    fn mark_completed(&self, session_id: &str) {
        let completed = &self.inner.completed;
        completed.insert(session_id.to_string(), Instant::now());
        if completed.len() > COMPLETED_SWEEP_THRESHOLD {
            let retention = self.inner.completed_retention;
            completed.retain(|_, at| at.elapsed() <= retention);
        }
    }

    fn recently_completed(&self, session_id: &str) -> bool {
        let retention = self.inner.completed_retention;
        match self.inner.completed.get(session_id) {
            Some(at) if at.elapsed() <= retention => true,
            Some(_) => {
                self.inner.completed.remove(session_id);
                false
            }
            None => false,
        }
    }

    pub fn is_leased(&self, session_id: &str) -> bool {
        self.inner.leases.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.leases.is_empty()
    }
}

/// Ownership of one lease. Dropping it releases the lease.
pub struct LeaseHandle {
    session_id: String,
    slot: Arc<LeaseSlot>,
    cache: Arc<LeaseCacheInner>,
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl LeaseHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Release without committing. Idempotent.
    ///
    /// A no-op once [`LeaseCache::save`] has taken the lease, including while
    /// that commit is still being applied: the entry stays registered until
    /// `save` removes it, so the id cannot be leased again mid-commit.
    pub fn release(&self) {
        let Some(active) = self.slot.take() else {
            return;
        };
        self.cache
            .leases
            .remove_if(self.session_id.as_str(), |s| Arc::ptr_eq(s, &self.slot));
        (active.on_released)();
        debug!(target: "session_relay.lease", session_id = %self.session_id, "lease released without commit");
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.release();
    }
}
