//! Session records, change tracking, and the injected session store.
//!
//! A [`SessionRecord`] is the key/value view of one logical session as seen by
//! a single request. It remembers which keys existed when it was materialized
//! and which keys were touched since, so the peer can send back a
//! [`Changeset`] instead of a full snapshot.
//!
//! ```text
//! SessionStore::load()  ──►  SessionRecord  ──►  mutations (set/remove/clear)
//!                                 │
//!                                 ├── changeset()      → Changeset
//!                                 └── accept_changes() → new base
//!
//! Changeset::apply_to(base) == mutated record
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::concurrent_map::ShardedMap;
use crate::error::SessionError;

/// Length of generated session ids.
pub const SESSION_ID_LEN: usize = 24;

/// Lowercase base32 alphabet used for generated session ids.
const SESSION_ID_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz012345";

/// Default session timeout (20 minutes).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Generate a fresh random session id.
#[must_use]
pub fn generate_session_id() -> String {
    let mut rng = rand::rng();
    (0..SESSION_ID_LEN)
        .map(|_| char::from(SESSION_ID_ALPHABET[rng.random_range(0..SESSION_ID_ALPHABET.len())]))
        .collect()
}

// =============================================================================
// Session record
// =============================================================================

/// One logical session as materialized for a single request.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    session_id: String,
    timeout: Duration,
    is_new_session: bool,
    is_abandoned: bool,
    is_read_only: bool,
    supports_changeset: bool,
    values: BTreeMap<String, Value>,
    /// Keys present when the record was materialized (or last rebased).
    base_keys: BTreeSet<String>,
    /// Keys written, or handed out mutably, since the base.
    touched: BTreeSet<String>,
    /// Keys the serializer could not map and skipped.
    unknown_keys: Vec<String>,
}

impl SessionRecord {
    /// Empty writable record.
    #[must_use]
    pub fn new(session_id: impl Into<String>, timeout: Duration) -> Self {
        Self::from_values(session_id, timeout, BTreeMap::new())
    }

    /// Writable record over existing values; those values form the base.
    #[must_use]
    pub fn from_values(
        session_id: impl Into<String>,
        timeout: Duration,
        values: BTreeMap<String, Value>,
    ) -> Self {
        let base_keys = values.keys().cloned().collect();
        Self {
            session_id: session_id.into(),
            timeout,
            is_new_session: false,
            is_abandoned: false,
            is_read_only: false,
            supports_changeset: false,
            values,
            base_keys,
            touched: BTreeSet::new(),
            unknown_keys: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_new_session(mut self, is_new: bool) -> Self {
        self.is_new_session = is_new;
        self
    }

    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.is_read_only = read_only;
        self
    }

    #[must_use]
    pub fn with_changeset_support(mut self, supported: bool) -> Self {
        self.supports_changeset = supported;
        self
    }

    #[must_use]
    pub fn with_abandoned(mut self, abandoned: bool) -> Self {
        self.is_abandoned = abandoned;
        self
    }

    #[must_use]
    pub fn with_unknown_keys(mut self, keys: Vec<String>) -> Self {
        self.unknown_keys = keys;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_new_session(&self) -> bool {
        self.is_new_session
    }

    pub fn is_abandoned(&self) -> bool {
        self.is_abandoned
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    /// Whether the other side accepts a changeset on commit.
    pub fn supports_changeset(&self) -> bool {
        self.supports_changeset
    }

    /// Keys the serializer skipped because they are not registered.
    pub fn unknown_keys(&self) -> &[String] {
        &self.unknown_keys
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Mutable access to a value. The key counts as changed from here on,
    /// since the caller may mutate it in place.
    pub fn get_mut(&mut self, key: &str) -> Result<Option<&mut Value>, SessionError> {
        self.ensure_writable()?;
        if self.values.contains_key(key) {
            self.touched.insert(key.to_string());
        }
        Ok(self.values.get_mut(key))
    }

    /// Set a value, returning the previous one.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<Option<Value>, SessionError> {
        self.ensure_writable()?;
        let key = key.into();
        if key.is_empty() {
            return Err(SessionError::EmptyKey);
        }
        self.touched.insert(key.clone());
        Ok(self.values.insert(key, value))
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, SessionError> {
        self.ensure_writable()?;
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.touched.insert(key.to_string());
        }
        Ok(removed)
    }

    pub fn clear(&mut self) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.touched.extend(self.values.keys().cloned());
        self.values.clear();
        Ok(())
    }

    /// Mark the session abandoned. Once set it cannot be cleared.
    pub fn abandon(&mut self) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.is_abandoned = true;
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.timeout = timeout;
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Changes since the base, ordered by key.
    #[must_use]
    pub fn changeset(&self) -> Changeset {
        let mut candidates: BTreeSet<&String> = self.touched.iter().collect();
        candidates.extend(self.base_keys.iter().filter(|k| !self.values.contains_key(*k)));

        let changes = candidates
            .into_iter()
            .filter_map(|key| {
                let in_base = self.base_keys.contains(key);
                match (self.values.get(key), in_base) {
                    (Some(value), true) => Some(SessionChange::changed(key, value.clone())),
                    (Some(value), false) => Some(SessionChange::new_value(key, value.clone())),
                    (None, true) => Some(SessionChange::removed(key)),
                    // added then removed again
                    (None, false) => None,
                }
            })
            .collect();

        Changeset {
            session_id: self.session_id.clone(),
            is_abandoned: self.is_abandoned,
            timeout: self.timeout,
            changes,
        }
    }

    /// Whether anything changed since the base.
    pub fn is_dirty(&self) -> bool {
        !self.changeset().changes.is_empty()
    }

    /// Rebase change tracking on the current contents.
    pub fn accept_changes(&mut self) {
        self.base_keys = self.values.keys().cloned().collect();
        self.touched.clear();
    }

    /// Replace every value, keeping the keys in `preserve` that are not in
    /// `values`. Tracking is preserved so the store sees a consistent diff.
    pub(crate) fn replace_values(
        &mut self,
        mut values: BTreeMap<String, Value>,
        preserve: &[String],
    ) {
        for key in preserve {
            if let Some(existing) = self.values.remove(key) {
                values.entry(key.clone()).or_insert(existing);
            }
        }
        self.touched.extend(self.values.keys().cloned());
        self.touched.extend(values.keys().cloned());
        self.values = values;
    }

    /// Header fields carried by every envelope.
    pub(crate) fn apply_header(&mut self, timeout: Duration, abandoned: bool) {
        self.timeout = timeout;
        if abandoned {
            self.is_abandoned = true;
        }
    }

    pub(crate) fn insert_unchecked(&mut self, key: String, value: Value) {
        self.touched.insert(key.clone());
        self.values.insert(key, value);
    }

    pub(crate) fn remove_unchecked(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.touched.insert(key.to_string());
        }
    }

    fn ensure_writable(&self) -> Result<(), SessionError> {
        if self.is_read_only {
            Err(SessionError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl PartialEq for SessionRecord {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
            && self.values == other.values
            && self.timeout == other.timeout
            && self.is_abandoned == other.is_abandoned
    }
}

// =============================================================================
// Changesets
// =============================================================================

/// How a key changed since the record was materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Key did not exist in the base.
    New,
    /// Key existed and was overwritten (or handed out mutably).
    Changed,
    /// Key existed and was removed.
    Removed,
    /// Key is not registered with the serializer; never applied.
    Unknown,
}

/// A single key change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionChange {
    pub key: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl SessionChange {
    #[must_use]
    pub fn new_value(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::New,
            value: Some(value),
        }
    }

    #[must_use]
    pub fn changed(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Changed,
            value: Some(value),
        }
    }

    #[must_use]
    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Removed,
            value: None,
        }
    }

    #[must_use]
    pub fn unknown(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Unknown,
            value: None,
        }
    }
}

/// Ordered mutations of one session since its base.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub session_id: String,
    pub is_abandoned: bool,
    pub timeout: Duration,
    pub changes: Vec<SessionChange>,
}

impl Changeset {
    /// Replay onto `record`.
    ///
    /// `Unknown` entries, and value-less `New`/`Changed` entries, are logged
    /// and skipped.
    pub fn apply_to(&self, record: &mut SessionRecord) {
        record.apply_header(self.timeout, self.is_abandoned);
        for change in &self.changes {
            match (change.kind, &change.value) {
                (ChangeKind::New | ChangeKind::Changed, Some(value)) => {
                    record.insert_unchecked(change.key.clone(), value.clone());
                }
                (ChangeKind::Removed, _) => record.remove_unchecked(&change.key),
                (ChangeKind::Unknown, _) => {
                    warn!(
                        target: "session_relay.serializer",
                        session_id = %self.session_id,
                        key = %change.key,
                        "skipping change for unregistered session key"
                    );
                }
                (kind, None) => {
                    warn!(
                        target: "session_relay.serializer",
                        session_id = %self.session_id,
                        key = %change.key,
                        ?kind,
                        "skipping change without a value"
                    );
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

// =============================================================================
// Session store
// =============================================================================

/// Origin-side session storage.
///
/// The relay does not own persistence; embedders inject their own store.
/// The endpoint calls both methods from tokio's blocking pool, so
/// implementations may do synchronous I/O.
pub trait SessionStore: Send + Sync {
    /// Get or create the session.
    ///
    /// A missing or expired id yields a freshly generated id with
    /// `is_new_session` set.
    fn load(&self, session_id: Option<&str>, read_only: bool) -> SessionRecord;

    /// Persist the record. Abandoned records are removed instead.
    fn commit(&self, record: &SessionRecord);
}

#[derive(Debug, Clone)]
struct StoredSession {
    values: BTreeMap<String, Value>,
    timeout: Duration,
    last_access: Instant,
}

impl StoredSession {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) > self.timeout
    }
}

/// In-process store with sliding expiry.
#[derive(Debug)]
pub struct InMemorySessionStore {
    sessions: ShardedMap<String, StoredSession>,
    default_timeout: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            sessions: ShardedMap::new(),
            default_timeout,
        }
    }

    /// Insert or overwrite a session directly.
    pub fn seed(&self, session_id: impl Into<String>, values: BTreeMap<String, Value>) {
        self.sessions.insert(
            session_id.into(),
            StoredSession {
                values,
                timeout: self.default_timeout,
                last_access: Instant::now(),
            },
        );
    }

    /// Current values of a live session, without touching its expiry.
    pub fn snapshot(&self, session_id: &str) -> Option<BTreeMap<String, Value>> {
        self.sessions
            .read_with(session_id, |s| (!s.is_expired(Instant::now())).then(|| s.values.clone()))
            .flatten()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.snapshot(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.sessions.len();
        let now = Instant::now();
        self.sessions.retain(|_, s| !s.is_expired(now));
        before.saturating_sub(self.sessions.len())
    }

    fn create(&self, read_only: bool) -> SessionRecord {
        loop {
            let id = generate_session_id();
            let stored = StoredSession {
                values: BTreeMap::new(),
                timeout: self.default_timeout,
                last_access: Instant::now(),
            };
            if self.sessions.insert_if_absent(id.clone(), stored) {
                debug!(target: "session_relay.store", session_id = %id, "created session");
                return SessionRecord::new(id, self.default_timeout)
                    .with_new_session(true)
                    .with_read_only(read_only);
            }
        }
    }
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, session_id: Option<&str>, read_only: bool) -> SessionRecord {
        let Some(id) = session_id.filter(|id| !id.is_empty()) else {
            return self.create(read_only);
        };

        let now = Instant::now();
        let found = self
            .sessions
            .write_with(id, |s| {
                if s.is_expired(now) {
                    None
                } else {
                    s.last_access = now;
                    Some((s.values.clone(), s.timeout))
                }
            })
            .flatten();

        match found {
            Some((values, timeout)) => {
                SessionRecord::from_values(id, timeout, values).with_read_only(read_only)
            }
            None => {
                if self.sessions.remove_if(id, |s| s.is_expired(now)).is_some() {
                    debug!(target: "session_relay.store", session_id = %id, "session expired");
                }
                self.create(read_only)
            }
        }
    }

    fn commit(&self, record: &SessionRecord) {
        if record.is_abandoned() {
            self.sessions.remove(record.session_id());
            debug!(
                target: "session_relay.store",
                session_id = %record.session_id(),
                "removed abandoned session"
            );
            return;
        }
        self.sessions.insert(
            record.session_id().to_string(),
            StoredSession {
                values: record.values().clone(),
                timeout: record.timeout(),
                last_access: Instant::now(),
            },
        );
    }
}
