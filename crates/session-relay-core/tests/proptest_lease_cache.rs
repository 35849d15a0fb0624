//! Property-based tests for the origin lease cache.
//!
//! Validates:
//! 1. Mutual exclusion: register succeeds iff the id is not currently leased
//! 2. Exactly-once release: every lease fires its callback once, whether it
//!    ends by commit, release or drop
//! 3. Commit outcomes track lease state (Success / AlreadyUpdated / NotFound)
//! 4. Racing release and commit on one lease still fires the callback once
//! 5. The cache is empty once every handle is gone
//! 6. A release that lands while a commit is inside the store does not free
//!    the id early

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use session_relay_core::lease::{LeaseCache, LeaseHandle, SaveResult};
use session_relay_core::serializer::SessionSerializer;
use session_relay_core::session::{InMemorySessionStore, SessionRecord, SessionStore};

// =============================================================================
// Model
// =============================================================================

const IDS: [&str; 3] = ["alpha", "bravo", "charlie"];

#[derive(Debug, Clone)]
enum Op {
    Register(usize),
    Release(usize),
    Drop(usize),
    CommitEmpty(usize),
    CommitValue(usize, i64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..IDS.len()).prop_map(Op::Register),
        2 => (0..IDS.len()).prop_map(Op::Release),
        1 => (0..IDS.len()).prop_map(Op::Drop),
        2 => (0..IDS.len()).prop_map(Op::CommitEmpty),
        2 => (0..IDS.len(), any::<i64>()).prop_map(|(i, v)| Op::CommitValue(i, v)),
    ]
}

/// What the cache should remember about each id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdState {
    Never,
    Leased,
    Committed,
    Released,
}

fn setup(retention: Duration) -> (LeaseCache, Arc<InMemorySessionStore>) {
    let store = Arc::new(InMemorySessionStore::default());
    for id in IDS {
        store.seed(id, BTreeMap::new());
    }
    let cache = LeaseCache::with_completed_retention(SessionSerializer::default(), store.clone(), retention);
    (cache, store)
}

fn counting_callback(count: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
    let count = Arc::clone(count);
    move || {
        count.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Sequential properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn lease_cache_matches_model(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let (cache, store) = setup(Duration::from_secs(60));
        let released = Arc::new(AtomicUsize::new(0));
        let mut registered = 0_usize;
        let mut handles: HashMap<usize, LeaseHandle> = HashMap::new();
        let mut state = [IdState::Never; IDS.len()];

        for op in &ops {
            match *op {
                Op::Register(i) => {
                    let record = store.load(Some(IDS[i]), false);
                    let result = cache.register(record, counting_callback(&released));
                    if state[i] == IdState::Leased {
                        prop_assert!(result.is_err());
                    } else {
                        let handle = result.unwrap();
                        prop_assert_eq!(handle.session_id(), IDS[i]);
                        // Replacing a stale handle must not disturb the new lease.
                        handles.insert(i, handle);
                        registered += 1;
                        state[i] = IdState::Leased;
                    }
                }
                Op::Release(i) => {
                    if let Some(handle) = handles.get(&i) {
                        handle.release();
                        if state[i] == IdState::Leased {
                            state[i] = IdState::Released;
                        }
                    }
                }
                Op::Drop(i) => {
                    if handles.remove(&i).is_some() && state[i] == IdState::Leased {
                        state[i] = IdState::Released;
                    }
                }
                Op::CommitEmpty(i) => {
                    let result = cache.save(IDS[i], b"");
                    let expected = match state[i] {
                        IdState::Leased => SaveResult::Success,
                        IdState::Committed => SaveResult::AlreadyUpdated,
                        IdState::Never | IdState::Released => SaveResult::SessionNotFound,
                    };
                    prop_assert_eq!(result, expected);
                    if state[i] == IdState::Leased {
                        state[i] = IdState::Committed;
                    }
                }
                Op::CommitValue(i, v) => {
                    let mut record = store.load(Some(IDS[i]), false);
                    record.set("n", json!(v)).unwrap();
                    let payload = cache.serializer().encode_changeset(&record).unwrap();
                    let result = cache.save(IDS[i], &payload);
                    match state[i] {
                        IdState::Leased => {
                            prop_assert_eq!(result, SaveResult::Success);
                            prop_assert_eq!(store.snapshot(IDS[i]).unwrap()["n"].clone(), json!(v));
                            state[i] = IdState::Committed;
                        }
                        IdState::Committed => prop_assert_eq!(result, SaveResult::AlreadyUpdated),
                        IdState::Never | IdState::Released => {
                            prop_assert_eq!(result, SaveResult::SessionNotFound);
                        }
                    }
                }
            }

            for (i, id) in IDS.iter().enumerate() {
                prop_assert_eq!(cache.is_leased(id), state[i] == IdState::Leased);
            }
            let live = state.iter().filter(|s| **s == IdState::Leased).count();
            prop_assert_eq!(released.load(Ordering::SeqCst), registered - live);
        }

        drop(handles);
        prop_assert!(cache.is_empty());
        prop_assert_eq!(released.load(Ordering::SeqCst), registered);
    }
}

// =============================================================================
// Concurrent properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn racing_release_and_commit_fire_once(commit_first in any::<bool>(), with_payload in any::<bool>()) {
        let (cache, store) = setup(Duration::from_secs(60));
        let released = Arc::new(AtomicUsize::new(0));
        let record = store.load(Some("alpha"), false);
        let mut peer = record.clone();
        peer.set("k", json!(1)).unwrap();
        let payload = if with_payload {
            cache.serializer().encode_changeset(&peer).unwrap()
        } else {
            Vec::new()
        };
        let handle = cache.register(record, counting_callback(&released)).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let committer = {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                cache.save("alpha", &payload)
            })
        };
        let releaser = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                if commit_first {
                    std::thread::yield_now();
                }
                handle.release();
                handle
            })
        };

        let result = committer.join().unwrap();
        let handle = releaser.join().unwrap();
        drop(handle);

        prop_assert!(matches!(result, SaveResult::Success | SaveResult::SessionNotFound | SaveResult::AlreadyUpdated));
        prop_assert_eq!(released.load(Ordering::SeqCst), 1);
        prop_assert!(cache.is_empty());
        if result == SaveResult::Success && with_payload {
            prop_assert_eq!(store.snapshot("alpha").unwrap()["k"].clone(), json!(1));
        }
    }
}

#[test]
fn concurrent_registers_admit_exactly_one() {
    let (cache, store) = setup(Duration::from_secs(60));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let winners = Arc::new(AtomicUsize::new(0));

    let joins: Vec<_> = (0..threads)
        .map(|_| {
            let cache = cache.clone();
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            std::thread::spawn(move || {
                let record = store.load(Some("bravo"), false);
                barrier.wait();
                let lease = cache.register(record, || {});
                if lease.is_ok() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                // Hold every successful lease until all threads have tried.
                barrier.wait();
                drop(lease);
            })
        })
        .collect();

    for join in joins {
        join.join().unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert!(cache.is_empty());
}

#[test]
fn release_after_commit_keeps_commit_result() {
    let (cache, store) = setup(Duration::from_secs(60));
    let released = Arc::new(AtomicUsize::new(0));
    let handle = cache
        .register(store.load(Some("charlie"), false), counting_callback(&released))
        .unwrap();
    assert_eq!(cache.save("charlie", b"  \n"), SaveResult::Success);
    handle.release();
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(cache.save("charlie", b""), SaveResult::AlreadyUpdated);
}

/// Store whose `commit` parks until the test lets it through.
struct GatedStore {
    inner: InMemorySessionStore,
    entered: Barrier,
    proceed: Barrier,
}

impl SessionStore for GatedStore {
    fn load(&self, session_id: Option<&str>, read_only: bool) -> SessionRecord {
        self.inner.load(session_id, read_only)
    }

    fn commit(&self, record: &SessionRecord) {
        self.entered.wait();
        self.proceed.wait();
        self.inner.commit(record);
    }
}

#[test]
fn release_during_store_commit_keeps_id_leased() {
    let store = Arc::new(GatedStore {
        inner: InMemorySessionStore::default(),
        entered: Barrier::new(2),
        proceed: Barrier::new(2),
    });
    store
        .inner
        .seed("delta", BTreeMap::from([("k1".to_string(), json!("v1"))]));
    let cache = LeaseCache::new(SessionSerializer::default(), store.clone());
    let released = Arc::new(AtomicUsize::new(0));

    let record = store.load(Some("delta"), false);
    let mut peer = record.clone();
    peer.set("k1", json!("v2")).unwrap();
    let payload = cache.serializer().encode_changeset(&peer).unwrap();
    let handle = cache.register(record, counting_callback(&released)).unwrap();

    let committer = {
        let cache = cache.clone();
        std::thread::spawn(move || cache.save("delta", &payload))
    };
    store.entered.wait();

    // Timeout or disconnect path firing while the commit is inside the store.
    handle.release();
    assert!(cache.is_leased("delta"));
    assert_eq!(released.load(Ordering::SeqCst), 0);
    let rival = cache.register(store.load(Some("delta"), false), || {});
    assert!(rival.is_err(), "second writer admitted while a commit was still applying");

    store.proceed.wait();
    assert_eq!(committer.join().unwrap(), SaveResult::Success);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(!cache.is_leased("delta"));

    let next = cache.register(store.load(Some("delta"), false), || {}).unwrap();
    assert_eq!(store.inner.snapshot("delta").unwrap()["k1"], json!("v2"));
    drop(next);
    drop(handle);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}
