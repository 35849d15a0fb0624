#![no_main]

use std::collections::BTreeMap;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use session_relay_core::serializer::{KeyRegistry, SerializerOptions, SessionSerializer, ValueKind};
use session_relay_core::session::{InMemorySessionStore, SessionStore};
use session_relay_core::{LeaseCache, SaveResult};

fn registry() -> KeyRegistry {
    KeyRegistry::new()
        .with("count", ValueKind::Integer)
        .with("name", ValueKind::String)
        .with("flag", ValueKind::Bool)
        .with("cart", ValueKind::Json)
}

fuzz_target!(|data: &[u8]| {
    let lenient = SessionSerializer::new(SerializerOptions {
        registry: registry(),
        throw_on_unknown_key: false,
        advertise_changesets: true,
    });
    let strict = SessionSerializer::new(SerializerOptions {
        registry: registry(),
        throw_on_unknown_key: true,
        advertise_changesets: true,
    });

    // Anything strict accepts, lenient accepts too.
    if strict.decode(data).is_ok() {
        assert!(lenient.decode(data).is_ok());
    }

    // Decoded snapshots re-encode to something that decodes to the same record.
    if let Ok(decoded) = lenient.decode(data) {
        if let Ok(record) = decoded.into_snapshot() {
            let encoded = lenient.encode(&record).expect("decoded record re-encodes");
            let again = lenient
                .decode(&encoded)
                .expect("re-encoded record decodes")
                .into_snapshot()
                .expect("snapshot stays a snapshot");
            assert_eq!(again.values(), record.values());
            assert_eq!(again.session_id(), record.session_id());
        }
    }

    // A commit with arbitrary bytes always ends the lease.
    let store = Arc::new(InMemorySessionStore::default());
    store.seed("abc", BTreeMap::from([("count".to_string(), serde_json::json!(1))]));
    let cache = LeaseCache::new(lenient, store.clone());
    let _handle = cache.register(store.load(Some("abc"), false), || {}).expect("fresh cache");
    let result = cache.save("abc", data);
    assert!(result != SaveResult::SessionNotFound);
    assert!(!cache.is_leased("abc"));
});
