//! Property-based tests for session envelopes and changesets.
//!
//! Validates:
//! 1. Snapshot round-trip: decode(encode(r)) == r
//! 2. Changeset round-trip: replaying a decoded changeset on the base
//!    record yields the mutated record
//! 3. Changeset replay without the wire: changeset(r, m) applied to r equals
//!    applying m sequentially
//! 4. Unknown-key policy: strict fails iff an unregistered key is present;
//!    lenient drops exactly the unregistered keys and lists them

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{Value, json};

use session_relay_core::error::SerializationError;
use session_relay_core::serializer::{KeyRegistry, SerializerOptions, SessionSerializer, ValueKind};
use session_relay_core::session::SessionRecord;

// =============================================================================
// Strategies
// =============================================================================

fn arb_key() -> impl Strategy<Value = String> {
    (0_u8..6).prop_map(|n| format!("k{n}"))
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,12}".prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        proptest::collection::vec(any::<i32>(), 0..4).prop_map(|v| json!(v)),
        ("[a-z]{1,6}", any::<u16>()).prop_map(|(k, v)| {
            let mut object = serde_json::Map::new();
            object.insert(k, Value::from(v));
            Value::Object(object)
        }),
    ]
}

fn arb_values() -> impl Strategy<Value = BTreeMap<String, Value>> {
    proptest::collection::btree_map(arb_key(), arb_value(), 0..6)
}

fn arb_record() -> impl Strategy<Value = SessionRecord> {
    ("[a-z0-5]{24}", 1_u64..100_000_000, arb_values(), any::<bool>()).prop_map(
        |(id, millis, values, abandoned)| {
            SessionRecord::from_values(id, Duration::from_millis(millis), values).with_abandoned(abandoned)
        },
    )
}

#[derive(Debug, Clone)]
enum Mutation {
    Set(String, Value),
    Remove(String),
    Clear,
    Abandon,
    Timeout(u64),
}

fn arb_mutation() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        4 => (arb_key(), arb_value()).prop_map(|(k, v)| Mutation::Set(k, v)),
        3 => arb_key().prop_map(Mutation::Remove),
        1 => Just(Mutation::Clear),
        1 => Just(Mutation::Abandon),
        1 => (1_u64..100_000_000).prop_map(Mutation::Timeout),
    ]
}

fn apply(record: &mut SessionRecord, mutation: &Mutation) {
    match mutation {
        Mutation::Set(k, v) => {
            record.set(k.clone(), v.clone()).unwrap();
        }
        Mutation::Remove(k) => {
            record.remove(k).unwrap();
        }
        Mutation::Clear => record.clear().unwrap(),
        Mutation::Abandon => record.abandon().unwrap(),
        Mutation::Timeout(millis) => record.set_timeout(Duration::from_millis(*millis)).unwrap(),
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn snapshot_roundtrip(record in arb_record()) {
        let serializer = SessionSerializer::default();
        let bytes = serializer.encode(&record).unwrap();
        let decoded = serializer.decode(&bytes).unwrap().into_snapshot().unwrap();
        prop_assert_eq!(decoded, record);
    }

    #[test]
    fn framed_snapshot_roundtrip(record in arb_record()) {
        let serializer = SessionSerializer::default();
        let frame = serializer.encode_frame(&record).unwrap();
        let decoded = serializer.decode(&frame).unwrap().into_snapshot().unwrap();
        prop_assert_eq!(decoded, record);
    }

    #[test]
    fn changeset_roundtrip_replays_mutations(
        base in arb_record(),
        mutations in proptest::collection::vec(arb_mutation(), 0..12),
    ) {
        let serializer = SessionSerializer::default();
        let mut mutated = base.clone();
        for m in &mutations {
            apply(&mut mutated, m);
        }

        let payload = serializer.encode_changeset(&mutated).unwrap();
        let decoded = serializer.decode(&payload).unwrap();
        prop_assert!(decoded.is_changeset());

        let mut replayed = base;
        decoded.apply_to(&mut replayed);
        prop_assert_eq!(replayed, mutated);
    }

    #[test]
    fn changeset_replay_matches_sequential_apply(
        base in arb_record(),
        mutations in proptest::collection::vec(arb_mutation(), 0..12),
    ) {
        let mut sequential = base.clone();
        for m in &mutations {
            apply(&mut sequential, m);
        }

        let mut replayed = base;
        sequential.changeset().apply_to(&mut replayed);
        prop_assert_eq!(replayed, sequential);
    }

    #[test]
    fn changeset_only_lists_touched_keys(
        base in arb_record(),
        mutations in proptest::collection::vec(arb_mutation(), 0..12),
    ) {
        let mut mutated = base.clone();
        for m in &mutations {
            apply(&mut mutated, m);
        }
        let mentioned: BTreeSet<&str> = mutations
            .iter()
            .filter_map(|m| match m {
                Mutation::Set(k, _) | Mutation::Remove(k) => Some(k.as_str()),
                _ => None,
            })
            .collect();
        let cleared = mutations.iter().any(|m| matches!(m, Mutation::Clear));

        for change in mutated.changeset().changes {
            let key = change.key.as_str();
            let from_clear = cleared && base.get(key).is_some();
            prop_assert!(
                mentioned.contains(key) || from_clear,
                "untouched key {} in changeset",
                key
            );
        }
    }

    #[test]
    fn unknown_key_policy(
        values in arb_values(),
        registered in proptest::collection::btree_set(arb_key(), 1..6),
    ) {
        let mut registry = KeyRegistry::new();
        for key in &registered {
            registry.register(key.clone(), ValueKind::Json);
        }
        let record = SessionRecord::from_values("abc", Duration::from_secs(60), values.clone());
        let payload = SessionSerializer::default().encode(&record).unwrap();

        let unregistered: Vec<String> = values
            .keys()
            .filter(|k| !registered.contains(*k))
            .cloned()
            .collect();

        let strict = SessionSerializer::new(SerializerOptions {
            registry: registry.clone(),
            throw_on_unknown_key: true,
            advertise_changesets: true,
        });
        match strict.decode(&payload) {
            Ok(_) => prop_assert!(unregistered.is_empty()),
            Err(SerializationError::UnknownKeys(keys)) => prop_assert_eq!(keys, unregistered.clone()),
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }

        let lenient = SessionSerializer::new(SerializerOptions {
            registry,
            throw_on_unknown_key: false,
            advertise_changesets: true,
        });
        let decoded = lenient.decode(&payload).unwrap().into_snapshot().unwrap();
        prop_assert_eq!(decoded.unknown_keys(), unregistered.as_slice());
        for key in decoded.keys() {
            prop_assert!(registered.contains(key));
        }
        for key in &unregistered {
            prop_assert!(decoded.get(key).is_none());
        }
    }

    #[test]
    fn typed_keys_never_hold_wrong_values(value in arb_value()) {
        let serializer = SessionSerializer::new(SerializerOptions {
            registry: KeyRegistry::new().with("count", ValueKind::Integer),
            ..SerializerOptions::default()
        });
        let record = SessionRecord::from_values(
            "abc",
            Duration::from_secs(60),
            BTreeMap::from([("count".to_string(), value.clone())]),
        );
        let payload = SessionSerializer::default().encode(&record).unwrap();
        match serializer.decode(&payload) {
            Ok(decoded) => {
                let decoded = decoded.into_snapshot().unwrap();
                prop_assert!(decoded.get("count").is_some_and(|v| v.is_i64() || v.is_u64()));
            }
            Err(err) => {
                let is_mismatch = matches!(err, SerializationError::TypeMismatch { .. });
                prop_assert!(is_mismatch);
                prop_assert!(!(value.is_i64() || value.is_u64()));
            }
        }
    }
}
