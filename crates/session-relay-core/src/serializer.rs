//! Wire envelope for session records and changesets.
//!
//! Every payload is a single JSON object. The header is shared by both modes;
//! `mode` selects the body:
//!
//! ```text
//! {"id":"abc","is_new":false,"abandoned":false,"read_only":false,"timeout_ms":1200000,
//!  "mode":"snapshot","values":{"k1":"v"},"unknown_keys":[],"supports_changeset":true}
//!
//! {"id":"abc","is_new":false,"abandoned":false,"read_only":false,"timeout_ms":1200000,
//!  "mode":"changeset","changes":[{"key":"k1","kind":"changed","value":"w"}]}
//! ```
//!
//! Keys are checked against a [`KeyRegistry`]. An empty registry accepts every
//! key as free-form JSON. With a non-empty registry, unregistered keys either
//! fail the whole payload (`throw_on_unknown_key`) or are skipped and tracked.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::SerializationError;
use crate::session::{ChangeKind, Changeset, SessionChange, SessionRecord};

/// Frame delimiter, also used as the heartbeat byte.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Relay protocol version, exchanged in the version header.
///
/// `V1` peers commit full snapshots only; `V2` adds changeset commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub const LATEST: Self = Self::V2;

    /// Missing or unparsable values mean `V1`. Versions newer than this
    /// build speak [`Self::LATEST`].
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.and_then(|v| v.trim().parse::<u32>().ok()) {
            Some(n) if n >= 2 => Self::V2,
            _ => Self::V1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
        }
    }

    /// Highest version both sides speak.
    #[must_use]
    pub fn negotiate(self, other: Self) -> Self {
        self.min(other)
    }

    #[must_use]
    pub fn supports_changesets(self) -> bool {
        self >= Self::V2
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON shape a registered key must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Integer,
    Float,
    Bool,
    /// Any JSON value.
    Json,
}

impl ValueKind {
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Json => true,
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Json => "json",
        };
        f.write_str(name)
    }
}

/// Registered session keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRegistry {
    keys: BTreeMap<String, ValueKind>,
}

impl KeyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Self::register`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, kind: ValueKind) -> Self {
        self.register(key, kind);
        self
    }

    pub fn register(&mut self, key: impl Into<String>, kind: ValueKind) {
        self.keys.insert(key.into(), kind);
    }

    pub fn kind_of(&self, key: &str) -> Option<ValueKind> {
        self.keys.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Serializer behavior.
#[derive(Debug, Clone)]
pub struct SerializerOptions {
    pub registry: KeyRegistry,
    /// Fail on unregistered keys instead of skipping them.
    pub throw_on_unknown_key: bool,
    /// Advertise changeset commits in snapshot envelopes.
    pub advertise_changesets: bool,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            registry: KeyRegistry::new(),
            throw_on_unknown_key: false,
            advertise_changesets: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: String,
    #[serde(default)]
    is_new: bool,
    #[serde(default)]
    abandoned: bool,
    #[serde(default)]
    read_only: bool,
    timeout_ms: u64,
    #[serde(flatten)]
    body: EnvelopeBody,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum EnvelopeBody {
    Snapshot {
        #[serde(default)]
        values: BTreeMap<String, Value>,
        #[serde(default)]
        unknown_keys: Vec<String>,
        #[serde(default)]
        supports_changeset: bool,
    },
    Changeset {
        #[serde(default)]
        changes: Vec<SessionChange>,
    },
}

/// A decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedSession {
    Snapshot(SessionRecord),
    Changeset(Changeset),
}

impl DecodedSession {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Snapshot(record) => record.session_id(),
            Self::Changeset(changeset) => &changeset.session_id,
        }
    }

    pub fn is_changeset(&self) -> bool {
        matches!(self, Self::Changeset(_))
    }

    /// Merge into `record`: full replace for snapshots, per-key apply for
    /// changesets. A snapshot never erases keys it lists as unknown.
    pub fn apply_to(self, record: &mut SessionRecord) {
        match self {
            Self::Snapshot(snapshot) => {
                record.apply_header(snapshot.timeout(), snapshot.is_abandoned());
                let preserve = snapshot.unknown_keys().to_vec();
                record.replace_values(snapshot.values().clone(), &preserve);
            }
            Self::Changeset(changeset) => changeset.apply_to(record),
        }
    }

    /// The record, when this is a snapshot.
    pub fn into_snapshot(self) -> Result<SessionRecord, SerializationError> {
        match self {
            Self::Snapshot(record) => Ok(record),
            Self::Changeset(_) => Err(SerializationError::Malformed(
                "expected a snapshot, got a changeset".to_string(),
            )),
        }
    }
}

/// Sub-millisecond remainders are dropped; absurd durations saturate.
fn duration_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Encodes and decodes session envelopes.
#[derive(Debug, Clone, Default)]
pub struct SessionSerializer {
    options: SerializerOptions,
}

impl SessionSerializer {
    #[must_use]
    pub fn new(options: SerializerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    fn resolve(&self, key: &str) -> Option<ValueKind> {
        if self.options.registry.is_empty() {
            Some(ValueKind::Json)
        } else {
            self.options.registry.kind_of(key)
        }
    }

    fn check_value(&self, key: &str, value: &Value) -> Result<bool, SerializationError> {
        match self.resolve(key) {
            Some(kind) if kind.accepts(value) => Ok(true),
            Some(expected) => Err(SerializationError::TypeMismatch {
                key: key.to_string(),
                expected,
            }),
            None => Ok(false),
        }
    }

    fn unknown_policy(&self, session_id: &str, unknown: &[String]) -> Result<(), SerializationError> {
        if unknown.is_empty() {
            return Ok(());
        }
        if self.options.throw_on_unknown_key {
            return Err(SerializationError::UnknownKeys(unknown.to_vec()));
        }
        warn!(
            target: "session_relay.serializer",
            session_id = %session_id,
            keys = ?unknown,
            "skipping unregistered session keys"
        );
        Ok(())
    }

    /// Full snapshot of `record`.
    pub fn encode(&self, record: &SessionRecord) -> Result<Vec<u8>, SerializationError> {
        self.encode_for(record, ProtocolVersion::LATEST)
    }

    /// Snapshot for a peer speaking `version`; changesets are only
    /// advertised to peers that can send them.
    pub fn encode_for(
        &self,
        record: &SessionRecord,
        version: ProtocolVersion,
    ) -> Result<Vec<u8>, SerializationError> {
        let mut values = BTreeMap::new();
        let mut unknown = Vec::new();
        for (key, value) in record.values() {
            if self.check_value(key, value)? {
                values.insert(key.clone(), value.clone());
            } else {
                unknown.push(key.clone());
            }
        }
        self.unknown_policy(record.session_id(), &unknown)?;

        let mut unknown_keys = record.unknown_keys().to_vec();
        for key in unknown {
            if !unknown_keys.contains(&key) {
                unknown_keys.push(key);
            }
        }

        let envelope = Envelope {
            id: record.session_id().to_string(),
            is_new: record.is_new_session(),
            abandoned: record.is_abandoned(),
            read_only: record.is_read_only(),
            timeout_ms: duration_millis(record.timeout()),
            body: EnvelopeBody::Snapshot {
                values,
                unknown_keys,
                supports_changeset: self.options.advertise_changesets
                    && version.supports_changesets(),
            },
        };
        to_bytes(&envelope)
    }

    /// Snapshot followed by the frame delimiter.
    pub fn encode_frame(&self, record: &SessionRecord) -> Result<Vec<u8>, SerializationError> {
        self.encode_frame_for(record, ProtocolVersion::LATEST)
    }

    pub fn encode_frame_for(
        &self,
        record: &SessionRecord,
        version: ProtocolVersion,
    ) -> Result<Vec<u8>, SerializationError> {
        let mut bytes = self.encode_for(record, version)?;
        bytes.push(FRAME_DELIMITER);
        Ok(bytes)
    }

    /// Changes of `record` since it was materialized.
    pub fn encode_changeset(&self, record: &SessionRecord) -> Result<Vec<u8>, SerializationError> {
        let changeset = record.changeset();
        let mut unknown = Vec::new();
        let mut changes = Vec::with_capacity(changeset.changes.len());
        for change in changeset.changes {
            let registered = match &change.value {
                Some(value) => self.check_value(&change.key, value)?,
                None => self.resolve(&change.key).is_some(),
            };
            if registered || change.kind == ChangeKind::Removed {
                changes.push(change);
            } else {
                unknown.push(change.key.clone());
                changes.push(SessionChange::unknown(change.key));
            }
        }
        self.unknown_policy(record.session_id(), &unknown)?;

        let envelope = Envelope {
            id: changeset.session_id,
            is_new: record.is_new_session(),
            abandoned: changeset.is_abandoned,
            read_only: record.is_read_only(),
            timeout_ms: duration_millis(changeset.timeout),
            body: EnvelopeBody::Changeset { changes },
        };
        to_bytes(&envelope)
    }

    /// Decode one payload. A trailing frame delimiter is accepted.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedSession, SerializationError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| SerializationError::Malformed(e.to_string()))?;
        if envelope.id.is_empty() {
            return Err(SerializationError::Malformed("empty session id".to_string()));
        }
        let timeout = Duration::from_millis(envelope.timeout_ms);

        match envelope.body {
            EnvelopeBody::Snapshot {
                values,
                mut unknown_keys,
                supports_changeset,
            } => {
                let mut accepted = BTreeMap::new();
                let mut unknown = Vec::new();
                for (key, value) in values {
                    if self.check_value(&key, &value)? {
                        accepted.insert(key, value);
                    } else {
                        unknown.push(key);
                    }
                }
                self.unknown_policy(&envelope.id, &unknown)?;
                for key in unknown {
                    if !unknown_keys.contains(&key) {
                        unknown_keys.push(key);
                    }
                }

                let record = SessionRecord::from_values(envelope.id, timeout, accepted)
                    .with_new_session(envelope.is_new)
                    .with_read_only(envelope.read_only)
                    .with_abandoned(envelope.abandoned)
                    .with_changeset_support(supports_changeset)
                    .with_unknown_keys(unknown_keys);
                Ok(DecodedSession::Snapshot(record))
            }
            EnvelopeBody::Changeset { changes } => {
                let mut unknown = Vec::new();
                let mut checked = Vec::with_capacity(changes.len());
                for change in changes {
                    let registered = match (change.kind, &change.value) {
                        (ChangeKind::Unknown, _) => {
                            checked.push(change);
                            continue;
                        }
                        (ChangeKind::New | ChangeKind::Changed, None) => {
                            return Err(SerializationError::MissingValue(change.key));
                        }
                        (ChangeKind::Removed, _) => true,
                        (_, Some(value)) => self.check_value(&change.key, value)?,
                    };
                    if registered {
                        checked.push(change);
                    } else {
                        unknown.push(change.key.clone());
                        checked.push(SessionChange::unknown(change.key));
                    }
                }
                self.unknown_policy(&envelope.id, &unknown)?;

                Ok(DecodedSession::Changeset(Changeset {
                    session_id: envelope.id,
                    is_abandoned: envelope.abandoned,
                    timeout,
                    changes: checked,
                }))
            }
        }
    }
}

fn to_bytes(envelope: &Envelope) -> Result<Vec<u8>, SerializationError> {
    serde_json::to_vec(envelope).map_err(|e| SerializationError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> SessionRecord {
        SessionRecord::from_values(
            "abc",
            Duration::from_secs(90),
            BTreeMap::from([
                ("user".to_string(), json!("ada")),
                ("visits".to_string(), json!(3)),
            ]),
        )
    }

    fn registry() -> KeyRegistry {
        KeyRegistry::new()
            .with("user", ValueKind::String)
            .with("visits", ValueKind::Integer)
    }

    fn strict() -> SessionSerializer {
        SessionSerializer::new(SerializerOptions {
            registry: registry(),
            throw_on_unknown_key: true,
            advertise_changesets: true,
        })
    }

    fn lenient() -> SessionSerializer {
        SessionSerializer::new(SerializerOptions {
            registry: registry(),
            ..SerializerOptions::default()
        })
    }

    #[test]
    fn snapshot_roundtrip_keeps_metadata() {
        let serializer = SessionSerializer::default();
        let original = record().with_new_session(true).with_abandoned(true);
        let decoded = serializer
            .decode(&serializer.encode(&original).unwrap())
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert_eq!(decoded, original);
        assert!(decoded.is_new_session());
        assert!(decoded.supports_changeset());
    }

    #[test]
    fn frame_ends_with_delimiter_and_decodes() {
        let serializer = SessionSerializer::default();
        let frame = serializer.encode_frame(&record()).unwrap();
        assert_eq!(frame.last(), Some(&FRAME_DELIMITER));
        assert!(serializer.decode(&frame).is_ok());
    }

    #[test]
    fn envelope_shape_is_stable() {
        let bytes = SessionSerializer::default().encode(&record()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["id"], "abc");
        assert_eq!(value["mode"], "snapshot");
        assert_eq!(value["timeout_ms"], 90_000);
        assert_eq!(value["values"]["visits"], 3);
    }

    #[test]
    fn protocol_version_parsing_defaults_to_v1() {
        assert_eq!(ProtocolVersion::parse(None), ProtocolVersion::V1);
        assert_eq!(ProtocolVersion::parse(Some("1")), ProtocolVersion::V1);
        assert_eq!(ProtocolVersion::parse(Some(" 2 ")), ProtocolVersion::V2);
        assert_eq!(ProtocolVersion::parse(Some("7")), ProtocolVersion::V2);
        assert_eq!(ProtocolVersion::parse(Some("two")), ProtocolVersion::V1);
        assert_eq!(ProtocolVersion::parse(Some("-2")), ProtocolVersion::V1);
        assert_eq!(ProtocolVersion::LATEST.negotiate(ProtocolVersion::V1), ProtocolVersion::V1);
        assert_eq!(ProtocolVersion::LATEST.to_string(), "2");
    }

    #[test]
    fn v1_peers_are_not_offered_changesets() {
        let serializer = SessionSerializer::default();
        let v1 = serializer.encode_for(&record(), ProtocolVersion::V1).unwrap();
        let value: Value = serde_json::from_slice(&v1).unwrap();
        assert_eq!(value["supports_changeset"], false);

        let v2 = serializer.encode_frame_for(&record(), ProtocolVersion::V2).unwrap();
        let decoded = serializer.decode(&v2).unwrap().into_snapshot().unwrap();
        assert!(decoded.supports_changeset());
    }

    #[test]
    fn sub_second_timeouts_survive_both_encodings() {
        let serializer = SessionSerializer::default();
        let original = SessionRecord::new("abc", Duration::from_millis(1500));
        let decoded = serializer
            .decode(&serializer.encode(&original).unwrap())
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert_eq!(decoded.timeout(), Duration::from_millis(1500));
        assert_eq!(decoded, original);

        let mut peer = original.clone();
        peer.set_timeout(Duration::from_millis(500)).unwrap();
        let mut origin = original;
        serializer
            .decode(&serializer.encode_changeset(&peer).unwrap())
            .unwrap()
            .apply_to(&mut origin);
        assert_eq!(origin.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn changeset_roundtrip_replays() {
        let serializer = lenient();
        let base = record();
        let mut mutated = base.clone();
        mutated.set("visits", json!(4)).unwrap();
        mutated.remove("user").unwrap();

        let decoded = serializer
            .decode(&serializer.encode_changeset(&mutated).unwrap())
            .unwrap();
        assert!(decoded.is_changeset());
        let mut replayed = base;
        decoded.apply_to(&mut replayed);
        assert_eq!(replayed, mutated);
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let payload = br#"{"id":"abc","timeout_ms":60000,"mode":"snapshot","values":{"user":"ada","theme":"dark"}}"#;
        let err = strict().decode(payload).unwrap_err();
        assert!(matches!(err, SerializationError::UnknownKeys(ref keys) if keys == &["theme".to_string()]));
    }

    #[test]
    fn lenient_mode_skips_and_tracks_unknown_keys() {
        let payload = br#"{"id":"abc","timeout_ms":60000,"mode":"snapshot","values":{"user":"ada","theme":"dark"}}"#;
        let record = lenient().decode(payload).unwrap().into_snapshot().unwrap();
        assert_eq!(record.get("theme"), None);
        assert_eq!(record.unknown_keys(), &["theme".to_string()]);
        assert_eq!(record.get("user"), Some(&json!("ada")));
    }

    #[test]
    fn wrongly_typed_value_is_rejected() {
        let payload = br#"{"id":"abc","timeout_ms":60000,"mode":"snapshot","values":{"visits":"three"}}"#;
        let err = lenient().decode(payload).unwrap_err();
        assert!(matches!(
            err,
            SerializationError::TypeMismatch { ref key, expected: ValueKind::Integer } if key == "visits"
        ));
    }

    #[test]
    fn lenient_changeset_marks_unregistered_keys_unknown() {
        let mut mutated = record();
        mutated.set("theme", json!("dark")).unwrap();
        let bytes = lenient().encode_changeset(&mutated).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["changes"][0]["kind"], "unknown");
        assert!(value["changes"][0].get("value").is_none());

        assert!(strict().encode_changeset(&mutated).is_err());
    }

    #[test]
    fn changeset_without_value_is_rejected() {
        let payload = br#"{"id":"abc","timeout_ms":60000,"mode":"changeset","changes":[{"key":"user","kind":"new"}]}"#;
        assert!(matches!(
            lenient().decode(payload),
            Err(SerializationError::MissingValue(_))
        ));
    }

    #[test]
    fn snapshot_apply_preserves_keys_peer_could_not_decode() {
        let mut origin = record();
        origin.set("theme", json!("dark")).unwrap();

        let peer_view = lenient()
            .decode(&SessionSerializer::default().encode(&origin).unwrap())
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert_eq!(peer_view.unknown_keys(), &["theme".to_string()]);

        let commit = lenient().encode(&peer_view).unwrap();
        SessionSerializer::default()
            .decode(&commit)
            .unwrap()
            .apply_to(&mut origin);
        assert_eq!(origin.get("theme"), Some(&json!("dark")));
    }

    #[test]
    fn garbage_is_malformed() {
        let payloads: [&[u8]; 4] = [
            b"",
            b"not json",
            b"{}",
            br#"{"id":"","timeout_ms":1000,"mode":"snapshot"}"#,
        ];
        for payload in payloads {
            assert!(matches!(
                SessionSerializer::default().decode(payload),
                Err(SerializationError::Malformed(_))
            ));
        }
    }
}
