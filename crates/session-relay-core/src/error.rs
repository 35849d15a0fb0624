//! Error types, each paired with operator-facing fix-up hints.

use std::fmt;
use thiserror::Error;

/// Hints printed under an error by `srelay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remediation {
    pub summary: String,
    /// `(purpose, command line)`
    pub commands: Vec<(String, String)>,
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, purpose: impl Into<String>, line: impl Into<String>) -> Self {
        self.commands.push((purpose.into(), line.into()));
        self
    }

    #[must_use]
    pub fn alternative(mut self, hint: impl Into<String>) -> Self {
        self.alternatives.push(hint.into());
        self
    }

    /// Multi-line text block starting with `To fix:`.
    #[must_use]
    pub fn render_plain(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "To fix:")?;
        writeln!(f, "  {}", self.summary)?;
        for (purpose, line) in &self.commands {
            writeln!(f, "  $ {line}    # {purpose}")?;
        }
        for hint in &self.alternatives {
            writeln!(f, "  or: {hint}")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the library; wraps the per-area enums below.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    /// Peer side only.
    #[error("Remote session error: {0}")]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint startup, signal handler and task join failures.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        let hint = match self {
            Self::Config(err) => err.remediation(),
            Self::Serialization(err) => err.remediation(),
            Self::Remote(err) => err.remediation(),
            Self::Lease(LeaseError::AlreadyLeased(_)) => {
                Remediation::new("Another peer request holds the write lease for this session.")
                    .alternative("Retry once the in-flight request on the peer has finished.")
            }
            Self::Session(SessionError::ReadOnly) => {
                Remediation::new("The session was acquired read-only; acquire it writable to mutate it.")
            }
            Self::Session(SessionError::EmptyKey) => Remediation::new("Use a non-empty session key."),
            Self::Io(_) => Remediation::new("Check the bind address and file permissions, then retry.")
                .command("validate config", "srelay config check"),
            Self::Json(_) => Remediation::new("The payload is not JSON; check what produced it."),
            Self::Runtime(_) => Remediation::new("Restart the origin endpoint and retry.")
                .alternative("Run with RUST_LOG=session_relay=debug for more detail."),
        };
        Some(hint)
    }
}


/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config: {0}")]
    ReadFailed(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Invalid config value: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or point --config at it: {path}"))
                    .command("write defaults", format!("srelay config init > {path}"))
            }
            Self::ReadFailed(_) => Remediation::new("Check file permissions and retry."),
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax and retry.")
                .command("validate config", "srelay config check --config <path>"),
            Self::SerializeError(_) => {
                Remediation::new("Report the issue; default config should always serialize.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Correct the reported value in the config file.")
                    .command("validate config", "srelay config check --config <path>")
                    .alternative("Set SESSION_RELAY_API_KEY instead of storing the key on disk.")
            }
        }
    }
}

/// Errors raised by a [`crate::session::SessionRecord`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is read-only")]
    ReadOnly,

    #[error("session key must not be empty")]
    EmptyKey,
}

/// Envelope encoding/decoding errors
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("malformed session payload: {0}")]
    Malformed(String),

    #[error("unknown session keys: {}", .0.join(", "))]
    UnknownKeys(Vec<String>),

    #[error("value for key '{key}' is not a {expected}")]
    TypeMismatch {
        key: String,
        expected: crate::serializer::ValueKind,
    },

    #[error("change for key '{0}' is missing its value")]
    MissingValue(String),

    #[error("payload is for session '{actual}', expected '{expected}'")]
    SessionMismatch { expected: String, actual: String },
}

impl SerializationError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Malformed(_) | Self::MissingValue(_) => Remediation::new(
                "The peer and origin disagree on the envelope format; deploy matching versions.",
            ),
            Self::UnknownKeys(keys) => Remediation::new(format!(
                "Register the session keys on both sides: {}",
                keys.join(", ")
            ))
            .alternative("Disable serializer.throw_on_unknown_key to skip and track them instead."),
            Self::TypeMismatch { key, expected } => Remediation::new(format!(
                "Key '{key}' is registered as {expected}; align the registration on both sides."
            )),
            Self::SessionMismatch { .. } => {
                Remediation::new("The commit was sent with the wrong session cookie.")
            }
        }
    }
}

/// Lease cache errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("session '{0}' is already leased")]
    AlreadyLeased(String),
}

/// Which commit conflict the origin reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    SessionNotFound,
    AlreadyUpdated,
    AlreadyLeased,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::SessionNotFound => "session not found",
            Self::AlreadyUpdated => "session already updated",
            Self::AlreadyLeased => "session already leased",
        };
        f.write_str(text)
    }
}

/// Peer-side errors talking to the origin
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("origin rejected the shared API key")]
    Unauthorized,

    #[error("origin reported a conflict: {0}")]
    Conflict(ConflictKind),

    #[error("origin rejected the request ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("origin did not respond within {0:?}")]
    Timeout(std::time::Duration),

    #[error("origin closed the session stream before sending a snapshot")]
    StreamClosed,

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid origin URL: {0}")]
    InvalidUrl(String),

    #[error("invalid header name: {0}")]
    InvalidHeader(String),

    #[error("origin sent an unreadable session: {0}")]
    Payload(#[from] SerializationError),
}

impl RemoteError {
    /// Whether the caller should treat this as "my write was not applied"
    /// rather than a hard failure.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Unauthorized => Remediation::new(
                "The peer and origin API keys differ; set the same session.api_key on both.",
            )
            .alternative("Export SESSION_RELAY_API_KEY on both processes."),
            Self::Conflict(kind) => Remediation::new(format!(
                "The write was not applied ({kind}); reload the session and retry the request."
            )),
            Self::Rejected { .. } => {
                Remediation::new("Check the origin logs for the rejected request.")
            }
            Self::Timeout(_) => Remediation::new("The origin is slow or unreachable.")
                .command("check origin", "srelay peer get --read-only")
                .alternative("Raise peer.network_timeout_secs if the origin is under load."),
            Self::StreamClosed | Self::Transport(_) => {
                Remediation::new("Verify the origin is running and reachable from the peer.")
                    .command("check origin", "srelay peer get --read-only")
            }
            Self::InvalidUrl(_) => Remediation::new("Fix peer.origin_url in the config file."),
            Self::InvalidHeader(_) => {
                Remediation::new("Fix the header names in the [session] config section.")
            }
            Self::Payload(err) => err.remediation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_variant_has_a_hint() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let errors = vec![
            Error::Config(ConfigError::FileNotFound("relay.toml".to_string())),
            Error::Config(ConfigError::ValidationError("api_key".to_string())),
            Error::Session(SessionError::ReadOnly),
            Error::Serialization(SerializationError::UnknownKeys(vec!["k".to_string()])),
            Error::Lease(LeaseError::AlreadyLeased("abc".to_string())),
            Error::Remote(RemoteError::Unauthorized),
            Error::Remote(RemoteError::Conflict(ConflictKind::AlreadyUpdated)),
            Error::Io(std::io::Error::other("boom")),
            Error::Json(json_err),
            Error::Runtime("join".to_string()),
        ];

        for err in errors {
            let remediation = err.remediation();
            assert!(remediation.is_some(), "missing remediation for {err}");
            assert!(!remediation.unwrap().summary.is_empty());
        }
    }

    #[test]
    fn render_plain_lists_commands_and_alternatives() {
        let text = Remediation::new("Do the thing")
            .command("check", "srelay config check")
            .alternative("skip it")
            .render_plain();
        assert_eq!(
            text,
            "To fix:\n  Do the thing\n  $ srelay config check    # check\n  or: skip it\n"
        );
    }

    #[test]
    fn conflicts_are_recoverable() {
        assert!(RemoteError::Conflict(ConflictKind::SessionNotFound).is_conflict());
        assert!(!RemoteError::Unauthorized.is_conflict());
    }

    #[test]
    fn unknown_keys_message_lists_keys() {
        let err = SerializationError::UnknownKeys(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "unknown session keys: a, b");
    }
}
