//! session-relay-core: leased session sharing between two web processes
//!
//! During a staged migration, requests for one user can land on either the
//! origin process (which owns the session) or a peer process. The peer
//! borrows the session for the duration of one request and hands it back;
//! the origin guarantees at most one writable borrower per session id.
//!
//! # Architecture
//!
//! ```text
//! peer                                   origin
//! RemoteSessionClient ── POST ─────────► endpoint ─► SessionStore::load
//!        ▲                                   │
//!        └──── snapshot + heartbeats ◄───────┤ LeaseCache::register
//!                                            │
//!    request body: changeset, end ─────►     ├─► LeaseCache::save
//!        ◄──── result line ──────────────────┘    └► SessionStore::commit
//! ```
//!
//! Origins that refuse the `POST` are served over two connections instead:
//! a `GET` for the snapshot stream and a `PUT` for the commit.
//!
//! # Modules
//!
//! - `session`: session records, change tracking, the injected store trait
//! - `serializer`: snapshot and changeset envelopes, key registration
//! - `lease`: the origin's lease cache
//! - `endpoint`: origin HTTP endpoint (axum)
//! - `client`: peer HTTP client (reqwest)
//! - `concurrent_map`: sharded map backing the cache and in-memory store
//! - `config`: `relay.toml` loading and validation
//! - `logging`: tracing subscriber setup
//! - `error`: error types with remediation hints
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod client;
pub mod concurrent_map;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod lease;
pub mod logging;
pub mod serializer;
pub mod session;

pub use client::{AcquiredSession, RemoteSessionClient, SessionOutcome};
pub use endpoint::{EndpointConfig, EndpointHandle, run_session_endpoint, session_router, start_session_endpoint};
pub use error::{Error, Result};
pub use lease::{LeaseCache, LeaseHandle, SaveResult};
pub use serializer::{DecodedSession, KeyRegistry, ProtocolVersion, SerializerOptions, SessionSerializer, ValueKind};
pub use session::{ChangeKind, Changeset, InMemorySessionStore, SessionChange, SessionRecord, SessionStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
