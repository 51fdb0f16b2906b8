//! Client-side encrypted full-text search for mailboxes.
//!
//! The engine builds and maintains a locally-encrypted index of a user's
//! mailbox without ever exposing plaintext outside process memory. The
//! host application supplies transport and key material through narrow
//! traits ([`remote::MailboxRemote`], [`crypto::KeyWrapper`]); the engine
//! owns the on-disk ciphertext store, the in-memory cache, resumable bulk
//! indexing, event-log synchronization, schema migration, and query
//! evaluation.

pub mod adapters;
pub mod cache;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod remote;
pub mod search;
pub mod services;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::{EngineConfig, SearchIndex};
pub use error::IndexError;
pub use remote::{MailboxRemote, RemoteContent, RemoteItem, RemotePage};
pub use search::{SearchQuery, SearchResults, SortOrder};
pub use types::events::{SyncNotifier, SyncOutcome, SyncSignal};
pub use types::{BuildProgress, BuildStatus, IndexRecord, RecoveryPoint, Timepoint};
