//! Remote event log model and sync wake signals.
//!
//! The remote store exposes a strictly ordered event log keyed by an opaque
//! cursor. The sync engine drains it batch by batch; hosts wake the engine
//! through an explicit flume channel instead of an ambient event bus, so
//! tests can drive it deterministically.

use serde::{Deserialize, Serialize};

use crate::remote::RemoteItem;

/// What happened to an item, as reported by the remote log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemChange {
    Created,
    Updated,
    Deleted,
}

/// One entry of the remote event log.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub id: String,
    pub change: ItemChange,
    /// Fresh item state for Created/Updated events. Deletes carry none.
    pub item: Option<RemoteItem>,
    /// Draft content mutates under a stable id, so draft updates always
    /// re-fetch the full content instead of patching metadata.
    pub is_draft: bool,
}

/// One round-trip of `poll_events`.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<RemoteEvent>,
    pub new_cursor: Option<String>,
    /// More events are queued behind this batch; poll again immediately.
    pub has_more: bool,
    /// The remote requests a full integrity check instead of incremental
    /// application.
    pub refresh: bool,
}

/// Wake signals delivered to the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSignal {
    /// New events may be available on the remote log.
    EventsAvailable,
    /// Force an integrity check on the next run.
    CheckIntegrity,
    /// Stop processing; the session is shutting down.
    Shutdown,
}

/// Cheap cloneable handle hosts use to wake the sync engine.
#[derive(Clone)]
pub struct SyncNotifier {
    tx: flume::Sender<SyncSignal>,
}

impl SyncNotifier {
    pub(crate) fn new(tx: flume::Sender<SyncSignal>) -> Self {
        Self { tx }
    }

    pub fn notify(&self, signal: SyncSignal) {
        let _ = self.tx.send(signal);
    }
}

/// Result summary of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub repaired: u64,
    pub integrity_checked: bool,
}

impl SyncOutcome {
    pub fn did_work(&self) -> bool {
        self.created + self.updated + self.deleted + self.repaired > 0
    }
}
