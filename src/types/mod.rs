//! Core data model for the encrypted index.
//!
//! Everything here is plaintext-in-memory only. The storage layer owns the
//! encrypted representation (`StoredCiphertext`); decrypted records exist
//! solely inside the current process.

pub mod events;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Composite sort and uniqueness key for mailbox items.
///
/// `order` breaks ties between items sharing a timestamp. The pair is
/// unique across a user's index and is the pagination cursor everywhere.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timepoint {
    /// Unix epoch seconds.
    pub time: i64,
    pub order: u64,
}

impl Timepoint {
    pub fn new(time: i64, order: u64) -> Self {
        Self { time, order }
    }
}

/// A single sender or recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub addr: String,
}

impl Address {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

/// Metadata fields the search evaluator filters on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchableMetadata {
    pub sender: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub has_attachments: bool,
    pub is_unread: bool,
    pub size_bytes: u64,
}

/// One indexed mailbox item, fully decrypted.
///
/// `subject` and `body` are absent when their ciphertext half failed to
/// decrypt; `decryption_failed` marks the record as degraded so the search
/// evaluator can surface it as a filterable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    pub timepoint: Timepoint,
    pub labels: BTreeSet<String>,
    pub metadata: SearchableMetadata,
    pub subject: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub decryption_failed: bool,
}

impl IndexRecord {
    /// Split into the separately-encrypted halves of the v2 schema.
    pub fn split(&self) -> (MetadataHalf, ContentHalf) {
        (
            MetadataHalf {
                id: self.id.clone(),
                timepoint: self.timepoint,
                labels: self.labels.clone(),
                metadata: self.metadata.clone(),
                subject: self.subject.clone(),
            },
            ContentHalf {
                body: self.body.clone(),
                failed: self.decryption_failed,
            },
        )
    }

    /// Reassemble from decrypted halves. A missing content half leaves
    /// `body` unset without failing the whole record.
    pub fn assemble(meta: MetadataHalf, content: Option<ContentHalf>) -> Self {
        let (body, failed) = match content {
            Some(c) => (c.body, c.failed),
            None => (None, false),
        };
        Self {
            id: meta.id,
            timepoint: meta.timepoint,
            labels: meta.labels,
            metadata: meta.metadata,
            subject: meta.subject,
            body,
            decryption_failed: failed,
        }
    }
}

/// Everything except the body: small, decrypted first, enough for all
/// metadata predicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataHalf {
    pub id: String,
    pub timepoint: Timepoint,
    pub labels: BTreeSet<String>,
    pub metadata: SearchableMetadata,
    pub subject: Option<String>,
}

/// The normalized body text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHalf {
    pub body: Option<String>,
    /// The host could not decrypt this item's content; the body is
    /// permanently absent rather than not-yet-indexed.
    #[serde(default)]
    pub failed: bool,
}

/// An IV + ciphertext pair as produced by the record codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// On-disk representation of one record. Owned exclusively by the storage
/// layer; `content` is None while only metadata has been indexed.
#[derive(Debug, Clone)]
pub struct StoredCiphertext {
    pub id: String,
    pub timepoint: Timepoint,
    pub labels: BTreeSet<String>,
    pub meta: SealedBlob,
    pub content: Option<SealedBlob>,
    /// Approximate on-disk footprint, used for the quota budget.
    pub byte_size: u64,
}

impl StoredCiphertext {
    pub fn approximate_size(meta: &SealedBlob, content: Option<&SealedBlob>) -> u64 {
        let content_len = content.map(|c| c.ciphertext.len() + 12).unwrap_or(0);
        (meta.ciphertext.len() + 12 + content_len) as u64
    }
}

/// Durable bookmark: the oldest item already indexed. Paginated work
/// resumes strictly below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub id: String,
    pub timepoint: Timepoint,
}

/// Build lifecycle. `Active` is terminal success; `Failed` requires a full
/// rebuild (lost key or corrupt database).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    NotStarted,
    Indexing,
    Paused,
    Active,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::NotStarted => "not_started",
            BuildStatus::Indexing => "indexing",
            BuildStatus::Paused => "paused",
            BuildStatus::Active => "active",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(BuildStatus::NotStarted),
            "indexing" => Some(BuildStatus::Indexing),
            "paused" => Some(BuildStatus::Paused),
            "active" => Some(BuildStatus::Active),
            "failed" => Some(BuildStatus::Failed),
            _ => None,
        }
    }

    /// True when a recovery point can pick the build back up.
    pub fn is_resumable(&self) -> bool {
        matches!(self, BuildStatus::Indexing | BuildStatus::Paused)
    }
}

/// Durable progress of the initial build, updated after every batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildProgress {
    pub status: BuildStatus,
    pub current_count: u64,
    pub total_count: u64,
    pub recovery_point: Option<RecoveryPoint>,
    /// Epoch-millisecond stamps, one per completed batch. Feeds the time
    /// estimate shown to the user.
    pub timestamps: Vec<i64>,
    pub num_pauses: u32,
    pub original_estimate_secs: Option<u64>,
}

impl BuildProgress {
    pub fn new(total_count: u64) -> Self {
        Self {
            status: BuildStatus::Indexing,
            current_count: 0,
            total_count,
            recovery_point: None,
            timestamps: Vec::new(),
            num_pauses: 0,
            original_estimate_secs: None,
        }
    }
}
