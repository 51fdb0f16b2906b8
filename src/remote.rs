//! Host-facing interface to the remote mailbox.
//!
//! The engine never talks to the network itself. The host application owns
//! the transport and the per-item key material; it hands the engine
//! already-decrypted item metadata and content through this trait, and the
//! engine re-encrypts everything with the index key before it touches disk.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::IndexError;
use crate::types::events::EventBatch;
use crate::types::{RecoveryPoint, SearchableMetadata, Timepoint};

/// One item of a metadata page, decrypted by the host.
#[derive(Debug, Clone)]
pub struct RemoteItem {
    pub id: String,
    pub timepoint: Timepoint,
    pub labels: BTreeSet<String>,
    pub metadata: SearchableMetadata,
    /// None when the host failed to decrypt the subject.
    pub subject: Option<String>,
    /// Forwarded messages keep their quoted blocks during normalization.
    pub is_forwarded: bool,
}

/// One page of the newest-first metadata listing.
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub items: Vec<RemoteItem>,
    pub has_more: bool,
}

/// Full content of one item, decrypted by the host.
#[derive(Debug, Clone)]
pub enum RemoteContent {
    Body {
        html: Option<String>,
        text: Option<String>,
    },
    /// The host could not decrypt this item. The record is indexed with
    /// metadata only and marked `decryption_failed`.
    Failed,
}

/// The remote mailbox as the engine sees it.
#[async_trait]
pub trait MailboxRemote: Send + Sync {
    /// Fetch a page of item metadata strictly older than `before`
    /// (newest-first pagination). `before = None` starts at the top.
    async fn fetch_page(
        &self,
        before: Option<&RecoveryPoint>,
        page_size: usize,
    ) -> Result<RemotePage, IndexError>;

    /// Fetch and decrypt the full content of one item.
    async fn fetch_content(&self, id: &str) -> Result<RemoteContent, IndexError>;

    /// Fetch events since `cursor`. `cursor = None` returns the current
    /// cursor with no events, establishing the baseline.
    async fn poll_events(&self, cursor: Option<&str>) -> Result<EventBatch, IndexError>;

    /// Authoritative item count, used for drift detection.
    async fn total_item_count(&self) -> Result<u64, IndexError>;
}

/// Retry a transient remote operation with capped exponential backoff.
///
/// Only `IndexError::Remote` is retried; everything else surfaces
/// immediately. Recovery points are untouched by retries.
pub(crate) async fn with_retries<T, F, Fut>(
    what: &str,
    max_retries: u32,
    base_delay_ms: u64,
    mut op: F,
) -> Result<T, IndexError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, IndexError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(IndexError::Remote(e)) if attempt < max_retries => {
                attempt += 1;
                let delay = base_delay_ms.saturating_mul(1u64 << attempt.min(6));
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    what, attempt, max_retries, delay, e
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            other => return other,
        }
    }
}
