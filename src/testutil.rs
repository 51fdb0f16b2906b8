//! Deterministic in-process fakes for service tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::adapters::sqlite::{create_memory_pool, schema, StoreConfig};
use crate::cache::{BoundedCache, CacheConfig};
use crate::crypto::{IndexCipher, IndexKey, KeyWrapper};
use crate::error::IndexError;
use crate::remote::{MailboxRemote, RemoteContent, RemoteItem, RemotePage};
use crate::services::helpers::html_text::TextConfig;
use crate::services::indexer::BuilderConfig;
use crate::services::sync::SyncConfig;
use crate::state::Session;
use crate::types::events::EventBatch;
use crate::types::{Address, RecoveryPoint, SearchableMetadata, Timepoint};

pub fn test_item(id: &str, time: i64, subject: &str) -> RemoteItem {
    RemoteItem {
        id: id.to_string(),
        timepoint: Timepoint::new(time, 0),
        labels: ["inbox".to_string()].into_iter().collect::<BTreeSet<_>>(),
        metadata: SearchableMetadata {
            sender: Address::new("Ada", "ada@example.com"),
            to: vec![Address::new("Bob", "bob@example.com")],
            cc: vec![],
            has_attachments: false,
            is_unread: true,
            size_bytes: 100,
        },
        subject: Some(subject.to_string()),
        is_forwarded: false,
    }
}

/// Scripted remote mailbox: a fixed item set, per-item bodies, a queue of
/// event batches, and injectable transient failures.
pub struct FakeRemote {
    items: Mutex<Vec<RemoteItem>>,
    bodies: Mutex<HashMap<String, RemoteContent>>,
    events: Mutex<VecDeque<EventBatch>>,
    total_override: Mutex<Option<u64>>,
    page_failures: AtomicU32,
    content_failures: AtomicU32,
    pub fetch_page_calls: AtomicU32,
    pub fetch_content_calls: AtomicU32,
}

impl FakeRemote {
    pub fn new(items: Vec<RemoteItem>) -> Self {
        Self {
            items: Mutex::new(items),
            bodies: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            total_override: Mutex::new(None),
            page_failures: AtomicU32::new(0),
            content_failures: AtomicU32::new(0),
            fetch_page_calls: AtomicU32::new(0),
            fetch_content_calls: AtomicU32::new(0),
        }
    }

    pub fn set_body(&self, id: &str, content: RemoteContent) {
        self.bodies.lock().unwrap().insert(id.to_string(), content);
    }

    pub fn push_events(&self, batch: EventBatch) {
        self.events.lock().unwrap().push_back(batch);
    }

    pub fn add_item(&self, item: RemoteItem) {
        self.items.lock().unwrap().push(item);
    }

    pub fn remove_item(&self, id: &str) {
        self.items.lock().unwrap().retain(|i| i.id != id);
    }

    pub fn set_total_override(&self, total: Option<u64>) {
        *self.total_override.lock().unwrap() = total;
    }

    /// Make the next `n` fetch_page calls fail transiently.
    pub fn fail_next_pages(&self, n: u32) {
        self.page_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` fetch_content calls fail transiently.
    pub fn fail_next_contents(&self, n: u32) {
        self.content_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailboxRemote for FakeRemote {
    async fn fetch_page(
        &self,
        before: Option<&RecoveryPoint>,
        page_size: usize,
    ) -> Result<RemotePage, IndexError> {
        self.fetch_page_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.page_failures) {
            return Err(IndexError::Remote("injected page failure".into()));
        }

        let mut items = self.items.lock().unwrap().clone();
        items.sort_by(|a, b| b.timepoint.cmp(&a.timepoint));
        let filtered: Vec<RemoteItem> = items
            .into_iter()
            .filter(|i| before.map_or(true, |rp| i.timepoint < rp.timepoint))
            .collect();

        let has_more = filtered.len() > page_size;
        let page = filtered.into_iter().take(page_size).collect();
        Ok(RemotePage {
            items: page,
            has_more,
        })
    }

    async fn fetch_content(&self, id: &str) -> Result<RemoteContent, IndexError> {
        self.fetch_content_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.content_failures) {
            return Err(IndexError::Remote("injected content failure".into()));
        }

        Ok(self
            .bodies
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| RemoteContent::Body {
                html: None,
                text: Some(format!("body of {}", id)),
            }))
    }

    async fn poll_events(&self, _cursor: Option<&str>) -> Result<EventBatch, IndexError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn total_item_count(&self) -> Result<u64, IndexError> {
        if let Some(total) = *self.total_override.lock().unwrap() {
            return Ok(total);
        }
        Ok(self.items.lock().unwrap().len() as u64)
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Host-side key wrap fake: XOR with a constant, enough to exercise the
/// wrap/unwrap round trip without a real asymmetric primitive.
pub struct TestKeyWrapper;

impl KeyWrapper for TestKeyWrapper {
    fn wrap_key(&self, raw: &[u8]) -> Result<Vec<u8>, IndexError> {
        Ok(raw.iter().map(|b| b ^ 0x5a).collect())
    }

    fn unwrap_key(&self, blob: &[u8]) -> Option<Vec<u8>> {
        Some(blob.iter().map(|b| b ^ 0x5a).collect())
    }
}

/// A wrapper whose private key is "lost": unwrap always fails.
pub struct BrokenKeyWrapper;

impl KeyWrapper for BrokenKeyWrapper {
    fn wrap_key(&self, raw: &[u8]) -> Result<Vec<u8>, IndexError> {
        Ok(raw.to_vec())
    }

    fn unwrap_key(&self, _blob: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Session over an in-memory store with small, test-friendly batch sizes.
pub fn make_session(max_store_bytes: Option<u64>, cache_bytes: u64) -> Session {
    let pool = create_memory_pool().unwrap();
    schema::initialize_schema(&pool.get().unwrap()).unwrap();
    make_session_with_pool(pool, max_store_bytes, cache_bytes)
}

pub fn make_session_with_pool(
    pool: crate::adapters::sqlite::DbPool,
    max_store_bytes: Option<u64>,
    cache_bytes: u64,
) -> Session {
    Session::new(
        pool,
        IndexCipher::new(&IndexKey::generate()),
        StoreConfig {
            max_bytes: max_store_bytes,
        },
        BuilderConfig {
            page_size: 2,
            fan_out: 2,
            max_retries: 1,
            retry_base_ms: 1,
        },
        SyncConfig {
            max_retries: 1,
            retry_base_ms: 1,
            ..Default::default()
        },
        CacheConfig {
            max_bytes: cache_bytes,
        },
        TextConfig::default(),
        BoundedCache::new(cache_bytes),
    )
    .unwrap()
}
