//! Engine facade: one handle per user session.
//!
//! Ties together the storage layer, the record cipher, the bounded cache,
//! and the build/sync/migration services behind the narrow interface the
//! host application sees. The on-disk index is a cache of remote state
//! plus locally-derived search text; everything except the key material
//! can be rebuilt from the remote.

use std::path::Path;

use tracing::{info, warn};

use crate::adapters::sqlite::{self, meta, progress, records, schema, DbPool, StoreConfig};
use crate::cache::{self, CacheConfig};
use crate::crypto::{IndexCipher, IndexKey, KeyWrapper};
use crate::error::IndexError;
use crate::remote::MailboxRemote;
use crate::search::{SearchConfig, SearchQuery, SearchResults, Searcher};
use crate::services::helpers::html_text::TextConfig;
use crate::services::indexer::BuilderConfig;
use crate::services::sync::{SyncConfig, SyncEngine};
use crate::services::worker;
use crate::state::Session;
use crate::types::events::{SyncNotifier, SyncOutcome};
use crate::types::BuildProgress;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub builder: BuilderConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub text: TextConfig,
}

/// The encrypted search index for one user.
pub struct SearchIndex {
    session: Session,
    sync: SyncEngine,
    searcher: Searcher,
}

impl SearchIndex {
    pub fn open(
        db_path: &Path,
        wrapper: &dyn KeyWrapper,
        config: EngineConfig,
    ) -> Result<Self, IndexError> {
        let pool = sqlite::create_pool(db_path)?;
        Self::open_with_pool(pool, wrapper, config)
    }

    /// Open over an existing pool (tests use an in-memory database).
    pub fn open_with_pool(
        pool: DbPool,
        wrapper: &dyn KeyWrapper,
        config: EngineConfig,
    ) -> Result<Self, IndexError> {
        {
            let conn = pool.get()?;
            schema::initialize_schema(&conn)?;
            // Fresh stores start at the current version. Legacy stores keep
            // their unset/old version until migration succeeds.
            if meta::get(&conn, meta::KEY_SCHEMA_VERSION)?.is_none()
                && !schema::has_legacy_table(&conn)?
            {
                meta::set(
                    &conn,
                    meta::KEY_SCHEMA_VERSION,
                    &schema::SCHEMA_VERSION.to_string(),
                )?;
            }
        }

        let cipher = load_or_create_cipher(&pool, wrapper)?;
        let cache = cache::warm(&pool, &cipher, &config.cache)?;
        let searcher = Searcher::new(config.search.clone());
        let sync = SyncEngine::new(&config.sync);

        let session = Session::new(
            pool,
            cipher,
            config.store,
            config.builder,
            config.sync,
            config.cache,
            config.text,
            cache,
        )?;

        Ok(Self {
            session,
            sync,
            searcher,
        })
    }

    /// Run one unit of background work: pending migration, then build,
    /// then queued sync signals. Hosts call this from their scheduler.
    pub async fn tick(&mut self, remote: &dyn MailboxRemote) -> Result<bool, IndexError> {
        let did_work = worker::tick(&self.session, remote, &mut self.sync).await?;
        if did_work {
            self.searcher.invalidate();
        }
        Ok(did_work)
    }

    /// Run one sync pass immediately, ignoring the signal queue.
    pub async fn sync_now(
        &mut self,
        remote: &dyn MailboxRemote,
    ) -> Result<SyncOutcome, IndexError> {
        let outcome = self.sync.sync_once(&self.session, remote, false).await?;
        if outcome.did_work() {
            self.searcher.invalidate();
        }
        Ok(outcome)
    }

    pub fn search(&mut self, query: &SearchQuery) -> Result<SearchResults, IndexError> {
        let session = &self.session;
        let cache = session.cache_guard();
        self.searcher
            .search(query, &cache, &session.pool, &session.cipher)
    }

    /// Handle for waking the sync engine from host event callbacks.
    pub fn notifier(&self) -> SyncNotifier {
        self.sync.notifier()
    }

    pub fn progress(&self) -> Result<Option<BuildProgress>, IndexError> {
        progress::load(&self.session.pool)
    }

    pub fn record_count(&self) -> Result<u64, IndexError> {
        records::count(&self.session.pool)
    }

    pub fn estimated_disk_bytes(&self) -> Result<u64, IndexError> {
        Ok(meta::get_i64(&self.session.pool, meta::KEY_ESTIMATED_BYTES)?.unwrap_or(0) as u64)
    }

    /// True when search results may be incomplete: the on-disk index was
    /// truncated under quota pressure, or the cache mirrors only part of
    /// the disk.
    pub fn is_limited(&self) -> Result<bool, IndexError> {
        if meta::get_bool(&self.session.pool, meta::KEY_INDEX_LIMITED)? {
            return Ok(true);
        }
        let disk_count = records::count(&self.session.pool)?;
        Ok(self.session.with_cache(|cache| cache.is_limited(disk_count)))
    }

    pub fn set_paused(&self, paused: bool) -> Result<(), IndexError> {
        self.session.set_paused(paused)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), IndexError> {
        self.session.set_enabled(enabled)
    }

    /// Signal cancellation to the running stage. In-flight batch writes
    /// complete; no further pages are fetched.
    pub fn cancel(&self) {
        self.session.cancel.cancel();
    }

    pub fn reset_cancel(&self) {
        self.session.cancel.reset();
    }

    /// Destroy the index and start over with a fresh key. The next build
    /// re-indexes the whole mailbox.
    pub fn wipe(&mut self, wrapper: &dyn KeyWrapper) -> Result<(), IndexError> {
        warn!("Wiping index for full rebuild");
        records::wipe(&self.session.pool)?;
        {
            let conn = self.session.pool.get()?;
            schema::drop_legacy_table(&conn)?;
            meta::set(
                &conn,
                meta::KEY_SCHEMA_VERSION,
                &schema::SCHEMA_VERSION.to_string(),
            )?;
        }

        let key = IndexKey::generate();
        let cipher = IndexCipher::new(&key);
        let wrapped = wrapper.wrap_key(key.as_bytes())?;
        meta::set_wrapped_key(&self.session.pool, &wrapped)?;
        meta::set_blob(&self.session.pool, meta::KEY_KEY_CHECK, &cipher.key_check()?)?;
        self.session.cipher = cipher;

        self.session.with_cache(|cache| cache.clear());
        self.searcher.invalidate();
        Ok(())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

/// Load the wrapped index key, or generate one on first use.
///
/// An unusable key (unwrap failure, wrong length, failed verification)
/// means every ciphertext on disk is garbage: the index is wiped and a
/// fresh key issued, and the next build starts from scratch.
fn load_or_create_cipher(
    pool: &DbPool,
    wrapper: &dyn KeyWrapper,
) -> Result<IndexCipher, IndexError> {
    if let Some(wrapped) = meta::get_wrapped_key(pool)? {
        match wrapper.unwrap_key(&wrapped).and_then(|raw| IndexKey::from_bytes(&raw)) {
            Some(key) => {
                let cipher = IndexCipher::new(&key);
                match meta::get_blob(pool, meta::KEY_KEY_CHECK) {
                    Ok(Some(check)) if cipher.verify_key_check(&check) => return Ok(cipher),
                    Ok(None) => {
                        // Pre-verification store: adopt the key and stamp it.
                        meta::set_blob(pool, meta::KEY_KEY_CHECK, &cipher.key_check()?)?;
                        return Ok(cipher);
                    }
                    Ok(Some(_)) => warn!("Index key failed verification; rebuilding index"),
                    Err(e) => warn!("Key check unreadable ({}); rebuilding index", e),
                }
            }
            None => warn!("Index key failed to unwrap; rebuilding index"),
        }

        // The key is gone and so is everything encrypted with it.
        records::wipe(pool)?;
        let conn = pool.get()?;
        schema::drop_legacy_table(&conn)?;
    }

    let key = IndexKey::generate();
    let cipher = IndexCipher::new(&key);
    let wrapped = wrapper.wrap_key(key.as_bytes())?;
    meta::set_wrapped_key(pool, &wrapped)?;
    meta::set_blob(pool, meta::KEY_KEY_CHECK, &cipher.key_check()?)?;
    {
        let conn = pool.get()?;
        if meta::get(&conn, meta::KEY_SCHEMA_VERSION)?.is_none() {
            meta::set(
                &conn,
                meta::KEY_SCHEMA_VERSION,
                &schema::SCHEMA_VERSION.to_string(),
            )?;
        }
    }
    info!("Generated fresh index key");
    Ok(cipher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_memory_pool;
    use crate::search::SortOrder;
    use crate::testutil::{test_item, BrokenKeyWrapper, FakeRemote, TestKeyWrapper};

    fn small_config() -> EngineConfig {
        EngineConfig {
            builder: BuilderConfig {
                page_size: 2,
                fan_out: 2,
                max_retries: 1,
                retry_base_ms: 1,
            },
            sync: SyncConfig {
                max_retries: 1,
                retry_base_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn mailbox() -> FakeRemote {
        FakeRemote::new(vec![
            test_item("m1", 100, "alpha report"),
            test_item("m2", 200, "beta notes"),
            test_item("m3", 300, "gamma summary"),
        ])
    }

    #[tokio::test]
    async fn test_open_build_search_round_trip() {
        let pool = create_memory_pool().unwrap();
        let mut engine =
            SearchIndex::open_with_pool(pool, &TestKeyWrapper, small_config()).unwrap();
        let remote = mailbox();

        assert!(engine.tick(&remote).await.unwrap());
        assert_eq!(engine.record_count().unwrap(), 3);
        assert!(!engine.is_limited().unwrap());
        assert!(engine.estimated_disk_bytes().unwrap() > 0);

        let hits = engine
            .search(&SearchQuery {
                keywords: Some("alpha".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.records.len(), 1);
        assert_eq!(hits.records[0].id, "m1");

        // Body text is searchable too.
        let hits = engine
            .search(&SearchQuery {
                keywords: Some("body of m2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.records.len(), 1);
        assert_eq!(hits.records[0].id, "m2");
    }

    #[tokio::test]
    async fn test_sort_only_change_reuses_results() {
        let pool = create_memory_pool().unwrap();
        let mut engine =
            SearchIndex::open_with_pool(pool, &TestKeyWrapper, small_config()).unwrap();
        let remote = mailbox();
        engine.tick(&remote).await.unwrap();

        let newest_first = engine.search(&SearchQuery::default()).unwrap();
        let ids_desc: Vec<String> = newest_first.records.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids_desc, vec!["m3", "m2", "m1"]);

        let oldest_first = engine
            .search(&SearchQuery {
                sort: SortOrder::TimeAsc,
                ..Default::default()
            })
            .unwrap();
        let ids_asc: Vec<String> = oldest_first.records.iter().map(|r| r.id.clone()).collect();
        let mut expected = ids_desc.clone();
        expected.reverse();
        assert_eq!(ids_asc, expected);
    }

    #[tokio::test]
    async fn test_reopen_decrypts_with_persisted_key() {
        let pool = create_memory_pool().unwrap();
        {
            let mut engine =
                SearchIndex::open_with_pool(pool.clone(), &TestKeyWrapper, small_config())
                    .unwrap();
            engine.tick(&mailbox()).await.unwrap();
            assert_eq!(engine.record_count().unwrap(), 3);
        }

        // A new session unwraps the same key and can read everything.
        let mut engine =
            SearchIndex::open_with_pool(pool, &TestKeyWrapper, small_config()).unwrap();
        assert_eq!(engine.record_count().unwrap(), 3);
        let hits = engine
            .search(&SearchQuery {
                keywords: Some("gamma".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.records.len(), 1);
        assert!(!hits.records[0].decryption_failed);
    }

    #[tokio::test]
    async fn test_unusable_key_wipes_for_rebuild() {
        let pool = create_memory_pool().unwrap();
        {
            let mut engine =
                SearchIndex::open_with_pool(pool.clone(), &TestKeyWrapper, small_config())
                    .unwrap();
            engine.tick(&mailbox()).await.unwrap();
        }

        // The "private key" is gone: the index cannot be read and is
        // rebuilt from scratch rather than crashing.
        let mut engine =
            SearchIndex::open_with_pool(pool.clone(), &BrokenKeyWrapper, small_config()).unwrap();
        assert_eq!(engine.record_count().unwrap(), 0);
        assert!(engine.progress().unwrap().is_none());

        let remote = mailbox();
        assert!(engine.tick(&remote).await.unwrap());
        assert_eq!(engine.record_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cache_and_disk_agree_when_not_limited() {
        let pool = create_memory_pool().unwrap();
        let mut engine =
            SearchIndex::open_with_pool(pool, &TestKeyWrapper, small_config()).unwrap();
        engine.tick(&mailbox()).await.unwrap();

        let disk = engine.record_count().unwrap();
        let cached = engine.session().with_cache(|cache| cache.len() as u64);
        assert!(!engine.is_limited().unwrap());
        assert_eq!(disk, cached);
    }

    #[tokio::test]
    async fn test_event_notification_flows_through_tick() {
        let pool = create_memory_pool().unwrap();
        let mut engine =
            SearchIndex::open_with_pool(pool, &TestKeyWrapper, small_config()).unwrap();
        let remote = mailbox();
        engine.tick(&remote).await.unwrap();

        remote.add_item(test_item("m4", 400, "delta"));
        remote.push_events(crate::types::events::EventBatch {
            events: vec![crate::types::events::RemoteEvent {
                id: "m4".into(),
                change: crate::types::events::ItemChange::Created,
                item: Some(test_item("m4", 400, "delta")),
                is_draft: false,
            }],
            new_cursor: Some("c1".into()),
            has_more: false,
            refresh: false,
        });
        engine.notifier().notify(crate::types::events::SyncSignal::EventsAvailable);

        assert!(engine.tick(&remote).await.unwrap());
        let hits = engine
            .search(&SearchQuery {
                keywords: Some("delta".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.records.len(), 1);
    }

    #[tokio::test]
    async fn test_wipe_resets_everything() {
        let pool = create_memory_pool().unwrap();
        let mut engine =
            SearchIndex::open_with_pool(pool, &TestKeyWrapper, small_config()).unwrap();
        let remote = mailbox();
        engine.tick(&remote).await.unwrap();
        assert_eq!(engine.record_count().unwrap(), 3);

        engine.wipe(&TestKeyWrapper).unwrap();
        assert_eq!(engine.record_count().unwrap(), 0);
        assert_eq!(engine.session().with_cache(|cache| cache.len()), 0);

        // Rebuild works under the fresh key.
        assert!(engine.tick(&remote).await.unwrap());
        assert_eq!(engine.record_count().unwrap(), 3);
    }
}
