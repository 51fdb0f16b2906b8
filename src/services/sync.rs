//! Incremental synchronization against the remote event log.
//!
//! The engine drains `poll_events` from the last stored cursor, applying
//! creates, updates, and deletes to the on-disk index and the in-memory
//! cache. A refresh flag on a batch forces a full integrity check instead
//! of incremental application. Drift is repaired insert-missing-only:
//! locally present records are never overwritten.

use std::collections::HashSet;

use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::adapters::sqlite::{meta, records};
use crate::error::IndexError;
use crate::remote::{with_retries, MailboxRemote, RemoteItem};
use crate::services::helpers::record_builder;
use crate::state::{Session, Stage};
use crate::types::events::{
    EventBatch, ItemChange, RemoteEvent, SyncNotifier, SyncOutcome, SyncSignal,
};
use crate::types::RecoveryPoint;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Consecutive non-delete events after which the recently-deleted set
    /// is cleared.
    pub deletion_quiet_threshold: u32,
    /// Page size for the insert-missing-only repair walk.
    pub recover_page_size: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            deletion_quiet_threshold: 2,
            recover_page_size: 100,
            max_retries: 3,
            retry_base_ms: 500,
        }
    }
}

/// Ids deleted recently enough that a racing create must not resurrect
/// them. The set empties after a configured streak of non-delete events.
#[derive(Debug)]
pub struct RecentlyDeleted {
    ids: HashSet<String>,
    quiet_streak: u32,
    threshold: u32,
}

impl RecentlyDeleted {
    pub fn new(threshold: u32) -> Self {
        Self {
            ids: HashSet::new(),
            quiet_streak: 0,
            threshold,
        }
    }

    pub fn mark_deleted(&mut self, id: &str) {
        self.ids.insert(id.to_string());
        self.quiet_streak = 0;
    }

    /// Record one non-delete event; clears the set once the quiet streak
    /// reaches the threshold.
    pub fn note_quiet_event(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        self.quiet_streak += 1;
        if self.quiet_streak >= self.threshold {
            debug!(
                "Clearing {} recently-deleted ids after {} quiet events",
                self.ids.len(),
                self.quiet_streak
            );
            self.ids.clear();
            self.quiet_streak = 0;
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Consumes the remote event log and keeps index and cache current.
pub struct SyncEngine {
    rx: Receiver<SyncSignal>,
    tx: Sender<SyncSignal>,
    recently_deleted: RecentlyDeleted,
}

impl SyncEngine {
    pub fn new(cfg: &SyncConfig) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            rx,
            tx,
            recently_deleted: RecentlyDeleted::new(cfg.deletion_quiet_threshold),
        }
    }

    /// Handle hosts use to wake the engine.
    pub fn notifier(&self) -> SyncNotifier {
        SyncNotifier::new(self.tx.clone())
    }

    /// Drain queued wake signals and run at most one sync pass. Returns
    /// `None` when no signal was pending.
    pub async fn run_pending(
        &mut self,
        session: &Session,
        remote: &dyn MailboxRemote,
    ) -> Result<Option<SyncOutcome>, IndexError> {
        let mut wake = false;
        let mut force_integrity = false;
        while let Ok(signal) = self.rx.try_recv() {
            match signal {
                SyncSignal::EventsAvailable => wake = true,
                SyncSignal::CheckIntegrity => {
                    wake = true;
                    force_integrity = true;
                }
                SyncSignal::Shutdown => return Ok(None),
            }
        }
        if !wake {
            return Ok(None);
        }

        let outcome = self.sync_once(session, remote, force_integrity).await?;
        Ok(Some(outcome))
    }

    /// One full catch-up pass: poll events until the log is drained.
    pub async fn sync_once(
        &mut self,
        session: &Session,
        remote: &dyn MailboxRemote,
        force_integrity: bool,
    ) -> Result<SyncOutcome, IndexError> {
        let _token = session.try_begin(Stage::Syncing)?;
        let pool = &session.pool;
        let cfg = &session.sync;
        let mut outcome = SyncOutcome::default();

        let mut cursor = meta::get_string(pool, meta::KEY_EVENT_CURSOR)?;

        loop {
            let batch: EventBatch =
                with_retries("poll_events", cfg.max_retries, cfg.retry_base_ms, || {
                    remote.poll_events(cursor.as_deref())
                })
                .await?;

            if batch.refresh {
                // The remote asked for a full corruption check instead of
                // incremental application.
                self.check_and_repair(session, remote, &mut outcome).await?;
            } else {
                for event in &batch.events {
                    self.apply_event(session, remote, event, &mut outcome).await?;
                }
            }

            if let Some(new_cursor) = batch.new_cursor {
                meta::set_string(pool, meta::KEY_EVENT_CURSOR, &new_cursor)?;
                cursor = Some(new_cursor);
            }

            if !batch.has_more {
                break;
            }
        }

        if force_integrity && !outcome.integrity_checked {
            self.check_and_repair(session, remote, &mut outcome).await?;
        }

        if outcome.did_work() {
            info!(
                "Sync applied {} creates, {} updates, {} deletes, {} repairs",
                outcome.created, outcome.updated, outcome.deleted, outcome.repaired
            );
        }
        Ok(outcome)
    }

    async fn apply_event(
        &mut self,
        session: &Session,
        remote: &dyn MailboxRemote,
        event: &RemoteEvent,
        outcome: &mut SyncOutcome,
    ) -> Result<(), IndexError> {
        let pool = &session.pool;

        match event.change {
            ItemChange::Deleted => {
                let existed = records::delete(pool, &event.id)?;
                session.with_cache(|cache| {
                    cache.remove(&event.id);
                });
                self.recently_deleted.mark_deleted(&event.id);
                if existed {
                    outcome.deleted += 1;
                }
            }
            ItemChange::Created => {
                self.recently_deleted.note_quiet_event();
                if self.recently_deleted.contains(&event.id) {
                    debug!("Skipping create for recently-deleted {}", event.id);
                    return Ok(());
                }
                if records::exists(pool, &event.id)? {
                    return Ok(());
                }
                let Some(item) = event.item.as_ref() else {
                    warn!("Create event for {} carried no item, skipping", event.id);
                    return Ok(());
                };
                self.insert_item(session, remote, item).await?;
                outcome.created += 1;
            }
            ItemChange::Updated => {
                self.recently_deleted.note_quiet_event();
                let Some(item) = event.item.as_ref() else {
                    warn!("Update event for {} carried no item, skipping", event.id);
                    return Ok(());
                };

                if !records::exists(pool, &event.id)? {
                    // Never saw the create; treat as one.
                    self.insert_item(session, remote, item).await?;
                    outcome.created += 1;
                    return Ok(());
                }

                if event.is_draft {
                    // Draft content changes under a stable id: metadata
                    // patching would miss the body, so re-fetch everything.
                    self.insert_item(session, remote, item).await?;
                } else {
                    self.patch_metadata(session, item)?;
                }
                outcome.updated += 1;
            }
        }
        Ok(())
    }

    /// Fetch content, seal, and write one item; mirrors into the cache.
    async fn insert_item(
        &self,
        session: &Session,
        remote: &dyn MailboxRemote,
        item: &RemoteItem,
    ) -> Result<(), IndexError> {
        let cfg = &session.sync;
        let content = with_retries("fetch_content", cfg.max_retries, cfg.retry_base_ms, || {
            remote.fetch_content(&item.id)
        })
        .await?;

        let record = record_builder::build_record(item, &content, &session.text);
        let stored = session.cipher.seal_record(&record)?;
        let byte_size = stored.byte_size;
        records::put(&session.pool, &session.store, &stored)?;

        session.with_cache(|cache| {
            if cache.contains(&record.id) {
                cache.replace(&record.id, record.clone(), byte_size);
            } else {
                cache.insert(record.clone(), byte_size);
            }
        });
        Ok(())
    }

    /// Re-encrypt only the metadata half; the content ciphertext stays.
    fn patch_metadata(&self, session: &Session, item: &RemoteItem) -> Result<(), IndexError> {
        let pool = &session.pool;

        let (meta_half, _) = record_builder::build_metadata_record(item).split();
        let sealed_meta = session.cipher.seal_metadata(&meta_half)?;
        records::update_metadata(pool, &item.id, item.timepoint, &item.labels, &sealed_meta)?;

        // Rebuild the cached entry with the preserved body.
        if let Some(stored) = records::get(pool, &item.id)? {
            let record = session.cipher.open_record(&stored);
            session.with_cache(|cache| {
                cache.replace(&record.id, record.clone(), stored.byte_size);
            });
        }
        Ok(())
    }

    async fn check_and_repair(
        &mut self,
        session: &Session,
        remote: &dyn MailboxRemote,
        outcome: &mut SyncOutcome,
    ) -> Result<(), IndexError> {
        outcome.integrity_checked = true;
        if self.verify_integrity(session, remote).await? {
            return Ok(());
        }
        warn!("Index drift detected; running insert-missing-only repair");
        outcome.repaired += self.recover_index(session, remote).await?;
        Ok(())
    }

    /// Compare local state against the authoritative remote count.
    /// Returns true when the index is consistent.
    pub async fn verify_integrity(
        &self,
        session: &Session,
        remote: &dyn MailboxRemote,
    ) -> Result<bool, IndexError> {
        let cfg = &session.sync;
        let local = records::count(&session.pool)?;
        let remote_total = with_retries(
            "total_item_count",
            cfg.max_retries,
            cfg.retry_base_ms,
            || remote.total_item_count(),
        )
        .await?;

        let limited = meta::get_bool(&session.pool, meta::KEY_INDEX_LIMITED)?;
        let consistent = if limited {
            // A limited index deliberately misses old items; it must never
            // hold more than the remote does.
            local <= remote_total
        } else {
            local == remote_total
        };

        if !consistent {
            warn!(
                "Integrity check failed: {} local vs {} remote (limited: {})",
                local, remote_total, limited
            );
        }
        Ok(consistent)
    }

    /// Re-walk remote metadata and insert whatever is missing locally.
    /// Present ids are never overwritten, so running this twice in a row
    /// with no remote changes is a no-op the second time.
    pub async fn recover_index(
        &mut self,
        session: &Session,
        remote: &dyn MailboxRemote,
    ) -> Result<u64, IndexError> {
        let pool = &session.pool;
        let cfg = &session.sync;
        let mut inserted = 0u64;
        let mut before: Option<RecoveryPoint> = None;

        loop {
            if session.cancel.is_cancelled() {
                break;
            }

            let page = with_retries("fetch_page", cfg.max_retries, cfg.retry_base_ms, || {
                remote.fetch_page(before.as_ref(), cfg.recover_page_size)
            })
            .await?;

            if page.items.is_empty() {
                break;
            }

            for item in &page.items {
                if records::exists(pool, &item.id)? {
                    continue;
                }
                if self.recently_deleted.contains(&item.id) {
                    continue;
                }
                self.insert_item(session, remote, item).await?;
                inserted += 1;
            }

            let last = page.items.last().expect("non-empty page");
            before = Some(RecoveryPoint {
                id: last.id.clone(),
                timepoint: last.timepoint,
            });

            if !page.has_more {
                break;
            }
        }

        if inserted > 0 {
            info!("Repair inserted {} missing records", inserted);
        }
        Ok(inserted)
    }
}
