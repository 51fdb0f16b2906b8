//! Initial bulk indexing.
//!
//! The builder walks the remote mailbox newest-first, one metadata page at
//! a time, fetching content with bounded fan-out, sealing records with the
//! index key, and committing each batch transactionally. The recovery
//! point is persisted before the next page is requested, so a crash loses
//! at most one in-flight batch. A quota hit concludes the build early as
//! success, leaving an intentionally limited index of the newest slice.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::adapters::sqlite::{progress, records};
use crate::error::IndexError;
use crate::remote::{with_retries, MailboxRemote, RemoteContent};
use crate::services::helpers::record_builder;
use crate::state::{Session, Stage};
use crate::types::{
    BuildProgress, BuildStatus, IndexRecord, RecoveryPoint, StoredCiphertext, Timepoint,
};

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Items per metadata page.
    pub page_size: usize,
    /// Concurrent content fetch/decrypt operations within a batch.
    pub fan_out: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            fan_out: 8,
            max_retries: 3,
            retry_base_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Fetch content for every item (the normal build).
    Full,
    /// Index metadata only; content is backfilled later. Used when a
    /// migration has to finish an interrupted build quickly.
    MetadataOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Terminal success: the whole mailbox is indexed.
    Active,
    /// Concluded early under quota pressure; the index is limited.
    Limited,
    /// Stopped on a pause flag or a persistent remote failure; resumable
    /// from the persisted recovery point.
    Paused,
    /// Stopped on the cancellation token; the in-flight batch committed
    /// and the recovery point is persisted.
    Cancelled,
    AlreadyComplete,
}

pub async fn run_build(
    session: &Session,
    remote: &dyn MailboxRemote,
    mode: BuildMode,
) -> Result<BuildOutcome, IndexError> {
    let _token = session.try_begin(Stage::Building)?;
    run_build_inner(session, remote, mode).await
}

pub(crate) async fn run_build_inner(
    session: &Session,
    remote: &dyn MailboxRemote,
    mode: BuildMode,
) -> Result<BuildOutcome, IndexError> {
    let pool = &session.pool;
    let cfg = &session.builder;

    let mut progress = match progress::load(pool)? {
        Some(p) => match p.status {
            BuildStatus::Active => return Ok(BuildOutcome::AlreadyComplete),
            BuildStatus::Failed => {
                return Err(IndexError::Corrupt(
                    "Previous build failed; full rebuild required".into(),
                ))
            }
            _ => {
                let mut p = p;
                p.status = BuildStatus::Indexing;
                p
            }
        },
        None => {
            let total = match with_retries(
                "total_item_count",
                cfg.max_retries,
                cfg.retry_base_ms,
                || remote.total_item_count(),
            )
            .await
            {
                Ok(total) => total,
                Err(IndexError::Remote(e)) => {
                    warn!("Cannot reach remote to start build: {}", e);
                    let mut p = BuildProgress::new(0);
                    p.status = BuildStatus::Paused;
                    p.num_pauses = 1;
                    progress::save(pool, &p)?;
                    return Ok(BuildOutcome::Paused);
                }
                Err(e) => return Err(e),
            };
            let mut p = BuildProgress::new(total);
            p.timestamps.push(Utc::now().timestamp_millis());
            p
        }
    };
    progress::save(pool, &progress)?;

    info!(
        "Index build running from {} of {} items",
        progress.current_count, progress.total_count
    );

    loop {
        if session.cancel.is_cancelled() {
            progress::save(pool, &progress)?;
            info!("Build cancelled after {} items", progress.current_count);
            return Ok(BuildOutcome::Cancelled);
        }
        if session.is_paused() {
            progress.status = BuildStatus::Paused;
            progress.num_pauses += 1;
            progress::save(pool, &progress)?;
            info!("Build paused after {} items", progress.current_count);
            return Ok(BuildOutcome::Paused);
        }

        let page = match with_retries("fetch_page", cfg.max_retries, cfg.retry_base_ms, || {
            remote.fetch_page(progress.recovery_point.as_ref(), cfg.page_size)
        })
        .await
        {
            Ok(page) => page,
            Err(IndexError::Remote(e)) => {
                warn!("Page fetch failed persistently, pausing build: {}", e);
                progress.status = BuildStatus::Paused;
                progress.num_pauses += 1;
                progress::save(pool, &progress)?;
                return Ok(BuildOutcome::Paused);
            }
            Err(e) => return Err(e),
        };

        if page.items.is_empty() {
            progress.status = BuildStatus::Active;
            progress::save(pool, &progress)?;
            info!("Index build complete: {} items", progress.current_count);
            return Ok(BuildOutcome::Active);
        }

        let built: Result<Vec<IndexRecord>, IndexError> = match mode {
            BuildMode::MetadataOnly => Ok(page
                .items
                .iter()
                .map(record_builder::build_metadata_record)
                .collect()),
            BuildMode::Full => {
                stream::iter(page.items.iter())
                    .map(|item| async move {
                        let content = with_retries(
                            "fetch_content",
                            cfg.max_retries,
                            cfg.retry_base_ms,
                            || remote.fetch_content(&item.id),
                        )
                        .await?;
                        Ok::<IndexRecord, IndexError>(record_builder::build_record(
                            item,
                            &content,
                            &session.text,
                        ))
                    })
                    .buffered(cfg.fan_out.max(1))
                    .collect::<Vec<_>>()
                    .await
                    .into_iter()
                    .collect()
            }
        };

        let batch = match built {
            Ok(batch) => batch,
            Err(IndexError::Remote(e)) => {
                warn!("Content fetch failed persistently, pausing build: {}", e);
                progress.status = BuildStatus::Paused;
                progress.num_pauses += 1;
                progress::save(pool, &progress)?;
                return Ok(BuildOutcome::Paused);
            }
            Err(e) => return Err(e),
        };

        let mut sealed: Vec<StoredCiphertext> = Vec::with_capacity(batch.len());
        for record in &batch {
            let stored = match mode {
                BuildMode::Full => session.cipher.seal_record(record)?,
                BuildMode::MetadataOnly => {
                    let (meta_half, _) = record.split();
                    let meta_blob = session.cipher.seal_metadata(&meta_half)?;
                    let byte_size = StoredCiphertext::approximate_size(&meta_blob, None);
                    StoredCiphertext {
                        id: record.id.clone(),
                        timepoint: record.timepoint,
                        labels: record.labels.clone(),
                        meta: meta_blob,
                        content: None,
                        byte_size,
                    }
                }
            };
            sealed.push(stored);
        }

        let outcome = records::put_batch(pool, &session.store, &sealed)?;

        if mode == BuildMode::Full {
            session.with_cache(|cache| {
                for (record, stored) in batch.iter().zip(&sealed) {
                    cache.insert(record.clone(), stored.byte_size);
                }
            });
        }

        let oldest = page.items.last().expect("non-empty page");
        progress.current_count += page.items.len() as u64;
        progress.recovery_point = Some(RecoveryPoint {
            id: oldest.id.clone(),
            timepoint: oldest.timepoint,
        });
        progress.timestamps.push(Utc::now().timestamp_millis());
        update_estimate(&mut progress);

        if outcome.quota_hit() {
            progress.status = BuildStatus::Active;
            progress::save(pool, &progress)?;
            info!(
                "Build concluded early under quota pressure after {} items; index is limited",
                progress.current_count
            );
            return Ok(BuildOutcome::Limited);
        }

        // Persist the recovery point before the next page is requested.
        progress::save(pool, &progress)?;
        debug!(
            "Batch committed: {}/{} items indexed",
            progress.current_count, progress.total_count
        );

        if !page.has_more {
            progress.status = BuildStatus::Active;
            progress::save(pool, &progress)?;
            info!("Index build complete: {} items", progress.current_count);
            return Ok(BuildOutcome::Active);
        }
    }
}

/// Fill in the content half for records indexed metadata-only.
///
/// Resumability comes from the rows themselves: a record with no content
/// ciphertext has not been backfilled, so an interrupted pass picks up at
/// the exact prior cut-off.
pub async fn run_content_backfill(
    session: &Session,
    remote: &dyn MailboxRemote,
) -> Result<BuildOutcome, IndexError> {
    let _token = session.try_begin(Stage::Building)?;
    run_content_backfill_inner(session, remote).await
}

pub(crate) async fn run_content_backfill_inner(
    session: &Session,
    remote: &dyn MailboxRemote,
) -> Result<BuildOutcome, IndexError> {
    let pool = &session.pool;
    let cfg = &session.builder;
    let mut cursor: Option<Timepoint> = None;
    let mut filled = 0u64;

    loop {
        if session.cancel.is_cancelled() {
            info!("Content backfill cancelled after {} records", filled);
            return Ok(BuildOutcome::Cancelled);
        }

        let page = records::page_missing_content(pool, cursor, cfg.page_size)?;
        if page.is_empty() {
            info!("Content backfill complete: {} records filled", filled);
            return Ok(BuildOutcome::Active);
        }
        cursor = page.last().map(|r| r.timepoint);

        let fetched: Vec<Result<(StoredCiphertext, RemoteContent), IndexError>> =
            stream::iter(page.into_iter())
                .map(|stored| async move {
                    let content = with_retries(
                        "fetch_content",
                        cfg.max_retries,
                        cfg.retry_base_ms,
                        || remote.fetch_content(&stored.id),
                    )
                    .await?;
                    Ok((stored, content))
                })
                .buffered(cfg.fan_out.max(1))
                .collect()
                .await;

        for result in fetched {
            let (stored, content) = match result {
                Ok(pair) => pair,
                Err(IndexError::Remote(e)) => {
                    warn!("Backfill fetch failed persistently, pausing: {}", e);
                    return Ok(BuildOutcome::Paused);
                }
                Err(e) => return Err(e),
            };

            let meta_half = session
                .cipher
                .open(&stored.meta)
                .and_then(|json| serde_json::from_slice::<crate::types::MetadataHalf>(&json).ok());
            let Some(meta_half) = meta_half else {
                warn!("Skipping backfill for {}: metadata half unreadable", stored.id);
                continue;
            };

            let content_half = record_builder::build_content_half(
                meta_half.subject.as_deref(),
                false,
                &content,
                &session.text,
            );
            let sealed_content = session.cipher.seal_content(&content_half)?;
            records::update_content(pool, &stored.id, &sealed_content)?;
            filled += 1;

            let record = IndexRecord::assemble(meta_half, Some(content_half));
            let byte_size =
                StoredCiphertext::approximate_size(&stored.meta, Some(&sealed_content));
            session.with_cache(|cache| {
                if cache.contains(&record.id) {
                    cache.replace(&record.id, record.clone(), byte_size);
                }
            });
        }
    }
}

fn update_estimate(progress: &mut BuildProgress) {
    if progress.original_estimate_secs.is_some()
        || progress.current_count == 0
        || progress.total_count == 0
    {
        return;
    }
    if let (Some(first), Some(last)) = (progress.timestamps.first(), progress.timestamps.last()) {
        let elapsed_ms = (last - first).max(0) as u64;
        let per_item_ms = elapsed_ms / progress.current_count;
        progress.original_estimate_secs = Some(per_item_ms * progress.total_count / 1000);
    }
}
