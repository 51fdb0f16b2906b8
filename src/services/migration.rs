//! One-shot schema migration: combined ciphertext (v1) to split
//! metadata/content ciphertexts (v2).
//!
//! The split step records a string-typed recovery point after every batch,
//! so an interrupted migration resumes exactly where it stopped. Legacy
//! state (the v1 table and the unset schema version) survives until the
//! whole migration succeeds; any failure leaves it intact and the
//! migration retries on next load.

use rusqlite::params;
use tracing::{info, warn};

use crate::adapters::sqlite::{meta, progress, records, schema, DbPool};
use crate::crypto::IndexCipher;
use crate::error::IndexError;
use crate::remote::MailboxRemote;
use crate::services::indexer::{self, BuildMode, BuildOutcome};
use crate::state::{Session, Stage};
use crate::types::{IndexRecord, SealedBlob, StoredCiphertext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub migrated: u64,
    /// Records whose combined ciphertext no longer decrypts; they are
    /// dropped and restored later by the drift repair.
    pub dropped: u64,
    /// True only when every step finished and legacy state was cleared.
    pub completed: bool,
    pub resumed_build: bool,
}

/// True when a legacy store still needs the v1 -> v2 upgrade.
pub fn needs_migration(pool: &DbPool) -> Result<bool, IndexError> {
    let conn = pool.get()?;
    let version = meta::get(&conn, meta::KEY_SCHEMA_VERSION)?.and_then(|v| v.parse::<i64>().ok());
    if version == Some(schema::SCHEMA_VERSION) {
        return Ok(false);
    }
    schema::has_legacy_table(&conn)
}

pub async fn run_migration(
    session: &Session,
    remote: &dyn MailboxRemote,
) -> Result<MigrationOutcome, IndexError> {
    let _token = session.try_begin(Stage::Migrating)?;
    run_migration_inner(session, remote).await
}

async fn run_migration_inner(
    session: &Session,
    remote: &dyn MailboxRemote,
) -> Result<MigrationOutcome, IndexError> {
    let pool = &session.pool;
    let mut outcome = MigrationOutcome::default();
    let batch_size = session.builder.page_size.max(1);

    info!("Schema migration v1 -> v2 running");

    // Move-and-split, one batch at a time. The cursor is the last legacy
    // id handled; re-running skips everything before it.
    loop {
        if session.cancel.is_cancelled() {
            info!(
                "Migration cancelled after {} records; legacy state kept for retry",
                outcome.migrated
            );
            return Ok(outcome);
        }

        let cursor = meta::get_string(pool, meta::KEY_MIGRATION_CURSOR)?;
        let rows = load_legacy_batch(pool, cursor.as_deref(), batch_size)?;
        if rows.is_empty() {
            break;
        }

        let last_id = rows.last().expect("non-empty batch").id.clone();
        let mut split: Vec<StoredCiphertext> = Vec::with_capacity(rows.len());
        for row in &rows {
            match open_combined(&session.cipher, row) {
                Some(record) => split.push(session.cipher.seal_record(&record)?),
                None => {
                    warn!(
                        "Legacy record {} no longer decrypts; dropping (repair will refetch)",
                        row.id
                    );
                    outcome.dropped += 1;
                }
            }
        }

        records::put_batch(pool, &session.store, &split)?;
        outcome.migrated += split.len() as u64;
        meta::set_string(pool, meta::KEY_MIGRATION_CURSOR, &last_id)?;
    }

    // If indexing was in progress pre-migration, finish metadata-only
    // indexing to termination, then resume content indexing at the exact
    // prior cut-off (rows without a content half).
    if let Some(p) = progress::load(pool)? {
        if p.status.is_resumable() {
            let meta_pass = indexer::run_build_inner(session, remote, BuildMode::MetadataOnly).await?;
            if !matches!(
                meta_pass,
                BuildOutcome::Active | BuildOutcome::Limited | BuildOutcome::AlreadyComplete
            ) {
                info!("Migration deferred: metadata pass ended as {:?}", meta_pass);
                return Ok(outcome);
            }

            let backfill = indexer::run_content_backfill_inner(session, remote).await?;
            if !matches!(backfill, BuildOutcome::Active) {
                info!("Migration deferred: content backfill ended as {:?}", backfill);
                return Ok(outcome);
            }
            outcome.resumed_build = true;
        }
    }

    // Full success: only now clear the legacy flags.
    {
        let conn = pool.get()?;
        meta::set(&conn, meta::KEY_SCHEMA_VERSION, &schema::SCHEMA_VERSION.to_string())?;
        meta::remove(&conn, meta::KEY_MIGRATION_CURSOR)?;
        schema::drop_legacy_table(&conn)?;
    }
    outcome.completed = true;
    info!(
        "Migration complete: {} records split, {} dropped",
        outcome.migrated, outcome.dropped
    );
    Ok(outcome)
}

struct LegacyRow {
    id: String,
    iv: Vec<u8>,
    ct: Vec<u8>,
}

fn load_legacy_batch(
    pool: &DbPool,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<LegacyRow>, IndexError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, iv, ct FROM records_v1
         WHERE id > ?1
         ORDER BY id
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![after.unwrap_or(""), limit as i64], |row| {
        Ok(LegacyRow {
            id: row.get(0)?,
            iv: row.get(1)?,
            ct: row.get(2)?,
        })
    })?;

    let mut batch = Vec::new();
    for row in rows {
        batch.push(row?);
    }
    Ok(batch)
}

fn open_combined(cipher: &IndexCipher, row: &LegacyRow) -> Option<IndexRecord> {
    let iv: [u8; 12] = row.iv.as_slice().try_into().ok()?;
    let blob = SealedBlob {
        iv,
        ciphertext: row.ct.clone(),
    };
    let json = cipher.open(&blob)?;
    serde_json::from_slice(&json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_memory_pool;
    use crate::testutil::{make_session_with_pool, test_item, FakeRemote};
    use crate::types::{
        Address, BuildProgress, BuildStatus, RecoveryPoint, SearchableMetadata, Timepoint,
    };
    use std::collections::BTreeSet;

    /// Stage one record in the legacy combined format, as a v1 client
    /// would have written it.
    fn write_legacy_record(
        pool: &DbPool,
        cipher: &IndexCipher,
        record: &IndexRecord,
    ) -> Result<(), IndexError> {
        let json = serde_json::to_vec(record)?;
        let blob = cipher.seal(&json)?;
        write_legacy_row(pool, &record.id, record.timepoint, &blob)
    }

    fn write_legacy_row(
        pool: &DbPool,
        id: &str,
        timepoint: Timepoint,
        blob: &SealedBlob,
    ) -> Result<(), IndexError> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO records_v1 (id, time, ord, labels, iv, ct, byte_size)
             VALUES (?1, ?2, ?3, '[]', ?4, ?5, ?6)",
            params![
                id,
                timepoint.time,
                timepoint.order as i64,
                blob.iv.to_vec(),
                blob.ciphertext,
                (blob.ciphertext.len() + 12) as i64,
            ],
        )?;
        Ok(())
    }

    fn legacy_record(id: &str, time: i64, body: &str) -> IndexRecord {
        IndexRecord {
            id: id.to_string(),
            timepoint: Timepoint::new(time, 0),
            labels: ["inbox".to_string()].into_iter().collect::<BTreeSet<_>>(),
            metadata: SearchableMetadata {
                sender: Address::new("Ada", "ada@example.com"),
                ..Default::default()
            },
            subject: Some(format!("subject {}", id)),
            body: Some(body.to_string()),
            decryption_failed: false,
        }
    }

    fn legacy_session() -> crate::state::Session {
        let pool = create_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        schema::initialize_schema(&conn).unwrap();
        schema::initialize_legacy_schema(&conn).unwrap();
        drop(conn);
        make_session_with_pool(pool, None, 1024 * 1024)
    }

    #[tokio::test]
    async fn test_migration_splits_combined_records() {
        let session = legacy_session();
        for i in 1..=3 {
            let record = legacy_record(&format!("m{}", i), i * 100, &format!("body {}", i));
            write_legacy_record(&session.pool, &session.cipher, &record).unwrap();
        }
        let remote = FakeRemote::new(vec![]);

        let outcome = run_migration(&session, &remote).await.unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.migrated, 3);
        assert_eq!(outcome.dropped, 0);

        assert_eq!(records::count(&session.pool).unwrap(), 3);
        let stored = records::get(&session.pool, "m2").unwrap().unwrap();
        assert!(stored.content.is_some());
        let record = session.cipher.open_record(&stored);
        assert_eq!(record.subject.as_deref(), Some("subject m2"));
        assert_eq!(record.body.as_deref(), Some("body 2"));

        let conn = session.pool.get().unwrap();
        assert!(!schema::has_legacy_table(&conn).unwrap());
        assert_eq!(
            meta::get(&conn, meta::KEY_SCHEMA_VERSION).unwrap().as_deref(),
            Some("2")
        );
        assert!(meta::get(&conn, meta::KEY_MIGRATION_CURSOR).unwrap().is_none());
        drop(conn);
        assert!(!needs_migration(&session.pool).unwrap());
    }

    #[tokio::test]
    async fn test_migration_resumes_from_string_cursor() {
        let session = legacy_session();
        for i in 1..=3 {
            let record = legacy_record(&format!("m{}", i), i * 100, "b");
            write_legacy_record(&session.pool, &session.cipher, &record).unwrap();
        }

        // Simulate a prior interrupted run that already split m1.
        let split = session
            .cipher
            .seal_record(&legacy_record("m1", 100, "b"))
            .unwrap();
        records::put(&session.pool, &session.store, &split).unwrap();
        meta::set_string(&session.pool, meta::KEY_MIGRATION_CURSOR, "m1").unwrap();

        let remote = FakeRemote::new(vec![]);
        let outcome = run_migration(&session, &remote).await.unwrap();

        assert!(outcome.completed);
        // Only the two records past the cursor were processed again.
        assert_eq!(outcome.migrated, 2);
        assert_eq!(records::count(&session.pool).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_migration_finishes_interrupted_build() {
        let session = legacy_session();
        // Pre-migration state: m4 and m3 indexed, build paused at m3.
        for (id, time) in [("m4", 400), ("m3", 300)] {
            let record = legacy_record(id, time, "b");
            write_legacy_record(&session.pool, &session.cipher, &record).unwrap();
        }
        let mut p = BuildProgress::new(4);
        p.current_count = 2;
        p.status = BuildStatus::Paused;
        p.recovery_point = Some(RecoveryPoint {
            id: "m3".into(),
            timepoint: Timepoint::new(300, 0),
        });
        progress::save(&session.pool, &p).unwrap();

        let remote = FakeRemote::new(vec![
            test_item("m4", 400, "s"),
            test_item("m3", 300, "s"),
            test_item("m2", 200, "s"),
            test_item("m1", 100, "s"),
        ]);

        let outcome = run_migration(&session, &remote).await.unwrap();
        assert!(outcome.completed);
        assert!(outcome.resumed_build);

        // Metadata indexing ran to termination, then content backfill
        // filled the rows the metadata pass left empty.
        assert_eq!(records::count(&session.pool).unwrap(), 4);
        assert!(records::page_missing_content(&session.pool, None, 10)
            .unwrap()
            .is_empty());
        let record = session
            .cipher
            .open_record(&records::get(&session.pool, "m1").unwrap().unwrap());
        assert_eq!(record.body.as_deref(), Some("body of m1"));

        let p = progress::load(&session.pool).unwrap().unwrap();
        assert_eq!(p.status, BuildStatus::Active);
    }

    #[tokio::test]
    async fn test_failed_resume_keeps_legacy_flags_for_retry() {
        let session = legacy_session();
        write_legacy_record(
            &session.pool,
            &session.cipher,
            &legacy_record("m2", 200, "b"),
        )
        .unwrap();
        let mut p = BuildProgress::new(2);
        p.current_count = 1;
        p.recovery_point = Some(RecoveryPoint {
            id: "m2".into(),
            timepoint: Timepoint::new(200, 0),
        });
        progress::save(&session.pool, &p).unwrap();

        let remote = FakeRemote::new(vec![test_item("m2", 200, "s"), test_item("m1", 100, "s")]);
        // Test session retries once; two failures pause the metadata pass.
        remote.fail_next_pages(2);

        let outcome = run_migration(&session, &remote).await.unwrap();
        assert!(!outcome.completed);

        // Legacy state intact: migration retries on next load.
        let conn = session.pool.get().unwrap();
        assert!(schema::has_legacy_table(&conn).unwrap());
        assert_ne!(
            meta::get(&conn, meta::KEY_SCHEMA_VERSION).unwrap().as_deref(),
            Some("2")
        );
        drop(conn);
        assert!(needs_migration(&session.pool).unwrap());

        // Retry completes.
        let outcome = run_migration(&session, &remote).await.unwrap();
        assert!(outcome.completed);
        assert!(!needs_migration(&session.pool).unwrap());
    }

    #[tokio::test]
    async fn test_undecryptable_legacy_record_is_dropped() {
        let session = legacy_session();
        write_legacy_record(
            &session.pool,
            &session.cipher,
            &legacy_record("good", 100, "b"),
        )
        .unwrap();
        write_legacy_row(
            &session.pool,
            "bad",
            Timepoint::new(200, 0),
            &SealedBlob {
                iv: [0u8; 12],
                ciphertext: vec![1, 2, 3, 4],
            },
        )
        .unwrap();

        let remote = FakeRemote::new(vec![]);
        let outcome = run_migration(&session, &remote).await.unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.migrated, 1);
        assert_eq!(outcome.dropped, 1);
        assert!(records::exists(&session.pool, "good").unwrap());
        assert!(!records::exists(&session.pool, "bad").unwrap());
    }

    #[test]
    fn test_fresh_store_needs_no_migration() {
        let pool = create_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        schema::initialize_schema(&conn).unwrap();
        meta::set(&conn, meta::KEY_SCHEMA_VERSION, "2").unwrap();
        drop(conn);
        assert!(!needs_migration(&pool).unwrap());
    }
}
