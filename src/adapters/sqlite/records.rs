//! Encrypted record CRUD and the quota-eviction policy.
//!
//! Under space pressure the store sheds its oldest records first, so the
//! index always represents the most-recent slice of the mailbox. An insert
//! older than everything already stored is a no-op success: the index is
//! already "limited" past that point.

use std::collections::{BTreeSet, VecDeque};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{meta, DbPool, StoreConfig};
use crate::error::IndexError;
use crate::types::{SealedBlob, StoredCiphertext, Timepoint};

/// Result of one transactional batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub stored: u64,
    pub evicted: u64,
    pub skipped_old: u64,
}

impl BatchOutcome {
    /// True when the quota forced an eviction or a skip. The index builder
    /// treats this as the signal to conclude early with a limited index.
    pub fn quota_hit(&self) -> bool {
        self.evicted > 0 || self.skipped_old > 0
    }

    fn absorb(&mut self, other: BatchOutcome) {
        self.stored += other.stored;
        self.evicted += other.evicted;
        self.skipped_old += other.skipped_old;
    }
}

pub fn put(
    pool: &DbPool,
    cfg: &StoreConfig,
    record: &StoredCiphertext,
) -> Result<BatchOutcome, IndexError> {
    put_batch(pool, cfg, std::slice::from_ref(record))
}

/// Write a batch of records in one transaction. No partial batch is ever
/// observable: either every record landed (or was intentionally skipped as
/// too old) or the transaction rolled back.
pub fn put_batch(
    pool: &DbPool,
    cfg: &StoreConfig,
    batch: &[StoredCiphertext],
) -> Result<BatchOutcome, IndexError> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;

    let mut outcome = BatchOutcome::default();
    for record in batch {
        let one = put_in_tx(&tx, cfg, record)?;
        outcome.absorb(one);
    }

    let used = total_bytes_conn(&tx)?;
    meta::set(&tx, meta::KEY_ESTIMATED_BYTES, &used.to_string())?;
    if outcome.quota_hit() {
        meta::set(&tx, meta::KEY_INDEX_LIMITED, "1")?;
    }

    tx.commit()?;

    if outcome.evicted > 0 {
        debug!(
            "Batch write evicted {} oldest records under quota pressure",
            outcome.evicted
        );
    }
    Ok(outcome)
}

fn put_in_tx(
    tx: &Connection,
    cfg: &StoreConfig,
    record: &StoredCiphertext,
) -> Result<BatchOutcome, IndexError> {
    let mut outcome = BatchOutcome::default();
    loop {
        if let Some(budget) = cfg.max_bytes {
            let existing: Option<u64> = tx
                .query_row(
                    "SELECT byte_size FROM records WHERE id = ?1",
                    params![record.id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .map(|v| v as u64);

            let used = total_bytes_conn(tx)?;
            let projected = used - existing.unwrap_or(0) + record.byte_size;

            if projected > budget {
                match oldest_in_tx(tx)? {
                    Some((oldest_id, oldest_tp))
                        if oldest_tp < record.timepoint && oldest_id != record.id =>
                    {
                        tx.execute("DELETE FROM records WHERE id = ?1", params![oldest_id])?;
                        outcome.evicted += 1;
                        continue;
                    }
                    _ => {
                        // Incoming record is at least as old as everything
                        // stored (or the store is empty and the record alone
                        // exceeds the budget). Intentional no-op success.
                        outcome.skipped_old += 1;
                        return Ok(outcome);
                    }
                }
            }
        }

        match insert_row(tx, record) {
            Ok(()) => {
                outcome.stored += 1;
                return Ok(outcome);
            }
            Err(e) if is_disk_full(&e) => {
                // The platform signalled quota exhaustion directly; take
                // the same eviction path as the configured budget.
                warn!("SQLITE_FULL during put, evicting oldest record");
                match oldest_in_tx(tx)? {
                    Some((oldest_id, oldest_tp))
                        if oldest_tp < record.timepoint && oldest_id != record.id =>
                    {
                        tx.execute("DELETE FROM records WHERE id = ?1", params![oldest_id])?;
                        outcome.evicted += 1;
                    }
                    _ => {
                        outcome.skipped_old += 1;
                        return Ok(outcome);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn insert_row(tx: &Connection, record: &StoredCiphertext) -> Result<(), rusqlite::Error> {
    let labels = serde_json::to_string(&record.labels).unwrap_or_else(|_| "[]".to_string());
    tx.execute(
        "INSERT INTO records (id, time, ord, labels, meta_iv, meta_ct, body_iv, body_ct, byte_size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
             time = excluded.time,
             ord = excluded.ord,
             labels = excluded.labels,
             meta_iv = excluded.meta_iv,
             meta_ct = excluded.meta_ct,
             body_iv = excluded.body_iv,
             body_ct = excluded.body_ct,
             byte_size = excluded.byte_size",
        params![
            record.id,
            record.timepoint.time,
            record.timepoint.order as i64,
            labels,
            record.meta.iv.to_vec(),
            record.meta.ciphertext,
            record.content.as_ref().map(|c| c.iv.to_vec()),
            record.content.as_ref().map(|c| c.ciphertext.clone()),
            record.byte_size as i64,
        ],
    )?;
    Ok(())
}

fn is_disk_full(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::DiskFull
    )
}

pub fn get(pool: &DbPool, id: &str) -> Result<Option<StoredCiphertext>, IndexError> {
    let conn = pool.get()?;
    let raw = conn
        .query_row(
            "SELECT id, time, ord, labels, meta_iv, meta_ct, body_iv, body_ct, byte_size
             FROM records WHERE id = ?1",
            params![id],
            map_raw_row,
        )
        .optional()?;
    raw.map(RawRow::into_stored).transpose()
}

pub fn exists(pool: &DbPool, id: &str) -> Result<bool, IndexError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn delete(pool: &DbPool, id: &str) -> Result<bool, IndexError> {
    let conn = pool.get()?;
    let affected = conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
    if affected > 0 {
        let used = total_bytes_conn(&conn)?;
        meta::set(&conn, meta::KEY_ESTIMATED_BYTES, &used.to_string())?;
    }
    Ok(affected > 0)
}

pub fn count(pool: &DbPool) -> Result<u64, IndexError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
    Ok(count as u64)
}

pub fn total_bytes(pool: &DbPool) -> Result<u64, IndexError> {
    let conn = pool.get()?;
    total_bytes_conn(&conn)
}

fn total_bytes_conn(conn: &Connection) -> Result<u64, IndexError> {
    let sum: i64 = conn.query_row(
        "SELECT COALESCE(SUM(byte_size), 0) FROM records",
        [],
        |row| row.get(0),
    )?;
    Ok(sum as u64)
}

pub fn oldest_timepoint(pool: &DbPool) -> Result<Option<Timepoint>, IndexError> {
    let conn = pool.get()?;
    Ok(oldest_in_tx(&conn)?.map(|(_, tp)| tp))
}

pub fn newest_timepoint(pool: &DbPool) -> Result<Option<Timepoint>, IndexError> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            "SELECT time, ord FROM records ORDER BY time DESC, ord DESC LIMIT 1",
            [],
            |row| {
                Ok(Timepoint {
                    time: row.get(0)?,
                    order: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn oldest_in_tx(conn: &Connection) -> Result<Option<(String, Timepoint)>, IndexError> {
    let row = conn
        .query_row(
            "SELECT id, time, ord FROM records ORDER BY time ASC, ord ASC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Timepoint {
                        time: row.get(1)?,
                        order: row.get::<_, i64>(2)? as u64,
                    },
                ))
            },
        )
        .optional()?;
    Ok(row)
}

/// One newest-first page strictly below `before`.
pub fn page_newest(
    pool: &DbPool,
    before: Option<Timepoint>,
    limit: usize,
) -> Result<Vec<StoredCiphertext>, IndexError> {
    let conn = pool.get()?;
    let mut raws: Vec<RawRow> = Vec::new();

    match before {
        Some(tp) => {
            let mut stmt = conn.prepare(
                "SELECT id, time, ord, labels, meta_iv, meta_ct, body_iv, body_ct, byte_size
                 FROM records
                 WHERE time < ?1 OR (time = ?1 AND ord < ?2)
                 ORDER BY time DESC, ord DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![tp.time, tp.order as i64, limit as i64],
                map_raw_row,
            )?;
            for row in rows {
                raws.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, time, ord, labels, meta_iv, meta_ct, body_iv, body_ct, byte_size
                 FROM records
                 ORDER BY time DESC, ord DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], map_raw_row)?;
            for row in rows {
                raws.push(row?);
            }
        }
    }

    raws.into_iter().map(RawRow::into_stored).collect()
}

/// Newest-first page of records whose content half has not been written
/// yet, strictly below `before`. Used by the content backfill pass.
pub fn page_missing_content(
    pool: &DbPool,
    before: Option<Timepoint>,
    limit: usize,
) -> Result<Vec<StoredCiphertext>, IndexError> {
    let conn = pool.get()?;
    let mut raws: Vec<RawRow> = Vec::new();

    match before {
        Some(tp) => {
            let mut stmt = conn.prepare(
                "SELECT id, time, ord, labels, meta_iv, meta_ct, body_iv, body_ct, byte_size
                 FROM records
                 WHERE body_ct IS NULL AND (time < ?1 OR (time = ?1 AND ord < ?2))
                 ORDER BY time DESC, ord DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![tp.time, tp.order as i64, limit as i64],
                map_raw_row,
            )?;
            for row in rows {
                raws.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, time, ord, labels, meta_iv, meta_ct, body_iv, body_ct, byte_size
                 FROM records
                 WHERE body_ct IS NULL
                 ORDER BY time DESC, ord DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], map_raw_row)?;
            for row in rows {
                raws.push(row?);
            }
        }
    }

    raws.into_iter().map(RawRow::into_stored).collect()
}

/// Patch the metadata half of an existing record in place (labels, sort
/// key, metadata ciphertext), preserving the content half.
pub fn update_metadata(
    pool: &DbPool,
    id: &str,
    timepoint: Timepoint,
    labels: &BTreeSet<String>,
    sealed_meta: &SealedBlob,
) -> Result<bool, IndexError> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;

    let content_len: Option<i64> = tx
        .query_row(
            "SELECT COALESCE(LENGTH(body_ct), 0) FROM records WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let content_len = match content_len {
        Some(len) => len as u64,
        None => return Ok(false),
    };

    let content_overhead = if content_len > 0 { 12 } else { 0 };
    let byte_size = (sealed_meta.ciphertext.len() + 12) as u64 + content_len + content_overhead;
    let labels_json = serde_json::to_string(labels)?;

    tx.execute(
        "UPDATE records
         SET time = ?2, ord = ?3, labels = ?4, meta_iv = ?5, meta_ct = ?6, byte_size = ?7
         WHERE id = ?1",
        params![
            id,
            timepoint.time,
            timepoint.order as i64,
            labels_json,
            sealed_meta.iv.to_vec(),
            sealed_meta.ciphertext,
            byte_size as i64,
        ],
    )?;
    tx.commit()?;
    Ok(true)
}

/// Write the content half of an existing record (backfill).
pub fn update_content(
    pool: &DbPool,
    id: &str,
    sealed_content: &SealedBlob,
) -> Result<bool, IndexError> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;

    let meta_len: Option<i64> = tx
        .query_row(
            "SELECT LENGTH(meta_ct) FROM records WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let meta_len = match meta_len {
        Some(len) => len as u64,
        None => return Ok(false),
    };

    let byte_size = meta_len + 12 + (sealed_content.ciphertext.len() + 12) as u64;
    tx.execute(
        "UPDATE records SET body_iv = ?2, body_ct = ?3, byte_size = ?4 WHERE id = ?1",
        params![
            id,
            sealed_content.iv.to_vec(),
            sealed_content.ciphertext,
            byte_size as i64,
        ],
    )?;
    tx.commit()?;
    Ok(true)
}

pub fn wipe(pool: &DbPool) -> Result<(), IndexError> {
    let conn = pool.get()?;
    conn.execute_batch(
        "DELETE FROM records;
         DELETE FROM meta;
         DELETE FROM build_progress;",
    )?;
    Ok(())
}

/// Lazy newest-first traversal of the whole store, paging internally.
pub fn iterate_newest(pool: &DbPool, page_size: usize) -> NewestIter {
    NewestIter {
        pool: pool.clone(),
        cursor: None,
        page_size: page_size.max(1),
        buf: VecDeque::new(),
        done: false,
    }
}

pub struct NewestIter {
    pool: DbPool,
    cursor: Option<Timepoint>,
    page_size: usize,
    buf: VecDeque<StoredCiphertext>,
    done: bool,
}

impl Iterator for NewestIter {
    type Item = Result<StoredCiphertext, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.buf.pop_front() {
            return Some(Ok(record));
        }
        if self.done {
            return None;
        }

        match page_newest(&self.pool, self.cursor, self.page_size) {
            Ok(page) => {
                if page.len() < self.page_size {
                    self.done = true;
                }
                if let Some(last) = page.last() {
                    self.cursor = Some(last.timepoint);
                }
                self.buf.extend(page);
                self.buf.pop_front().map(Ok)
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

struct RawRow {
    id: String,
    time: i64,
    ord: i64,
    labels: String,
    meta_iv: Vec<u8>,
    meta_ct: Vec<u8>,
    body_iv: Option<Vec<u8>>,
    body_ct: Option<Vec<u8>>,
    byte_size: i64,
}

fn map_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        time: row.get(1)?,
        ord: row.get(2)?,
        labels: row.get(3)?,
        meta_iv: row.get(4)?,
        meta_ct: row.get(5)?,
        body_iv: row.get(6)?,
        body_ct: row.get(7)?,
        byte_size: row.get(8)?,
    })
}

impl RawRow {
    fn into_stored(self) -> Result<StoredCiphertext, IndexError> {
        let meta_iv: [u8; 12] = self.meta_iv.as_slice().try_into().map_err(|_| {
            IndexError::Corrupt(format!("Record {} has malformed metadata IV", self.id))
        })?;

        let content = match (self.body_iv, self.body_ct) {
            (Some(iv), Some(ct)) => {
                let iv: [u8; 12] = iv.as_slice().try_into().map_err(|_| {
                    IndexError::Corrupt(format!("Record {} has malformed content IV", self.id))
                })?;
                Some(SealedBlob { iv, ciphertext: ct })
            }
            _ => None,
        };

        let labels: BTreeSet<String> = serde_json::from_str(&self.labels).unwrap_or_default();

        Ok(StoredCiphertext {
            id: self.id,
            timepoint: Timepoint {
                time: self.time,
                order: self.ord as u64,
            },
            labels,
            meta: SealedBlob {
                iv: meta_iv,
                ciphertext: self.meta_ct,
            },
            content,
            byte_size: self.byte_size as u64,
        })
    }
}
