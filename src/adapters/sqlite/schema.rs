use rusqlite::Connection;

use crate::error::IndexError;

/// Current on-disk schema version: metadata and content encrypted as
/// separate ciphertexts per record.
pub const SCHEMA_VERSION: i64 = 2;

/// First shipped schema: one combined ciphertext per record.
pub const LEGACY_SCHEMA_VERSION: i64 = 1;

pub fn initialize_schema(conn: &Connection) -> Result<(), IndexError> {
    conn.execute_batch(
        "
        -- Encrypted record store. Clear columns are limited to what the
        -- storage layer itself needs: the remote id, the (time, ord) sort
        -- key, and the label set for cheap filtering.
        CREATE TABLE IF NOT EXISTS records (
            id          TEXT PRIMARY KEY,   -- stable remote identifier
            time        INTEGER NOT NULL,   -- unix epoch seconds
            ord         INTEGER NOT NULL,   -- tiebreak within one second
            labels      TEXT NOT NULL DEFAULT '[]',  -- JSON array
            meta_iv     BLOB NOT NULL,
            meta_ct     BLOB NOT NULL,
            body_iv     BLOB,               -- NULL until content is indexed
            body_ct     BLOB,
            byte_size   INTEGER NOT NULL,   -- approximate footprint for the quota
            UNIQUE(time, ord)
        );

        CREATE INDEX IF NOT EXISTS idx_records_time ON records(time DESC, ord DESC);

        -- Small per-user key/value store: wrapped index key, event cursor,
        -- schema version, enabled/paused flags, estimated disk bytes.
        CREATE TABLE IF NOT EXISTS meta (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL
        );

        -- Single-row build progress, updated after every batch.
        CREATE TABLE IF NOT EXISTS build_progress (
            id                      INTEGER PRIMARY KEY CHECK (id = 1),
            status                  TEXT NOT NULL,
            current_count           INTEGER NOT NULL DEFAULT 0,
            total_count             INTEGER NOT NULL DEFAULT 0,
            recovery_id             TEXT,
            recovery_time           INTEGER,
            recovery_ord            INTEGER,
            timestamps              TEXT NOT NULL DEFAULT '[]',  -- JSON array of epoch ms
            num_pauses              INTEGER NOT NULL DEFAULT 0,
            original_estimate_secs  INTEGER
        );
        ",
    )?;

    Ok(())
}

/// Legacy v1 store: one combined ciphertext per record. Only ever created
/// by old clients (and by migration tests); current code reads it during
/// migration and drops it afterwards.
pub fn initialize_legacy_schema(conn: &Connection) -> Result<(), IndexError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS records_v1 (
            id          TEXT PRIMARY KEY,
            time        INTEGER NOT NULL,
            ord         INTEGER NOT NULL,
            labels      TEXT NOT NULL DEFAULT '[]',
            iv          BLOB NOT NULL,
            ct          BLOB NOT NULL,
            byte_size   INTEGER NOT NULL,
            UNIQUE(time, ord)
        );

        CREATE TABLE IF NOT EXISTS meta (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS build_progress (
            id                      INTEGER PRIMARY KEY CHECK (id = 1),
            status                  TEXT NOT NULL,
            current_count           INTEGER NOT NULL DEFAULT 0,
            total_count             INTEGER NOT NULL DEFAULT 0,
            recovery_id             TEXT,
            recovery_time           INTEGER,
            recovery_ord            INTEGER,
            timestamps              TEXT NOT NULL DEFAULT '[]',
            num_pauses              INTEGER NOT NULL DEFAULT 0,
            original_estimate_secs  INTEGER
        );
        ",
    )?;

    Ok(())
}

/// True when the legacy combined-ciphertext table is still present.
pub fn has_legacy_table(conn: &Connection) -> Result<bool, IndexError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'records_v1'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn drop_legacy_table(conn: &Connection) -> Result<(), IndexError> {
    conn.execute_batch("DROP TABLE IF EXISTS records_v1;")?;
    Ok(())
}
