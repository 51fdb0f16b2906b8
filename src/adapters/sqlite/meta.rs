//! Typed accessors over the small per-user meta store.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rusqlite::{params, Connection, OptionalExtension};

use super::DbPool;
use crate::error::IndexError;
use crate::types::SealedBlob;

pub const KEY_SCHEMA_VERSION: &str = "schema_version";
pub const KEY_WRAPPED_INDEX_KEY: &str = "wrapped_index_key";
pub const KEY_KEY_CHECK: &str = "key_check";
pub const KEY_EVENT_CURSOR: &str = "event_cursor";
pub const KEY_ESTIMATED_BYTES: &str = "estimated_disk_bytes";
pub const KEY_INDEX_LIMITED: &str = "index_limited";
pub const KEY_INDEX_ENABLED: &str = "index_enabled";
pub const KEY_BUILD_PAUSED: &str = "build_paused";
pub const KEY_MIGRATION_CURSOR: &str = "migration_cursor";

// Connection-level primitives, usable inside an open transaction.

pub fn get(conn: &Connection, key: &str) -> Result<Option<String>, IndexError> {
    let value = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

pub fn set(conn: &Connection, key: &str, value: &str) -> Result<(), IndexError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn remove(conn: &Connection, key: &str) -> Result<(), IndexError> {
    conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
    Ok(())
}

// Pool-level typed helpers.

pub fn get_string(pool: &DbPool, key: &str) -> Result<Option<String>, IndexError> {
    let conn = pool.get()?;
    get(&conn, key)
}

pub fn set_string(pool: &DbPool, key: &str, value: &str) -> Result<(), IndexError> {
    let conn = pool.get()?;
    set(&conn, key, value)
}

pub fn remove_key(pool: &DbPool, key: &str) -> Result<(), IndexError> {
    let conn = pool.get()?;
    remove(&conn, key)
}

pub fn get_i64(pool: &DbPool, key: &str) -> Result<Option<i64>, IndexError> {
    Ok(get_string(pool, key)?.and_then(|v| v.parse().ok()))
}

pub fn set_i64(pool: &DbPool, key: &str, value: i64) -> Result<(), IndexError> {
    set_string(pool, key, &value.to_string())
}

pub fn get_bool(pool: &DbPool, key: &str) -> Result<bool, IndexError> {
    Ok(get_string(pool, key)?.as_deref() == Some("1"))
}

pub fn set_bool(pool: &DbPool, key: &str, value: bool) -> Result<(), IndexError> {
    set_string(pool, key, if value { "1" } else { "0" })
}

/// Persist a sealed blob (iv || ciphertext, base64).
pub fn set_blob(pool: &DbPool, key: &str, blob: &SealedBlob) -> Result<(), IndexError> {
    let mut combined = Vec::with_capacity(12 + blob.ciphertext.len());
    combined.extend_from_slice(&blob.iv);
    combined.extend_from_slice(&blob.ciphertext);
    set_string(pool, key, &BASE64.encode(combined))
}

pub fn get_blob(pool: &DbPool, key: &str) -> Result<Option<SealedBlob>, IndexError> {
    let encoded = match get_string(pool, key)? {
        Some(v) => v,
        None => return Ok(None),
    };
    let combined = BASE64
        .decode(encoded)
        .map_err(|e| IndexError::Corrupt(format!("Invalid base64 in meta '{}': {}", key, e)))?;
    if combined.len() < 12 {
        return Err(IndexError::Corrupt(format!(
            "Sealed blob in meta '{}' too short: {} bytes",
            key,
            combined.len()
        )));
    }
    let (iv, ct) = combined.split_at(12);
    let mut iv_arr = [0u8; 12];
    iv_arr.copy_from_slice(iv);
    Ok(Some(SealedBlob {
        iv: iv_arr,
        ciphertext: ct.to_vec(),
    }))
}

/// Persist the raw wrapped-key bytes produced by the host's `KeyWrapper`.
pub fn set_wrapped_key(pool: &DbPool, wrapped: &[u8]) -> Result<(), IndexError> {
    set_string(pool, KEY_WRAPPED_INDEX_KEY, &BASE64.encode(wrapped))
}

pub fn get_wrapped_key(pool: &DbPool) -> Result<Option<Vec<u8>>, IndexError> {
    match get_string(pool, KEY_WRAPPED_INDEX_KEY)? {
        Some(encoded) => BASE64
            .decode(encoded)
            .map(Some)
            .map_err(|e| IndexError::Corrupt(format!("Invalid wrapped key blob: {}", e))),
        None => Ok(None),
    }
}
