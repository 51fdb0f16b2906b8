//! In-memory, byte-budgeted mirror of the newest index records.
//!
//! The cache is a derived view: rebuilt from disk each session, never
//! persisted, never the source of truth. It holds decrypted records sorted
//! newest-first so most queries never touch the storage layer. Only the
//! currently active stage (build, sync, or query-time warm) mutates it.

use tracing::debug;

use crate::adapters::sqlite::{records, DbPool};
use crate::crypto::IndexCipher;
use crate::error::IndexError;
use crate::types::{IndexRecord, Timepoint};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget for decrypted records held in memory.
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // Generous enough for tens of thousands of typical records.
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: IndexRecord,
    pub byte_size: u64,
}

/// Time-ordered record cache under a byte budget.
///
/// Entries are kept sorted by `(time, order)` descending in a vec with
/// binary-search insertion; index 0 is always the newest record.
pub struct BoundedCache {
    entries: Vec<CacheEntry>,
    used_bytes: u64,
    max_bytes: u64,
}

impl BoundedCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: Vec::new(),
            used_bytes: 0,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// The cache is limited whenever the disk holds records it does not.
    pub fn is_limited(&self, disk_count: u64) -> bool {
        disk_count > self.entries.len() as u64
    }

    /// Timepoint of the oldest cached record; queries scanning past the
    /// cache continue below this horizon on disk.
    pub fn horizon(&self) -> Option<Timepoint> {
        self.entries.last().map(|e| e.record.timepoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.record.id == id)
    }

    /// Insert a record, keeping the cache a strict most-recent-bytes
    /// window. Returns false when the record is too old to displace
    /// anything; the cache then reports itself limited.
    pub fn insert(&mut self, record: IndexRecord, byte_size: u64) -> bool {
        while self.used_bytes + byte_size > self.max_bytes {
            match self.entries.last() {
                Some(last) if last.record.timepoint < record.timepoint => {
                    let evicted = self.entries.pop().expect("last() was Some");
                    self.used_bytes -= evicted.byte_size;
                }
                _ => return false,
            }
        }

        let tp = record.timepoint;
        let pos = match self
            .entries
            .binary_search_by(|e| tp.cmp(&e.record.timepoint))
        {
            // Same timepoint means same item (the pair is unique): replace.
            Ok(pos) => {
                let old = std::mem::replace(
                    &mut self.entries[pos],
                    CacheEntry { record, byte_size },
                );
                self.used_bytes = self.used_bytes - old.byte_size + byte_size;
                return true;
            }
            Err(pos) => pos,
        };
        self.entries.insert(pos, CacheEntry { record, byte_size });
        self.used_bytes += byte_size;
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.record.id == id) {
            let removed = self.entries.remove(pos);
            self.used_bytes -= removed.byte_size;
            true
        } else {
            false
        }
    }

    /// Update an entry in place, re-sorting only when the sort key moved
    /// (a draft save can change its timepoint).
    pub fn replace(&mut self, id: &str, record: IndexRecord, byte_size: u64) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.record.id == id) else {
            return false;
        };

        if self.entries[pos].record.timepoint == record.timepoint {
            let old = std::mem::replace(&mut self.entries[pos], CacheEntry { record, byte_size });
            self.used_bytes = self.used_bytes - old.byte_size + byte_size;
            true
        } else {
            let removed = self.entries.remove(pos);
            self.used_bytes -= removed.byte_size;
            self.insert(record, byte_size)
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }
}

/// Rebuild the cache by streaming the newest on-disk records through the
/// cipher until the byte budget fills.
pub fn warm(
    pool: &DbPool,
    cipher: &IndexCipher,
    cfg: &CacheConfig,
) -> Result<BoundedCache, IndexError> {
    let mut cache = BoundedCache::new(cfg.max_bytes);

    for stored in records::iterate_newest(pool, 256) {
        let stored = stored?;
        if cache.used_bytes() + stored.byte_size > cfg.max_bytes {
            break;
        }
        let record = cipher.open_record(&stored);
        cache.insert(record, stored.byte_size);
    }

    debug!(
        "Cache warmed: {} records, {} bytes",
        cache.len(),
        cache.used_bytes()
    );
    Ok(cache)
}
