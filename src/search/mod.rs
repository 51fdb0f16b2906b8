//! Query normalization and record matching.
//!
//! Evaluation is metadata-first: every cheap predicate gets a chance to
//! reject a record before any keyword work happens. Keyword matching is
//! substring containment of every normalized token (logical AND) over the
//! subject, participants, and body.

use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::adapters::sqlite::{meta, records, DbPool};
use crate::cache::BoundedCache;
use crate::crypto::IndexCipher;
use crate::error::IndexError;
use crate::types::IndexRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    TimeDesc,
    TimeAsc,
    SizeDesc,
    SizeAsc,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::TimeDesc
    }
}

/// Raw query as the host hands it over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub label: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Inclusive epoch-second bounds.
    pub begin: Option<i64>,
    pub end: Option<i64>,
    pub has_attachments: Option<bool>,
    pub is_unread: Option<bool>,
    /// Filter on the per-record decryption-failed state.
    pub decryption_failed: Option<bool>,
    /// Free-text keywords, whitespace separated.
    pub keywords: Option<String>,
    #[serde(default)]
    pub sort: SortOrder,
}

/// Normalized form: folded addresses, tokenized keywords.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQuery {
    pub label: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub begin: Option<i64>,
    pub end: Option<i64>,
    pub has_attachments: Option<bool>,
    pub is_unread: Option<bool>,
    pub decryption_failed: Option<bool>,
    pub keywords: Vec<String>,
    pub sort: SortOrder,
}

/// Lowercase and strip diacritics (NFD, combining marks dropped).
fn fold(s: &str) -> String {
    s.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn normalize(raw: &SearchQuery) -> NormalizedQuery {
    let keywords = raw
        .keywords
        .as_deref()
        .map(|s| {
            fold(s)
                .split_whitespace()
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    NormalizedQuery {
        label: raw.label.clone(),
        from: raw.from.as_deref().map(fold),
        to: raw.to.as_deref().map(fold),
        begin: raw.begin,
        end: raw.end,
        has_attachments: raw.has_attachments,
        is_unread: raw.is_unread,
        decryption_failed: raw.decryption_failed,
        keywords,
        sort: raw.sort,
    }
}

/// True when two successive normalized queries differ only in sort order,
/// so the previous result set can be re-sorted instead of re-scanned.
pub fn should_only_sort_results(prev: &NormalizedQuery, next: &NormalizedQuery) -> bool {
    let mut prev_resorted = prev.clone();
    prev_resorted.sort = next.sort;
    prev_resorted == *next
}

pub fn matches(query: &NormalizedQuery, record: &IndexRecord) -> bool {
    // Flag and label predicates first: cheapest, most likely to reject.
    if let Some(wanted) = query.decryption_failed {
        if record.decryption_failed != wanted {
            return false;
        }
    }
    if let Some(wanted) = query.has_attachments {
        if record.metadata.has_attachments != wanted {
            return false;
        }
    }
    if let Some(wanted) = query.is_unread {
        if record.metadata.is_unread != wanted {
            return false;
        }
    }
    if let Some(label) = &query.label {
        if !record.labels.contains(label) {
            return false;
        }
    }
    if let Some(begin) = query.begin {
        if record.timepoint.time < begin {
            return false;
        }
    }
    if let Some(end) = query.end {
        if record.timepoint.time > end {
            return false;
        }
    }
    if let Some(from) = &query.from {
        if fold(&record.metadata.sender.addr) != *from {
            return false;
        }
    }
    if let Some(to) = &query.to {
        let hit = record
            .metadata
            .to
            .iter()
            .chain(record.metadata.cc.iter())
            .any(|a| fold(&a.addr) == *to);
        if !hit {
            return false;
        }
    }

    if query.keywords.is_empty() {
        return true;
    }

    // Only now pay for the haystack: subject + participants + body.
    let mut haystack = String::new();
    if let Some(subject) = &record.subject {
        haystack.push_str(&fold(subject));
        haystack.push(' ');
    }
    haystack.push_str(&fold(&record.metadata.sender.name));
    haystack.push(' ');
    haystack.push_str(&fold(&record.metadata.sender.addr));
    for addr in record.metadata.to.iter().chain(record.metadata.cc.iter()) {
        haystack.push(' ');
        haystack.push_str(&fold(&addr.name));
        haystack.push(' ');
        haystack.push_str(&fold(&addr.addr));
    }
    if let Some(body) = &record.body {
        haystack.push(' ');
        haystack.push_str(&fold(body));
    }

    query.keywords.iter().all(|kw| haystack.contains(kw))
}

pub fn sort_records(records: &mut [IndexRecord], sort: SortOrder) {
    match sort {
        SortOrder::TimeDesc => {
            records.sort_by(|a, b| b.timepoint.cmp(&a.timepoint));
        }
        SortOrder::TimeAsc => {
            records.sort_by(|a, b| a.timepoint.cmp(&b.timepoint));
        }
        SortOrder::SizeDesc => {
            records.sort_by(|a, b| {
                b.metadata
                    .size_bytes
                    .cmp(&a.metadata.size_bytes)
                    .then(b.timepoint.cmp(&a.timepoint))
            });
        }
        SortOrder::SizeAsc => {
            records.sort_by(|a, b| {
                a.metadata
                    .size_bytes
                    .cmp(&b.metadata.size_bytes)
                    .then(b.timepoint.cmp(&a.timepoint))
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Stop after this many hits (newest-first scan order). `None` scans
    /// the whole index.
    pub max_results: Option<usize>,
    /// Page size for the on-disk fallback scan.
    pub disk_page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: None,
            disk_page_size: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResults {
    pub records: Vec<IndexRecord>,
    /// True when the results may be incomplete: the on-disk index itself
    /// is limited, or the scan stopped at `max_results`.
    pub limited: bool,
}

/// Stateful query front-end: consults the cache first, falls back to a
/// decrypt-on-read disk scan below the cache horizon, and reuses the last
/// result set across sort-only query changes.
pub struct Searcher {
    cfg: SearchConfig,
    last: Option<(NormalizedQuery, Vec<IndexRecord>)>,
}

impl Searcher {
    pub fn new(cfg: SearchConfig) -> Self {
        Self { cfg, last: None }
    }

    pub fn search(
        &mut self,
        raw: &SearchQuery,
        cache: &BoundedCache,
        pool: &DbPool,
        cipher: &IndexCipher,
    ) -> Result<SearchResults, IndexError> {
        let query = normalize(raw);

        if let Some((prev, prev_hits)) = &self.last {
            if should_only_sort_results(prev, &query) {
                let mut hits = prev_hits.clone();
                sort_records(&mut hits, query.sort);
                self.last = Some((query, hits.clone()));
                let limited = meta::get_bool(pool, meta::KEY_INDEX_LIMITED)?;
                return Ok(SearchResults {
                    records: hits,
                    limited,
                });
            }
        }

        let mut hits: Vec<IndexRecord> = Vec::new();
        let mut truncated = false;

        'scan: {
            for record in cache.iter() {
                if matches(&query, record) {
                    hits.push(record.clone());
                    if self.reached_limit(hits.len()) {
                        truncated = true;
                        break 'scan;
                    }
                }
            }

            let disk_count = records::count(pool)?;
            if !cache.is_limited(disk_count) {
                break 'scan;
            }

            // The disk holds records the cache does not: keep scanning
            // below the cache horizon, decrypting as we go.
            let mut cursor = cache.horizon();
            loop {
                let page = records::page_newest(pool, cursor, self.cfg.disk_page_size)?;
                if page.is_empty() {
                    break;
                }
                cursor = page.last().map(|r| r.timepoint);
                for stored in &page {
                    let record = cipher.open_record(stored);
                    if matches(&query, &record) {
                        hits.push(record);
                        if self.reached_limit(hits.len()) {
                            truncated = true;
                            break 'scan;
                        }
                    }
                }
            }
        }

        sort_records(&mut hits, query.sort);
        self.last = Some((query, hits.clone()));

        let limited = truncated || meta::get_bool(pool, meta::KEY_INDEX_LIMITED)?;
        Ok(SearchResults {
            records: hits,
            limited,
        })
    }

    fn reached_limit(&self, hits: usize) -> bool {
        self.cfg.max_results.is_some_and(|max| hits >= max)
    }

    /// Drop the memoized result set (index contents changed).
    pub fn invalidate(&mut self) {
        self.last = None;
    }
}
