//! Turns remote items and their fetched content into index records.

use crate::remote::{RemoteContent, RemoteItem};
use crate::types::{ContentHalf, IndexRecord};

use super::html_text::{self, TextConfig};

/// Normalize fetched content into the searchable content half.
///
/// Quote stripping is skipped when either the remote flagged the item as
/// forwarded or the subject carries a configured forward prefix.
pub fn build_content_half(
    subject: Option<&str>,
    forwarded_flag: bool,
    content: &RemoteContent,
    cfg: &TextConfig,
) -> ContentHalf {
    match content {
        RemoteContent::Failed => ContentHalf {
            body: None,
            failed: true,
        },
        RemoteContent::Body { html, text } => {
            let keep_quotes = forwarded_flag
                || subject
                    .map(|s| html_text::is_forwarded(s, cfg))
                    .unwrap_or(false);

            let body = match (html, text) {
                (Some(html), _) => html_text::html_to_searchable_text(html, keep_quotes),
                (None, Some(text)) => html_text::normalize_plain_text(text),
                (None, None) => String::new(),
            };
            ContentHalf {
                body: Some(body),
                failed: false,
            }
        }
    }
}

/// Build the plaintext record for one item.
///
/// A host-side decryption failure degrades the record (metadata stays,
/// `decryption_failed` set) instead of dropping it from the index.
pub fn build_record(item: &RemoteItem, content: &RemoteContent, cfg: &TextConfig) -> IndexRecord {
    let half = build_content_half(item.subject.as_deref(), item.is_forwarded, content, cfg);

    IndexRecord {
        id: item.id.clone(),
        timepoint: item.timepoint,
        labels: item.labels.clone(),
        metadata: item.metadata.clone(),
        subject: item.subject.clone(),
        body: half.body,
        decryption_failed: half.failed,
    }
}

/// Metadata-only record: used while content indexing has not reached the
/// item yet (post-migration resume, content backfill).
pub fn build_metadata_record(item: &RemoteItem) -> IndexRecord {
    IndexRecord {
        id: item.id.clone(),
        timepoint: item.timepoint,
        labels: item.labels.clone(),
        metadata: item.metadata.clone(),
        subject: item.subject.clone(),
        body: None,
        decryption_failed: false,
    }
}
