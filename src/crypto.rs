//! Record codec for the on-disk index.
//!
//! Every record is encrypted with AES-256-GCM under a single per-user index
//! key. The index key itself is generated once, wrapped with the user's
//! long-term asymmetric key (a host-supplied primitive), and persisted in
//! the meta store. Losing the key invalidates the whole index; the only
//! recovery is a rebuild.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;

use crate::error::IndexError;
use crate::types::{
    ContentHalf, IndexRecord, MetadataHalf, SealedBlob, SearchableMetadata, StoredCiphertext,
};

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

/// Known plaintext sealed at key-creation time. Opening it verifies an
/// unwrapped key before the first record is touched.
const KEY_CHECK_PLAINTEXT: &[u8] = b"mailseal.index.key.check.v2";

/// The raw symmetric index key.
pub struct IndexKey([u8; 32]);

impl IndexKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        Self(raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let raw: [u8; 32] = raw.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Host-provided asymmetric wrap for the index key (RSA in production).
///
/// `unwrap_key` returns `None` on any failure rather than an error: a
/// missing or corrupt key blob simply means the index is unusable and must
/// be rebuilt, never a crash.
pub trait KeyWrapper: Send + Sync {
    fn wrap_key(&self, raw: &[u8]) -> Result<Vec<u8>, IndexError>;
    fn unwrap_key(&self, blob: &[u8]) -> Option<Vec<u8>>;
}

/// AES-256-GCM codec over index records.
pub struct IndexCipher {
    cipher: Aes256Gcm,
}

impl IndexCipher {
    pub fn new(key: &IndexKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.0.into()),
        }
    }

    /// Encrypt a plaintext with a fresh random nonce.
    ///
    /// Nonce reuse under one key breaks GCM, so the nonce is generated here
    /// on every call and callers never supply one.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedBlob, IndexError> {
        let mut iv = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| IndexError::Crypto(format!("AES-GCM encryption failed: {}", e)))?;

        Ok(SealedBlob { iv, ciphertext })
    }

    /// Decrypt a blob. Returns `None` on failure (wrong key, corrupt
    /// ciphertext); the failure is logged and never propagates as fatal.
    pub fn open(&self, blob: &SealedBlob) -> Option<Vec<u8>> {
        let nonce = Nonce::from_slice(&blob.iv);
        match self.cipher.decrypt(nonce, blob.ciphertext.as_slice()) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                warn!("Record decryption failed: {}", e);
                None
            }
        }
    }

    pub fn seal_metadata(&self, half: &MetadataHalf) -> Result<SealedBlob, IndexError> {
        let json = serde_json::to_vec(half)?;
        self.seal(&json)
    }

    pub fn seal_content(&self, half: &ContentHalf) -> Result<SealedBlob, IndexError> {
        let json = serde_json::to_vec(half)?;
        self.seal(&json)
    }

    /// Seal both halves of a record and assemble the on-disk row.
    pub fn seal_record(&self, record: &IndexRecord) -> Result<StoredCiphertext, IndexError> {
        let (meta_half, content_half) = record.split();
        let meta = self.seal_metadata(&meta_half)?;
        let content = Some(self.seal_content(&content_half)?);
        let byte_size = StoredCiphertext::approximate_size(&meta, content.as_ref());
        Ok(StoredCiphertext {
            id: record.id.clone(),
            timepoint: record.timepoint,
            labels: record.labels.clone(),
            meta,
            content,
            byte_size,
        })
    }

    /// Decrypt a stored row back into a record.
    ///
    /// A failed half degrades the record (`decryption_failed = true`)
    /// instead of dropping it: the clear columns (id, timepoint, labels)
    /// always survive, and an intact metadata half survives a corrupt
    /// content half.
    pub fn open_record(&self, stored: &StoredCiphertext) -> IndexRecord {
        let meta_half = self
            .open(&stored.meta)
            .and_then(|json| serde_json::from_slice::<MetadataHalf>(&json).ok());

        let (content_half, content_failed) = match &stored.content {
            None => (None, false),
            Some(blob) => match self
                .open(blob)
                .and_then(|json| serde_json::from_slice::<ContentHalf>(&json).ok())
            {
                Some(half) => (Some(half), false),
                None => (None, true),
            },
        };

        match meta_half {
            Some(meta) => {
                let mut record = IndexRecord::assemble(meta, content_half);
                record.decryption_failed |= content_failed;
                record
            }
            None => IndexRecord {
                id: stored.id.clone(),
                timepoint: stored.timepoint,
                labels: stored.labels.clone(),
                metadata: SearchableMetadata::default(),
                subject: None,
                body: None,
                decryption_failed: true,
            },
        }
    }

    /// Produce the key-check sentinel persisted next to the wrapped key.
    pub fn key_check(&self) -> Result<SealedBlob, IndexError> {
        self.seal(KEY_CHECK_PLAINTEXT)
    }

    /// Verify an unwrapped key against the persisted sentinel.
    pub fn verify_key_check(&self, blob: &SealedBlob) -> bool {
        self.open(blob).as_deref() == Some(KEY_CHECK_PLAINTEXT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, Timepoint};
    use std::collections::BTreeSet;

    fn sample_record() -> IndexRecord {
        IndexRecord {
            id: "m1".into(),
            timepoint: Timepoint::new(1700000000, 3),
            labels: ["inbox".to_string(), "work".to_string()]
                .into_iter()
                .collect(),
            metadata: SearchableMetadata {
                sender: Address::new("Ada Lovelace", "ada@example.com"),
                to: vec![Address::new("Bob", "bob@example.com")],
                cc: vec![],
                has_attachments: true,
                is_unread: false,
                size_bytes: 2048,
            },
            subject: Some("Analytical engine notes".into()),
            body: Some("the engine weaves algebraic patterns".into()),
            decryption_failed: false,
        }
    }

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = IndexCipher::new(&IndexKey::generate());
        let record = sample_record();

        let stored = cipher.seal_record(&record).unwrap();
        let opened = cipher.open_record(&stored);

        assert_eq!(opened, record);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let cipher = IndexCipher::new(&IndexKey::generate());

        let a = cipher.seal(b"same plaintext").unwrap();
        let b = cipher.seal(b"same plaintext").unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(cipher.open(&a).unwrap(), b"same plaintext");
        assert_eq!(cipher.open(&b).unwrap(), b"same plaintext");
    }

    #[test]
    fn test_wrong_key_degrades_not_crashes() {
        let cipher = IndexCipher::new(&IndexKey::generate());
        let other = IndexCipher::new(&IndexKey::generate());
        let stored = cipher.seal_record(&sample_record()).unwrap();

        let opened = other.open_record(&stored);

        assert!(opened.decryption_failed);
        assert_eq!(opened.id, "m1");
        assert_eq!(opened.timepoint, Timepoint::new(1700000000, 3));
        assert!(opened.subject.is_none());
        assert!(opened.body.is_none());
    }

    #[test]
    fn test_corrupt_content_half_keeps_metadata() {
        let cipher = IndexCipher::new(&IndexKey::generate());
        let mut stored = cipher.seal_record(&sample_record()).unwrap();

        if let Some(content) = stored.content.as_mut() {
            content.ciphertext[0] ^= 0xff;
        }

        let opened = cipher.open_record(&stored);
        assert!(opened.decryption_failed);
        assert_eq!(opened.subject.as_deref(), Some("Analytical engine notes"));
        assert!(opened.body.is_none());
    }

    #[test]
    fn test_key_check_sentinel() {
        let key = IndexKey::generate();
        let cipher = IndexCipher::new(&key);
        let check = cipher.key_check().unwrap();

        assert!(cipher.verify_key_check(&check));

        let stranger = IndexCipher::new(&IndexKey::generate());
        assert!(!stranger.verify_key_check(&check));
    }

    #[test]
    fn test_key_from_bytes_rejects_bad_length() {
        assert!(IndexKey::from_bytes(&[0u8; 16]).is_none());
        assert!(IndexKey::from_bytes(&[0u8; 32]).is_some());
    }

    struct XorWrapper;

    impl KeyWrapper for XorWrapper {
        fn wrap_key(&self, raw: &[u8]) -> Result<Vec<u8>, IndexError> {
            Ok(raw.iter().map(|b| b ^ 0x5a).collect())
        }

        fn unwrap_key(&self, blob: &[u8]) -> Option<Vec<u8>> {
            Some(blob.iter().map(|b| b ^ 0x5a).collect())
        }
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let key = IndexKey::generate();
        let wrapper = XorWrapper;

        let blob = wrapper.wrap_key(key.as_bytes()).unwrap();
        let raw = wrapper.unwrap_key(&blob).unwrap();

        assert_eq!(raw, key.as_bytes());
    }
}
