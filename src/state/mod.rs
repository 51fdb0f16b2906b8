//! Per-user session state.
//!
//! One logical worker per session: build, sync, and migration are mutually
//! exclusive, enforced by an explicit stage guard instead of ambient global
//! flags. All stage entry points take the session by reference, so every
//! piece of mutable state has one obvious owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::adapters::sqlite::{meta, DbPool, StoreConfig};
use crate::cache::{BoundedCache, CacheConfig};
use crate::crypto::IndexCipher;
use crate::error::IndexError;
use crate::services::helpers::html_text::TextConfig;
use crate::services::indexer::BuilderConfig;
use crate::services::sync::SyncConfig;

/// Cancellation signal shared with long-running stages. Cancelling lets the
/// in-flight batch commit; no further pages are fetched.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The stage currently holding the single worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Building,
    Syncing,
    Migrating,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Building => "building",
            Stage::Syncing => "syncing",
            Stage::Migrating => "migrating",
        }
    }
}

/// Everything one user session owns: pool, cipher, configuration, cache,
/// runtime flags, and the stage guard.
pub struct Session {
    pub pool: DbPool,
    pub cipher: IndexCipher,
    pub store: StoreConfig,
    pub builder: BuilderConfig,
    pub sync: SyncConfig,
    pub cache_cfg: CacheConfig,
    pub text: TextConfig,
    pub cancel: CancelToken,
    cache: Mutex<BoundedCache>,
    stage: Mutex<Stage>,
    paused: AtomicBool,
    enabled: AtomicBool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: DbPool,
        cipher: IndexCipher,
        store: StoreConfig,
        builder: BuilderConfig,
        sync: SyncConfig,
        cache_cfg: CacheConfig,
        text: TextConfig,
        cache: BoundedCache,
    ) -> Result<Self, IndexError> {
        let paused = meta::get_bool(&pool, meta::KEY_BUILD_PAUSED)?;
        let enabled = meta::get_string(&pool, meta::KEY_INDEX_ENABLED)?
            .map(|v| v == "1")
            .unwrap_or(true);

        Ok(Self {
            pool,
            cipher,
            store,
            builder,
            sync,
            cache_cfg,
            text,
            cancel: CancelToken::new(),
            cache: Mutex::new(cache),
            stage: Mutex::new(Stage::Idle),
            paused: AtomicBool::new(paused),
            enabled: AtomicBool::new(enabled),
        })
    }

    /// Claim the worker slot for a stage. Fails with `StageBusy` when
    /// another stage holds it; callers queue their work instead of
    /// interleaving writes.
    pub fn try_begin(&self, stage: Stage) -> Result<StageToken<'_>, IndexError> {
        let mut current = self.stage.lock().expect("stage lock poisoned");
        if *current != Stage::Idle {
            return Err(IndexError::StageBusy(current.name()));
        }
        *current = stage;
        debug!("Stage started: {}", stage.name());
        Ok(StageToken { session: self })
    }

    pub fn current_stage(&self) -> Stage {
        *self.stage.lock().expect("stage lock poisoned")
    }

    /// Run a closure against the cache. The lock is never held across an
    /// await point; stages batch their cache mutations through this.
    pub fn with_cache<T>(&self, f: impl FnOnce(&mut BoundedCache) -> T) -> T {
        let mut cache = self.cache.lock().expect("cache lock poisoned");
        f(&mut cache)
    }

    pub fn cache_guard(&self) -> MutexGuard<'_, BoundedCache> {
        self.cache.lock().expect("cache lock poisoned")
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) -> Result<(), IndexError> {
        self.paused.store(paused, Ordering::SeqCst);
        meta::set_bool(&self.pool, meta::KEY_BUILD_PAUSED, paused)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), IndexError> {
        self.enabled.store(enabled, Ordering::SeqCst);
        meta::set_bool(&self.pool, meta::KEY_INDEX_ENABLED, enabled)
    }
}

/// Releases the worker slot on drop, so early returns and `?` cannot leave
/// the session wedged in a stage.
pub struct StageToken<'a> {
    session: &'a Session,
}

impl Drop for StageToken<'_> {
    fn drop(&mut self) {
        let mut current = self.session.stage.lock().expect("stage lock poisoned");
        debug!("Stage finished: {}", current.name());
        *current = Stage::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_memory_pool, schema};
    use crate::crypto::IndexKey;

    fn session() -> Session {
        let pool = create_memory_pool().unwrap();
        schema::initialize_schema(&pool.get().unwrap()).unwrap();
        Session::new(
            pool,
            IndexCipher::new(&IndexKey::generate()),
            StoreConfig::default(),
            BuilderConfig::default(),
            SyncConfig::default(),
            CacheConfig::default(),
            TextConfig::default(),
            BoundedCache::new(1024),
        )
        .unwrap()
    }

    #[test]
    fn test_stages_are_mutually_exclusive() {
        let session = session();

        let token = session.try_begin(Stage::Building).unwrap();
        assert_eq!(session.current_stage(), Stage::Building);

        assert!(matches!(
            session.try_begin(Stage::Syncing),
            Err(IndexError::StageBusy("building"))
        ));

        drop(token);
        assert_eq!(session.current_stage(), Stage::Idle);
        let _token = session.try_begin(Stage::Syncing).unwrap();
    }

    #[test]
    fn test_pause_flag_is_persisted() {
        let session = session();
        assert!(!session.is_paused());

        session.set_paused(true).unwrap();
        assert!(session.is_paused());
        assert!(meta::get_bool(&session.pool, meta::KEY_BUILD_PAUSED).unwrap());
    }

    #[test]
    fn test_enabled_defaults_to_true() {
        let session = session();
        assert!(session.is_enabled());
        session.set_enabled(false).unwrap();
        assert!(!session.is_enabled());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!token.is_cancelled());
    }
}
