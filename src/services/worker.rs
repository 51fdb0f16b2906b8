//! Single-worker dispatch: one unit of work per tick.
//!
//! Migration, build, and sync never interleave. A migration that still
//! needs to run blocks everything else; an unfinished build runs before
//! any event processing; queued sync signals drain only once the index is
//! usable. Hosts call `tick` from their scheduling loop.

use tracing::{debug, warn};

use crate::adapters::sqlite::progress;
use crate::error::IndexError;
use crate::remote::MailboxRemote;
use crate::services::indexer::{self, BuildMode, BuildOutcome};
use crate::services::migration;
use crate::services::sync::SyncEngine;
use crate::state::Session;
use crate::types::BuildStatus;

/// Run one unit of work. Returns true if work was done.
pub async fn tick(
    session: &Session,
    remote: &dyn MailboxRemote,
    sync: &mut SyncEngine,
) -> Result<bool, IndexError> {
    if !session.is_enabled() {
        debug!("Index disabled; worker idle");
        return Ok(false);
    }

    if migration::needs_migration(&session.pool)? {
        let outcome = migration::run_migration(session, remote).await?;
        debug!(
            "Migration tick: {} migrated, completed: {}",
            outcome.migrated, outcome.completed
        );
        return Ok(true);
    }

    match progress::load(&session.pool)?.map(|p| p.status) {
        Some(BuildStatus::Failed) => {
            warn!("Index build previously failed; waiting for a rebuild");
            return Ok(false);
        }
        Some(BuildStatus::Active) => {}
        Some(BuildStatus::Paused) if session.is_paused() => {
            // User-paused build: keep the index current through events.
        }
        _ => {
            let outcome = indexer::run_build(session, remote, BuildMode::Full).await?;
            return Ok(!matches!(outcome, BuildOutcome::AlreadyComplete));
        }
    }

    let outcome = sync.run_pending(session, remote).await?;
    Ok(outcome.map(|o| o.did_work()).unwrap_or(false))
}
