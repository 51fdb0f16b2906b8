//! Durable build-progress bookkeeping.

use rusqlite::{params, OptionalExtension};

use super::DbPool;
use crate::error::IndexError;
use crate::types::{BuildProgress, BuildStatus, RecoveryPoint, Timepoint};

pub fn load(pool: &DbPool) -> Result<Option<BuildProgress>, IndexError> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            "SELECT status, current_count, total_count, recovery_id, recovery_time,
                    recovery_ord, timestamps, num_pauses, original_estimate_secs
             FROM build_progress WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<i64>>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((status, current, total, rid, rtime, rord, timestamps, pauses, estimate)) = row
    else {
        return Ok(None);
    };

    let status = BuildStatus::parse(&status)
        .ok_or_else(|| IndexError::Corrupt(format!("Unknown build status '{}'", status)))?;

    let recovery_point = match (rid, rtime, rord) {
        (Some(id), Some(time), Some(ord)) => Some(RecoveryPoint {
            id,
            timepoint: Timepoint::new(time, ord as u64),
        }),
        _ => None,
    };

    Ok(Some(BuildProgress {
        status,
        current_count: current as u64,
        total_count: total as u64,
        recovery_point,
        timestamps: serde_json::from_str(&timestamps).unwrap_or_default(),
        num_pauses: pauses as u32,
        original_estimate_secs: estimate.map(|v| v as u64),
    }))
}

pub fn save(pool: &DbPool, progress: &BuildProgress) -> Result<(), IndexError> {
    let conn = pool.get()?;
    let timestamps = serde_json::to_string(&progress.timestamps)?;
    conn.execute(
        "INSERT INTO build_progress (
            id, status, current_count, total_count, recovery_id, recovery_time,
            recovery_ord, timestamps, num_pauses, original_estimate_secs
         ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            current_count = excluded.current_count,
            total_count = excluded.total_count,
            recovery_id = excluded.recovery_id,
            recovery_time = excluded.recovery_time,
            recovery_ord = excluded.recovery_ord,
            timestamps = excluded.timestamps,
            num_pauses = excluded.num_pauses,
            original_estimate_secs = excluded.original_estimate_secs",
        params![
            progress.status.as_str(),
            progress.current_count as i64,
            progress.total_count as i64,
            progress.recovery_point.as_ref().map(|r| r.id.clone()),
            progress.recovery_point.as_ref().map(|r| r.timepoint.time),
            progress
                .recovery_point
                .as_ref()
                .map(|r| r.timepoint.order as i64),
            timestamps,
            progress.num_pauses as i64,
            progress.original_estimate_secs.map(|v| v as i64),
        ],
    )?;
    Ok(())
}

pub fn clear(pool: &DbPool) -> Result<(), IndexError> {
    let conn = pool.get()?;
    conn.execute("DELETE FROM build_progress WHERE id = 1", [])?;
    Ok(())
}
