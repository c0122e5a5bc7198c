/// Status & History Log
///
/// One status row per currency keyspace answers "where did we stop?";
/// the append-only history records every committed batch. `validate`
/// checks the monotonicity invariants the coordinator relies on for
/// resume.

use tracing::warn;

use crate::error::UpdateError;
use crate::transformed_store::TransformedStore;
use crate::types::{DeltaUpdaterHistory, DeltaUpdaterStatus};

/// Where the next batch starts: `last_synced_block` of the status row, or
/// -1 for a keyspace that has never been updated.
pub fn last_synced_block(store: &TransformedStore) -> Result<i64, UpdateError> {
    Ok(store
        .get_status()?
        .map(|s| s.last_synced_block)
        .unwrap_or(-1))
}

/// Seed for the id allocator. Prefers the status row; falls back to a
/// one-off index scan for keyspaces written before status tracking.
pub fn highest_address_id(store: &TransformedStore) -> Result<i32, UpdateError> {
    match store.get_status()? {
        Some(status) => Ok(status.highest_address_id),
        None => store.scan_highest_address_id(),
    }
}

pub fn build_status(
    keyspace_name: &str,
    last_synced_block: i64,
    last_synced_block_timestamp: i64,
    highest_address_id: i32,
    write_new: bool,
    write_dirty: bool,
    runtime_seconds: f64,
) -> DeltaUpdaterStatus {
    DeltaUpdaterStatus {
        keyspace_name: keyspace_name.to_string(),
        last_synced_block,
        last_synced_block_timestamp,
        highest_address_id,
        timestamp: now_epoch(),
        write_new,
        write_dirty,
        runtime_seconds,
    }
}

pub fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Verify the history invariants: strictly increasing
/// `last_synced_block`, no duplicates, weakly monotone timestamps, and
/// agreement between the newest history row and the status row.
///
/// `allow_missing_history` tolerates keyspaces transformed before history
/// was recorded (a status row with no history rows).
pub fn validate_history(
    store: &TransformedStore,
    allow_missing_history: bool,
) -> Result<Vec<DeltaUpdaterHistory>, UpdateError> {
    let history = store.get_history()?;
    let status = store.get_status()?;

    if history.is_empty() {
        return match status {
            Some(_) if !allow_missing_history => Err(UpdateError::invariant(
                "status row exists but history is empty",
            )),
            Some(_) => {
                warn!("history is empty for an updated keyspace (tolerated by config)");
                Ok(history)
            }
            None => Ok(history),
        };
    }

    for pair in history.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if b.last_synced_block == a.last_synced_block {
            return Err(UpdateError::invariant(format!(
                "duplicate history row for block {}",
                a.last_synced_block
            )));
        }
        if b.last_synced_block < a.last_synced_block {
            return Err(UpdateError::invariant(format!(
                "history not monotone: block {} follows {}",
                b.last_synced_block, a.last_synced_block
            )));
        }
        if b.timestamp < a.timestamp {
            return Err(UpdateError::invariant(format!(
                "history timestamps not monotone at block {}",
                b.last_synced_block
            )));
        }
    }

    if let Some(status) = status {
        let newest = history.last().unwrap();
        if newest.last_synced_block != status.last_synced_block {
            return Err(UpdateError::invariant(format!(
                "status row at block {} disagrees with newest history row {}",
                status.last_synced_block, newest.last_synced_block
            )));
        }
    }

    Ok(history)
}
