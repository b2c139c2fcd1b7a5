//! Orphan recovery for claims whose owner stopped heartbeating.
//!
//! Opt-in: only runs when a lease timeout is configured. A claim is reaped
//! when it is older than the timeout and its owner's heartbeat is missing
//! or equally old. Reaping goes through `retry_or_fail`, so the rename race
//! decides between concurrent reapers and the owner finishing late.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::heartbeat::HeartbeatRegistry;
use crate::tasks::{Resolution, Stage, TaskStore};

/// Error recorded on reaped attempts.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Recycle expired claims in `active/`. Returns how many were recycled.
pub async fn reap_orphans(
    store: &TaskStore,
    heartbeats: &HeartbeatRegistry,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
    let mut active = store.scan(Stage::Active).await?;
    let mut reaped = 0;

    while let Some(task_ref) = active.next().await {
        let record = match store.load(&task_ref).await {
            Ok(r) => r,
            Err(e) => {
                debug!(path = %task_ref.path.display(), error = %e, "Skipping active record");
                continue;
            }
        };

        let Some(claimed_at) = record.claimed_at else {
            continue;
        };
        if now.signed_duration_since(claimed_at) <= timeout {
            continue;
        }

        let owner_alive = match record.claimed_by.as_deref() {
            Some(owner) => heartbeats
                .read(owner)
                .await
                .ok()
                .flatten()
                .is_some_and(|hb| !hb.is_stale(now, timeout)),
            None => false,
        };
        if owner_alive {
            continue;
        }

        match store.retry_or_fail(&task_ref, LEASE_EXPIRED).await {
            Ok(resolution) => {
                reaped += 1;
                let outcome = match resolution {
                    Resolution::Retried { .. } => "retried",
                    Resolution::Failed { .. } => "failed",
                };
                info!(
                    task_id = %record.id,
                    owner = record.claimed_by.as_deref().unwrap_or("unknown"),
                    outcome,
                    "Reaped orphaned claim"
                );
            }
            Err(e) if e.is_transient() => {
                debug!(task_id = %record.id, error = %e, "Orphan already moved");
            }
            Err(e) => warn!(task_id = %record.id, error = %e, "Failed to reap orphan"),
        }
    }
    Ok(reaped)
}
