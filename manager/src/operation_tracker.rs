//! Operation tracking for snapshot, restore, squash and cleanup runs
//!
//! Only one operation may run against a network at a time. A started operation
//! hands back an [`OperationGuard`] that releases the slot when dropped, and
//! carries a cancellation token so a stuck or unwanted run can be stopped from
//! outside.
//!
//! # Usage
//!
//! ```ignore
//! // Fails if the network is busy
//! let guard = tracker.try_start_operation("mainnet", OperationKind::Snapshot)?;
//!
//! manager.create_snapshot(id, Some(&networks), true, guard.token()).await?;
//!
//! // Slot released here
//! drop(guard);
//! ```

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Snapshot,
    Restore,
    Squash,
    Cleanup,
    Gc,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Snapshot => "snapshot",
            OperationKind::Restore => "restore",
            OperationKind::Squash => "squash",
            OperationKind::Cleanup => "cleanup",
            OperationKind::Gc => "gc",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub target: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    token: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationStatus {
    pub busy_targets: HashMap<String, ActiveOperation>,
    pub total_active: usize,
}

type ActiveMap = Arc<Mutex<HashMap<String, ActiveOperation>>>;

/// Releases the target's slot on drop
pub struct OperationGuard {
    id: Uuid,
    target: String,
    token: CancellationToken,
    active: ActiveMap,
}

impl OperationGuard {
    /// Cancelled when the operation is cancelled through the tracker
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut active = lock(&self.active);
        // A cancelled operation may already have been replaced by a new one
        let ours = active
            .get(&self.target)
            .map_or(false, |op| op.id == self.id);
        if ours {
            if let Some(op) = active.remove(&self.target) {
                let duration = Utc::now().signed_duration_since(op.started_at);
                info!(
                    "Finished operation '{}' on {} (took {}s)",
                    op.kind,
                    self.target,
                    duration.num_seconds()
                );
            }
        }
    }
}

fn lock(active: &ActiveMap) -> MutexGuard<'_, HashMap<String, ActiveOperation>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Default)]
pub struct OperationTracker {
    active_operations: ActiveMap, // target -> operation
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `target` for an operation; fails if it is already busy
    #[instrument(skip_all, fields(target = %target, operation = %kind))]
    pub fn try_start_operation(&self, target: &str, kind: OperationKind) -> Result<OperationGuard> {
        let mut active = lock(&self.active_operations);

        if let Some(current_op) = active.get(target) {
            let duration = Utc::now().signed_duration_since(current_op.started_at);
            let duration_str = if duration.num_hours() > 0 {
                format!("{}h {}m", duration.num_hours(), duration.num_minutes() % 60)
            } else {
                format!("{}m", duration.num_minutes())
            };

            return Err(anyhow!(
                "Target {} is currently busy with '{}' (started {} ago)",
                target,
                current_op.kind,
                duration_str
            ));
        }

        let operation = ActiveOperation {
            id: Uuid::new_v4(),
            kind,
            target: target.to_string(),
            started_at: Utc::now(),
            token: CancellationToken::new(),
        };
        let guard = OperationGuard {
            id: operation.id,
            target: target.to_string(),
            token: operation.token.clone(),
            active: self.active_operations.clone(),
        };

        active.insert(target.to_string(), operation);
        info!("Started operation '{}' on {}", kind, target);
        Ok(guard)
    }

    /// Cancel a running operation and free its slot
    pub fn cancel_operation(&self, target: &str) -> Result<()> {
        let mut active = lock(&self.active_operations);
        match active.remove(target) {
            Some(op) => {
                op.token.cancel();
                warn!(
                    "Cancelled operation '{}' on {} (was running for {}m)",
                    op.kind,
                    target,
                    Utc::now().signed_duration_since(op.started_at).num_minutes()
                );
                Ok(())
            }
            None => Err(anyhow!("No active operation found on {}", target)),
        }
    }

    pub fn get_operation_status(&self) -> OperationStatus {
        let active = lock(&self.active_operations);
        OperationStatus {
            busy_targets: active.clone(),
            total_active: active.len(),
        }
    }

    pub fn is_busy(&self, target: &str) -> bool {
        lock(&self.active_operations).contains_key(target)
    }

    pub fn get_active_operation(&self, target: &str) -> Option<ActiveOperation> {
        lock(&self.active_operations).get(target).cloned()
    }

    /// Cancel every operation, e.g. on shutdown
    pub fn cancel_all(&self) -> usize {
        let mut active = lock(&self.active_operations);
        let count = active.len();
        for (_, op) in active.drain() {
            op.token.cancel();
        }
        count
    }

    /// Cancel operations running longer than `max_hours`
    pub fn cleanup_old_operations(&self, max_hours: i64) -> u32 {
        let mut active = lock(&self.active_operations);
        let cutoff = Utc::now() - chrono::Duration::hours(max_hours);
        let initial_count = active.len();

        active.retain(|target, operation| {
            let should_keep = operation.started_at > cutoff;
            if !should_keep {
                operation.token.cancel();
                warn!(
                    "Cleaned up stuck operation '{}' on {} (was running for {}h)",
                    operation.kind,
                    target,
                    Utc::now().signed_duration_since(operation.started_at).num_hours()
                );
            }
            should_keep
        });

        (initial_count - active.len()) as u32
    }
}
