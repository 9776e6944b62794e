//! Fans out re-encrypting snapshot copies under an admission-control gate.

use std::sync::Arc;
use std::time::Duration;

use amiferry_common::{CloudProvider, Result, RunContext};
use tracing::{info, instrument, warn};

use crate::poll::poll_until;

/// Copies are not initiated while this many destination-region snapshots
/// are still pending. Best effort only: the provider may process more
/// concurrently once initiation is allowed.
pub const MAX_INFLIGHT_COPIES: usize = 5;

/// Interval between re-checks while the gate is closed.
pub const GATE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Ordered source/destination id pair; index i of the recorded list always
/// corresponds to device mapping i of the source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPair {
    pub source_id: String,
    pub destination_id: String,
}

#[derive(Clone)]
pub struct SnapshotCopier {
    source: Arc<dyn CloudProvider>,
    destination: Arc<dyn CloudProvider>,
}

impl SnapshotCopier {
    pub fn new(source: Arc<dyn CloudProvider>, destination: Arc<dyn CloudProvider>) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Initiates one copy per snapshot in document order: wait for gate
    /// capacity, share the source snapshot with the destination account
    /// (unless the source is a shared account we hold no credentials for),
    /// then start the asynchronous copy. Any failure aborts the run; copies
    /// already started are left in flight.
    #[instrument(skip_all, fields(snapshots = snapshot_ids.len()))]
    pub async fn copy_all(
        &self,
        snapshot_ids: &[String],
        ctx: &RunContext,
        encryption_key: Option<&str>,
    ) -> Result<Vec<SnapshotPair>> {
        let mut pairs = Vec::with_capacity(snapshot_ids.len());
        for snapshot_id in snapshot_ids {
            self.wait_for_capacity().await?;

            if !ctx.shared_source {
                self.source
                    .allow_snapshot_access(snapshot_id, &ctx.destination_account)
                    .await?;
            }

            let description = format!(
                "Copied from {snapshot_id} ({region})",
                region = ctx.source_region
            );
            let destination_id = self
                .destination
                .copy_snapshot(
                    &ctx.source_region,
                    snapshot_id,
                    encryption_key.map(str::to_string),
                    &description,
                )
                .await?;
            info!(source = %snapshot_id, destination = %destination_id, "snapshot copy started");
            pairs.push(SnapshotPair {
                source_id: snapshot_id.clone(),
                destination_id,
            });
        }
        Ok(pairs)
    }

    async fn wait_for_capacity(&self) -> Result<()> {
        let destination = &self.destination;
        poll_until(GATE_POLL_INTERVAL, move || async move {
            let pending = destination.pending_snapshot_count().await?;
            if pending < MAX_INFLIGHT_COPIES {
                Ok(Some(()))
            } else {
                warn!(pending, "too many pending snapshot copies, waiting");
                Ok(None)
            }
        })
        .await
    }
}
