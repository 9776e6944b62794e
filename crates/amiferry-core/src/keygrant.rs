//! Grants the destination account access to the source-side encryption keys.

use std::collections::BTreeSet;
use std::sync::Arc;

use amiferry_common::{AmiError, CloudProvider, KeyManager, Result, RunContext};
use serde_json::Value;
use tracing::{info, instrument};

use crate::doc;

#[derive(Clone)]
pub struct KeyGrantManager {
    source: Arc<dyn CloudProvider>,
}

impl KeyGrantManager {
    pub fn new(source: Arc<dyn CloudProvider>) -> Self {
        Self { source }
    }

    /// Issues one grant per distinct customer-managed key referenced by the
    /// image's snapshots. Unencrypted images need no grants. A snapshot
    /// encrypted under a provider-default key aborts the run: such keys
    /// cannot be shared cross-account.
    #[instrument(skip_all)]
    pub async fn grant_destination_access(
        &self,
        descriptor: &Value,
        ctx: &RunContext,
    ) -> Result<()> {
        let snapshot_ids = doc::device_snapshot_ids(descriptor);
        if snapshot_ids.is_empty() {
            return Ok(());
        }

        let snapshots = self.source.describe_snapshots(&snapshot_ids).await?;
        let keys: BTreeSet<String> = snapshots
            .into_iter()
            .filter(|s| s.encrypted)
            .filter_map(|s| s.kms_key_id)
            .collect();
        if keys.is_empty() {
            info!("no encrypted snapshots, skipping key grants");
            return Ok(());
        }

        for key_id in keys {
            let key = self.source.describe_key(&key_id).await?;
            if key.manager != KeyManager::Customer {
                return Err(AmiError::UnsupportedKey(format!(
                    "snapshot encryption key {key_id} is provider-managed and cannot \
                     be shared with another account"
                )));
            }
            self.source
                .grant_key_access(&key_id, &ctx.destination_account)
                .await?;
            info!(key = %key_id, grantee = %ctx.destination_account, "issued key grant");
        }
        Ok(())
    }
}
