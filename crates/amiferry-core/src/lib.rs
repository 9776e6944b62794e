//! Pipeline that copies a machine image and its backing snapshots into
//! another account/region, re-encrypting the snapshots along the way.
//!
//! Stages run strictly in order: resolve accounts/regions, grant the
//! destination access to source encryption keys, fan out snapshot copies
//! under an admission gate, poll the copies to completion, then rewrite and
//! register the image descriptor (optionally replicating tags). Every error
//! is fatal; nothing created before the failure is rolled back.

use std::sync::Arc;

use amiferry_common::{CloudProvider, CopyRequest, Result, SourceSpec};
use tracing::{info, instrument};

pub mod copy;
pub mod doc;
pub mod keygrant;
pub mod poll;
pub mod register;
pub mod resolve;

pub use amiferry_common as common;
pub use copy::{SnapshotCopier, SnapshotPair};
pub use keygrant::KeyGrantManager;
pub use poll::CompletionPoller;
pub use register::ImageReconciler;

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub image_id: String,
    pub snapshots: Vec<SnapshotPair>,
}

#[derive(Clone)]
pub struct Pipeline {
    source: Arc<dyn CloudProvider>,
    destination: Arc<dyn CloudProvider>,
}

impl Pipeline {
    pub fn new(source: Arc<dyn CloudProvider>, destination: Arc<dyn CloudProvider>) -> Self {
        Self {
            source,
            destination,
        }
    }

    #[instrument(skip_all, fields(image = %request.image_id))]
    pub async fn run(&self, spec: &SourceSpec, request: &CopyRequest) -> Result<CopyOutcome> {
        let ctx =
            resolve::resolve(self.source.as_ref(), self.destination.as_ref(), spec).await?;
        info!(
            source_account = %ctx.source_account,
            destination_account = %ctx.destination_account,
            source_region = %ctx.source_region,
            destination_region = %ctx.destination_region,
            shared_source = ctx.shared_source,
            "resolved accounts and regions"
        );

        let descriptor = self.source.describe_image(&request.image_id).await?;

        if ctx.shared_source {
            // No source credentials: key grants must already be in place on
            // the sharing side.
            info!("shared-account source, skipping key grant stage");
        } else {
            KeyGrantManager::new(self.source.clone())
                .grant_destination_access(&descriptor, &ctx)
                .await?;
        }

        let snapshot_ids = doc::device_snapshot_ids(&descriptor);
        let pairs = SnapshotCopier::new(self.source.clone(), self.destination.clone())
            .copy_all(&snapshot_ids, &ctx, request.encryption_key.as_deref())
            .await?;

        CompletionPoller::new(self.destination.clone())
            .wait_all(&pairs)
            .await?;

        let name = register::destination_name(&descriptor, request.name.as_deref());
        let reconciled = register::reconcile(&descriptor, &pairs, &name, request.ena_support);
        let reconciler = ImageReconciler::new(self.source.clone(), self.destination.clone());
        let image_id = reconciler.register(&reconciled).await?;
        info!(%image_id, name = %name, "registered destination image");

        if request.copy_tags {
            reconciler
                .replicate_tags(
                    &request.image_id,
                    &image_id,
                    &pairs,
                    request.env_override.as_deref(),
                )
                .await?;
        }

        Ok(CopyOutcome {
            image_id,
            snapshots: pairs,
        })
    }
}
