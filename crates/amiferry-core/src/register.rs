//! Rewrites the image descriptor for the destination and registers it,
//! optionally replicating tags onto the new image and snapshots.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use amiferry_common::{CloudProvider, Result, Tag};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::copy::SnapshotPair;
use crate::doc;

/// Tag key whose value may be overridden on destination resources.
pub const ENV_TAG_KEY: &str = "Env";

/// Caller-supplied name wins; otherwise the name embeds the current unix
/// timestamp so repeated runs against the same source stay distinct.
pub fn destination_name(descriptor: &Value, requested: Option<&str>) -> String {
    if let Some(name) = requested {
        return name.to_string();
    }
    let original = descriptor
        .get("Name")
        .and_then(Value::as_str)
        .unwrap_or("image");
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("Copy of {original} {timestamp}")
}

/// Produces the registrable descriptor: destination snapshot ids substituted
/// everywhere, non-transferable fields stripped at every depth, the chosen
/// name set, and ENA support re-requested when asked for.
pub fn reconcile(
    descriptor: &Value,
    pairs: &[SnapshotPair],
    name: &str,
    ena_support: bool,
) -> Value {
    let mut doc = descriptor.clone();
    doc::substitute_snapshot_ids(&mut doc, pairs);
    doc::strip_fields(&mut doc, doc::STRIPPED_FIELDS);
    doc["Name"] = json!(name);
    if ena_support {
        doc["EnaSupport"] = json!(true);
    }
    doc
}

#[derive(Clone)]
pub struct ImageReconciler {
    source: Arc<dyn CloudProvider>,
    destination: Arc<dyn CloudProvider>,
}

impl ImageReconciler {
    pub fn new(source: Arc<dyn CloudProvider>, destination: Arc<dyn CloudProvider>) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub async fn register(&self, descriptor: &Value) -> Result<String> {
        self.destination.register_image(descriptor).await
    }

    /// Copies the source tag sets of the image and each copied snapshot onto the
    /// corresponding destination resources. An override value sets or
    /// replaces the `Env` tag on every destination resource.
    #[instrument(skip_all)]
    pub async fn replicate_tags(
        &self,
        source_image: &str,
        destination_image: &str,
        pairs: &[SnapshotPair],
        env_override: Option<&str>,
    ) -> Result<()> {
        self.replicate_one(source_image, destination_image, env_override)
            .await?;
        for pair in pairs {
            self.replicate_one(&pair.source_id, &pair.destination_id, env_override)
                .await?;
        }
        Ok(())
    }

    async fn replicate_one(
        &self,
        source_resource: &str,
        destination_resource: &str,
        env_override: Option<&str>,
    ) -> Result<()> {
        let mut tags = self.source.resource_tags(source_resource).await?;
        if let Some(value) = env_override {
            match tags.iter_mut().find(|t| t.key == ENV_TAG_KEY) {
                Some(tag) => tag.value = value.to_string(),
                None => tags.push(Tag {
                    key: ENV_TAG_KEY.to_string(),
                    value: value.to_string(),
                }),
            }
        }
        if tags.is_empty() {
            return Ok(());
        }
        self.destination
            .apply_tags(destination_resource, &tags)
            .await?;
        info!(
            resource = %destination_resource,
            tags = tags.len(),
            "replicated tags"
        );
        Ok(())
    }
}
