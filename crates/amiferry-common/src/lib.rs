// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmiError {
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Authorization Error: {0}")]
    Authorization(String),

    #[error("Unsupported Key: {0}")]
    UnsupportedKey(String),

    #[error("Provisioning Error: {0}")]
    Provisioning(String),

    #[error("Copy Failed: {0}")]
    CopyFailed(String),

    #[error("Registration Error: {0}")]
    Registration(String),
}

// Define the primary Result type for copy operations
pub type Result<T> = std::result::Result<T, AmiError>;

/// How the source account is identified. A raw account id means the image
/// was already shared with the destination and no source credentials exist,
/// so source-side mutations are skipped and reads go through the
/// destination's visibility into the shared resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Profile(String),
    SharedAccount(String),
}

impl SourceSpec {
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::SharedAccount(_))
    }
}

/// Resolved accounts and regions, threaded explicitly through every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub source_account: String,
    pub destination_account: String,
    pub source_region: String,
    pub destination_region: String,
    pub shared_source: bool,
}

/// Caller options for a single image copy.
#[derive(Debug, Clone, Default)]
pub struct CopyRequest {
    pub image_id: String,
    pub name: Option<String>,
    /// Destination KMS key for re-encryption; absent means the destination
    /// account's default EBS key.
    pub encryption_key: Option<String>,
    pub ena_support: bool,
    pub copy_tags: bool,
    /// Replacement value for the "Env" tag, only honored with `copy_tags`.
    pub env_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyState {
    Pending,
    Completed,
    Error,
}

impl Display for CopyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time view of one in-flight snapshot copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyProgress {
    pub percent: u8,
    pub state: CopyState,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyManager {
    /// Provider-default key; cannot be shared cross-account.
    Aws,
    Customer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key_id: String,
    pub manager: KeyManager,
    pub enabled: bool,
}

/// Operation set granted to the destination account on each source key.
pub const GRANT_OPERATIONS: [&str; 3] = ["DescribeKey", "Decrypt", "CreateGrant"];

/// One provider instance is bound to a single account/region pair; the
/// pipeline holds one for the source side and one for the destination side.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Region this provider is bound to.
    fn region(&self) -> &str;

    /// Account id owning this provider's credentials.
    async fn account_id(&self) -> Result<String>;

    /// Fetch an image descriptor as a generic JSON tree. Field names follow
    /// the provider's wire casing (`ImageId`, `BlockDeviceMappings`, ...).
    async fn describe_image(&self, image_id: &str) -> Result<Value>;

    async fn describe_snapshots(&self, snapshot_ids: &[String]) -> Result<Vec<SnapshotInfo>>;

    /// Number of snapshots currently in `pending` state in this region.
    async fn pending_snapshot_count(&self) -> Result<usize>;

    async fn describe_key(&self, key_id: &str) -> Result<KeyInfo>;

    /// Grant the destination account `GRANT_OPERATIONS` on a key.
    async fn grant_key_access(&self, key_id: &str, grantee_account: &str) -> Result<()>;

    /// Allow another account to create volumes from a snapshot.
    async fn allow_snapshot_access(&self, snapshot_id: &str, account_id: &str) -> Result<()>;

    /// Start an asynchronous re-encrypting copy into this provider's region.
    /// Returns the destination snapshot id immediately.
    async fn copy_snapshot(
        &self,
        source_region: &str,
        source_snapshot_id: &str,
        encryption_key: Option<String>,
        description: &str,
    ) -> Result<String>;

    async fn snapshot_progress(&self, snapshot_id: &str) -> Result<CopyProgress>;

    /// Block until the snapshot reaches the completed state.
    async fn wait_snapshot_completed(&self, snapshot_id: &str) -> Result<()>;

    /// Register a reconciled descriptor, returning the new image id.
    async fn register_image(&self, descriptor: &Value) -> Result<String>;

    async fn resource_tags(&self, resource_id: &str) -> Result<Vec<Tag>>;

    async fn apply_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<()>;
}
