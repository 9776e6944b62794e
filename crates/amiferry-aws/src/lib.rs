//! AWS binding for the copy pipeline: EC2 for images/snapshots, KMS for
//! key grants, STS for identity, all configured from a credential profile.

use std::time::Duration;

use amiferry_common::{
    AmiError, CloudProvider, CopyProgress, CopyState, KeyInfo, KeyManager, Result, SnapshotInfo,
    Tag,
};
use async_trait::async_trait;
use aws_config::meta::region::ProvideRegion;
use aws_config::profile::ProfileFileRegionProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::client::Waiters;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, Image, OperationType, SnapshotAttributeName,
    SnapshotState, Tag as Ec2Tag, VolumeType,
};
use aws_sdk_kms::types::{GrantOperation, KeyManagerType};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

/// Upper bound on the final confirmation wait per snapshot.
const SNAPSHOT_WAIT_MAX: Duration = Duration::from_secs(3600);

pub struct AwsProvider {
    ec2: aws_sdk_ec2::Client,
    kms: aws_sdk_kms::Client,
    sts: aws_sdk_sts::Client,
    region: String,
}

impl AwsProvider {
    /// Builds a provider bound to `profile`, using the explicit region when
    /// given and the profile's configured default otherwise.
    #[instrument(skip_all, fields(profile = %profile))]
    pub async fn from_profile(profile: &str, region: Option<String>) -> Result<Self> {
        let region = match region {
            Some(r) => Region::new(r),
            None => ProfileFileRegionProvider::builder()
                .profile_name(profile)
                .build()
                .region()
                .await
                .ok_or_else(|| {
                    AmiError::Configuration(format!(
                        "no region configured for profile {profile} and none supplied"
                    ))
                })?,
        };
        debug!(region = %region, "loading AWS configuration");
        let config = aws_config::defaults(BehaviorVersion::latest())
            .profile_name(profile)
            .region(region.clone())
            .load()
            .await;
        Ok(Self::from_sdk_config(&config, region.to_string()))
    }

    pub fn from_sdk_config(config: &SdkConfig, region: String) -> Self {
        Self {
            ec2: aws_sdk_ec2::Client::new(config),
            kms: aws_sdk_kms::Client::new(config),
            sts: aws_sdk_sts::Client::new(config),
            region,
        }
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn region(&self) -> &str {
        &self.region
    }

    async fn account_id(&self) -> Result<String> {
        let identity = self.sts.get_caller_identity().send().await.map_err(|e| {
            AmiError::Authorization(format!(
                "GetCallerIdentity failed: {}",
                DisplayErrorContext(&e)
            ))
        })?;
        identity
            .account()
            .map(str::to_string)
            .ok_or_else(|| AmiError::Authorization("caller identity has no account id".into()))
    }

    async fn describe_image(&self, image_id: &str) -> Result<Value> {
        let output = self
            .ec2
            .describe_images()
            .image_ids(image_id)
            .send()
            .await
            .map_err(|e| {
                AmiError::Provisioning(format!(
                    "DescribeImages failed for {image_id}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        let image = output
            .images()
            .first()
            .ok_or_else(|| AmiError::Provisioning(format!("image {image_id} not found")))?;
        Ok(image_to_descriptor(image))
    }

    async fn describe_snapshots(&self, snapshot_ids: &[String]) -> Result<Vec<SnapshotInfo>> {
        let output = self
            .ec2
            .describe_snapshots()
            .set_snapshot_ids(Some(snapshot_ids.to_vec()))
            .send()
            .await
            .map_err(|e| {
                AmiError::Provisioning(format!(
                    "DescribeSnapshots failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(output
            .snapshots()
            .iter()
            .map(|s| SnapshotInfo {
                snapshot_id: s.snapshot_id().unwrap_or_default().to_string(),
                encrypted: s.encrypted().unwrap_or(false),
                kms_key_id: s.kms_key_id().map(str::to_string),
            })
            .collect())
    }

    async fn pending_snapshot_count(&self) -> Result<usize> {
        let output = self
            .ec2
            .describe_snapshots()
            .owner_ids("self")
            .filters(
                Filter::builder()
                    .name("status")
                    .values("pending")
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                AmiError::Provisioning(format!(
                    "DescribeSnapshots (pending) failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(output.snapshots().len())
    }

    async fn describe_key(&self, key_id: &str) -> Result<KeyInfo> {
        let output = self
            .kms
            .describe_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| {
                AmiError::Authorization(format!(
                    "DescribeKey failed for {key_id}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        let metadata = output
            .key_metadata()
            .ok_or_else(|| AmiError::Authorization(format!("key {key_id} has no metadata")))?;
        let manager = match metadata.key_manager() {
            Some(KeyManagerType::Customer) => KeyManager::Customer,
            _ => KeyManager::Aws,
        };
        Ok(KeyInfo {
            key_id: key_id.to_string(),
            manager,
            enabled: metadata.enabled(),
        })
    }

    async fn grant_key_access(&self, key_id: &str, grantee_account: &str) -> Result<()> {
        self.kms
            .create_grant()
            .key_id(key_id)
            .grantee_principal(format!("arn:aws:iam::{grantee_account}:root"))
            .operations(GrantOperation::DescribeKey)
            .operations(GrantOperation::Decrypt)
            .operations(GrantOperation::CreateGrant)
            .send()
            .await
            .map_err(|e| {
                AmiError::Authorization(format!(
                    "CreateGrant failed for {key_id}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn allow_snapshot_access(&self, snapshot_id: &str, account_id: &str) -> Result<()> {
        self.ec2
            .modify_snapshot_attribute()
            .snapshot_id(snapshot_id)
            .attribute(SnapshotAttributeName::CreateVolumePermission)
            .operation_type(OperationType::Add)
            .user_ids(account_id)
            .send()
            .await
            .map_err(|e| {
                AmiError::Provisioning(format!(
                    "ModifySnapshotAttribute failed for {snapshot_id}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn copy_snapshot(
        &self,
        source_region: &str,
        source_snapshot_id: &str,
        encryption_key: Option<String>,
        description: &str,
    ) -> Result<String> {
        let output = self
            .ec2
            .copy_snapshot()
            .source_region(source_region)
            .source_snapshot_id(source_snapshot_id)
            .encrypted(true)
            .set_kms_key_id(encryption_key)
            .description(description)
            .send()
            .await
            .map_err(|e| {
                AmiError::Provisioning(format!(
                    "CopySnapshot failed for {source_snapshot_id}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        output
            .snapshot_id()
            .map(str::to_string)
            .ok_or_else(|| {
                AmiError::Provisioning(format!(
                    "CopySnapshot for {source_snapshot_id} returned no snapshot id"
                ))
            })
    }

    async fn snapshot_progress(&self, snapshot_id: &str) -> Result<CopyProgress> {
        let output = self
            .ec2
            .describe_snapshots()
            .snapshot_ids(snapshot_id)
            .send()
            .await
            .map_err(|e| {
                AmiError::CopyFailed(format!(
                    "DescribeSnapshots failed for {snapshot_id}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        let snapshot = output
            .snapshots()
            .first()
            .ok_or_else(|| AmiError::CopyFailed(format!("snapshot {snapshot_id} not found")))?;
        let state = match snapshot.state() {
            Some(SnapshotState::Completed) => CopyState::Completed,
            Some(SnapshotState::Error) => CopyState::Error,
            _ => CopyState::Pending,
        };
        Ok(CopyProgress {
            percent: parse_progress(snapshot.progress()),
            state,
            message: snapshot.state_message().map(str::to_string),
        })
    }

    async fn wait_snapshot_completed(&self, snapshot_id: &str) -> Result<()> {
        self.ec2
            .wait_until_snapshot_completed()
            .snapshot_ids(snapshot_id)
            .wait(SNAPSHOT_WAIT_MAX)
            .await
            .map_err(|e| {
                AmiError::CopyFailed(format!(
                    "wait for snapshot {snapshot_id} completion failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn register_image(&self, descriptor: &Value) -> Result<String> {
        let doc: RegisterDoc = serde_json::from_value(descriptor.clone()).map_err(|e| {
            AmiError::Registration(format!("descriptor not registrable: {e}"))
        })?;
        let mut request = self
            .ec2
            .register_image()
            .name(doc.name.clone())
            .set_description(doc.description.clone())
            .set_architecture(doc.architecture.as_deref().map(Into::into))
            .set_root_device_name(doc.root_device_name.clone())
            .set_virtualization_type(doc.virtualization_type.clone())
            .set_sriov_net_support(doc.sriov_net_support.clone())
            .set_boot_mode(doc.boot_mode.as_deref().map(Into::into))
            .set_ena_support(doc.ena_support);
        for mapping in &doc.block_device_mappings {
            request = request.block_device_mappings(mapping.to_sdk());
        }
        let output = request.send().await.map_err(|e| {
            AmiError::Registration(format!(
                "RegisterImage failed for {}: {}",
                doc.name,
                DisplayErrorContext(&e)
            ))
        })?;
        output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| AmiError::Registration("RegisterImage returned no image id".into()))
    }

    async fn resource_tags(&self, resource_id: &str) -> Result<Vec<Tag>> {
        let output = self
            .ec2
            .describe_tags()
            .filters(
                Filter::builder()
                    .name("resource-id")
                    .values(resource_id)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                AmiError::Registration(format!(
                    "DescribeTags failed for {resource_id}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(output
            .tags()
            .iter()
            .filter_map(|t| match (t.key(), t.value()) {
                (Some(key), Some(value)) => Some(Tag {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
                _ => None,
            })
            .collect())
    }

    async fn apply_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<()> {
        let sdk_tags: Vec<Ec2Tag> = tags
            .iter()
            .map(|t| {
                Ec2Tag::builder()
                    .key(t.key.clone())
                    .value(t.value.clone())
                    .build()
            })
            .collect();
        self.ec2
            .create_tags()
            .resources(resource_id)
            .set_tags(Some(sdk_tags))
            .send()
            .await
            .map_err(|e| {
                AmiError::Registration(format!(
                    "CreateTags failed for {resource_id}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}

fn parse_progress(progress: Option<&str>) -> u8 {
    progress
        .unwrap_or("0")
        .trim_end_matches('%')
        .parse()
        .unwrap_or(0)
}

/// Flattens an SDK image into the PascalCase JSON tree the pipeline
/// rewrites. Only fields present on the source image are emitted.
fn image_to_descriptor(image: &Image) -> Value {
    let mut map = Map::new();
    put_str(&mut map, "ImageId", image.image_id());
    put_str(&mut map, "Name", image.name());
    put_str(&mut map, "Description", image.description());
    put_str(&mut map, "Architecture", image.architecture().map(|v| v.as_str()));
    put_str(&mut map, "CreationDate", image.creation_date());
    put_str(&mut map, "ImageLocation", image.image_location());
    put_str(&mut map, "OwnerId", image.owner_id());
    put_str(&mut map, "Platform", image.platform().map(|v| v.as_str()));
    put_str(&mut map, "PlatformDetails", image.platform_details());
    put_str(&mut map, "UsageOperation", image.usage_operation());
    put_str(&mut map, "State", image.state().map(|v| v.as_str()));
    put_str(&mut map, "ImageType", image.image_type().map(|v| v.as_str()));
    put_str(&mut map, "RootDeviceName", image.root_device_name());
    put_str(&mut map, "RootDeviceType", image.root_device_type().map(|v| v.as_str()));
    put_str(&mut map, "VirtualizationType", image.virtualization_type().map(|v| v.as_str()));
    put_str(&mut map, "Hypervisor", image.hypervisor().map(|v| v.as_str()));
    put_str(&mut map, "SriovNetSupport", image.sriov_net_support());
    put_str(&mut map, "BootMode", image.boot_mode().map(|v| v.as_str()));
    put_bool(&mut map, "Public", image.public());
    put_bool(&mut map, "EnaSupport", image.ena_support());

    let product_codes: Vec<Value> = image
        .product_codes()
        .iter()
        .map(|pc| {
            let mut m = Map::new();
            put_str(&mut m, "ProductCodeId", pc.product_code_id());
            put_str(&mut m, "ProductCodeType", pc.product_code_type().map(|v| v.as_str()));
            Value::Object(m)
        })
        .collect();
    if !product_codes.is_empty() {
        map.insert("ProductCodes".to_string(), Value::Array(product_codes));
    }

    let tags: Vec<Value> = image
        .tags()
        .iter()
        .map(|t| {
            let mut m = Map::new();
            put_str(&mut m, "Key", t.key());
            put_str(&mut m, "Value", t.value());
            Value::Object(m)
        })
        .collect();
    if !tags.is_empty() {
        map.insert("Tags".to_string(), Value::Array(tags));
    }

    let mappings: Vec<Value> = image
        .block_device_mappings()
        .iter()
        .map(|bdm| {
            let mut m = Map::new();
            put_str(&mut m, "DeviceName", bdm.device_name());
            put_str(&mut m, "VirtualName", bdm.virtual_name());
            put_str(&mut m, "NoDevice", bdm.no_device());
            if let Some(ebs) = bdm.ebs() {
                let mut e = Map::new();
                put_str(&mut e, "SnapshotId", ebs.snapshot_id());
                put_str(&mut e, "VolumeType", ebs.volume_type().map(|v| v.as_str()));
                put_bool(&mut e, "Encrypted", ebs.encrypted());
                put_bool(&mut e, "DeleteOnTermination", ebs.delete_on_termination());
                put_i32(&mut e, "VolumeSize", ebs.volume_size());
                put_i32(&mut e, "Iops", ebs.iops());
                put_i32(&mut e, "Throughput", ebs.throughput());
                m.insert("Ebs".to_string(), Value::Object(e));
            }
            Value::Object(m)
        })
        .collect();
    map.insert("BlockDeviceMappings".to_string(), Value::Array(mappings));

    Value::Object(map)
}

fn put_str(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        map.insert(key.to_string(), Value::String(v.to_string()));
    }
}

fn put_bool(map: &mut Map<String, Value>, key: &str, value: Option<bool>) {
    if let Some(v) = value {
        map.insert(key.to_string(), Value::Bool(v));
    }
}

fn put_i32(map: &mut Map<String, Value>, key: &str, value: Option<i32>) {
    if let Some(v) = value {
        map.insert(key.to_string(), Value::Number(v.into()));
    }
}

/// Registrable subset of the reconciled descriptor. Unknown fields are
/// ignored so stripped-but-unmodeled attributes cannot break registration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterDoc {
    name: String,
    description: Option<String>,
    architecture: Option<String>,
    root_device_name: Option<String>,
    virtualization_type: Option<String>,
    sriov_net_support: Option<String>,
    boot_mode: Option<String>,
    ena_support: Option<bool>,
    #[serde(default)]
    block_device_mappings: Vec<MappingDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MappingDoc {
    device_name: Option<String>,
    virtual_name: Option<String>,
    no_device: Option<String>,
    ebs: Option<EbsDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EbsDoc {
    snapshot_id: Option<String>,
    volume_size: Option<i32>,
    volume_type: Option<String>,
    delete_on_termination: Option<bool>,
    iops: Option<i32>,
    throughput: Option<i32>,
}

impl MappingDoc {
    fn to_sdk(&self) -> BlockDeviceMapping {
        let mut builder = BlockDeviceMapping::builder()
            .set_device_name(self.device_name.clone())
            .set_virtual_name(self.virtual_name.clone())
            .set_no_device(self.no_device.clone());
        if let Some(ebs) = &self.ebs {
            builder = builder.ebs(
                EbsBlockDevice::builder()
                    .set_snapshot_id(ebs.snapshot_id.clone())
                    .set_volume_size(ebs.volume_size)
                    .set_volume_type(ebs.volume_type.as_deref().map(VolumeType::from))
                    .set_delete_on_termination(ebs.delete_on_termination)
                    .set_iops(ebs.iops)
                    .set_throughput(ebs.throughput)
                    .build(),
            );
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_strings_parse_leniently() {
        assert_eq!(parse_progress(Some("87%")), 87);
        assert_eq!(parse_progress(Some("100%")), 100);
        assert_eq!(parse_progress(Some("garbage")), 0);
        assert_eq!(parse_progress(None), 0);
    }

    #[test]
    fn image_flattens_to_pascal_case_tree() {
        let image = Image::builder()
            .image_id("ami-1234")
            .name("web-base")
            .owner_id("111111111111")
            .ena_support(true)
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name("/dev/sda1")
                    .ebs(
                        EbsBlockDevice::builder()
                            .snapshot_id("snap-A")
                            .volume_size(8)
                            .encrypted(true)
                            .build(),
                    )
                    .build(),
            )
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name("/dev/sdb")
                    .virtual_name("ephemeral0")
                    .build(),
            )
            .build();

        let doc = image_to_descriptor(&image);
        assert_eq!(doc["ImageId"], "ami-1234");
        assert_eq!(doc["Name"], "web-base");
        assert_eq!(doc["EnaSupport"], json!(true));
        assert_eq!(doc["BlockDeviceMappings"].as_array().unwrap().len(), 2);
        assert_eq!(doc["BlockDeviceMappings"][0]["Ebs"]["SnapshotId"], "snap-A");
        assert_eq!(doc["BlockDeviceMappings"][0]["Ebs"]["Encrypted"], json!(true));
        assert_eq!(doc["BlockDeviceMappings"][1]["VirtualName"], "ephemeral0");
        assert!(doc["BlockDeviceMappings"][1].get("Ebs").is_none());
        // Absent optionals are omitted, not emitted as null.
        assert!(doc.get("Platform").is_none());
    }

    #[test]
    fn reconciled_descriptor_deserializes_for_registration() {
        let doc = json!({
            "Name": "Copy of web-base 1700000000",
            "Architecture": "x86_64",
            "RootDeviceName": "/dev/sda1",
            "VirtualizationType": "hvm",
            "EnaSupport": true,
            "UnmodeledField": "ignored",
            "BlockDeviceMappings": [
                {"DeviceName": "/dev/sda1", "Ebs": {"SnapshotId": "snap-new-A", "VolumeSize": 8, "VolumeType": "gp3"}},
                {"DeviceName": "/dev/sdb", "VirtualName": "ephemeral0"}
            ]
        });
        let parsed: RegisterDoc = serde_json::from_value(doc).unwrap();
        assert_eq!(parsed.name, "Copy of web-base 1700000000");
        assert_eq!(parsed.ena_support, Some(true));
        assert_eq!(parsed.block_device_mappings.len(), 2);
        let sdk = parsed.block_device_mappings[0].to_sdk();
        assert_eq!(sdk.ebs().unwrap().snapshot_id(), Some("snap-new-A"));
        assert_eq!(sdk.ebs().unwrap().volume_type(), Some(&VolumeType::Gp3));
    }

    #[test]
    fn descriptor_without_name_is_rejected() {
        let doc = json!({"Architecture": "x86_64"});
        let parsed: std::result::Result<RegisterDoc, _> = serde_json::from_value(doc);
        assert!(parsed.is_err());
    }
}
