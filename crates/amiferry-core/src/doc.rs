//! Structural transforms over the image descriptor JSON tree.
//!
//! The descriptor is kept as a generic `serde_json::Value` so the rewrite
//! touches every nesting level: snapshot ids are substituted wherever they
//! appear and non-transferable fields are deleted at any depth.

use serde_json::Value;

use crate::copy::SnapshotPair;

/// Fields that are read-only, account-specific, or rejected on
/// re-registration. Removed recursively, at every nesting level.
pub const STRIPPED_FIELDS: &[&str] = &[
    "Encrypted",
    "Tags",
    "Platform",
    "PlatformDetails",
    "ImageId",
    "CreationDate",
    "OwnerId",
    "ImageLocation",
    "State",
    "ImageType",
    "RootDeviceType",
    "Hypervisor",
    "Public",
    "EnaSupport",
    "ProductCodes",
    "UsageOperation",
];

/// Snapshot ids referenced by the descriptor's device mappings, in
/// document order. Mappings without a backing snapshot (ephemeral or
/// empty volumes) are skipped.
pub fn device_snapshot_ids(descriptor: &Value) -> Vec<String> {
    let Some(mappings) = descriptor
        .get("BlockDeviceMappings")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    mappings
        .iter()
        .filter_map(|mapping| mapping.pointer("/Ebs/SnapshotId"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

/// Replaces every string leaf equal to a source snapshot id with the
/// corresponding destination id, anywhere in the tree.
pub fn substitute_snapshot_ids(doc: &mut Value, pairs: &[SnapshotPair]) {
    match doc {
        Value::String(s) => {
            if let Some(pair) = pairs.iter().find(|p| p.source_id == *s) {
                *s = pair.destination_id.clone();
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_snapshot_ids(item, pairs);
            }
        }
        Value::Object(map) => {
            for value in map.values_mut() {
                substitute_snapshot_ids(value, pairs);
            }
        }
        _ => {}
    }
}

/// Deletes the named keys from every object in the tree.
pub fn strip_fields(doc: &mut Value, fields: &[&str]) {
    match doc {
        Value::Object(map) => {
            map.retain(|key, _| !fields.contains(&key.as_str()));
            for value in map.values_mut() {
                strip_fields(value, fields);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_fields(item, fields);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs() -> Vec<SnapshotPair> {
        vec![
            SnapshotPair {
                source_id: "snap-A".to_string(),
                destination_id: "snap-new-A".to_string(),
            },
            SnapshotPair {
                source_id: "snap-B".to_string(),
                destination_id: "snap-new-B".to_string(),
            },
        ]
    }

    fn sample_descriptor() -> Value {
        json!({
            "ImageId": "ami-1234",
            "Name": "web-base",
            "State": "available",
            "CreationDate": "2024-03-01T00:00:00.000Z",
            "OwnerId": "111111111111",
            "EnaSupport": true,
            "Tags": [{"Key": "Env", "Value": "prod"}],
            "ProductCodes": [{"ProductCodeId": "abc"}],
            "BlockDeviceMappings": [
                {
                    "DeviceName": "/dev/sda1",
                    "Ebs": {
                        "SnapshotId": "snap-A",
                        "VolumeSize": 8,
                        "Encrypted": false
                    }
                },
                {
                    "DeviceName": "/dev/sdb",
                    "Ebs": {
                        "SnapshotId": "snap-B",
                        "VolumeSize": 100,
                        "Encrypted": true
                    }
                },
                {
                    "DeviceName": "/dev/sdc",
                    "VirtualName": "ephemeral0"
                }
            ]
        })
    }

    #[test]
    fn snapshot_ids_in_document_order() {
        let ids = device_snapshot_ids(&sample_descriptor());
        assert_eq!(ids, vec!["snap-A".to_string(), "snap-B".to_string()]);
    }

    #[test]
    fn no_mappings_yields_empty() {
        assert!(device_snapshot_ids(&json!({"Name": "bare"})).is_empty());
    }

    #[test]
    fn substitution_reaches_nested_references() {
        let mut doc = json!({
            "BlockDeviceMappings": [
                {"Ebs": {"SnapshotId": "snap-A"}}
            ],
            "Description": "built from snapshots",
            "Nested": {"Deep": ["snap-B", "unrelated"]}
        });
        substitute_snapshot_ids(&mut doc, &pairs());
        let rendered = doc.to_string();
        assert!(!rendered.contains("snap-A\""));
        assert!(!rendered.contains("snap-B\""));
        assert_eq!(doc["Nested"]["Deep"][0], "snap-new-B");
        assert_eq!(doc["Nested"]["Deep"][1], "unrelated");
    }

    #[test]
    fn strip_removes_fields_at_every_depth() {
        let mut doc = sample_descriptor();
        strip_fields(&mut doc, STRIPPED_FIELDS);
        let rendered = doc.to_string();
        for field in ["ImageId", "State", "Tags", "EnaSupport", "Encrypted", "ProductCodes"] {
            assert!(
                !rendered.contains(&format!("\"{field}\"")),
                "{field} survived: {rendered}"
            );
        }
        // Carry-over structure is untouched.
        assert_eq!(
            doc["BlockDeviceMappings"].as_array().unwrap().len(),
            3
        );
        assert_eq!(doc["BlockDeviceMappings"][0]["Ebs"]["VolumeSize"], 8);
    }

    #[test]
    fn rewrite_preserves_mapping_count_and_drops_source_ids() {
        let source = sample_descriptor();
        let mut doc = source.clone();
        substitute_snapshot_ids(&mut doc, &pairs());
        strip_fields(&mut doc, STRIPPED_FIELDS);

        let rendered = doc.to_string();
        assert!(!rendered.contains("snap-A"));
        assert!(!rendered.contains("snap-B"));
        assert_eq!(
            doc["BlockDeviceMappings"].as_array().unwrap().len(),
            source["BlockDeviceMappings"].as_array().unwrap().len()
        );
        assert_eq!(doc["BlockDeviceMappings"][0]["Ebs"]["SnapshotId"], "snap-new-A");
        assert_eq!(doc["BlockDeviceMappings"][1]["Ebs"]["SnapshotId"], "snap-new-B");
    }
}
