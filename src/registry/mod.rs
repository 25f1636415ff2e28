//! Device twin registry operations
//!
//! Twins are the hub-side state documents for devices. Bulk updates follow
//! all-results semantics: the call succeeds at the transport level even when
//! individual twins fail, and the per-item failures ride along in the
//! result. Only a batch-level transport failure is an `Err`.

pub mod client;

pub use client::RegistryClient;

use crate::error::DeviceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hub-side state document for one device (or module) identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Twin {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "moduleId", skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub tags: Map<String, Value>,
    #[serde(default)]
    pub properties: TwinProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: Map<String, Value>,
    #[serde(default)]
    pub reported: Map<String, Value>,
}

impl Twin {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: None,
            etag: None,
            tags: Map::new(),
            properties: TwinProperties::default(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: Value) -> Self {
        self.tags.insert(key.into(), value);
        self
    }

    pub fn with_desired(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.desired.insert(key.into(), value);
        self
    }
}

/// Per-item failure inside an otherwise completed bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistryOperationError {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "errorCode")]
    pub error_code: String,
    #[serde(rename = "errorStatus")]
    pub error_status: String,
}

/// Result of a bulk registry operation. `is_successful` is false as soon as
/// any item failed; the successfully processed items are still applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRegistryOperationResult {
    #[serde(rename = "isSuccessful")]
    pub is_successful: bool,
    #[serde(default)]
    pub errors: Vec<DeviceRegistryOperationError>,
}

impl BulkRegistryOperationResult {
    pub fn success() -> Self {
        Self {
            is_successful: true,
            errors: Vec::new(),
        }
    }

    pub fn with_errors(errors: Vec<DeviceRegistryOperationError>) -> Self {
        Self {
            is_successful: errors.is_empty(),
            errors,
        }
    }
}

/// Registry surface used by service-side callers. Implemented over HTTP by
/// [`RegistryClient`] and in-memory by the test hub.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Fetch the current twin for a device
    async fn get_twin(&self, device_id: &str) -> DeviceResult<Twin>;

    /// Apply many twin updates in one call. `force_replace` swaps merge
    /// semantics for wholesale replacement of tags and desired properties.
    async fn update_twins_bulk(
        &self,
        twins: Vec<Twin>,
        force_replace: bool,
    ) -> DeviceResult<BulkRegistryOperationResult>;
}

/// JSON merge-patch over a twin section: objects merge recursively, `null`
/// deletes the key, anything else overwrites.
pub fn merge_section(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(patch_obj) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(existing) = entry {
                    merge_section(existing, patch_obj);
                } else {
                    *entry = Value::Object(patch_obj.clone());
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Apply one twin update onto an existing twin, honoring merge or replace
/// semantics for tags and desired properties. Reported properties are
/// device-owned and never written through the registry.
pub fn apply_update(existing: &mut Twin, update: &Twin, force_replace: bool) {
    if force_replace {
        existing.tags = update.tags.clone();
        existing.properties.desired = update.properties.desired.clone();
    } else {
        merge_section(&mut existing.tags, &update.tags);
        merge_section(&mut existing.properties.desired, &update.properties.desired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_merge_overwrites_and_adds() {
        let mut target = map(json!({"floor": 1, "zone": "a"}));
        let patch = map(json!({"zone": "b", "rack": 7}));
        merge_section(&mut target, &patch);
        assert_eq!(target, map(json!({"floor": 1, "zone": "b", "rack": 7})));
    }

    #[test]
    fn test_merge_null_deletes() {
        let mut target = map(json!({"floor": 1, "zone": "a"}));
        let patch = map(json!({"zone": null}));
        merge_section(&mut target, &patch);
        assert_eq!(target, map(json!({"floor": 1})));
    }

    #[test]
    fn test_merge_recurses_into_objects() {
        let mut target = map(json!({"location": {"building": "b1", "floor": 2}}));
        let patch = map(json!({"location": {"floor": 3}}));
        merge_section(&mut target, &patch);
        assert_eq!(
            target,
            map(json!({"location": {"building": "b1", "floor": 3}}))
        );
    }

    #[test]
    fn test_replace_discards_unmentioned_keys() {
        let mut existing = Twin::new("dev-01").with_tag("floor", json!(1)).with_tag("zone", json!("a"));
        let update = Twin::new("dev-01").with_tag("rack", json!(7));
        apply_update(&mut existing, &update, true);
        assert_eq!(existing.tags, map(json!({"rack": 7})));
    }

    #[test]
    fn test_update_never_touches_reported() {
        let mut existing = Twin::new("dev-01");
        existing
            .properties
            .reported
            .insert("fw".to_string(), json!("1.2.3"));
        let mut update = Twin::new("dev-01").with_desired("interval", json!(30));
        update
            .properties
            .reported
            .insert("fw".to_string(), json!("9.9.9"));

        apply_update(&mut existing, &update, false);
        assert_eq!(existing.properties.reported["fw"], json!("1.2.3"));
        assert_eq!(existing.properties.desired["interval"], json!(30));
    }

    #[test]
    fn test_bulk_result_predicate() {
        assert!(BulkRegistryOperationResult::success().is_successful);
        assert!(BulkRegistryOperationResult::with_errors(Vec::new()).is_successful);

        let partial = BulkRegistryOperationResult::with_errors(vec![DeviceRegistryOperationError {
            device_id: "ghost".to_string(),
            error_code: "DeviceNotFound".to_string(),
            error_status: "device ghost is not registered".to_string(),
        }]);
        assert!(!partial.is_successful);
        assert_eq!(partial.errors.len(), 1);
    }

    #[test]
    fn test_twin_wire_format() {
        let twin = Twin::new("dev-01").with_tag("zone", json!("a"));
        let encoded = serde_json::to_string(&twin).unwrap();
        assert!(encoded.contains("\"deviceId\":\"dev-01\""));
        assert!(!encoded.contains("moduleId"));
        assert!(!encoded.contains("etag"));
    }
}
