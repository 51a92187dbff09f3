//! Field-by-field metadata extraction from a resource's describe document.
//!
//! Each field has an ordered list of candidate paths so one extractor tolerates
//! the differing schemas of buckets, disks and file shares. The first candidate
//! holding a non-null, non-empty scalar wins; when none does the field stays
//! unknown. Paths are dot-separated; numeric segments index into arrays
//! (`fileShares.0.capacityGb`).

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::inventory::record::{ResourceRecord, ResourceType, UNKNOWN};

/// Bytes per GiB; size fields in describe documents are expressed in GiB.
pub const GIB: u64 = 1 << 30;

/// Candidate source paths for every extracted field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub location: &'static [&'static str],
    pub created_at: &'static [&'static str],
    pub created_by: &'static [&'static str],
    pub updated_at: &'static [&'static str],
    pub class_or_type: &'static [&'static str],
    pub labels: &'static [&'static str],
    /// Size in GiB, for kinds whose size is a provisioned capacity.
    pub size_gib: &'static [&'static str],
}

const CREATED_BY: &[&str] = &[
    "labels.created-by",
    "labels.created_by",
    "labels.creator",
    "labels.owner",
    "createdBy",
    "owner.entity",
];

const BUCKET_SCHEMA: FieldSchema = FieldSchema {
    location: &["location", "locationConstraint", "region"],
    created_at: &["creation_time", "timeCreated", "createTime", "creationTimestamp"],
    created_by: CREATED_BY,
    updated_at: &["update_time", "updated", "updateTime"],
    class_or_type: &["default_storage_class", "storageClass", "storage_class"],
    labels: &["labels", "tags"],
    size_gib: &[],
};

const DISK_SCHEMA: FieldSchema = FieldSchema {
    location: &["zone", "region", "location"],
    created_at: &["creationTimestamp", "createTime", "timeCreated"],
    created_by: CREATED_BY,
    updated_at: &["lastAttachTimestamp", "lastDetachTimestamp", "updateTime"],
    class_or_type: &["type", "diskType"],
    labels: &["labels"],
    size_gib: &["sizeGb", "size_gb", "capacityGb"],
};

const FILE_SHARE_SCHEMA: FieldSchema = FieldSchema {
    location: &["location", "zone"],
    created_at: &["createTime", "creationTimestamp"],
    created_by: CREATED_BY,
    updated_at: &["updateTime", "lastUpdateTime"],
    class_or_type: &["tier", "serviceTier"],
    labels: &["labels"],
    size_gib: &["fileShares.0.capacityGb", "capacityGb"],
};

impl FieldSchema {
    #[must_use]
    pub const fn for_type(resource_type: ResourceType) -> &'static Self {
        match resource_type {
            ResourceType::Bucket => &BUCKET_SCHEMA,
            ResourceType::Disk => &DISK_SCHEMA,
            ResourceType::FileShare => &FILE_SHARE_SCHEMA,
        }
    }
}

/// Resolve one dotted path inside a JSON document.
#[must_use]
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// First candidate rendering to a non-empty scalar string.
#[must_use]
pub fn first_scalar(doc: &Value, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|path| lookup(doc, path))
        .find_map(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Strip a resource URL down to its last segment (`.../zones/us-east1-b` → `us-east1-b`).
#[must_use]
pub fn basename(value: &str) -> &str {
    value.rsplit('/').next().unwrap_or(value)
}

/// Parse a describe-document timestamp. Unparseable text counts as absent.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            // `gcloud storage` prints "2024-01-02T03:04:05+0000".
            DateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S%.f%z")
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

fn first_timestamp(doc: &Value, candidates: &[&str]) -> Option<DateTime<Utc>> {
    candidates
        .iter()
        .filter_map(|path| lookup(doc, path))
        .filter_map(scalar_text)
        .find_map(|raw| parse_timestamp(&raw))
}

fn first_labels(doc: &Value, candidates: &[&str]) -> BTreeMap<String, String> {
    candidates
        .iter()
        .filter_map(|path| lookup(doc, path))
        .find_map(|value| match value {
            Value::Object(map) => Some(
                map.iter()
                    .filter_map(|(k, v)| scalar_text(v).map(|text| (k.clone(), text)))
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_default()
}

/// Provisioned size in bytes from the schema's GiB candidates.
///
/// Returns `None` when no candidate holds a whole number.
#[must_use]
pub fn size_from_metadata(doc: &Value, schema: &FieldSchema) -> Option<u64> {
    schema
        .size_gib
        .iter()
        .filter_map(|path| lookup(doc, path))
        .filter_map(scalar_text)
        .find_map(|raw| raw.parse::<u64>().ok())
        .map(|gib| gib.saturating_mul(GIB))
}

/// Populate a record's descriptive fields from a describe document.
///
/// Fields already known (e.g. location taken from the enumeration scope) are
/// only replaced when the document supplies a value.
pub fn apply_metadata(record: &mut ResourceRecord, doc: &Value) {
    let schema = FieldSchema::for_type(record.resource_type);

    if let Some(location) = first_scalar(doc, schema.location) {
        record.location = basename(&location).to_string();
    }
    record.created_at = first_timestamp(doc, schema.created_at);
    record.updated_at = first_timestamp(doc, schema.updated_at);
    record.created_by = first_scalar(doc, schema.created_by);
    record.class_or_type = first_scalar(doc, schema.class_or_type)
        .map_or_else(|| UNKNOWN.to_string(), |v| basename(&v).to_string());
    record.labels = first_labels(doc, schema.labels);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::record::{ResourceRef, ScanTask};
    use serde_json::json;

    fn record(resource_type: ResourceType) -> ResourceRecord {
        ResourceRecord::for_task(&ScanTask {
            project_id: "p".to_string(),
            resource_type,
            resource: ResourceRef::named("r"),
            sequence_index: 0,
        })
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let doc = json!({"fileShares": [{"capacityGb": "1024"}]});
        assert_eq!(
            lookup(&doc, "fileShares.0.capacityGb"),
            Some(&json!("1024"))
        );
        assert_eq!(lookup(&doc, "fileShares.1.capacityGb"), None);
        assert_eq!(lookup(&doc, "missing.path"), None);
    }

    #[test]
    fn first_candidate_present_wins() {
        let doc = json!({"timeCreated": null, "createTime": "", "creationTimestamp": "x"});
        assert_eq!(
            first_scalar(&doc, &["timeCreated", "createTime", "creationTimestamp"]),
            Some("x".to_string())
        );
    }

    #[test]
    fn bucket_metadata_is_extracted() {
        let doc = json!({
            "location": "US-CENTRAL1",
            "creation_time": "2024-03-01T10:00:00+0000",
            "update_time": "2024-04-01T10:00:00Z",
            "default_storage_class": "STANDARD",
            "labels": {"team": "data", "created-by": "alice"}
        });
        let mut rec = record(ResourceType::Bucket);
        apply_metadata(&mut rec, &doc);
        assert_eq!(rec.location, "US-CENTRAL1");
        assert_eq!(rec.class_or_type, "STANDARD");
        assert_eq!(rec.created_by.as_deref(), Some("alice"));
        assert!(rec.created_at.is_some());
        assert!(rec.updated_at.is_some());
        assert_eq!(rec.labels.len(), 2);
    }

    #[test]
    fn disk_urls_are_reduced_to_basename() {
        let doc = json!({
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b",
            "type": "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b/diskTypes/pd-ssd",
            "sizeGb": "100",
            "creationTimestamp": "2023-11-05T08:15:30.123-07:00"
        });
        let mut rec = record(ResourceType::Disk);
        apply_metadata(&mut rec, &doc);
        assert_eq!(rec.location, "us-east1-b");
        assert_eq!(rec.class_or_type, "pd-ssd");
        assert_eq!(
            size_from_metadata(&doc, FieldSchema::for_type(ResourceType::Disk)),
            Some(100 * GIB)
        );
    }

    #[test]
    fn missing_fields_degrade_to_unknown() {
        let mut rec = record(ResourceType::FileShare);
        apply_metadata(&mut rec, &json!({}));
        assert_eq!(rec.location, UNKNOWN);
        assert_eq!(rec.class_or_type, UNKNOWN);
        assert_eq!(rec.created_by, None);
        assert_eq!(rec.created_at, None);
        assert!(rec.labels.is_empty());
    }

    #[test]
    fn unparseable_timestamp_counts_as_absent() {
        assert_eq!(parse_timestamp("yesterday"), None);
        assert!(parse_timestamp("2024-01-02T03:04:05Z").is_some());
    }

    #[test]
    fn file_share_capacity_from_nested_share() {
        let doc = json!({"tier": "BASIC_HDD", "fileShares": [{"capacityGb": 2048}]});
        assert_eq!(
            size_from_metadata(&doc, FieldSchema::for_type(ResourceType::FileShare)),
            Some(2048 * GIB)
        );
    }
}
