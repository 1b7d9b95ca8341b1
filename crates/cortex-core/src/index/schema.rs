use crate::types::{FileId, FileRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// On-disk form of the index.
#[derive(Debug, Deserialize)]
struct PersistedIndex {
    #[allow(dead_code)]
    schema_version: u32,
    #[allow(dead_code)]
    saved_at: Option<DateTime<Utc>>,
    files: BTreeMap<FileId, FileRecord>,
}

#[derive(Serialize)]
struct PersistedIndexRef<'a> {
    schema_version: u32,
    saved_at: DateTime<Utc>,
    files: &'a BTreeMap<FileId, FileRecord>,
}

/// Successfully decoded index contents.
#[derive(Debug)]
pub(crate) struct Decoded {
    pub files: BTreeMap<FileId, FileRecord>,
    /// Schema the file was written with, if older than current.
    pub migrated_from: Option<u32>,
}

pub(crate) fn encode(files: &BTreeMap<FileId, FileRecord>) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec_pretty(&PersistedIndexRef {
        schema_version: CURRENT_SCHEMA_VERSION,
        saved_at: Utc::now(),
        files,
    })
}

/// Parse and validate a persisted index. The error string says why the file
/// is unusable.
pub(crate) fn decode(bytes: &[u8]) -> Result<Decoded, String> {
    let mut value: Value = serde_json::from_slice(bytes).map_err(|e| format!("malformed JSON: {}", e))?;

    // No version entry = v1
    let version = match value.get("schema_version") {
        None => 1,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| format!("schema_version is not a number: {}", v))?,
    };

    let migrated_from = match version.cmp(&CURRENT_SCHEMA_VERSION) {
        std::cmp::Ordering::Equal => None,
        std::cmp::Ordering::Less if version == 1 => {
            migrate_v1(&mut value)?;
            Some(version)
        }
        std::cmp::Ordering::Less => return Err(format!("unknown schema v{}", version)),
        std::cmp::Ordering::Greater => {
            return Err(format!(
                "schema v{} is newer than this binary (v{})",
                version, CURRENT_SCHEMA_VERSION
            ))
        }
    };

    let parsed: PersistedIndex = serde_json::from_value(value).map_err(|e| format!("invalid record: {}", e))?;
    for (key, record) in &parsed.files {
        if *key != record.id {
            return Err(format!("record keyed {} describes {}", key, record.id));
        }
    }
    Ok(Decoded {
        files: parsed.files,
        migrated_from,
    })
}

/// v1 kept outbound links as `dependencies: [id]`. Each entry becomes a
/// reference link.
fn migrate_v1(value: &mut Value) -> Result<(), String> {
    let root = value.as_object_mut().ok_or("index root is not an object")?;
    root.insert("schema_version".into(), json!(CURRENT_SCHEMA_VERSION));

    let files = root
        .get_mut("files")
        .and_then(Value::as_object_mut)
        .ok_or("missing files map")?;

    for (key, record) in files.iter_mut() {
        let record: &mut Map<String, Value> = record
            .as_object_mut()
            .ok_or_else(|| format!("record {} is not an object", key))?;
        let deps = record.remove("dependencies").unwrap_or_else(|| json!([]));
        let deps = deps
            .as_array()
            .ok_or_else(|| format!("dependencies of {} is not a list", key))?;
        let links: Vec<Value> = deps
            .iter()
            .map(|target| json!({ "target_id": target, "kind": "reference" }))
            .collect();
        record.entry("links").or_insert(Value::Array(links));
    }
    Ok(())
}
