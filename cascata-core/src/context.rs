use crate::error::{CascataError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata keys owned by the store. Caller-supplied values for these are
/// discarded on save; the store is the sole source of version, timestamp
/// and size.
const RESERVED_META_KEYS: [&str; 3] = ["version", "lastModified", "size"];

/// Per-context metadata maintained authoritatively by the store.
///
/// `version` starts at 1 on first save and increases by exactly 1 on every
/// successful save. Deleting a context discards its version history; a
/// re-created context starts at 1 again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    pub version: u64,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContextMetadata {
    pub fn next(previous: Option<&ContextMetadata>, size: u64, extra: Option<&Map<String, Value>>) -> Self {
        let version = previous.map(|meta| meta.version + 1).unwrap_or(1);

        let mut merged = previous.map(|meta| meta.extra.clone()).unwrap_or_default();
        if let Some(extra) = extra {
            for (key, value) in extra {
                merged.insert(key.clone(), value.clone());
            }
        }
        for key in RESERVED_META_KEYS {
            merged.remove(key);
        }

        Self {
            version,
            last_modified: Utc::now(),
            size,
            extra: merged,
        }
    }
}

/// Listing entry for `list_with_metadata` and the
/// `GET /contexts?includeMetadata=true` wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub metadata: ContextMetadata,
}

/// Validate a context id before it touches the filesystem.
///
/// Ids are opaque non-empty UTF-8, but they become file names under
/// `data_dir`, so path separators, NUL, and dot components are rejected.
/// Ids containing `.meta.` are rejected too: they would collide with the
/// metadata file naming scheme and vanish from listings.
pub fn validate_context_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CascataError::InvalidRequest(
            "context id cannot be empty".to_string(),
        ));
    }

    if id.contains('/') || id.contains('\\') || id.contains('\0') {
        return Err(CascataError::InvalidRequest(format!(
            "context id contains path separator or NUL: {}",
            id
        )));
    }

    if id == "." || id == ".." {
        return Err(CascataError::InvalidRequest(format!(
            "invalid context id: {}",
            id
        )));
    }

    if id.contains(".meta.") || id.ends_with(".meta") {
        return Err(CascataError::InvalidRequest(format!(
            "context id collides with metadata file naming: {}",
            id
        )));
    }

    Ok(())
}
