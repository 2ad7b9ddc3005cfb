//! Stack lock files: load, save (atomic), and build from a template.

use super::types::{ResourceLock, StackLock};
use crate::provenance::{eventlog, hasher};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Derive the lock file path for a stack within the state directory.
pub fn lock_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("stack.lock.yaml")
}

/// Load a stack's lock file. Returns None if the file doesn't exist.
pub fn load_lock(state_dir: &Path, stack: &str) -> Result<Option<StackLock>, String> {
    let path = lock_file_path(state_dir, stack);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let lock: StackLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid lock file {}: {}", path.display(), e))?;
    Ok(Some(lock))
}

/// Save a lock file atomically (write to temp, then rename).
pub fn save_lock(state_dir: &Path, lock: &StackLock) -> Result<(), String> {
    let path = lock_file_path(state_dir, &lock.stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }

    let yaml = serde_yaml_ng::to_string(lock).map_err(|e| format!("serialize error: {}", e))?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        format!(
            "cannot rename {} -> {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;

    Ok(())
}

/// Per-resource hashes of a serialized template.
pub fn resource_hashes(template: &serde_json::Value) -> Result<IndexMap<String, ResourceLock>, String> {
    let resources = template
        .get("Resources")
        .and_then(|r| r.as_object())
        .ok_or_else(|| "template has no Resources object".to_string())?;
    let mut out = IndexMap::new();
    for (name, body) in resources {
        let resource_type = body
            .get("Type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| format!("resource '{}' has no Type", name))?;
        let canonical =
            serde_json::to_string(body).map_err(|e| format!("serialize error: {}", e))?;
        out.insert(
            name.clone(),
            ResourceLock {
                resource_type: resource_type.to_string(),
                hash: hasher::hash_string(&canonical),
            },
        );
    }
    Ok(out)
}

/// Build a lock for `stack` from its template text.
pub fn new_lock(
    stack: &str,
    stack_id: &str,
    template: &str,
    tags: &IndexMap<String, String>,
) -> Result<StackLock, String> {
    let value: serde_json::Value =
        serde_json::from_str(template).map_err(|e| format!("invalid template JSON: {}", e))?;
    Ok(StackLock {
        schema: "1.0".to_string(),
        stack: stack.to_string(),
        stack_id: stack_id.to_string(),
        generated_at: eventlog::now_iso8601(),
        generator: format!("stratus {}", env!("CARGO_PKG_VERSION")),
        template_hash: hasher::hash_string(template),
        tags: tags.clone(),
        resources: resource_hashes(&value)?,
    })
}
