//! Filesystem-backed providers for running without a cloud account.
//!
//! Objects live under `<root>/<bucket>/<key>`. A bucket's lifecycle rules are
//! read from `<root>/<bucket>/.lifecycle.yaml`. Converged stacks are recorded
//! as lock files under the state directory.

use super::{
    ConvergeRequest, ConvergenceTarget, IdentityError, IdentityService, LifecyclePolicy,
    LifecycleRule, ObjectStorage, StackHandle, TemplateSource,
};
use crate::core::state;
use crate::provenance::hasher;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LIFECYCLE_FILE: &str = ".lifecycle.yaml";

/// Object storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    pub fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>, String> {
        let path = self.object_path(bucket, key);
        std::fs::read(&path).map_err(|e| format!("cannot read {}: {}", path.display(), e))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), String> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }
        std::fs::write(&path, body).map_err(|e| format!("cannot write {}: {}", path.display(), e))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), String> {
        let path = self.object_path(bucket, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("cannot delete {}: {}", path.display(), e)),
        }
    }

    async fn lifecycle_policy(&self, bucket: &str) -> Result<LifecyclePolicy, String> {
        let path = self.root.join(bucket).join(LIFECYCLE_FILE);
        if !path.exists() {
            return Ok(LifecyclePolicy::NotConfigured);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let rules: Vec<LifecycleRule> = serde_yaml_ng::from_str(&content)
            .map_err(|e| format!("invalid lifecycle file {}: {}", path.display(), e))?;
        if rules.is_empty() {
            Ok(LifecyclePolicy::NotConfigured)
        } else {
            Ok(LifecyclePolicy::Enabled(rules))
        }
    }
}

/// Role table loaded from a YAML map of name -> ARN.
#[derive(Debug, Clone, Default)]
pub struct LocalIdentityService {
    roles: IndexMap<String, String>,
}

impl LocalIdentityService {
    /// Load the role table. A missing file is an empty table.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let roles = serde_yaml_ng::from_str(&content)
            .map_err(|e| format!("invalid role table {}: {}", path.display(), e))?;
        Ok(Self { roles })
    }
}

#[async_trait]
impl IdentityService for LocalIdentityService {
    async fn lookup_role(&self, name: &str) -> Result<String, IdentityError> {
        self.roles.get(name).cloned().ok_or(IdentityError::NotFound)
    }
}

/// Records converged stacks as lock files.
#[derive(Debug, Clone)]
pub struct LocalConvergenceTarget {
    state_dir: PathBuf,
    storage: Arc<LocalObjectStorage>,
}

impl LocalConvergenceTarget {
    pub fn new(state_dir: impl Into<PathBuf>, storage: Arc<LocalObjectStorage>) -> Self {
        Self {
            state_dir: state_dir.into(),
            storage,
        }
    }

    fn template_text(&self, source: &TemplateSource) -> Result<String, String> {
        match source {
            TemplateSource::Inline(body) => Ok(body.clone()),
            TemplateSource::Reference { bucket, key } => {
                let bytes = self.storage.read(bucket, key)?;
                String::from_utf8(bytes).map_err(|e| format!("template is not UTF-8: {}", e))
            }
        }
    }
}

#[async_trait]
impl ConvergenceTarget for LocalConvergenceTarget {
    async fn converge(&self, request: ConvergeRequest) -> Result<StackHandle, String> {
        let template = self.template_text(&request.template)?;
        let stack_id = match state::load_lock(&self.state_dir, &request.stack_name)? {
            Some(existing) if existing.template_hash == hasher::hash_string(&template) => {
                tracing::info!(stack = %request.stack_name, "stack unchanged");
                return Ok(StackHandle {
                    stack_name: request.stack_name,
                    stack_id: existing.stack_id,
                });
            }
            Some(existing) => existing.stack_id,
            None => format!(
                "stratus:{}:{}",
                request.stack_name,
                &hasher::digest_hex(&[&request.stack_name, &request.started_at])[..12]
            ),
        };
        let lock = state::new_lock(&request.stack_name, &stack_id, &template, &request.tags)?;
        state::save_lock(&self.state_dir, &lock)?;
        tracing::info!(
            stack = %request.stack_name,
            resources = lock.resources.len(),
            "stack converged"
        );
        Ok(StackHandle {
            stack_name: request.stack_name,
            stack_id,
        })
    }
}
