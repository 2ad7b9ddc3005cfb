//! External collaborators: identity service, object storage, and the
//! convergence target.
//!
//! `local` backs the CLI with the filesystem; `memory` records every call
//! and backs the tests.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure looking up an existing role.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("role not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Verifies that named execution roles exist.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Returns the role's ARN.
    async fn lookup_role(&self, name: &str) -> Result<String, IdentityError>;
}

/// One expiration rule on a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub id: String,

    #[serde(default)]
    pub prefix: String,

    pub expiration_days: u32,
}

/// Bucket lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecyclePolicy {
    Enabled(Vec<LifecycleRule>),
    NotConfigured,
}

/// Durable artifact storage.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), String>;

    /// Deleting a missing object succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), String>;

    async fn lifecycle_policy(&self, bucket: &str) -> Result<LifecyclePolicy, String>;
}

/// Where the convergence target reads the template from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Inline(String),
    Reference { bucket: String, key: String },
}

/// One create-or-update call.
#[derive(Debug, Clone)]
pub struct ConvergeRequest {
    pub stack_name: String,
    pub template: TemplateSource,
    pub tags: IndexMap<String, String>,
    pub started_at: String,
}

/// Identity of a converged stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackHandle {
    pub stack_name: String,
    pub stack_id: String,
}

/// Deployment service that converges a stack to a template.
///
/// Must be idempotent under identical input.
#[async_trait]
pub trait ConvergenceTarget: Send + Sync {
    async fn converge(&self, request: ConvergeRequest) -> Result<StackHandle, String>;
}
