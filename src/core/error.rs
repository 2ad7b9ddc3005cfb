//! Error taxonomy for a provisioning run.
//!
//! Precondition errors surface before any side effect. Everything else is a
//! step error: the engine rolls back and then returns the original error.

use thiserror::Error;

/// Errors raised by the resource graph assembler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("resource '{0}' already declared with a different body")]
    Collision(String),

    #[error("output '{0}' already declared with a different value")]
    OutputCollision(String),

    #[error("merge produced conflicting declarations: {}", .0.join(", "))]
    MergeConflicts(Vec<String>),

    #[error("resource '{resource}' depends on unknown '{dependency}'")]
    UnknownDependency { resource: String, dependency: String },

    #[error("dependency cycle detected involving: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("serialize error: {0}")]
    Serialize(String),
}

/// Top-level provisioning error.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid service declaration:\n  {}", .0.join("\n  "))]
    Precondition(Vec<String>),

    #[error("IAM role '{0}' does not exist")]
    RoleNotFound(String),

    #[error("identity service failed looking up role '{role}': {message}")]
    IdentityTransport { role: String, message: String },

    #[error("build failed: {0}")]
    Build(String),

    #[error("{hook} hook failed: {message}")]
    Hook { hook: &'static str, message: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("encountered {} error(s) during upload:\n  {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<ProvisionError>),

    #[error("template assembly failed: {0}")]
    Template(String),

    #[error("convergence rejected: {0}")]
    Converge(String),

    #[error("I/O error: {0}")]
    Io(String),
}

fn join_errors(errors: &[ProvisionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n  ")
}
