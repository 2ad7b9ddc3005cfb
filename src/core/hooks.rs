//! Workflow hook registrations.
//!
//! Every hook kind is an ordered list run in registration order. Hooks share
//! one mutable context map for the duration of a run. The older single-hook
//! form is accepted only through [`LegacyWorkflowHooks`], which folds it in
//! as the first entry of the matching list.

use super::error::ProvisionError;
use super::graph::{ResourceGraph, ResourceNode};
use crate::build::archive::ArchiveWriter;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// State shared between hooks across one run.
pub type HookContext = IndexMap<String, Value>;

/// Error type returned by user hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Run metadata passed to every hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookArgs {
    pub service_name: String,
    pub bucket: String,
    pub build_id: String,
    pub dry_run: bool,
}

/// Runs before or after compilation, and around template assembly.
pub trait BuildHook: Send + Sync {
    fn run(&self, ctx: &mut HookContext, args: &HookArgs) -> Result<(), HookError>;
}

impl<F> BuildHook for F
where
    F: Fn(&mut HookContext, &HookArgs) -> Result<(), HookError> + Send + Sync,
{
    fn run(&self, ctx: &mut HookContext, args: &HookArgs) -> Result<(), HookError> {
        self(ctx, args)
    }
}

/// Adds entries to the archive before it is sealed.
pub trait ArchiveHook: Send + Sync {
    fn run(
        &self,
        ctx: &mut HookContext,
        args: &HookArgs,
        archive: &mut ArchiveWriter,
    ) -> Result<(), HookError>;
}

impl<F> ArchiveHook for F
where
    F: Fn(&mut HookContext, &HookArgs, &mut ArchiveWriter) -> Result<(), HookError>
        + Send
        + Sync,
{
    fn run(
        &self,
        ctx: &mut HookContext,
        args: &HookArgs,
        archive: &mut ArchiveWriter,
    ) -> Result<(), HookError> {
        self(ctx, args, archive)
    }
}

/// Adds service-level resources into a scratch graph merged afterwards.
pub trait ServiceDecoratorHook: Send + Sync {
    fn decorate(
        &self,
        ctx: &mut HookContext,
        args: &HookArgs,
        scratch: &mut ResourceGraph,
    ) -> Result<(), HookError>;
}

impl<F> ServiceDecoratorHook for F
where
    F: Fn(&mut HookContext, &HookArgs, &mut ResourceGraph) -> Result<(), HookError>
        + Send
        + Sync,
{
    fn decorate(
        &self,
        ctx: &mut HookContext,
        args: &HookArgs,
        scratch: &mut ResourceGraph,
    ) -> Result<(), HookError> {
        self(ctx, args, scratch)
    }
}

/// What a function decorator sees of the function being exported.
#[derive(Debug, Clone, Copy)]
pub struct DecoratorTarget<'a> {
    pub logical_name: &'a str,
    pub function: &'a ResourceNode,
    pub archive_key: &'a str,
}

/// Per-function template decorator. Resources go into `scratch`; `metadata`
/// lands on the function node.
pub trait TemplateDecorator: Send + Sync {
    fn decorate(
        &self,
        ctx: &mut HookContext,
        args: &HookArgs,
        target: &DecoratorTarget<'_>,
        scratch: &mut ResourceGraph,
        metadata: &mut IndexMap<String, Value>,
    ) -> Result<(), HookError>;
}

/// Compensation hook run alongside the built-in rollback actions.
pub trait RollbackHook: Send + Sync {
    fn rollback(&self, ctx: &HookContext, args: &HookArgs);
}

impl<F> RollbackHook for F
where
    F: Fn(&HookContext, &HookArgs) + Send + Sync,
{
    fn rollback(&self, ctx: &HookContext, args: &HookArgs) {
        self(ctx, args)
    }
}

/// Ordered hook lists for one run.
#[derive(Clone, Default)]
pub struct WorkflowHooks {
    pub context: HookContext,
    pub pre_build: Vec<Arc<dyn BuildHook>>,
    pub post_build: Vec<Arc<dyn BuildHook>>,
    pub archive: Vec<Arc<dyn ArchiveHook>>,
    pub pre_marshal: Vec<Arc<dyn BuildHook>>,
    pub service_decorators: Vec<Arc<dyn ServiceDecoratorHook>>,
    pub post_marshal: Vec<Arc<dyn BuildHook>>,
    pub rollback: Vec<Arc<dyn RollbackHook>>,
}

impl std::fmt::Debug for WorkflowHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHooks")
            .field("context", &self.context)
            .field("pre_build", &self.pre_build.len())
            .field("post_build", &self.post_build.len())
            .field("archive", &self.archive.len())
            .field("pre_marshal", &self.pre_marshal.len())
            .field("service_decorators", &self.service_decorators.len())
            .field("post_marshal", &self.post_marshal.len())
            .field("rollback", &self.rollback.len())
            .finish()
    }
}

/// Hooks in the older shape: one optional handler per kind next to the list.
#[derive(Default)]
pub struct LegacyWorkflowHooks {
    pub hooks: WorkflowHooks,
    pub pre_build: Option<Arc<dyn BuildHook>>,
    pub post_build: Option<Arc<dyn BuildHook>>,
    pub archive: Option<Arc<dyn ArchiveHook>>,
    pub pre_marshal: Option<Arc<dyn BuildHook>>,
    pub service_decorator: Option<Arc<dyn ServiceDecoratorHook>>,
    pub post_marshal: Option<Arc<dyn BuildHook>>,
    pub rollback: Option<Arc<dyn RollbackHook>>,
}

fn fold<T: ?Sized>(field: &'static str, single: Option<Arc<T>>, list: &mut Vec<Arc<T>>) {
    if let Some(hook) = single {
        tracing::warn!(
            hook = field,
            "single-hook field is DEPRECATED; register hooks in the ordered list instead"
        );
        list.insert(0, hook);
    }
}

impl From<LegacyWorkflowHooks> for WorkflowHooks {
    fn from(legacy: LegacyWorkflowHooks) -> Self {
        let mut hooks = legacy.hooks;
        fold("pre_build", legacy.pre_build, &mut hooks.pre_build);
        fold("post_build", legacy.post_build, &mut hooks.post_build);
        fold("archive", legacy.archive, &mut hooks.archive);
        fold("pre_marshal", legacy.pre_marshal, &mut hooks.pre_marshal);
        fold(
            "service_decorator",
            legacy.service_decorator,
            &mut hooks.service_decorators,
        );
        fold("post_marshal", legacy.post_marshal, &mut hooks.post_marshal);
        fold("rollback", legacy.rollback, &mut hooks.rollback);
        hooks
    }
}

/// Put a legacy single decorator in front of a function's decorator list.
pub fn fold_legacy_decorator(
    decorator: Option<Arc<dyn TemplateDecorator>>,
    decorators: &mut Vec<Arc<dyn TemplateDecorator>>,
) {
    fold("decorator", decorator, decorators);
}

/// Run a list of build hooks in order, stopping at the first failure.
pub(crate) fn run_build_hooks(
    kind: &'static str,
    hooks: &[Arc<dyn BuildHook>],
    ctx: &mut HookContext,
    args: &HookArgs,
) -> Result<(), ProvisionError> {
    for (index, hook) in hooks.iter().enumerate() {
        tracing::debug!(hook = kind, index, "running hook");
        hook.run(ctx, args).map_err(|e| hook_error(kind, e))?;
    }
    Ok(())
}

pub(crate) fn hook_error(kind: &'static str, e: HookError) -> ProvisionError {
    ProvisionError::Hook {
        hook: kind,
        message: e.to_string(),
    }
}
