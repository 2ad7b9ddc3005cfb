//! Provisioning workflow: a chain of steps driven to completion.
//!
//! VerifyRoles → Package → Upload → AssembleGraph → Converge
//!
//! Preconditions are checked before the chain and never trigger rollback.
//! A failing step rolls back every side effect registered so far, then the
//! step's own error is returned.

use super::error::ProvisionError;
use super::export::{self, ExportContext, GatewayExporter};
use super::graph::{self, ResourceGraph, TypeRegistry};
use super::hooks::{self, HookArgs, HookContext, WorkflowHooks};
use super::naming;
use super::parser;
use super::resolver::TemplateScope;
use super::roles::{self, RoleMap};
use super::types::{BuildSettings, FunctionDeclaration, ProvenanceEvent, ServiceConfig, SiteDeclaration};
use crate::build::{self, archive, toolchain::Toolchain, PackageSpec};
use crate::provenance::eventlog;
use crate::provider::{
    ConvergeRequest, ConvergenceTarget, IdentityService, ObjectStorage, StackHandle,
    TemplateSource,
};
use crate::upload::rollback::{self, RollbackLedger};
use crate::upload::UploadManager;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Templates larger than this are uploaded and passed by reference.
pub const INLINE_TEMPLATE_LIMIT: usize = 51_200;

pub const TAG_HOME: &str = "stratus:home";
pub const TAG_VERSION: &str = "stratus:version";
pub const TAG_BUILD_ID: &str = "stratus:buildId";
pub const TAG_BUILD_TAGS: &str = "stratus:buildTags";

/// External collaborators for one run.
#[derive(Clone)]
pub struct Providers {
    pub identity: Arc<dyn IdentityService>,
    pub storage: Arc<dyn ObjectStorage>,
    pub convergence: Arc<dyn ConvergenceTarget>,
    pub toolchain: Arc<dyn Toolchain>,
}

/// Everything a run needs besides the providers.
pub struct ProvisionRequest {
    pub service_name: String,
    pub description: Option<String>,
    pub bucket: String,
    pub functions: Vec<FunctionDeclaration>,
    pub gateway: Option<Arc<dyn GatewayExporter>>,
    pub site: Option<SiteDeclaration>,
    pub params: IndexMap<String, serde_json::Value>,
    pub build: BuildSettings,
    pub build_id: Option<String>,
    pub dry_run: bool,
    pub hooks: WorkflowHooks,
    pub log_level: String,
    /// Provenance event log location; no log when unset
    pub state_dir: Option<PathBuf>,
    /// Receives the indented template when set
    pub template_out: Option<PathBuf>,
}

impl ProvisionRequest {
    pub fn new(
        service_name: impl Into<String>,
        bucket: impl Into<String>,
        functions: Vec<FunctionDeclaration>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            description: None,
            bucket: bucket.into(),
            functions,
            gateway: None,
            site: None,
            params: IndexMap::new(),
            build: BuildSettings::default(),
            build_id: None,
            dry_run: false,
            hooks: WorkflowHooks::default(),
            log_level: "info".to_string(),
            state_dir: None,
            template_out: None,
        }
    }

    /// Request for a parsed stratus.yaml.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, String> {
        let functions = parser::declarations(config)?;
        let mut request = Self::new(config.name.as_str(), config.bucket.as_str(), functions);
        request.description = config.description.clone();
        request.site = config.site.clone();
        request.params = config.params.clone();
        request.build = config.build.clone();
        Ok(request)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub build_id: String,
    pub archive_key: String,
    pub site_key: Option<String>,
    /// Compact serialized template
    pub template: String,
    pub resource_count: usize,
    /// Converged stack; `None` for dry runs
    pub stack: Option<StackHandle>,
}

/// State owned by the engine for one run.
pub struct WorkflowContext {
    request: ProvisionRequest,
    providers: Providers,
    build_id: String,
    started_at: String,
    graph: ResourceGraph,
    roles: RoleMap,
    hook_ctx: HookContext,
    hook_args: HookArgs,
    ledger: RollbackLedger,
    archive_key: Option<String>,
    site_key: Option<String>,
    template: Option<String>,
    stack: Option<StackHandle>,
}

impl WorkflowContext {
    fn new(request: ProvisionRequest, providers: Providers) -> Self {
        let build_id = request
            .build_id
            .clone()
            .unwrap_or_else(eventlog::generate_build_id);
        let hook_args = HookArgs {
            service_name: request.service_name.clone(),
            bucket: request.bucket.clone(),
            build_id: build_id.clone(),
            dry_run: request.dry_run,
        };
        let mut graph = ResourceGraph::new(Arc::new(TypeRegistry::builtin()));
        if let Some(description) = &request.description {
            graph.set_description(description.as_str());
        }
        Self {
            hook_ctx: request.hooks.context.clone(),
            providers,
            build_id,
            started_at: eventlog::now_iso8601(),
            graph,
            roles: RoleMap::new(),
            hook_args,
            ledger: RollbackLedger::new(),
            archive_key: None,
            site_key: None,
            template: None,
            stack: None,
            request,
        }
    }

    fn upload_manager(&self) -> UploadManager {
        UploadManager::new(
            Arc::clone(&self.providers.storage),
            &self.request.bucket,
            &self.request.service_name,
            self.request.dry_run,
            self.ledger.clone(),
        )
    }

    fn record(&self, event: ProvenanceEvent) {
        let Some(state_dir) = &self.request.state_dir else {
            return;
        };
        if let Err(e) = eventlog::append_event(state_dir, &self.request.service_name, event) {
            tracing::warn!(error = %e, "failed to append provenance event");
        }
    }

    /// Undo every registered side effect and run the rollback hooks.
    async fn rollback(&mut self) {
        let actions = self.ledger.take();
        tracing::warn!(actions = actions.len(), "rolling back");
        self.record(ProvenanceEvent::RollbackInvoked {
            service: self.request.service_name.clone(),
            actions: u32::try_from(actions.len()).unwrap_or(u32::MAX),
        });
        let failures = rollback::rollback_all(
            actions,
            &self.request.hooks.rollback,
            &self.hook_ctx,
            &self.hook_args,
        )
        .await;
        if failures > 0 {
            tracing::warn!(failures, "rollback finished with failures");
        }
    }

    fn into_outcome(self) -> ProvisionOutcome {
        ProvisionOutcome {
            resource_count: self.graph.len(),
            build_id: self.build_id,
            archive_key: self.archive_key.unwrap_or_default(),
            site_key: self.site_key,
            template: self.template.unwrap_or_default(),
            stack: self.stack,
        }
    }
}

/// One stage of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    VerifyRoles,
    Package,
    Upload {
        archive: PathBuf,
        site: Option<PathBuf>,
    },
    AssembleGraph,
    Converge,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Self::VerifyRoles => "verify_roles",
            Self::Package => "package",
            Self::Upload { .. } => "upload",
            Self::AssembleGraph => "assemble_graph",
            Self::Converge => "converge",
        }
    }

    /// Run this step. `Ok(None)` ends the chain.
    pub async fn run(self, ctx: &mut WorkflowContext) -> Result<Option<Step>, ProvisionError> {
        match self {
            Self::VerifyRoles => verify_roles(ctx).await,
            Self::Package => package(ctx),
            Self::Upload { archive, site } => upload(ctx, &archive, site.as_deref()).await,
            Self::AssembleGraph => assemble_graph(ctx),
            Self::Converge => converge(ctx).await,
        }
    }
}

async fn verify_roles(ctx: &mut WorkflowContext) -> Result<Option<Step>, ProvisionError> {
    ctx.roles = roles::resolve(
        &ctx.request.service_name,
        &ctx.request.functions,
        &mut ctx.graph,
        ctx.providers.identity.as_ref(),
    )
    .await?;
    tracing::info!(roles = ctx.roles.len(), "execution roles resolved");
    Ok(Some(Step::Package))
}

fn package(ctx: &mut WorkflowContext) -> Result<Option<Step>, ProvisionError> {
    let spec = PackageSpec {
        service_name: &ctx.request.service_name,
        functions: &ctx.request.functions,
        settings: &ctx.request.build,
        build_id: &ctx.build_id,
    };
    let archive = build::build_and_package(
        ctx.providers.toolchain.as_ref(),
        &spec,
        &ctx.request.hooks,
        &mut ctx.hook_ctx,
        &ctx.hook_args,
    )?;

    let site = match &ctx.request.site {
        Some(site) => {
            let output = site_archive_path(&ctx.request.build, &ctx.request.service_name, &ctx.build_id);
            match archive::archive_directory(Path::new(&site.resources), &output) {
                Ok(path) => Some(path),
                Err(e) => {
                    if let Err(rm) = std::fs::remove_file(&archive) {
                        tracing::warn!(file = %archive.display(), error = %rm, "failed to delete archive");
                    }
                    return Err(ProvisionError::Build(format!("site archive: {}", e)));
                }
            }
        }
        None => None,
    };
    Ok(Some(Step::Upload { archive, site }))
}

fn site_archive_path(settings: &BuildSettings, service_name: &str, build_id: &str) -> PathBuf {
    Path::new(&settings.work_dir).join(format!(
        "{}-site-{}.zip",
        naming::file_component(service_name),
        naming::file_component(build_id)
    ))
}

async fn upload(
    ctx: &mut WorkflowContext,
    archive: &Path,
    site: Option<&Path>,
) -> Result<Option<Step>, ProvisionError> {
    let uploaded = ctx.upload_manager().upload_artifacts(archive, site).await?;
    ctx.archive_key = Some(uploaded.archive_key);
    ctx.site_key = uploaded.site_key;
    Ok(Some(Step::AssembleGraph))
}

fn assemble_graph(ctx: &mut WorkflowContext) -> Result<Option<Step>, ProvisionError> {
    let WorkflowContext {
        request,
        build_id,
        graph,
        roles,
        hook_ctx,
        hook_args,
        archive_key,
        site_key,
        template,
        ..
    } = ctx;

    hooks::run_build_hooks("pre_marshal", &request.hooks.pre_marshal, hook_ctx, hook_args)?;

    let export_ctx = ExportContext {
        service_name: &request.service_name,
        bucket: &request.bucket,
        archive_key: archive_key.as_deref().unwrap_or_default(),
        roles,
        scope: TemplateScope {
            params: &request.params,
            service_name: &request.service_name,
            build_id,
        },
        log_level: &request.log_level,
    };

    for function in &request.functions {
        export::export_function(function, &export_ctx, graph, hook_ctx, hook_args)?;
    }

    let gateway = match &request.gateway {
        Some(gateway) => Some(export::export_gateway(gateway.as_ref(), &export_ctx, graph)?),
        None => None,
    };

    let mut site_graph = None;
    if let (Some(site), Some(key)) = (&request.site, site_key.as_deref()) {
        let mut scratch = graph.scratch();
        let no_outputs = IndexMap::new();
        let gateway_outputs = gateway.as_ref().map(|g| g.outputs()).unwrap_or(&no_outputs);
        export::export_site(site, key, gateway_outputs, &export_ctx, &mut scratch)?;
        site_graph = Some(scratch);
    }

    let mut decorated = graph.scratch();
    for (index, decorator) in request.hooks.service_decorators.iter().enumerate() {
        tracing::debug!(hook = "service_decorator", index, "running hook");
        decorator
            .decorate(hook_ctx, hook_args, &mut decorated)
            .map_err(|e| hooks::hook_error("service_decorator", e))?;
    }

    for scratch in [gateway.as_ref(), site_graph.as_ref(), Some(&decorated)]
        .into_iter()
        .flatten()
    {
        graph::merge(scratch, graph)?;
    }

    graph.annotate_discovery_info();
    let order = graph.execution_order()?;
    tracing::debug!(resources = order.len(), "dependency order validated");

    hooks::run_build_hooks("post_marshal", &request.hooks.post_marshal, hook_ctx, hook_args)?;

    let serialized = graph.serialize()?;
    if let Some(path) = &request.template_out {
        write_template(path, &graph.serialize_pretty()?)?;
    }
    tracing::info!(
        resources = graph.len(),
        bytes = serialized.len(),
        "template assembled"
    );
    *template = Some(serialized);
    Ok(Some(Step::Converge))
}

fn write_template(path: &Path, body: &str) -> Result<(), ProvisionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ProvisionError::Io(format!("cannot create dir {}: {}", parent.display(), e)))?;
    }
    std::fs::write(path, body)
        .map_err(|e| ProvisionError::Io(format!("cannot write {}: {}", path.display(), e)))?;
    tracing::info!(file = %path.display(), "template written");
    Ok(())
}

/// Remote key for an uploaded template.
pub fn template_key(service_name: &str, build_id: &str) -> String {
    format!(
        "{}/{}-{:x}-cf.json",
        service_name,
        naming::sanitize(service_name),
        Sha256::digest(build_id.as_bytes())
    )
}

/// Tags applied to the converged stack.
pub fn stack_tags(build_id: &str, build_tags: &[String]) -> IndexMap<String, String> {
    let mut tags = IndexMap::new();
    tags.insert(TAG_HOME.to_string(), env!("CARGO_PKG_REPOSITORY").to_string());
    tags.insert(TAG_VERSION.to_string(), env!("CARGO_PKG_VERSION").to_string());
    tags.insert(TAG_BUILD_ID.to_string(), build_id.to_string());
    if !build_tags.is_empty() {
        tags.insert(TAG_BUILD_TAGS.to_string(), build_tags.join(","));
    }
    tags
}

async fn converge(ctx: &mut WorkflowContext) -> Result<Option<Step>, ProvisionError> {
    if ctx.request.dry_run {
        tracing::info!(stack = %ctx.request.service_name, "dry run: convergence skipped");
        return Ok(None);
    }
    let body = ctx.template.clone().unwrap_or_default();
    let source = if body.len() > INLINE_TEMPLATE_LIMIT {
        let key = template_key(&ctx.request.service_name, &ctx.build_id);
        ctx.upload_manager().upload_bytes(&key, body.into_bytes()).await?;
        TemplateSource::Reference {
            bucket: ctx.request.bucket.clone(),
            key,
        }
    } else {
        TemplateSource::Inline(body)
    };

    let request = ConvergeRequest {
        stack_name: ctx.request.service_name.clone(),
        template: source,
        tags: stack_tags(&ctx.build_id, &ctx.request.build.tags),
        started_at: ctx.started_at.clone(),
    };
    let handle = ctx
        .providers
        .convergence
        .converge(request)
        .await
        .map_err(ProvisionError::Converge)?;
    tracing::info!(stack = %handle.stack_name, stack_id = %handle.stack_id, "stack converged");
    ctx.stack = Some(handle);
    Ok(None)
}

fn check_preconditions(request: &ProvisionRequest) -> Result<(), ProvisionError> {
    let mut messages: Vec<String> = Vec::new();
    if let Some(e) = parser::check_service_name(&request.service_name) {
        messages.push(format!("service {}", e.message));
    }
    if request.bucket.trim().is_empty() {
        messages.push("bucket must not be empty".to_string());
    }
    messages.extend(
        parser::check_declarations(&request.functions)
            .into_iter()
            .map(|e| e.message),
    );
    if messages.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::Precondition(messages))
    }
}

/// Run the whole chain.
pub async fn provision(
    request: ProvisionRequest,
    providers: Providers,
) -> Result<ProvisionOutcome, ProvisionError> {
    check_preconditions(&request)?;

    let start = Instant::now();
    let mut ctx = WorkflowContext::new(request, providers);
    let service = ctx.request.service_name.clone();
    tracing::info!(
        service = %service,
        build_id = %ctx.build_id,
        dry_run = ctx.request.dry_run,
        "provisioning"
    );
    ctx.record(ProvenanceEvent::ProvisionStarted {
        service: service.clone(),
        build_id: ctx.build_id.clone(),
        dry_run: ctx.request.dry_run,
        stratus_version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let mut step = Some(Step::VerifyRoles);
    while let Some(current) = step.take() {
        let name = current.name();
        let step_start = Instant::now();
        tracing::debug!(step = name, "step started");
        match current.run(&mut ctx).await {
            Ok(next) => {
                ctx.record(ProvenanceEvent::StepCompleted {
                    service: service.clone(),
                    step: name.to_string(),
                    duration_seconds: step_start.elapsed().as_secs_f64(),
                });
                step = next;
            }
            Err(e) => {
                tracing::error!(step = name, error = %e, "step failed");
                ctx.record(ProvenanceEvent::StepFailed {
                    service: service.clone(),
                    step: name.to_string(),
                    error: e.to_string(),
                });
                ctx.rollback().await;
                return Err(e);
            }
        }
    }

    let elapsed = start.elapsed();
    ctx.record(ProvenanceEvent::ProvisionCompleted {
        service: service.clone(),
        build_id: ctx.build_id.clone(),
        total_seconds: elapsed.as_secs_f64(),
    });
    tracing::info!(service = %service, elapsed_ms = elapsed.as_millis() as u64, "provisioning complete");
    Ok(ctx.into_outcome())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::toolchain::PrebuiltToolchain;
    use crate::core::error::GraphError;
    use crate::core::graph::{Output, ResourceNode, ROLE_TYPE};
    use crate::core::hooks::{BuildHook, HookError, RollbackHook, ServiceDecoratorHook};
    use crate::core::types::{Privilege, RoleDefinition, RoleRequirement};
    use crate::provider::memory::{MemoryConvergenceTarget, MemoryIdentityService, MemoryObjectStorage};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        dir: tempfile::TempDir,
        identity: Arc<MemoryIdentityService>,
        storage: Arc<MemoryObjectStorage>,
        convergence: Arc<MemoryConvergenceTarget>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with(MemoryObjectStorage::new(), MemoryConvergenceTarget::new())
        }

        fn with(storage: MemoryObjectStorage, convergence: MemoryConvergenceTarget) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                identity: Arc::new(MemoryIdentityService::new().with_role("ops", "arn:aws:iam::1:role/ops")),
                storage: Arc::new(storage),
                convergence: Arc::new(convergence),
            }
        }

        fn providers(&self) -> Providers {
            Providers {
                identity: self.identity.clone(),
                storage: self.storage.clone(),
                convergence: self.convergence.clone(),
                toolchain: Arc::new(PrebuiltToolchain::new(b"ELF".to_vec())),
            }
        }

        fn request(&self, functions: Vec<FunctionDeclaration>) -> ProvisionRequest {
            let mut request = ProvisionRequest::new("hello", "artifacts", functions);
            request.build.work_dir = self.dir.path().join("work").display().to_string();
            request.build_id = Some("b-1".into());
            request.state_dir = Some(self.dir.path().join("state"));
            request
        }

        fn events(&self) -> Vec<Value> {
            eventlog::read_events(&self.dir.path().join("state"), "hello")
                .unwrap()
                .into_iter()
                .map(|e| serde_json::to_value(e).unwrap())
                .collect()
        }
    }

    fn inline_function() -> FunctionDeclaration {
        let read_data = Privilege {
            actions: vec!["s3:GetObject".into()],
            resource: json!("arn:aws:s3:::data/*"),
        };
        FunctionDeclaration::new(
            "hello::greet",
            RoleRequirement::inline(RoleDefinition::new(vec![read_data])),
        )
    }

    fn parse(template: &str) -> Value {
        serde_json::from_str(template).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let fx = Fixture::new();
        let outcome = provision(fx.request(vec![inline_function()]), fx.providers())
            .await
            .unwrap();

        assert_eq!(outcome.archive_key, "hello/hello-b-1.zip");
        assert!(fx.storage.get("artifacts", &outcome.archive_key).is_some());
        assert_eq!(outcome.resource_count, 2);
        assert_eq!(outcome.stack.as_ref().unwrap().stack_id, "memory:hello");

        let requests = fx.convergence.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tags[TAG_BUILD_ID], "b-1");
        let TemplateSource::Inline(body) = &requests[0].template else {
            panic!("expected inline template");
        };
        let template = parse(body);
        let resources = template["Resources"].as_object().unwrap();
        assert_eq!(resources.len(), 2);
        let roles: Vec<&Value> = resources.values().filter(|r| r["Type"] == ROLE_TYPE).collect();
        assert_eq!(roles.len(), 1);
        let statements = roles[0]["Properties"]["Policies"][0]["PolicyDocument"]["Statement"]
            .as_array()
            .unwrap();
        assert!(statements.iter().any(|s| {
            s["Action"] == json!(["s3:GetObject"]) && s["Resource"] == "arn:aws:s3:::data/*"
        }));
        assert!(fx.storage.deleted().is_empty());
        assert!(!build::archive_path(&fx.request(vec![]).build, "hello", "b-1").exists());

        let events = fx.events();
        assert_eq!(events.first().unwrap()["event"], "provision_started");
        assert_eq!(events.last().unwrap()["event"], "provision_completed");
        assert_eq!(
            events.iter().filter(|e| e["event"] == "step_completed").count(),
            5
        );
    }

    #[tokio::test]
    async fn test_converge_failure_rolls_back_once() {
        let fx = Fixture::with(
            MemoryObjectStorage::new(),
            MemoryConvergenceTarget::new().rejecting("stack is locked"),
        );
        let err = provision(fx.request(vec![inline_function()]), fx.providers())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Converge(ref m) if m == "stack is locked"));
        assert_eq!(fx.storage.deleted(), vec!["hello/hello-b-1.zip"]);

        let events = fx.events();
        let rollbacks: Vec<&Value> = events
            .iter()
            .filter(|e| e["event"] == "rollback_invoked")
            .collect();
        assert_eq!(rollbacks.len(), 1);
        assert_eq!(rollbacks[0]["actions"], 1);
        assert!(events.iter().any(|e| e["event"] == "step_failed" && e["step"] == "converge"));
    }

    #[tokio::test]
    async fn test_dry_run_is_idempotent_and_side_effect_free() {
        let fx = Fixture::new();
        let mut templates = Vec::new();
        for _ in 0..2 {
            let mut request = fx.request(vec![inline_function()]);
            request.dry_run = true;
            let outcome = provision(request, fx.providers()).await.unwrap();
            assert!(outcome.stack.is_none());
            templates.push(outcome.template);
        }
        assert_eq!(templates[0], templates[1]);
        assert!(!templates[0].is_empty());
        assert_eq!(fx.storage.put_count(), 0);
        assert!(fx.convergence.requests().is_empty());
        let archive = build::archive_path(&fx.request(vec![]).build, "hello", "b-1");
        assert_eq!(archive, fx.dir.path().join("work").join("hello-b-1.zip"));
        assert!(fx.dir.path().join("work").is_dir());
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn test_duplicate_names_fail_before_side_effects() {
        let fx = Fixture::new();
        let functions = vec![
            FunctionDeclaration::new("a::main", RoleRequirement::Named("ops".into())),
            FunctionDeclaration::new("b::main", RoleRequirement::Named("ops".into())),
        ];
        let err = provision(fx.request(functions), fx.providers()).await.unwrap_err();
        match err {
            ProvisionError::Precondition(messages) => {
                assert_eq!(messages.len(), 1);
                assert!(messages[0].contains("'main'"));
            }
            other => panic!("expected precondition error, got {}", other),
        }
        assert!(fx.identity.lookups().is_empty());
        assert_eq!(fx.storage.put_count(), 0);
        assert!(fx.events().is_empty());
    }

    #[tokio::test]
    async fn test_empty_request_is_precondition_error() {
        let fx = Fixture::new();
        let err = provision(fx.request(vec![]), fx.providers()).await.unwrap_err();
        assert!(err.to_string().contains("no functions declared"));
    }

    #[tokio::test]
    async fn test_path_like_service_name_is_precondition_error() {
        let fx = Fixture::new();
        let mut request = fx.request(vec![inline_function()]);
        request.service_name = "../../../escaped".into();
        let err = provision(request, fx.providers()).await.unwrap_err();
        match err {
            ProvisionError::Precondition(messages) => {
                assert_eq!(messages.len(), 1);
                assert!(messages[0].starts_with("service name '../../../escaped'"));
            }
            other => panic!("expected precondition error, got {}", other),
        }
        assert_eq!(fx.storage.put_count(), 0);
        assert!(fx.convergence.requests().is_empty());
        assert!(!fx.dir.path().join("work").exists());
    }

    #[tokio::test]
    async fn test_shared_inline_role_declared_once() {
        let fx = Fixture::new();
        let shared = RoleDefinition::new(vec![]);
        let functions: Vec<FunctionDeclaration> = ["a", "b", "c"]
            .iter()
            .map(|n| {
                FunctionDeclaration::new(format!("hello::{}", n), RoleRequirement::inline(Arc::clone(&shared)))
            })
            .collect();
        let mut request = fx.request(functions);
        request.dry_run = true;
        let outcome = provision(request, fx.providers()).await.unwrap();
        let template = parse(&outcome.template);
        let roles = template["Resources"]
            .as_object()
            .unwrap()
            .values()
            .filter(|r| r["Type"] == ROLE_TYPE)
            .count();
        assert_eq!(roles, 1);
        assert_eq!(outcome.resource_count, 4);
    }

    #[tokio::test]
    async fn test_missing_named_role_aborts_without_rollback_actions() {
        let fx = Fixture::new();
        let functions = vec![FunctionDeclaration::new("hello::greet", RoleRequirement::Named("ghost".into()))];
        let err = provision(fx.request(functions), fx.providers()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::RoleNotFound(ref n) if n == "ghost"));
        assert_eq!(fx.storage.put_count(), 0);
        let events = fx.events();
        assert!(events.iter().any(|e| e["event"] == "rollback_invoked" && e["actions"] == 0));
    }

    #[tokio::test]
    async fn test_large_template_passed_by_reference() {
        let fx = Fixture::with(
            MemoryObjectStorage::new(),
            MemoryConvergenceTarget::new().rejecting("boom"),
        );
        let mut function = inline_function();
        function
            .options
            .environment
            .insert("PAYLOAD".into(), "x".repeat(INLINE_TEMPLATE_LIMIT));
        let err = provision(fx.request(vec![function]), fx.providers()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Converge(_)));

        let key = template_key("hello", "b-1");
        assert!(key.starts_with("hello/hello-"));
        assert!(key.ends_with("-cf.json"));
        let requests = fx.convergence.requests();
        assert_eq!(
            requests[0].template,
            TemplateSource::Reference {
                bucket: "artifacts".into(),
                key: key.clone(),
            }
        );
        let mut deleted = fx.storage.deleted();
        deleted.sort();
        let mut expected = vec!["hello/hello-b-1.zip".to_string(), key];
        expected.sort();
        assert_eq!(deleted, expected);
    }

    #[tokio::test]
    async fn test_hooks_around_assembly() {
        let fx = Fixture::new();
        let mut request = fx.request(vec![inline_function()]);
        request.dry_run = true;
        request.hooks.context.insert("seed".into(), json!(1));

        let pre: Arc<dyn BuildHook> = Arc::new(|ctx: &mut HookContext, _: &HookArgs| -> Result<(), HookError> {
            let seed = ctx["seed"].clone();
            ctx.insert("pre".into(), seed);
            Ok(())
        });
        let decorator: Arc<dyn ServiceDecoratorHook> = Arc::new(
            |ctx: &mut HookContext, args: &HookArgs, scratch: &mut ResourceGraph| -> Result<(), HookError> {
                assert!(ctx.contains_key("pre"));
                scratch.add_resource(
                    "Dashboard",
                    ResourceNode::new("AWS::CloudWatch::Dashboard", json!({ "Name": args.service_name })),
                )?;
                Ok(())
            },
        );
        let post: Arc<dyn BuildHook> = Arc::new(|ctx: &mut HookContext, _: &HookArgs| -> Result<(), HookError> {
            ctx.insert("post".into(), json!(true));
            Ok(())
        });
        request.hooks.pre_marshal.push(pre);
        request.hooks.service_decorators.push(decorator);
        request.hooks.post_marshal.push(post);
        let out = fx.dir.path().join("out").join("template.json");
        request.template_out = Some(out.clone());

        let outcome = provision(request, fx.providers()).await.unwrap();
        let template = parse(&outcome.template);
        assert_eq!(template["Resources"]["Dashboard"]["Properties"]["Name"], "hello");
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(parse(&written), template);
        assert!(written.contains('\n'));
    }

    #[tokio::test]
    async fn test_decorator_collision_fails_and_runs_rollback_hooks() {
        let fx = Fixture::new();
        let mut request = fx.request(vec![inline_function()]);
        let logical = request.functions[0].logical_name();
        let clash: Arc<dyn ServiceDecoratorHook> = Arc::new(
            move |_: &mut HookContext, _: &HookArgs, scratch: &mut ResourceGraph| -> Result<(), HookError> {
                scratch.add_resource(logical.clone(), ResourceNode::new("AWS::SNS::Topic", json!({})))?;
                Ok(())
            },
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let on_rollback: Arc<dyn RollbackHook> = Arc::new(move |_: &HookContext, args: &HookArgs| {
            if args.build_id == "b-1" {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        request.hooks.service_decorators.push(clash);
        request.hooks.rollback.push(on_rollback);

        let err = provision(request, fx.providers()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Graph(GraphError::MergeConflicts(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.storage.deleted(), vec!["hello/hello-b-1.zip"]);
        assert!(fx.convergence.requests().is_empty());
    }

    struct Gateway;

    impl GatewayExporter for Gateway {
        fn export(&self, ctx: &ExportContext<'_>, scratch: &mut ResourceGraph) -> Result<(), String> {
            scratch
                .add_output(
                    "ApiURL",
                    Output::new("API URL", json!(format!("https://{}.example", ctx.service_name))),
                )
                .map_err(|e| e.to_string())
        }
    }

    #[tokio::test]
    async fn test_site_and_gateway() {
        let fx = Fixture::new();
        let site_dir = fx.dir.path().join("site");
        std::fs::create_dir_all(&site_dir).unwrap();
        std::fs::write(site_dir.join("index.html"), "<h1>hi</h1>").unwrap();

        let mut request = fx.request(vec![inline_function()]);
        request.gateway = Some(Arc::new(Gateway));
        request.site = Some(SiteDeclaration {
            resources: site_dir.display().to_string(),
            index_document: "index.html".into(),
            error_document: "error.html".into(),
        });
        let outcome = provision(request, fx.providers()).await.unwrap();

        assert_eq!(outcome.site_key.as_deref(), Some("hello/hello-site-b-1.zip"));
        assert!(fx.storage.get("artifacts", "hello/hello-site-b-1.zip").is_some());
        let template = parse(&outcome.template);
        assert!(template["Outputs"]["SiteURL"].is_object());
        assert_eq!(template["Outputs"]["ApiURL"]["Value"], "https://hello.example");
        assert_eq!(outcome.resource_count, 7);
    }

    #[test]
    fn test_stack_tags() {
        let tags = stack_tags("b-9", &[]);
        assert_eq!(tags[TAG_BUILD_ID], "b-9");
        assert_eq!(tags[TAG_VERSION], env!("CARGO_PKG_VERSION"));
        assert!(!tags.contains_key(TAG_BUILD_TAGS));
        let tags = stack_tags("b-9", &["metrics".into(), "trace".into()]);
        assert_eq!(tags[TAG_BUILD_TAGS], "metrics,trace");
    }

    #[test]
    fn test_template_key_stable() {
        assert_eq!(template_key("my svc", "b-1"), template_key("my svc", "b-1"));
        assert_ne!(template_key("hello", "b-1"), template_key("hello", "b-2"));
        assert!(template_key("my svc", "b-1").starts_with("my svc/my_svc-"));
    }

    #[test]
    fn test_request_from_config() {
        let config = parser::parse_config(
            r#"
version: "1.0"
name: hello
bucket: artifacts
params: { stage: dev }
functions:
  - handler: hello::greet
    role: { name: ops }
"#,
        )
        .unwrap();
        let request = ProvisionRequest::from_config(&config).unwrap();
        assert_eq!(request.service_name, "hello");
        assert_eq!(request.functions.len(), 1);
        assert_eq!(request.params["stage"], "dev");
        assert!(!request.dry_run);
    }
}
