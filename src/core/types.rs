//! Service declaration types, stack lock types, and provenance events.
//!
//! The YAML schema (`stratus.yaml`) deserializes into [`ServiceConfig`]; the
//! workflow operates on the in-memory [`FunctionDeclaration`] values produced
//! from it (or built directly through the library API).

use super::hooks::{self, TemplateDecorator};
use super::naming;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

// ============================================================================
// Top-level stratus.yaml
// ============================================================================

/// Root configuration: one serverless service.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServiceConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Service name. Also the stack name and the artifact key prefix.
    pub name: String,

    /// Optional description, copied into the template
    #[serde(default)]
    pub description: Option<String>,

    /// Bucket receiving archives and templates
    pub bucket: String,

    /// Parameters available to `{{params.key}}` templates
    #[serde(default)]
    pub params: IndexMap<String, serde_json::Value>,

    /// Shared inline role definitions, referenced by name from functions
    #[serde(default)]
    pub roles: IndexMap<String, RoleDefinitionConfig>,

    /// Build settings
    #[serde(default)]
    pub build: BuildSettings,

    /// Function declarations (order-preserving)
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,

    /// Optional static site bundled with the service
    #[serde(default)]
    pub site: Option<SiteDeclaration>,
}

/// Compile settings for the function binary.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildSettings {
    /// Directory holding the Cargo manifest
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: String,

    /// Binary target name (defaults to the package name)
    #[serde(default)]
    pub binary: Option<String>,

    /// Target triple
    #[serde(default = "default_target")]
    pub target: String,

    /// Cargo features. Every build also sets `--cfg lambda_binary`.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Code generation command run in `manifest_dir` before compiling,
    /// e.g. `["cargo", "run", "-p", "codegen"]`
    #[serde(default)]
    pub generate: Vec<String>,

    /// Scratch directory for compiled binaries and archives
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            manifest_dir: default_manifest_dir(),
            binary: None,
            target: default_target(),
            tags: Vec::new(),
            generate: Vec::new(),
            work_dir: default_work_dir(),
        }
    }
}

fn default_manifest_dir() -> String {
    ".".to_string()
}

fn default_target() -> String {
    "x86_64-unknown-linux-musl".to_string()
}

fn default_work_dir() -> String {
    ".stratus".to_string()
}

/// One function as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FunctionConfig {
    /// Handler path, e.g. `hello::handlers::greet`
    pub handler: String,

    /// Explicit stable name (otherwise derived from the handler path)
    #[serde(default)]
    pub name: Option<String>,

    /// Execution role, written as a one-key map (`{ name: ops }`)
    #[serde(default, with = "serde_yaml_ng::with::singleton_map")]
    #[schemars(with = "Option<RoleConfig>")]
    pub role: Option<RoleConfig>,

    #[serde(default)]
    pub options: FunctionOptions,

    #[serde(default)]
    pub permissions: Vec<Permission>,

    #[serde(default)]
    pub event_source_mappings: Vec<EventSourceMapping>,

    #[serde(default)]
    pub custom_resources: Vec<CustomResourceConfig>,

    /// Extra logical names this function depends on
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A custom resource as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CustomResourceConfig {
    pub handler: String,

    #[serde(default, with = "serde_yaml_ng::with::singleton_map")]
    #[schemars(with = "Option<RoleConfig>")]
    pub role: Option<RoleConfig>,

    #[serde(default)]
    pub options: FunctionOptions,

    #[serde(default)]
    pub properties: IndexMap<String, serde_json::Value>,
}

/// Role reference as written in YAML: exactly one form.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RoleConfig {
    /// Pre-existing role, verified before provisioning
    Name(String),
    /// Inline definition private to this function
    Inline(RoleDefinitionConfig),
    /// Shared definition from the top-level `roles` map
    Definition(String),
}

/// Inline role definition as written in YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RoleDefinitionConfig {
    #[serde(default)]
    pub privileges: Vec<Privilege>,
}

/// Static site bundled next to the service.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SiteDeclaration {
    /// Local directory with the site content
    pub resources: String,

    #[serde(default = "default_index_document")]
    pub index_document: String,

    #[serde(default = "default_error_document")]
    pub error_document: String,
}

fn default_index_document() -> String {
    "index.html".to_string()
}

fn default_error_document() -> String {
    "error.html".to_string()
}

// ============================================================================
// Function building blocks
// ============================================================================

/// One allowed privilege inside a role definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Privilege {
    pub actions: Vec<String>,

    /// ARN string or template expression
    pub resource: serde_json::Value,
}

/// Execution options for a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FunctionOptions {
    #[serde(default)]
    pub description: Option<String>,

    /// Memory limit (MB)
    #[serde(default = "default_memory")]
    pub memory_size: u32,

    /// Timeout (seconds)
    #[serde(default = "default_timeout")]
    pub timeout: u32,

    #[serde(default)]
    pub environment: IndexMap<String, String>,

    #[serde(default)]
    pub vpc: Option<VpcConfig>,

    #[serde(default)]
    pub reserved_concurrency: Option<u32>,

    #[serde(default)]
    pub dead_letter_arn: Option<String>,

    #[serde(default)]
    pub kms_key_arn: Option<String>,

    #[serde(default)]
    pub tags: IndexMap<String, String>,
}

impl Default for FunctionOptions {
    fn default() -> Self {
        Self {
            description: None,
            memory_size: default_memory(),
            timeout: default_timeout(),
            environment: IndexMap::new(),
            vpc: None,
            reserved_concurrency: None,
            dead_letter_arn: None,
            kms_key_arn: None,
            tags: IndexMap::new(),
        }
    }
}

fn default_memory() -> u32 {
    128
}

fn default_timeout() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VpcConfig {
    pub security_group_ids: Vec<String>,
    pub subnet_ids: Vec<String>,
}

/// Push-based invocation permission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Permission {
    /// Service principal, e.g. `sns.amazonaws.com`
    pub principal: String,

    #[serde(default)]
    pub source_arn: Option<String>,

    #[serde(default)]
    pub source_account: Option<String>,
}

/// Pull-based event source mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventSourceMapping {
    pub event_source_arn: String,

    #[serde(default = "default_starting_position")]
    pub starting_position: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default)]
    pub disabled: bool,
}

fn default_starting_position() -> String {
    "LATEST".to_string()
}

fn default_batch_size() -> u32 {
    100
}

// ============================================================================
// Roles
// ============================================================================

/// Reusable set of privileges. Shared between functions by `Arc`; identity is
/// the pointer, not the contents.
#[derive(Debug, Default)]
pub struct RoleDefinition {
    pub privileges: Vec<Privilege>,
    cached_logical_name: OnceLock<String>,
}

impl RoleDefinition {
    pub fn new(privileges: Vec<Privilege>) -> Arc<Self> {
        Arc::new(Self {
            privileges,
            cached_logical_name: OnceLock::new(),
        })
    }

    /// Logical name of the role resource. Fixed by the first owner that asks.
    pub fn logical_name(&self, service_name: &str, owner: &str) -> &str {
        self.cached_logical_name
            .get_or_init(|| naming::derive("IAMRole", &[service_name, owner]))
    }
}

impl From<&RoleDefinitionConfig> for Arc<RoleDefinition> {
    fn from(cfg: &RoleDefinitionConfig) -> Self {
        RoleDefinition::new(cfg.privileges.clone())
    }
}

/// Execution identity: an existing role or an inline definition.
#[derive(Debug, Clone)]
pub enum RoleRequirement {
    Named(String),
    Inline(Arc<RoleDefinition>),
}

impl RoleRequirement {
    /// Reference an existing role. Empty names are rejected.
    pub fn named(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err("role name must not be empty".to_string());
        }
        Ok(Self::Named(name))
    }

    pub fn inline(definition: Arc<RoleDefinition>) -> Self {
        Self::Inline(definition)
    }

    /// Key under which the resolved reference is cached.
    pub fn identity_key(&self, service_name: &str, owner: &str) -> String {
        match self {
            Self::Named(name) => name.clone(),
            Self::Inline(def) => def.logical_name(service_name, owner).to_string(),
        }
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// Lambda-backed custom resource owned by a function.
#[derive(Debug, Clone)]
pub struct CustomResourceDeclaration {
    pub handler: String,
    pub role: RoleRequirement,
    pub options: FunctionOptions,
    pub properties: IndexMap<String, serde_json::Value>,
}

impl CustomResourceDeclaration {
    pub fn new(handler: impl Into<String>, role: RoleRequirement) -> Self {
        Self {
            handler: handler.into(),
            role,
            options: FunctionOptions::default(),
            properties: IndexMap::new(),
        }
    }

    /// Internal function name for dispatch.
    pub fn function_name(&self) -> String {
        naming::sanitize(&self.handler)
    }

    /// Logical name of the custom-resource invocation. Depends only on the
    /// handler so it stays stable across runs.
    pub fn logical_name(&self) -> String {
        naming::derive(&self.function_name(), &[&self.handler])
    }

    /// Logical name of the backing function resource.
    pub fn function_logical_name(&self) -> String {
        naming::derive(
            "CustomResourceLambda",
            &[&self.function_name(), &self.logical_name()],
        )
    }
}

/// One deployable function.
#[derive(Clone)]
pub struct FunctionDeclaration {
    pub handler: String,
    pub explicit_name: Option<String>,
    pub role: RoleRequirement,
    pub options: FunctionOptions,
    pub permissions: Vec<Permission>,
    pub event_source_mappings: Vec<EventSourceMapping>,
    pub decorators: Vec<Arc<dyn TemplateDecorator>>,
    pub custom_resources: Vec<CustomResourceDeclaration>,
    pub depends_on: Vec<String>,
    cached_name: OnceLock<String>,
}

impl FunctionDeclaration {
    pub fn new(handler: impl Into<String>, role: RoleRequirement) -> Self {
        Self {
            handler: handler.into(),
            explicit_name: None,
            role,
            options: FunctionOptions::default(),
            permissions: Vec::new(),
            event_source_mappings: Vec::new(),
            decorators: Vec::new(),
            custom_resources: Vec::new(),
            depends_on: Vec::new(),
            cached_name: OnceLock::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.explicit_name = Some(name.into());
        self.cached_name = OnceLock::new();
        self
    }

    /// Single-decorator form. The decorator runs before any listed one.
    #[deprecated(note = "push onto `decorators` instead")]
    pub fn with_decorator(mut self, decorator: Arc<dyn TemplateDecorator>) -> Self {
        hooks::fold_legacy_decorator(Some(decorator), &mut self.decorators);
        self
    }

    /// Attach a custom resource and return its invocation logical name.
    pub fn require_custom_resource(&mut self, resource: CustomResourceDeclaration) -> String {
        let name = resource.logical_name();
        self.custom_resources.push(resource);
        name
    }

    /// Internal function name. Computed once and cached for the run.
    pub fn name(&self) -> &str {
        self.cached_name
            .get_or_init(|| naming::function_name(self.explicit_name.as_deref(), &self.handler))
    }

    /// Logical name of the function resource.
    pub fn logical_name(&self) -> String {
        let base = naming::sanitize(self.name()).replace('_', "");
        naming::derive(&format!("{}Lambda", base), &[self.name()])
    }
}

impl fmt::Debug for FunctionDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDeclaration")
            .field("handler", &self.handler)
            .field("name", &self.name())
            .field("role", &self.role)
            .field("decorators", &self.decorators.len())
            .field("custom_resources", &self.custom_resources)
            .finish()
    }
}

// ============================================================================
// Stack lock
// ============================================================================

/// Recorded state of a converged stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackLock {
    /// Schema version
    pub schema: String,

    /// Stack name
    pub stack: String,

    /// Stable stack id
    pub stack_id: String,

    /// When the lock was generated
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// BLAKE3 of the full serialized template
    pub template_hash: String,

    /// Stack tags
    #[serde(default)]
    pub tags: IndexMap<String, String>,

    /// Per-resource state
    pub resources: IndexMap<String, ResourceLock>,
}

/// Per-resource lock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Resource type, e.g. `AWS::Lambda::Function`
    #[serde(rename = "type")]
    pub resource_type: String,

    /// BLAKE3 of the resource body
    pub hash: String,
}

// ============================================================================
// Plan
// ============================================================================

/// Action convergence takes on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Delete,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub logical_name: String,
    pub resource_type: String,
    pub action: PlanAction,
}

/// Diff of a template against the recorded stack.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub stack: String,
    pub changes: Vec<PlannedChange>,
    pub to_create: u32,
    pub to_update: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ProvisionStarted {
        service: String,
        build_id: String,
        dry_run: bool,
        stratus_version: String,
    },
    StepCompleted {
        service: String,
        step: String,
        duration_seconds: f64,
    },
    StepFailed {
        service: String,
        step: String,
        error: String,
    },
    RollbackInvoked {
        service: String,
        actions: u32,
    },
    ProvisionCompleted {
        service: String,
        build_id: String,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parse() {
        let yaml = r#"
version: "1.0"
name: hello
bucket: artifacts
roles:
  shared:
    privileges:
      - actions: ["s3:GetObject"]
        resource: "arn:aws:s3:::data/*"
functions:
  - handler: hello::greet
    role:
      definition: shared
  - handler: hello::farewell
    role:
      name: existing-role
    options:
      memory_size: 512
"#;
        let config: ServiceConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.name, "hello");
        assert_eq!(config.functions.len(), 2);
        assert!(matches!(config.functions[0].role, Some(RoleConfig::Definition(_))));
        assert_eq!(config.functions[1].options.memory_size, 512);
        assert_eq!(config.functions[1].options.timeout, 3);
        assert_eq!(config.build.target, "x86_64-unknown-linux-musl");
    }

    #[test]
    fn test_function_options_defaults() {
        let o = FunctionOptions::default();
        assert_eq!(o.memory_size, 128);
        assert_eq!(o.timeout, 3);
        assert!(o.vpc.is_none());
    }

    #[test]
    fn test_event_source_defaults() {
        let m: EventSourceMapping =
            serde_yaml_ng::from_str("event_source_arn: arn:aws:kinesis:x").unwrap();
        assert_eq!(m.starting_position, "LATEST");
        assert_eq!(m.batch_size, 100);
        assert!(!m.disabled);
    }

    #[test]
    fn test_named_role_rejects_empty() {
        assert!(RoleRequirement::named("").is_err());
        assert!(RoleRequirement::named("  ").is_err());
        assert!(RoleRequirement::named("ops").is_ok());
    }

    #[test]
    fn test_role_logical_name_fixed_by_first_owner() {
        let def = RoleDefinition::new(vec![]);
        let first = def.logical_name("svc", "a").to_string();
        let second = def.logical_name("svc", "b").to_string();
        assert_eq!(first, second);
        assert_eq!(first, naming::derive("IAMRole", &["svc", "a"]));
    }

    #[test]
    fn test_function_name_cached() {
        let f = FunctionDeclaration::new("hello::handlers::greet", RoleRequirement::Named("r".into()));
        assert_eq!(f.name(), "greet");
        let ptr = f.name().as_ptr();
        assert_eq!(f.name().as_ptr(), ptr);
        let named = f.with_name("Greeter");
        assert_eq!(named.name(), "Greeter");
    }

    #[test]
    fn test_function_logical_name_stable() {
        let a = FunctionDeclaration::new("x::greet", RoleRequirement::Named("r".into()));
        let b = FunctionDeclaration::new("y::greet", RoleRequirement::Named("r".into()));
        assert_eq!(a.logical_name(), b.logical_name());
        assert!(a.logical_name().starts_with("greetLambda"));
    }

    #[test]
    fn test_custom_resource_names_stable() {
        let cr = CustomResourceDeclaration::new("hello::custom::seed", RoleRequirement::Named("r".into()));
        assert_eq!(cr.function_name(), "hello_custom_seed");
        assert_eq!(cr.logical_name(), cr.clone().logical_name());
        assert_ne!(cr.logical_name(), cr.function_logical_name());
    }

    #[test]
    fn test_plan_action_display() {
        assert_eq!(PlanAction::Create.to_string(), "CREATE");
        assert_eq!(PlanAction::NoOp.to_string(), "NO-OP");
    }

    #[test]
    fn test_provenance_event_serde() {
        let event = ProvenanceEvent::ProvisionStarted {
            service: "hello".to_string(),
            build_id: "b-1".to_string(),
            dry_run: true,
            stratus_version: "0.3.0".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"provision_started\""));
        assert!(json.contains("\"build_id\":\"b-1\""));
    }
}
