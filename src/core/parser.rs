//! YAML parsing and validation.
//!
//! Parses stratus.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Name is a valid stack name, bucket is present
//! - Every function and custom resource has exactly one role
//! - Handler paths are well-formed, function names unique

use super::types::*;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, LazyLock};

static SERVICE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").expect("static pattern compiles")
});

static HANDLER_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(::[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("static pattern compiles")
});

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Parse a stratus.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<ServiceConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a stratus.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<ServiceConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Whether `name` can be a stack name. The name also prefixes object keys
/// and names state directories, so path separators never get through.
pub fn is_valid_service_name(name: &str) -> bool {
    SERVICE_NAME.is_match(name)
}

/// Whether `handler` is a `::`-separated path of identifiers.
pub fn is_valid_handler(handler: &str) -> bool {
    HANDLER_PATH.is_match(handler)
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &ServiceConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ValidationError::new(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }
    if let Some(e) = check_service_name(&config.name) {
        errors.push(e);
    }
    if config.bucket.trim().is_empty() {
        errors.push(ValidationError::new("bucket must not be empty"));
    }
    if let Some(site) = &config.site {
        if site.resources.trim().is_empty() {
            errors.push(ValidationError::new("site has no resources directory"));
        }
    }

    for function in &config.functions {
        check_role(&config.roles, &function.handler, function.role.as_ref(), &mut errors);
        for custom in &function.custom_resources {
            check_role(&config.roles, &custom.handler, custom.role.as_ref(), &mut errors);
        }
    }
    if !errors.is_empty() {
        return errors;
    }

    match declarations(config) {
        Ok(functions) => errors.extend(check_declarations(&functions)),
        Err(e) => errors.push(ValidationError::new(e)),
    }
    errors
}

fn check_role(
    shared: &IndexMap<String, RoleDefinitionConfig>,
    handler: &str,
    role: Option<&RoleConfig>,
    errors: &mut Vec<ValidationError>,
) {
    match role {
        None => errors.push(ValidationError::new(format!(
            "'{}' has no role (set one of name, inline, definition)",
            handler
        ))),
        Some(RoleConfig::Name(name)) if name.trim().is_empty() => errors.push(
            ValidationError::new(format!("'{}' has an empty role name", handler)),
        ),
        Some(RoleConfig::Definition(name)) if !shared.contains_key(name) => {
            errors.push(ValidationError::new(format!(
                "'{}' references unknown role definition '{}'",
                handler, name
            )))
        }
        Some(_) => {}
    }
}

/// Service name precondition, shared with the workflow engine.
pub fn check_service_name(name: &str) -> Option<ValidationError> {
    if name.trim().is_empty() {
        Some(ValidationError::new("name must not be empty"))
    } else if !is_valid_service_name(name) {
        Some(ValidationError::new(format!(
            "name '{}' must start with a letter and contain only letters, digits and '-'",
            name
        )))
    } else {
        None
    }
}

/// Preconditions on declarations, checked before any side effect.
pub fn check_declarations(functions: &[FunctionDeclaration]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if functions.is_empty() {
        errors.push(ValidationError::new("no functions declared"));
    }

    let mut names: HashSet<&str> = HashSet::new();
    let mut custom_names: HashSet<String> = HashSet::new();
    for function in functions {
        if !is_valid_handler(&function.handler) {
            errors.push(ValidationError::new(format!(
                "function handler '{}' is not a valid path",
                function.handler
            )));
        }
        if !names.insert(function.name()) {
            errors.push(ValidationError::new(format!(
                "duplicate function name '{}' (handler '{}'); set an explicit name",
                function.name(),
                function.handler
            )));
        }
        for custom in &function.custom_resources {
            if !is_valid_handler(&custom.handler) {
                errors.push(ValidationError::new(format!(
                    "custom resource handler '{}' is not a valid path",
                    custom.handler
                )));
            }
            if !custom_names.insert(custom.function_name()) {
                errors.push(ValidationError::new(format!(
                    "duplicate custom resource name '{}'",
                    custom.function_name()
                )));
            }
        }
    }
    errors
}

fn role_requirement(
    shared: &IndexMap<String, Arc<RoleDefinition>>,
    handler: &str,
    role: Option<&RoleConfig>,
) -> Result<RoleRequirement, String> {
    match role {
        Some(RoleConfig::Name(name)) => {
            RoleRequirement::named(name.as_str()).map_err(|e| format!("'{}': {}", handler, e))
        }
        Some(RoleConfig::Inline(definition)) => Ok(RoleRequirement::inline(definition.into())),
        Some(RoleConfig::Definition(name)) => shared
            .get(name)
            .map(|d| RoleRequirement::inline(Arc::clone(d)))
            .ok_or_else(|| format!("'{}' references unknown role definition '{}'", handler, name)),
        None => Err(format!("'{}' has no role", handler)),
    }
}

/// Turn a config into function declarations. Functions naming the same
/// shared definition share one `Arc`, so they end up with one role.
pub fn declarations(config: &ServiceConfig) -> Result<Vec<FunctionDeclaration>, String> {
    let shared: IndexMap<String, Arc<RoleDefinition>> = config
        .roles
        .iter()
        .map(|(name, def)| (name.clone(), def.into()))
        .collect();

    config
        .functions
        .iter()
        .map(|fc| {
            let role = role_requirement(&shared, &fc.handler, fc.role.as_ref())?;
            let mut function = FunctionDeclaration::new(fc.handler.as_str(), role);
            if let Some(name) = &fc.name {
                function = function.with_name(name.as_str());
            }
            function.options = fc.options.clone();
            function.permissions = fc.permissions.clone();
            function.event_source_mappings = fc.event_source_mappings.clone();
            function.depends_on = fc.depends_on.clone();
            for cc in &fc.custom_resources {
                let role = role_requirement(&shared, &cc.handler, cc.role.as_ref())?;
                let mut custom = CustomResourceDeclaration::new(cc.handler.as_str(), role);
                custom.options = cc.options.clone();
                custom.properties = cc.properties.clone();
                function.require_custom_resource(custom);
            }
            Ok(function)
        })
        .collect()
}

/// JSON schema of stratus.yaml.
pub fn config_schema() -> Result<String, String> {
    let schema = schemars::schema_for!(ServiceConfig);
    serde_json::to_string_pretty(&schema).map_err(|e| format!("JSON serialize error: {}", e))
}
