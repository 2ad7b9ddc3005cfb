//! Export of declarations into the resource graph.
//!
//! Functions, their permissions, event-source mappings and custom resources
//! go straight into the main graph. Decorators, the gateway and the site each
//! work on a scratch graph that the caller merges afterwards.

use super::error::ProvisionError;
use super::graph::{self, Output, ResourceGraph, ResourceNode, FUNCTION_TYPE};
use super::hooks::{self, DecoratorTarget, HookArgs, HookContext};
use super::naming;
use super::resolver::{self, TemplateScope};
use super::roles::{self, RoleMap, RoleRef};
use super::types::{
    CustomResourceDeclaration, EventSourceMapping, FunctionDeclaration, FunctionOptions,
    Permission, RoleRequirement, SiteDeclaration,
};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};

/// Function runtime for a custom `bootstrap` entry point.
pub const RUNTIME: &str = "provided.al2";

/// Environment variable carrying the log level into every function.
pub const LOG_LEVEL_VARIABLE: &str = "STRATUS_LOG_LEVEL";

/// Output holding the static site URL.
pub const SITE_URL_OUTPUT: &str = "SiteURL";

pub const CUSTOM_RESOURCE_TYPE: &str = "AWS::CloudFormation::CustomResource";

/// Dispatch identifier of the site content copier.
const SITE_COPY_HANDLER: &str = "Stratus::ZipToS3Bucket";

/// Metadata key naming the dispatch identifier of a function node.
const FUNCTION_METADATA_KEY: &str = "stratusFunction";

/// Shared inputs for every export in one run.
#[derive(Debug, Clone)]
pub struct ExportContext<'a> {
    pub service_name: &'a str,
    pub bucket: &'a str,
    pub archive_key: &'a str,
    pub roles: &'a RoleMap,
    pub scope: TemplateScope<'a>,
    pub log_level: &'a str,
}

/// Exports gateway resources (and their outputs) into a scratch graph.
pub trait GatewayExporter: Send + Sync {
    fn export(&self, ctx: &ExportContext<'_>, scratch: &mut ResourceGraph) -> Result<(), String>;
}

/// Deployed function name: `<StackName>_<name>`.
pub fn deployed_name(internal_name: &str) -> Value {
    json!({
        "Fn::Join": ["_", [graph::reference("AWS::StackName"), naming::sanitize(internal_name)]]
    })
}

fn resolved_role<'a>(
    ctx: &'a ExportContext<'_>,
    requirement: &RoleRequirement,
    owner: &str,
) -> Result<&'a RoleRef, ProvisionError> {
    roles::lookup(ctx.roles, requirement, ctx.service_name, owner)
        .ok_or_else(|| ProvisionError::Template(format!("no resolved role for '{}'", owner)))
}

fn function_properties(
    ctx: &ExportContext<'_>,
    name: &str,
    options: &FunctionOptions,
    role: &RoleRef,
    default_description: String,
) -> Result<Value, ProvisionError> {
    let mut variables = resolver::resolve_environment(&options.environment, &ctx.scope)
        .map_err(|e| ProvisionError::Template(format!("function '{}': {}", name, e)))?;
    variables.insert(LOG_LEVEL_VARIABLE.to_string(), ctx.log_level.to_string());

    let mut props = Map::new();
    props.insert(
        "Code".into(),
        json!({ "S3Bucket": ctx.bucket, "S3Key": ctx.archive_key }),
    );
    props.insert(
        "Description".into(),
        json!(options.description.clone().unwrap_or(default_description)),
    );
    props.insert("FunctionName".into(), deployed_name(name));
    props.insert("Handler".into(), json!(name));
    props.insert("Runtime".into(), json!(RUNTIME));
    props.insert("MemorySize".into(), json!(options.memory_size));
    props.insert("Timeout".into(), json!(options.timeout));
    props.insert("Role".into(), role.to_value());
    props.insert("Environment".into(), json!({ "Variables": variables }));

    if let Some(vpc) = &options.vpc {
        props.insert(
            "VpcConfig".into(),
            json!({
                "SecurityGroupIds": vpc.security_group_ids,
                "SubnetIds": vpc.subnet_ids,
            }),
        );
    }
    if let Some(reserved) = options.reserved_concurrency {
        props.insert("ReservedConcurrentExecutions".into(), json!(reserved));
    }
    if let Some(arn) = &options.dead_letter_arn {
        props.insert("DeadLetterConfig".into(), json!({ "TargetArn": arn }));
    }
    if let Some(arn) = &options.kms_key_arn {
        props.insert("KmsKeyArn".into(), json!(arn));
    }
    if !options.tags.is_empty() {
        let tags: Vec<Value> = options
            .tags
            .iter()
            .map(|(k, v)| json!({ "Key": k, "Value": v }))
            .collect();
        props.insert("Tags".into(), Value::Array(tags));
    }
    Ok(Value::Object(props))
}

fn function_node(
    ctx: &ExportContext<'_>,
    name: &str,
    options: &FunctionOptions,
    role: &RoleRef,
    default_description: String,
) -> Result<ResourceNode, ProvisionError> {
    let props = function_properties(ctx, name, options, role, default_description)?;
    let mut node = ResourceNode::new(FUNCTION_TYPE, props)
        .depends_on(role.dependency().map(str::to_string));
    node.metadata
        .insert(FUNCTION_METADATA_KEY.to_string(), json!(name));
    Ok(node)
}

/// Export one function with everything attached to it.
pub fn export_function(
    function: &FunctionDeclaration,
    ctx: &ExportContext<'_>,
    graph: &mut ResourceGraph,
    hook_ctx: &mut HookContext,
    args: &HookArgs,
) -> Result<(), ProvisionError> {
    let name = function.name();
    let logical_name = function.logical_name();
    let role = resolved_role(ctx, &function.role, name)?;

    let mut node = function_node(
        ctx,
        name,
        &function.options,
        role,
        format!("{}: {}", ctx.service_name, name),
    )?
    .depends_on(function.depends_on.iter().cloned());

    let mut scratch = graph.scratch();
    if !function.decorators.is_empty() {
        let mut metadata: IndexMap<String, Value> = IndexMap::new();
        for (index, decorator) in function.decorators.iter().enumerate() {
            tracing::debug!(function = name, index, "running template decorator");
            let target = DecoratorTarget {
                logical_name: &logical_name,
                function: &node,
                archive_key: ctx.archive_key,
            };
            decorator
                .decorate(hook_ctx, args, &target, &mut scratch, &mut metadata)
                .map_err(|e| hooks::hook_error("decorator", e))?;
        }
        node.metadata.extend(metadata);
    }

    graph.add_resource(logical_name.clone(), node)?;
    graph::merge(&scratch, graph)?;

    let function_arn = graph::get_att(&logical_name, "Arn");
    for permission in &function.permissions {
        let (perm_name, perm) = permission_resource(&logical_name, &function_arn, permission);
        graph.add_resource(perm_name, perm)?;
    }
    for mapping in &function.event_source_mappings {
        let (es_name, es) = event_source_resource(&logical_name, &function_arn, mapping);
        graph.add_resource(es_name, es)?;
    }
    for custom in &function.custom_resources {
        export_custom_resource(custom, &logical_name, ctx, graph)?;
    }

    tracing::debug!(
        function = name,
        logical = %logical_name,
        permissions = function.permissions.len(),
        mappings = function.event_source_mappings.len(),
        custom_resources = function.custom_resources.len(),
        "exported function"
    );
    Ok(())
}

fn permission_resource(
    function_logical: &str,
    function_arn: &Value,
    permission: &Permission,
) -> (String, ResourceNode) {
    let name = naming::derive(
        "LambdaPerm",
        &[
            function_logical,
            &permission.principal,
            permission.source_arn.as_deref().unwrap_or(""),
            permission.source_account.as_deref().unwrap_or(""),
        ],
    );
    let mut props = Map::new();
    props.insert("Action".into(), json!("lambda:InvokeFunction"));
    props.insert("FunctionName".into(), function_arn.clone());
    props.insert("Principal".into(), json!(permission.principal));
    if let Some(arn) = &permission.source_arn {
        props.insert("SourceArn".into(), json!(arn));
    }
    if let Some(account) = &permission.source_account {
        props.insert("SourceAccount".into(), json!(account));
    }
    (
        name,
        ResourceNode::new("AWS::Lambda::Permission", Value::Object(props)),
    )
}

fn event_source_resource(
    function_logical: &str,
    function_arn: &Value,
    mapping: &EventSourceMapping,
) -> (String, ResourceNode) {
    let batch_size = mapping.batch_size.to_string();
    let name = naming::derive(
        "LambdaES",
        &[
            function_logical,
            &mapping.event_source_arn,
            &batch_size,
            &mapping.starting_position,
        ],
    );
    let node = ResourceNode::new(
        "AWS::Lambda::EventSourceMapping",
        json!({
            "EventSourceArn": mapping.event_source_arn,
            "FunctionName": function_arn,
            "StartingPosition": mapping.starting_position,
            "BatchSize": mapping.batch_size,
            "Enabled": !mapping.disabled,
        }),
    );
    (name, node)
}

/// Export a custom resource: its backing function and the invocation node.
/// The invocation depends on the owning function.
pub fn export_custom_resource(
    custom: &CustomResourceDeclaration,
    owner_logical: &str,
    ctx: &ExportContext<'_>,
    graph: &mut ResourceGraph,
) -> Result<String, ProvisionError> {
    let function_name = custom.function_name();
    let role = resolved_role(ctx, &custom.role, &function_name)?;
    let function_logical = custom.function_logical_name();
    let node = function_node(
        ctx,
        &function_name,
        &custom.options,
        role,
        format!("{} CustomResource: {}", ctx.service_name, function_name),
    )?;
    graph.add_resource(function_logical.clone(), node)?;

    let mut props = Map::new();
    props.insert(
        "ServiceToken".into(),
        graph::get_att(&function_logical, "Arn"),
    );
    props.insert("UserProperties".into(), json!(custom.properties));
    let invocation = ResourceNode::new(CUSTOM_RESOURCE_TYPE, Value::Object(props))
        .depends_on([owner_logical.to_string(), function_logical]);
    let logical_name = custom.logical_name();
    graph.add_resource(logical_name.clone(), invocation)?;
    Ok(logical_name)
}

/// Export a static site: bucket, public-read policy, the `SiteURL` output, and
/// a copier invoked with the uploaded content and the gateway outputs.
pub fn export_site(
    site: &SiteDeclaration,
    site_key: &str,
    gateway_outputs: &IndexMap<String, Output>,
    ctx: &ExportContext<'_>,
    scratch: &mut ResourceGraph,
) -> Result<(), ProvisionError> {
    let service = ctx.service_name;
    let bucket_name = naming::derive("SiteBucket", &[service]);
    let mut bucket = ResourceNode::new(
        "AWS::S3::Bucket",
        json!({
            "AccessControl": "PublicRead",
            "WebsiteConfiguration": {
                "IndexDocument": site.index_document,
                "ErrorDocument": site.error_document,
            },
        }),
    );
    bucket.deletion_policy = Some("Delete".to_string());
    scratch.add_resource(bucket_name.clone(), bucket)?;
    scratch.add_output(
        SITE_URL_OUTPUT,
        Output::new("Site URL", graph::get_att(&bucket_name, "WebsiteURL")),
    )?;

    let bucket_arn = json!({ "Fn::Join": ["", ["arn:aws:s3:::", graph::reference(&bucket_name)]] });
    let bucket_keys_arn =
        json!({ "Fn::Join": ["", ["arn:aws:s3:::", graph::reference(&bucket_name), "/*"]] });

    let policy_name = naming::derive("SiteBucketPolicy", &[service]);
    scratch.add_resource(
        policy_name.clone(),
        ResourceNode::new(
            "AWS::S3::BucketPolicy",
            json!({
                "Bucket": graph::reference(&bucket_name),
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Sid": "PublicReadGetObject",
                        "Effect": "Allow",
                        "Principal": { "AWS": "*" },
                        "Action": "s3:GetObject",
                        "Resource": bucket_keys_arn,
                    }],
                },
            }),
        ),
    )?;

    let mut statements = roles::core_statements();
    statements.push(json!({
        "Effect": "Allow",
        "Action": ["s3:ListBucket"],
        "Resource": bucket_arn,
    }));
    statements.push(json!({
        "Effect": "Allow",
        "Action": ["s3:DeleteObject", "s3:PutObject"],
        "Resource": bucket_keys_arn,
    }));
    statements.push(json!({
        "Effect": "Allow",
        "Action": ["s3:GetObject"],
        "Resource": format!("arn:aws:s3:::{}/{}", ctx.bucket, site_key),
    }));
    let role_name = naming::derive("SiteRole", &[service]);
    let role = roles::role_node("SiteManagement", statements).depends_on([bucket_name.clone()]);
    scratch.add_resource(role_name.clone(), role)?;

    let copier_options = FunctionOptions {
        memory_size: 256,
        timeout: 180,
        ..FunctionOptions::default()
    };
    let copier_name = naming::derive("SiteCopier", &[service]);
    let copier = function_node(
        ctx,
        SITE_COPY_HANDLER,
        &copier_options,
        &RoleRef::Deferred {
            logical_name: role_name,
        },
        format!("{}: static site content", service),
    )?;
    scratch.add_resource(copier_name.clone(), copier)?;

    let manifest: Map<String, Value> = gateway_outputs
        .iter()
        .map(|(name, output)| (name.clone(), output.value.clone()))
        .collect();
    let content = ResourceNode::new(
        CUSTOM_RESOURCE_TYPE,
        json!({
            "ServiceToken": graph::get_att(&copier_name, "Arn"),
            "SrcBucket": ctx.bucket,
            "SrcKeyName": site_key,
            "DestBucket": graph::reference(&bucket_name),
            "Manifest": { "gateway": manifest },
        }),
    )
    .depends_on([copier_name, policy_name]);
    scratch.add_resource(naming::derive("SiteContent", &[service]), content)?;

    tracing::debug!(site = %site.resources, key = site_key, "exported site");
    Ok(())
}

/// Run the gateway exporter into a fresh scratch graph.
pub fn export_gateway(
    gateway: &dyn GatewayExporter,
    ctx: &ExportContext<'_>,
    graph: &ResourceGraph,
) -> Result<ResourceGraph, ProvisionError> {
    let mut scratch = graph.scratch();
    gateway
        .export(ctx, &mut scratch)
        .map_err(|e| ProvisionError::Template(format!("gateway export: {}", e)))?;
    tracing::debug!(
        resources = scratch.len(),
        outputs = scratch.outputs().len(),
        "exported gateway"
    );
    Ok(scratch)
}
