//! Execution-role resolution.
//!
//! Inline definitions become one role resource each, keyed by `Arc` identity:
//! two structurally identical definitions created separately stay two roles.
//! Named roles are verified against the identity service once per name.

use super::error::ProvisionError;
use super::graph::{self, ResourceGraph, ResourceNode, ROLE_TYPE};
use super::types::{FunctionDeclaration, FunctionOptions, Privilege, RoleDefinition, RoleRequirement};
use crate::provider::{IdentityError, IdentityService};
use indexmap::{IndexMap, IndexSet};
use serde_json::{json, Value};
use std::sync::Arc;

/// Resolved execution-role reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleRef {
    /// Concrete ARN of an existing role
    Arn(String),
    /// Role declared in this template, resolved at convergence time
    Deferred { logical_name: String },
}

impl RoleRef {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Arn(arn) => json!(arn),
            Self::Deferred { logical_name } => graph::get_att(logical_name, "Arn"),
        }
    }

    /// Logical name this reference depends on, if any.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            Self::Arn(_) => None,
            Self::Deferred { logical_name } => Some(logical_name),
        }
    }
}

/// Identity key -> resolved reference.
pub type RoleMap = IndexMap<String, RoleRef>;

/// Look up the resolved reference for a requirement owned by `owner`.
pub fn lookup<'a>(
    roles: &'a RoleMap,
    requirement: &RoleRequirement,
    service_name: &str,
    owner: &str,
) -> Option<&'a RoleRef> {
    roles.get(&requirement.identity_key(service_name, owner))
}

struct InlineRole {
    definition: Arc<RoleDefinition>,
    needs_vpc: bool,
}

/// Resolve every role requirement of `functions` and their custom resources.
///
/// Inline definitions are declared into `graph`; named roles are checked
/// against `identity`. Not-found is fatal and never retried.
pub async fn resolve(
    service_name: &str,
    functions: &[FunctionDeclaration],
    graph: &mut ResourceGraph,
    identity: &dyn IdentityService,
) -> Result<RoleMap, ProvisionError> {
    let mut inline: IndexMap<String, InlineRole> = IndexMap::new();
    let mut named: IndexSet<String> = IndexSet::new();

    let mut owners: Vec<(&RoleRequirement, String, &FunctionOptions)> = Vec::new();
    for function in functions {
        owners.push((&function.role, function.name().to_string(), &function.options));
        for custom in &function.custom_resources {
            owners.push((&custom.role, custom.function_name(), &custom.options));
        }
    }

    for (requirement, owner, options) in owners {
        match requirement {
            RoleRequirement::Named(name) => {
                named.insert(name.clone());
            }
            RoleRequirement::Inline(definition) => {
                let key = definition.logical_name(service_name, &owner).to_string();
                let entry = inline.entry(key).or_insert_with(|| InlineRole {
                    definition: Arc::clone(definition),
                    needs_vpc: false,
                });
                entry.needs_vpc |= options.vpc.is_some();
            }
        }
    }

    let mut roles = RoleMap::new();
    for (logical_name, role) in inline {
        let node = role_resource(&logical_name, &role.definition.privileges, role.needs_vpc);
        graph.add_resource(logical_name.clone(), node)?;
        tracing::debug!(role = %logical_name, "declared inline role");
        roles.insert(logical_name.clone(), RoleRef::Deferred { logical_name });
    }

    for name in named {
        match identity.lookup_role(&name).await {
            Ok(arn) => {
                tracing::info!(role = %name, arn = %arn, "verified IAM role");
                roles.insert(name, RoleRef::Arn(arn));
            }
            Err(IdentityError::NotFound) => return Err(ProvisionError::RoleNotFound(name)),
            Err(IdentityError::Transport(message)) => {
                return Err(ProvisionError::IdentityTransport { role: name, message })
            }
        }
    }

    Ok(roles)
}

/// Statements every inline role carries.
pub(crate) fn core_statements() -> Vec<Value> {
    vec![
        json!({
            "Effect": "Allow",
            "Action": ["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
            "Resource": "arn:aws:logs:*:*:*",
        }),
        json!({
            "Effect": "Allow",
            "Action": ["cloudwatch:PutMetricData"],
            "Resource": "*",
        }),
        json!({
            "Effect": "Allow",
            "Action": ["cloudformation:DescribeStacks", "cloudformation:DescribeStackResource"],
            "Resource": graph::reference("AWS::StackId"),
        }),
        json!({
            "Effect": "Allow",
            "Action": ["xray:PutTraceSegments", "xray:PutTelemetryRecords"],
            "Resource": "*",
        }),
    ]
}

fn vpc_statement() -> Value {
    json!({
        "Effect": "Allow",
        "Action": [
            "ec2:CreateNetworkInterface",
            "ec2:DescribeNetworkInterfaces",
            "ec2:DeleteNetworkInterface",
        ],
        "Resource": "*",
    })
}

fn role_resource(logical_name: &str, privileges: &[Privilege], needs_vpc: bool) -> ResourceNode {
    let mut statements = core_statements();
    if needs_vpc {
        statements.push(vpc_statement());
    }
    statements.extend(privileges.iter().map(|p| {
        json!({
            "Effect": "Allow",
            "Action": p.actions,
            "Resource": p.resource,
        })
    }));
    role_node(&format!("{}Statements", logical_name), statements)
}

/// Role assumable by the function service, carrying one inline policy.
pub(crate) fn role_node(policy_name: &str, statements: Vec<Value>) -> ResourceNode {
    ResourceNode::new(
        ROLE_TYPE,
        json!({
            "AssumeRolePolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": ["lambda.amazonaws.com"] },
                    "Action": ["sts:AssumeRole"],
                }],
            },
            "Policies": [{
                "PolicyName": policy_name,
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": statements,
                },
            }],
        }),
    )
}
