//! In-memory resource graph: logical name -> resource node, plus outputs.
//!
//! A name may be declared twice only with an identical body. Graphs built
//! independently (gateway export, decorators) are merged with the same rule.
//! Serialization goes through `serde_json::Value`, so object keys come out
//! sorted and two runs over the same declarations are byte-identical.

use super::error::GraphError;
use super::resolver;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub const FUNCTION_TYPE: &str = "AWS::Lambda::Function";
pub const ROLE_TYPE: &str = "AWS::IAM::Role";

/// Resource type -> output attribute names exposed through `Fn::GetAtt`.
///
/// Given to a graph at construction and shared by its scratch graphs.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    outputs: IndexMap<String, Vec<String>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the resource types this crate emits.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(FUNCTION_TYPE, &["Arn"]);
        registry.register(ROLE_TYPE, &["Arn", "RoleId"]);
        registry.register("AWS::S3::Bucket", &["Arn", "DomainName", "WebsiteURL"]);
        registry.register("AWS::SNS::Topic", &["TopicName"]);
        registry.register("AWS::SQS::Queue", &["Arn", "QueueName"]);
        registry.register("AWS::DynamoDB::Table", &["Arn", "StreamArn"]);
        registry.register("AWS::Kinesis::Stream", &["Arn"]);
        registry.register("AWS::ApiGateway::RestApi", &["RootResourceId"]);
        registry
    }

    pub fn register(&mut self, resource_type: &str, attributes: &[&str]) {
        self.outputs.insert(
            resource_type.to_string(),
            attributes.iter().map(|a| a.to_string()).collect(),
        );
    }

    pub fn outputs_for(&self, resource_type: &str) -> &[String] {
        self.outputs
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// One declared resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceNode {
    #[serde(rename = "Type")]
    pub resource_type: String,

    #[serde(rename = "Properties", skip_serializing_if = "Value::is_null")]
    pub properties: Value,

    #[serde(rename = "DependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(rename = "Metadata", skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, Value>,

    #[serde(rename = "DeletionPolicy", skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

impl ResourceNode {
    pub fn new(resource_type: impl Into<String>, properties: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties,
            depends_on: Vec::new(),
            metadata: IndexMap::new(),
            deletion_policy: None,
        }
    }

    pub fn depends_on(mut self, names: impl IntoIterator<Item = String>) -> Self {
        for name in names {
            if !self.depends_on.contains(&name) {
                self.depends_on.push(name);
            }
        }
        self
    }
}

/// A declared output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Value")]
    pub value: Value,
}

impl Output {
    pub fn new(description: impl Into<String>, value: Value) -> Self {
        Self {
            description: Some(description.into()),
            value,
        }
    }
}

/// Mutable graph of declared resources.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    description: Option<String>,
    resources: IndexMap<String, ResourceNode>,
    outputs: IndexMap<String, Output>,
    registry: Arc<TypeRegistry>,
}

#[derive(Serialize)]
struct TemplateDocument<'a> {
    #[serde(rename = "AWSTemplateFormatVersion")]
    format_version: &'static str,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(rename = "Resources")]
    resources: &'a IndexMap<String, ResourceNode>,
    #[serde(rename = "Outputs", skip_serializing_if = "IndexMap::is_empty")]
    outputs: &'a IndexMap<String, Output>,
}

impl ResourceGraph {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            description: None,
            resources: IndexMap::new(),
            outputs: IndexMap::new(),
            registry,
        }
    }

    /// Empty sibling graph sharing this graph's type registry.
    pub fn scratch(&self) -> Self {
        Self::new(Arc::clone(&self.registry))
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Declare a resource. Re-declaring an identical body is a no-op.
    pub fn add_resource(
        &mut self,
        name: impl Into<String>,
        node: ResourceNode,
    ) -> Result<(), GraphError> {
        let name = name.into();
        match self.resources.get(&name) {
            Some(existing) if *existing == node => Ok(()),
            Some(_) => Err(GraphError::Collision(name)),
            None => {
                self.resources.insert(name, node);
                Ok(())
            }
        }
    }

    /// Declare an output. Re-declaring an identical value is a no-op.
    pub fn add_output(&mut self, name: impl Into<String>, output: Output) -> Result<(), GraphError> {
        let name = name.into();
        match self.outputs.get(&name) {
            Some(existing) if *existing == output => Ok(()),
            Some(_) => Err(GraphError::OutputCollision(name)),
            None => {
                self.outputs.insert(name, output);
                Ok(())
            }
        }
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceNode> {
        self.resources.get(name)
    }

    pub fn resources(&self) -> &IndexMap<String, ResourceNode> {
        &self.resources
    }

    pub fn outputs(&self) -> &IndexMap<String, Output> {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Names of every resource of the given type, in declaration order.
    pub fn names_of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a str> {
        self.resources
            .iter()
            .filter(move |(_, n)| n.resource_type == resource_type)
            .map(|(k, _)| k.as_str())
    }

    /// Topological order of the declared resources.
    pub fn execution_order(&self) -> Result<Vec<String>, GraphError> {
        let edges: IndexMap<String, Vec<String>> = self
            .resources
            .iter()
            .map(|(k, n)| (k.clone(), n.depends_on.clone()))
            .collect();
        resolver::build_execution_order(&edges)
    }

    /// Annotate every function resource with its own logical id, the stack
    /// identity, and the outputs of every resource it depends on.
    pub fn annotate_discovery_info(&mut self) {
        let mut annotations: Vec<(String, Value)> = Vec::new();
        for (name, node) in &self.resources {
            if node.resource_type != FUNCTION_TYPE {
                continue;
            }
            let mut resources = serde_json::Map::new();
            for dep in &node.depends_on {
                let Some(dep_node) = self.resources.get(dep) else {
                    continue;
                };
                let mut entry = serde_json::Map::new();
                entry.insert("ResourceType".into(), json!(dep_node.resource_type));
                entry.insert("Ref".into(), json!({ "Ref": dep }));
                for attr in self.registry.outputs_for(&dep_node.resource_type) {
                    entry.insert(attr.clone(), json!({ "Fn::GetAtt": [dep, attr] }));
                }
                resources.insert(dep.clone(), Value::Object(entry));
            }
            annotations.push((
                name.clone(),
                json!({
                    "ResourceID": name,
                    "Region": { "Ref": "AWS::Region" },
                    "StackID": { "Ref": "AWS::StackId" },
                    "StackName": { "Ref": "AWS::StackName" },
                    "Resources": resources,
                }),
            ));
        }
        for (name, info) in annotations {
            if let Some(node) = self.resources.get_mut(&name) {
                node.metadata.insert("stratusDiscovery".to_string(), info);
            }
        }
    }

    /// Full template as a JSON value (object keys sorted).
    pub fn to_value(&self) -> Result<Value, GraphError> {
        serde_json::to_value(TemplateDocument {
            format_version: "2010-09-09",
            description: self.description.as_deref(),
            resources: &self.resources,
            outputs: &self.outputs,
        })
        .map_err(|e| GraphError::Serialize(e.to_string()))
    }

    /// Compact, deterministic serialization.
    pub fn serialize(&self) -> Result<String, GraphError> {
        serde_json::to_string(&self.to_value()?).map_err(|e| GraphError::Serialize(e.to_string()))
    }

    /// Indented serialization for humans.
    pub fn serialize_pretty(&self) -> Result<String, GraphError> {
        serde_json::to_string_pretty(&self.to_value()?)
            .map_err(|e| GraphError::Serialize(e.to_string()))
    }
}

/// Merge `source` into `dest`. Every conflicting resource or output is
/// collected; on any conflict `dest` is left untouched.
pub fn merge(source: &ResourceGraph, dest: &mut ResourceGraph) -> Result<(), GraphError> {
    let mut conflicts = Vec::new();
    for (name, node) in &source.resources {
        if matches!(dest.resources.get(name), Some(existing) if existing != node) {
            conflicts.push(name.clone());
        }
    }
    for (name, output) in &source.outputs {
        if matches!(dest.outputs.get(name), Some(existing) if existing != output) {
            conflicts.push(format!("output {}", name));
        }
    }
    if !conflicts.is_empty() {
        return Err(GraphError::MergeConflicts(conflicts));
    }
    for (name, node) in &source.resources {
        dest.resources
            .entry(name.clone())
            .or_insert_with(|| node.clone());
    }
    for (name, output) in &source.outputs {
        dest.outputs
            .entry(name.clone())
            .or_insert_with(|| output.clone());
    }
    Ok(())
}

/// `{"Fn::GetAtt": [name, attr]}`
pub fn get_att(name: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [name, attribute] })
}

/// `{"Ref": name}`
pub fn reference(name: &str) -> Value {
    json!({ "Ref": name })
}
