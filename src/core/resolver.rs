//! Template resolution and dependency ordering.
//!
//! Resolves `{{params.key}}`, `{{service.name}}` and `{{build.id}}` templates
//! in function environment values. Orders resource dependencies using Kahn's
//! algorithm with deterministic (alphabetical) tie-breaking.

use super::error::GraphError;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Values available to templates during one run.
#[derive(Debug, Clone)]
pub struct TemplateScope<'a> {
    pub params: &'a IndexMap<String, serde_json::Value>,
    pub service_name: &'a str,
    pub build_id: &'a str,
}

/// Resolve all template variables in a string.
pub fn resolve_template(template: &str, scope: &TemplateScope<'_>) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = if let Some(param_key) = key.strip_prefix("params.") {
            scope
                .params
                .get(param_key)
                .map(json_value_to_string)
                .ok_or_else(|| format!("unknown param: {}", param_key))?
        } else {
            match key {
                "service.name" => scope.service_name.to_string(),
                "build.id" => scope.build_id.to_string(),
                _ => return Err(format!("unknown template variable: {}", key)),
            }
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Resolve every value of an environment map.
pub fn resolve_environment(
    environment: &IndexMap<String, String>,
    scope: &TemplateScope<'_>,
) -> Result<IndexMap<String, String>, String> {
    environment
        .iter()
        .map(|(k, v)| {
            resolve_template(v, scope)
                .map(|resolved| (k.clone(), resolved))
                .map_err(|e| format!("environment '{}': {}", k, e))
        })
        .collect()
}

fn json_value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Topological order over `node -> depends_on` edges.
/// Kahn's algorithm with alphabetical tie-breaking for determinism.
pub fn build_execution_order(
    edges: &IndexMap<String, Vec<String>>,
) -> Result<Vec<String>, GraphError> {
    let mut in_degree: FxHashMap<&str, usize> = edges.keys().map(|k| (k.as_str(), 0)).collect();
    let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();

    for (id, deps) in edges {
        for dep in deps {
            if !edges.contains_key(dep) {
                return Err(GraphError::UnknownDependency {
                    resource: id.clone(),
                    dependency: dep.clone(),
                });
            }
            adjacency.entry(dep.as_str()).or_default().push(id.as_str());
            *in_degree.entry(id.as_str()).or_default() += 1;
        }
    }

    let mut zero_degree: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    zero_degree.sort_unstable();
    let mut queue: VecDeque<&str> = zero_degree.into_iter().collect();

    let mut order = Vec::with_capacity(edges.len());
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready: Vec<&str> = Vec::new();
        for neighbor in adjacency.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(neighbor) {
                *degree -= 1;
                if *degree == 0 {
                    next_ready.push(neighbor);
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != edges.len() {
        let ordered: FxHashSet<&str> = order.iter().map(String::as_str).collect();
        let mut cycle_members: Vec<String> = edges
            .keys()
            .filter(|k| !ordered.contains(k.as_str()))
            .cloned()
            .collect();
        cycle_members.sort();
        return Err(GraphError::Cycle(cycle_members));
    }

    Ok(order)
}
