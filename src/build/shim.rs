//! Dispatch shim: maps each external invocation identifier to the single
//! generic dispatcher inside the compiled binary.

use super::archive::BINARY_ENTRY;
use crate::core::types::FunctionDeclaration;
use indexmap::IndexSet;

/// Resource types every service can invoke without declaring them.
pub const BUILTIN_RESOURCE_TYPES: [&str; 5] = [
    "Stratus::S3EventSource",
    "Stratus::SNSEventSource",
    "Stratus::SESEventSource",
    "Stratus::CloudWatchLogsEventSource",
    "Stratus::ZipToS3Bucket",
];

/// Ordered, de-duplicated set of invocation identifiers.
#[derive(Debug, Clone)]
pub struct DispatchShim {
    service_name: String,
    identifiers: IndexSet<String>,
}

impl DispatchShim {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            identifiers: IndexSet::new(),
        }
    }

    /// Register an identifier. Returns false when it was already present.
    pub fn register(&mut self, identifier: impl Into<String>) -> bool {
        self.identifiers.insert(identifier.into())
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.identifiers.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// Render the `bootstrap` entry point.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("#!/bin/sh\n");
        out.push_str(&format!(
            "# Generated by stratus {} for service {}. Do not edit.\n",
            env!("CARGO_PKG_VERSION"),
            shell_quote(&self.service_name)
        ));
        out.push_str("set -eu\n");
        out.push_str("cd \"$(dirname \"$0\")\"\n");
        out.push_str(&format!(
            "export STRATUS_SERVICE_NAME={}\n\n",
            shell_quote(&self.service_name)
        ));
        out.push_str("case \"${_HANDLER:-}\" in\n");
        for id in &self.identifiers {
            let quoted = shell_quote(id);
            out.push_str(&format!(
                "  {})\n    exec ./{} dispatch {} ;;\n",
                quoted, BINARY_ENTRY, quoted
            ));
        }
        out.push_str("  *)\n    echo \"stratus: unknown handler '${_HANDLER:-}'\" >&2\n    exit 1 ;;\n");
        out.push_str("esac\n");
        out
    }
}

/// Shim covering every function, every custom resource, and the built-in
/// resource types.
pub fn shim_for(service_name: &str, functions: &[FunctionDeclaration]) -> DispatchShim {
    let mut shim = DispatchShim::new(service_name);
    for function in functions {
        shim.register(function.name());
        for custom in &function.custom_resources {
            shim.register(custom.function_name());
        }
    }
    for builtin in BUILTIN_RESOURCE_TYPES {
        shim.register(builtin);
    }
    shim
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
