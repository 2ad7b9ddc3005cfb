//! Stable logical names for template resources.
//!
//! Every name is a pure function of its inputs: a sanitized prefix followed by
//! the BLAKE3 digest of the identity parts. Two runs over the same declarations
//! produce byte-identical names, so convergence sees unchanged resources as
//! unchanged.

use crate::provenance::hasher;
use regex::Regex;
use std::sync::LazyLock;

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\W+").expect("static pattern compiles"));

static NON_FILE_CHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("static pattern compiles"));

/// Make `input` safe as one file-name component. Keeps `-` and `.`;
/// separators and everything else collapse to `_`.
pub fn file_component(input: &str) -> String {
    NON_FILE_CHAR.replace_all(input, "_").into_owned()
}

/// Replace every run of non-word characters with `_`.
pub fn sanitize(input: &str) -> String {
    NON_WORD.replace_all(input, "_").into_owned()
}

/// Derive a logical name from a kind hint and ordered identity parts.
///
/// Template logical ids are alphanumeric only, so the prefix keeps just the
/// ASCII alphanumerics of `kind`.
pub fn derive(kind: &str, parts: &[&str]) -> String {
    let mut prefix: String = kind.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if prefix.is_empty() {
        prefix.push_str("Resource");
    }
    format!("{}{}", prefix, hasher::digest_hex(parts))
}

/// Strategy for turning a handler reference into a function name.
pub trait NamingStrategy {
    /// Returns `None` when the strategy cannot produce a name.
    fn function_name(&self, handler: &str) -> Option<String>;
}

/// Caller-supplied stable name. Always wins when present.
pub struct ExplicitName<'a>(pub &'a str);

impl NamingStrategy for ExplicitName<'_> {
    fn function_name(&self, _handler: &str) -> Option<String> {
        let trimmed = self.0.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(sanitize(trimmed))
        }
    }
}

/// Fallback: last `::` segment of the handler path, so
/// `hello::handlers::greet` becomes `greet`.
pub struct HandlerPath;

impl NamingStrategy for HandlerPath {
    fn function_name(&self, handler: &str) -> Option<String> {
        handler
            .rsplit("::")
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(sanitize)
    }
}

/// Resolve a function name, preferring the explicit name over the handler path.
pub fn function_name(explicit: Option<&str>, handler: &str) -> String {
    let strategies: [&dyn NamingStrategy; 2] = [&ExplicitName(explicit.unwrap_or("")), &HandlerPath];
    strategies
        .iter()
        .find_map(|s| s.function_name(handler))
        .unwrap_or_else(|| sanitize(handler))
}
