//! Secret references in node configuration.
//!
//! String-typed configuration leaves may embed `{{secrets.<name>.<field>}}`
//! tokens. Before a node runs, the engine walks its configuration and
//! replaces every token with the resolver's answer for `name.field`. The
//! walker is pure: it takes a value and returns a new value, never mutating
//! the node's stored configuration.

use crate::error::{FlowError, FlowResult};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Maximum depth the walker descends into nested configuration
pub const DEFAULT_MAX_DEPTH: usize = 8;

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*secrets\.([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\s*\}\}")
            .expect("secret reference pattern is valid")
    })
}

/// Resolves `name.field` references to secret values
pub trait SecretResolver: Send + Sync {
    /// Resolve a reference of the form `name.field`
    fn resolve(&self, reference: &str) -> FlowResult<String>;
}

/// Replace every secret reference in `value`, returning a new value.
///
/// Recursion into arrays and objects is bounded by `max_depth`; deeper
/// structure is passed through untouched.
pub fn resolve_secrets(
    value: &serde_json::Value,
    resolver: &dyn SecretResolver,
    max_depth: usize,
) -> FlowResult<serde_json::Value> {
    if max_depth == 0 {
        return Ok(value.clone());
    }

    match value {
        serde_json::Value::String(text) => {
            Ok(serde_json::Value::String(resolve_string(text, resolver)?))
        }
        serde_json::Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_secrets(item, resolver, max_depth - 1)?);
            }
            Ok(serde_json::Value::Array(resolved))
        }
        serde_json::Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_secrets(item, resolver, max_depth - 1)?);
            }
            Ok(serde_json::Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(text: &str, resolver: &dyn SecretResolver) -> FlowResult<String> {
    let pattern = secret_pattern();
    let mut result = String::with_capacity(text.len());
    let mut last_end = 0;

    for captures in pattern.captures_iter(text) {
        let whole = captures.get(0).expect("match 0 always present");
        let reference = format!("{}.{}", &captures[1], &captures[2]);
        let value = resolver.resolve(&reference)?;
        result.push_str(&text[last_end..whole.start()]);
        result.push_str(&value);
        last_end = whole.end();
    }

    result.push_str(&text[last_end..]);
    Ok(result)
}

/// In-memory resolver backed by a map of `name.field` entries
#[derive(Debug, Clone, Default)]
pub struct MapSecretResolver {
    secrets: HashMap<String, String>,
}

impl MapSecretResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a secret field
    pub fn insert<N, F, V>(&mut self, name: N, field: F, value: V)
    where
        N: AsRef<str>,
        F: AsRef<str>,
        V: Into<String>,
    {
        self.secrets.insert(
            format!("{}.{}", name.as_ref(), field.as_ref()),
            value.into(),
        );
    }
}

impl SecretResolver for MapSecretResolver {
    fn resolve(&self, reference: &str) -> FlowResult<String> {
        self.secrets
            .get(reference)
            .cloned()
            .ok_or_else(|| FlowError::secret(reference, "not found"))
    }
}

/// Resolver that reads `FLOW_SECRET_<NAME>_<FIELD>` environment variables
#[derive(Debug, Clone, Default)]
pub struct EnvSecretResolver;

impl EnvSecretResolver {
    /// Create the resolver
    pub fn new() -> Self {
        Self
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, reference: &str) -> FlowResult<String> {
        let variable = format!(
            "FLOW_SECRET_{}",
            reference.replace(['.', '-'], "_").to_uppercase()
        );
        std::env::var(&variable)
            .map_err(|_| FlowError::secret(reference, format!("{variable} is not set")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> MapSecretResolver {
        let mut resolver = MapSecretResolver::new();
        resolver.insert("api", "key", "s3cr3t");
        resolver.insert("db", "password", "hunter2");
        resolver
    }

    #[test]
    fn test_replaces_token_inside_string() {
        let value = json!({"header": "Bearer {{secrets.api.key}}"});
        let resolved = resolve_secrets(&value, &resolver(), DEFAULT_MAX_DEPTH).unwrap();
        assert_eq!(resolved, json!({"header": "Bearer s3cr3t"}));
    }

    #[test]
    fn test_whitespace_inside_braces_is_accepted() {
        let value = json!("{{ secrets.api.key }}");
        let resolved = resolve_secrets(&value, &resolver(), DEFAULT_MAX_DEPTH).unwrap();
        assert_eq!(resolved, json!("s3cr3t"));
    }

    #[test]
    fn test_multiple_tokens_in_one_leaf() {
        let value = json!("{{secrets.api.key}}:{{secrets.db.password}}");
        let resolved = resolve_secrets(&value, &resolver(), DEFAULT_MAX_DEPTH).unwrap();
        assert_eq!(resolved, json!("s3cr3t:hunter2"));
    }

    #[test]
    fn test_walks_nested_structure() {
        let value = json!({"auth": {"tokens": ["{{secrets.api.key}}", "plain"]}});
        let resolved = resolve_secrets(&value, &resolver(), DEFAULT_MAX_DEPTH).unwrap();
        assert_eq!(resolved, json!({"auth": {"tokens": ["s3cr3t", "plain"]}}));
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let value = json!("{{secrets.api.missing}}");
        let err = resolve_secrets(&value, &resolver(), DEFAULT_MAX_DEPTH).unwrap_err();
        assert!(matches!(err, FlowError::SecretResolution { .. }));
    }

    #[test]
    fn test_non_secret_braces_pass_through() {
        let value = json!("{{not.a.secret}} and {{secrets.bad reference}}");
        let resolved = resolve_secrets(&value, &resolver(), DEFAULT_MAX_DEPTH).unwrap();
        assert_eq!(resolved, value);
    }

    #[test]
    fn test_depth_limit_stops_recursion() {
        let value = json!({"a": {"b": "{{secrets.api.key}}"}});
        // Depth 1 visits only the top object; the nested string is untouched.
        let resolved = resolve_secrets(&value, &resolver(), 1).unwrap();
        assert_eq!(resolved, value);
    }

    #[test]
    fn test_env_resolver_reads_variable() {
        std::env::set_var("FLOW_SECRET_SMTP_HOST", "mail.example.com");
        let resolved = EnvSecretResolver::new().resolve("smtp.host").unwrap();
        assert_eq!(resolved, "mail.example.com");
        std::env::remove_var("FLOW_SECRET_SMTP_HOST");
    }
}
