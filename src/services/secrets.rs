use crate::errors::{ToolError, ToolErrorKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

/// Single indirection point for `${VAR}` resolution. Definitions carry
/// placeholders, never credential values; every component resolves through
/// this trait so secret policy lives in one place.
pub trait SecretSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

pub struct StaticSecretSource {
    values: HashMap<String, String>,
}

impl StaticSecretSource {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl SecretSource for StaticSecretSource {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

pub fn contains_placeholder(input: &str) -> bool {
    PLACEHOLDER.is_match(input)
}

/// Expands every `${VAR}` in `input` against the source. The error names the
/// variable, never its value, and the caller-supplied label says which field
/// needed it.
pub fn expand_placeholders(
    input: &str,
    source: &dyn SecretSource,
    label: &str,
) -> Result<String, ToolError> {
    let mut missing: Option<String> = None;
    let expanded = PLACEHOLDER.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match source.get(name) {
            Some(value) => value,
            None => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(ToolError::new(
            ToolErrorKind::NotFound,
            "MISSING_SECRET",
            format!("Secret variable is not set: {}", name),
        )
        .with_hint(format!(
            "Set {} in the server environment, or adjust the {} definition.",
            name, label
        )));
    }
    Ok(expanded.into_owned())
}
