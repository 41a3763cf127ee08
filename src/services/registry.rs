use crate::constants::network as network_constants;
use crate::constants::protocols::ALLOWED_HTTP;
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::auth::{KeySlot, ResolvedAuth};
use crate::services::executor::{RetryOverrides, RetryPolicy};
use crate::services::logger::Logger;
use crate::services::secrets::{contains_placeholder, expand_placeholders, SecretSource};
use crate::services::security::SecurityConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use url::Url;

static PATH_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("path param regex"));

/// A string field that may embed `${VAR}` placeholders, resolved only at
/// call time. Holds the template, never the resolved value.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    pub fn template(&self) -> &str {
        &self.0
    }

    pub fn resolve(&self, source: &dyn SecretSource, label: &str) -> Result<String, ToolError> {
        expand_placeholders(&self.0, source, label)
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretRef(***)")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyLocation {
    #[default]
    Header,
    Query,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthStrategy {
    #[default]
    None,
    ApiKey {
        #[serde(default)]
        location: KeyLocation,
        field: String,
        secret: SecretRef,
    },
    Bearer {
        token: SecretRef,
    },
    Basic {
        username: SecretRef,
        password: SecretRef,
    },
}

impl AuthStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthStrategy::None => "none",
            AuthStrategy::ApiKey { .. } => "api_key",
            AuthStrategy::Bearer { .. } => "bearer",
            AuthStrategy::Basic { .. } => "basic",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    #[default]
    Query,
    Path,
    Body,
    Header,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub location: ParamLocation,
    #[serde(default)]
    pub description: String,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDefinition {
    pub name: String,
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

impl EndpointDefinition {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthStrategy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryOverrides>,
    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryFile {
    #[serde(default)]
    pub apis: Vec<ApiDefinition>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Clone)]
pub struct ApiEntry {
    pub def: Arc<ApiDefinition>,
    pub endpoints: HashMap<String, Arc<EndpointDefinition>>,
}

pub struct RegistrySnapshot {
    pub apis: HashMap<String, ApiEntry>,
    pub defaults: Defaults,
    pub security: SecurityConfig,
    pub loaded_at: String,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            apis: HashMap::new(),
            defaults: Defaults::default(),
            security: SecurityConfig::default(),
            loaded_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Everything the executor needs for one call, with `${VAR}` placeholders in
/// the base URL, auth material and parameter defaults already resolved.
#[derive(Debug)]
pub struct ResolvedCall {
    pub api_name: String,
    pub endpoint: Arc<EndpointDefinition>,
    pub base_url: String,
    pub auth: ResolvedAuth,
    pub allowed_hosts: Option<Vec<String>>,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    pub param_defaults: serde_json::Map<String, Value>,
}

/// Read-mostly registry of API definitions. `reload` builds and validates a
/// full replacement snapshot before swapping a single `Arc`, so in-flight
/// calls never observe a half-updated definition.
pub struct ConfigRegistry {
    logger: Logger,
    config_path: PathBuf,
    secrets: Arc<dyn SecretSource>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl ConfigRegistry {
    pub fn new(
        logger: Logger,
        config_path: PathBuf,
        secrets: Arc<dyn SecretSource>,
    ) -> Result<Self, ToolError> {
        let logger = logger.child("registry");
        let snapshot = if config_path.exists() {
            Arc::new(build_snapshot(&config_path)?)
        } else {
            logger.warn(
                "Config file not found, starting with an empty registry",
                Some(&serde_json::json!({ "path": config_path.display().to_string() })),
            );
            Arc::new(RegistrySnapshot::empty())
        };
        logger.info(
            "Registry loaded",
            Some(&serde_json::json!({ "apis": snapshot.apis.len() })),
        );
        Ok(Self {
            logger,
            config_path,
            secrets,
            snapshot: RwLock::new(snapshot),
        })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry lock").clone()
    }

    pub fn reload(&self) -> Result<usize, ToolError> {
        let next = Arc::new(build_snapshot(&self.config_path)?);
        let count = next.apis.len();
        *self.snapshot.write().expect("registry lock") = next;
        self.logger
            .info("Registry reloaded", Some(&serde_json::json!({ "apis": count })));
        Ok(count)
    }

    pub fn api(&self, api_name: &str) -> Result<ApiEntry, ToolError> {
        let snapshot = self.snapshot();
        let entry = snapshot.apis.get(api_name).ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::NotFound,
                "UNKNOWN_API",
                format!("API is not configured: {}", api_name),
            )
            .with_hint("Use action=config_list to see configured APIs.")
        })?;
        Ok(entry.clone())
    }

    /// Expanded base URL plus the per-API host allow-list, for connectivity
    /// probes that target no particular endpoint.
    pub fn resolve_base(
        &self,
        api_name: &str,
    ) -> Result<(String, Option<Vec<String>>), ToolError> {
        let entry = self.api(api_name)?;
        if !entry.def.enabled {
            return Err(ToolError::new(
                ToolErrorKind::Denied,
                "API_DISABLED",
                format!("API is disabled: {}", api_name),
            ));
        }
        let base_url =
            expand_placeholders(&entry.def.base_url, self.secrets.as_ref(), "base_url")?;
        Ok((base_url, entry.def.allowed_hosts.clone()))
    }

    pub fn resolve(&self, api_name: &str, endpoint_name: &str) -> Result<ResolvedCall, ToolError> {
        let snapshot = self.snapshot();
        let entry = snapshot.apis.get(api_name).ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::NotFound,
                "UNKNOWN_API",
                format!("API is not configured: {}", api_name),
            )
            .with_hint("Use action=config_list to see configured APIs.")
        })?;
        if !entry.def.enabled {
            return Err(ToolError::new(
                ToolErrorKind::Denied,
                "API_DISABLED",
                format!("API is disabled: {}", api_name),
            ));
        }
        let endpoint = entry.endpoints.get(endpoint_name).cloned().ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::NotFound,
                "UNKNOWN_ENDPOINT",
                format!("Endpoint does not exist: {}.{}", api_name, endpoint_name),
            )
            .with_hint("Use action=endpoints to list an API's endpoints.")
        })?;

        let base_url =
            expand_placeholders(&entry.def.base_url, self.secrets.as_ref(), "base_url")?;
        let auth = self.resolve_auth(&entry.def.auth)?;

        let mut param_defaults = serde_json::Map::new();
        for param in endpoint.params.iter() {
            if let Some(default) = param.default.as_ref() {
                let value = match default {
                    Value::String(text) if contains_placeholder(text) => Value::String(
                        expand_placeholders(text, self.secrets.as_ref(), &param.name)?,
                    ),
                    other => other.clone(),
                };
                param_defaults.insert(param.name.clone(), value);
            }
        }

        let timeout_ms = entry
            .def
            .timeout_ms
            .or(snapshot.defaults.timeout_ms)
            .unwrap_or(network_constants::TIMEOUT_API_REQUEST_MS);
        let retry = RetryPolicy::resolve(&[
            snapshot.defaults.retry.as_ref(),
            entry.def.retry.as_ref(),
        ]);

        Ok(ResolvedCall {
            api_name: api_name.to_string(),
            endpoint,
            base_url,
            auth,
            allowed_hosts: entry.def.allowed_hosts.clone(),
            timeout_ms,
            retry,
            param_defaults,
        })
    }

    fn resolve_auth(&self, strategy: &AuthStrategy) -> Result<ResolvedAuth, ToolError> {
        let source = self.secrets.as_ref();
        Ok(match strategy {
            AuthStrategy::None => ResolvedAuth::None,
            AuthStrategy::ApiKey {
                location,
                field,
                secret,
            } => ResolvedAuth::ApiKey {
                slot: match location {
                    KeyLocation::Query => KeySlot::Query,
                    KeyLocation::Header => KeySlot::Header,
                },
                field: field.clone(),
                value: secret.resolve(source, "auth.secret")?,
            },
            AuthStrategy::Bearer { token } => ResolvedAuth::Bearer {
                token: token.resolve(source, "auth.token")?,
            },
            AuthStrategy::Basic { username, password } => ResolvedAuth::Basic {
                username: username.resolve(source, "auth.username")?,
                password: password.resolve(source, "auth.password")?,
            },
        })
    }
}

fn build_snapshot(path: &PathBuf) -> Result<RegistrySnapshot, ToolError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ToolError::new(
            ToolErrorKind::InvalidParams,
            "INVALID_CONFIG",
            format!("Failed to read config file: {}", err),
        )
    })?;
    let file: RegistryFile = serde_json::from_str(&raw).map_err(|err| {
        ToolError::new(
            ToolErrorKind::InvalidParams,
            "INVALID_CONFIG",
            format!("Failed to parse config file: {}", err),
        )
    })?;
    validate_file(&file)?;

    let mut apis = HashMap::new();
    for api in file.apis.into_iter() {
        let mut endpoints = HashMap::new();
        let def = Arc::new(api);
        for endpoint in def.endpoints.iter() {
            endpoints.insert(endpoint.name.clone(), Arc::new(endpoint.clone()));
        }
        apis.insert(def.name.clone(), ApiEntry { def, endpoints });
    }

    Ok(RegistrySnapshot {
        apis,
        defaults: file.defaults,
        security: file.security,
        loaded_at: chrono::Utc::now().to_rfc3339(),
    })
}

fn invalid_config(message: impl Into<String>) -> ToolError {
    ToolError::new(ToolErrorKind::InvalidParams, "INVALID_CONFIG", message)
}

fn validate_file(file: &RegistryFile) -> Result<(), ToolError> {
    let mut api_names = HashSet::new();
    for api in file.apis.iter() {
        let name = api.name.trim();
        if name.is_empty() {
            return Err(invalid_config("API name must be a non-empty string"));
        }
        if !api_names.insert(name.to_string()) {
            return Err(invalid_config(format!("Duplicate API name: {}", name)));
        }
        validate_api(api)?;
    }
    Ok(())
}

fn validate_api(api: &ApiDefinition) -> Result<(), ToolError> {
    if api.base_url.trim().is_empty() {
        return Err(invalid_config(format!(
            "API {} is missing base_url",
            api.name
        )));
    }
    // Placeholders make the URL unparseable until call time; only fully
    // literal base URLs are checked here.
    if !contains_placeholder(&api.base_url) {
        let parsed = Url::parse(&api.base_url).map_err(|_| {
            invalid_config(format!("API {} has an invalid base_url", api.name))
        })?;
        if !ALLOWED_HTTP.contains(&parsed.scheme()) {
            return Err(invalid_config(format!(
                "API {} base_url must use http or https",
                api.name
            )));
        }
    }

    if let AuthStrategy::ApiKey { field, .. } = &api.auth {
        if field.trim().is_empty() {
            return Err(invalid_config(format!(
                "API {} api_key auth is missing the field name",
                api.name
            )));
        }
    }

    let mut endpoint_names = HashSet::new();
    for endpoint in api.endpoints.iter() {
        if endpoint.name.trim().is_empty() {
            return Err(invalid_config(format!(
                "API {} has an endpoint without a name",
                api.name
            )));
        }
        if !endpoint_names.insert(endpoint.name.clone()) {
            return Err(invalid_config(format!(
                "Duplicate endpoint name: {}.{}",
                api.name, endpoint.name
            )));
        }
        validate_endpoint(&api.name, endpoint)?;
    }
    Ok(())
}

fn validate_endpoint(api_name: &str, endpoint: &EndpointDefinition) -> Result<(), ToolError> {
    let label = format!("{}.{}", api_name, endpoint.name);
    if endpoint.path.trim().is_empty() {
        return Err(invalid_config(format!("Endpoint {} is missing path", label)));
    }
    Method::from_bytes(endpoint.method.to_uppercase().as_bytes())
        .map_err(|_| invalid_config(format!("Endpoint {} has an invalid method", label)))?;

    let mut param_names = HashSet::new();
    for param in endpoint.params.iter() {
        if param.name.trim().is_empty() {
            return Err(invalid_config(format!(
                "Endpoint {} has a parameter without a name",
                label
            )));
        }
        if !param_names.insert(param.name.clone()) {
            return Err(invalid_config(format!(
                "Duplicate parameter {} on endpoint {}",
                param.name, label
            )));
        }
    }

    for caps in PATH_PARAM.captures_iter(&endpoint.path) {
        let name = &caps[1];
        let spec = endpoint.param(name).ok_or_else(|| {
            invalid_config(format!(
                "Endpoint {} path references undeclared parameter {{{}}}",
                label, name
            ))
        })?;
        if spec.location != ParamLocation::Path {
            return Err(invalid_config(format!(
                "Parameter {} on endpoint {} must have location=path",
                name, label
            )));
        }
        if !spec.required && spec.default.is_none() {
            return Err(invalid_config(format!(
                "Path parameter {} on endpoint {} must be required or carry a default",
                name, label
            )));
        }
    }
    Ok(())
}

pub fn path_param_names(path: &str) -> Vec<String> {
    PATH_PARAM
        .captures_iter(path)
        .map(|caps| caps[1].to_string())
        .collect()
}
