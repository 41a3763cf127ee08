use crate::constants::preview as preview_constants;
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::executor::RequestExecutor;
use crate::services::logger::Logger;
use crate::services::registry::ConfigRegistry;
use crate::services::storage::{SessionStatus, SessionStore};
use crate::services::transform::TransformSpec;
use crate::services::validation::Validation;
use crate::utils::redact::redact_value;
use serde_json::Value;
use std::sync::Arc;

const API_ACTIONS: &[&str] = &[
    "fetch",
    "preview",
    "endpoints",
    "config_list",
    "config_test",
    "config_test_all",
    "config_reload",
    "session_create",
    "session_list",
    "session_get",
    "session_export",
    "session_close",
    "session_delete",
];

/// Front-end of the invocation engine: one action-dispatched tool in the
/// shape the MCP layer expects.
#[derive(Clone)]
pub struct ApiManager {
    logger: Logger,
    validation: Validation,
    registry: Arc<ConfigRegistry>,
    executor: Arc<RequestExecutor>,
    sessions: Arc<SessionStore>,
}

impl ApiManager {
    pub fn new(
        logger: Logger,
        validation: Validation,
        registry: Arc<ConfigRegistry>,
        executor: Arc<RequestExecutor>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            logger: logger.child("api"),
            validation,
            registry,
            executor,
            sessions,
        }
    }

    pub async fn handle_action(&self, args: Value) -> Result<Value, ToolError> {
        let action = args.get("action");
        let action_name = action.and_then(|v| v.as_str()).unwrap_or("");
        match action_name {
            "fetch" => self.fetch(&args).await,
            "preview" => self.preview(&args).await,
            "endpoints" => self.endpoints(&args),
            "config_list" => self.config_list(),
            "config_test" => self.config_test(&args).await,
            "config_test_all" => self.config_test_all().await,
            "config_reload" => self.config_reload(),
            "session_create" => self.session_create(&args).await,
            "session_list" => self.session_list(),
            "session_get" => self.session_get(&args).await,
            "session_export" => self.session_export(&args).await,
            "session_close" => self.session_close(&args).await,
            "session_delete" => self.session_delete(&args).await,
            _ => Err(unknown_action(action)),
        }
    }

    /// The one-call path: resolve, guard, execute, transform, then either
    /// return the payload or fold it into a storage session. With a session
    /// id the caller gets the summary, never the payload as well.
    async fn fetch(&self, args: &Value) -> Result<Value, ToolError> {
        let api =
            self.validation
                .ensure_string(args.get("api").unwrap_or(&Value::Null), "api", true)?;
        let endpoint = self.validation.ensure_string(
            args.get("endpoint").unwrap_or(&Value::Null),
            "endpoint",
            true,
        )?;
        let params = self
            .validation
            .ensure_optional_object(args.get("params"), "params")?
            .unwrap_or_default();
        let spec = match args.get("transform") {
            None => TransformSpec::default(),
            Some(raw) => TransformSpec::parse(raw)?,
        };
        let session_id = match self
            .validation
            .ensure_optional_string(args.get("session_id"), "session_id", true)?
        {
            Some(id) => Some(self.validation.ensure_slug(&id, "session_id")?),
            None => None,
        };

        // Fail on a bad session before spending a network call; append
        // re-checks under the session lock.
        if let Some(id) = session_id.as_deref() {
            let meta = self.sessions.get(id).await?;
            if meta.status == SessionStatus::Closed {
                return Err(ToolError::new(
                    ToolErrorKind::Conflict,
                    "SESSION_CLOSED",
                    format!("Storage session is closed: {}", id),
                ));
            }
        }

        let mut call = self.registry.resolve(&api, &endpoint)?;
        if let Some(timeout_ms) = args.get("timeout_ms").and_then(|v| v.as_u64()) {
            call.timeout_ms = timeout_ms;
        }
        let snapshot = self.registry.snapshot();
        let response = self.executor.execute(&call, &params, &snapshot.security).await?;

        let data = if spec.is_empty() {
            response.data.clone()
        } else {
            spec.apply(&response.data)
        };

        if let Some(id) = session_id.as_deref() {
            let records: Vec<Value> = match &data {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let summary = self.sessions.append(id, &records).await?;
            self.logger.info(
                "Fetched into session",
                Some(&serde_json::json!({
                    "api": api,
                    "endpoint": endpoint,
                    "session_id": id,
                    "appended": summary.appended,
                })),
            );
            return Ok(serde_json::json!({
                "success": true,
                "api": api,
                "endpoint": endpoint,
                "status": response.status,
                "duration_ms": response.duration_ms,
                "attempts": response.attempts,
                "session": summary,
            }));
        }

        let record_count = data.as_array().map(|items| items.len());
        Ok(serde_json::json!({
            "success": true,
            "api": api,
            "endpoint": endpoint,
            "status": response.status,
            "url": response.url,
            "duration_ms": response.duration_ms,
            "attempts": response.attempts,
            "record_count": record_count,
            "data": data,
        }))
    }

    /// Fetch without storing, shaped for a human skimming unknown data.
    async fn preview(&self, args: &Value) -> Result<Value, ToolError> {
        let api =
            self.validation
                .ensure_string(args.get("api").unwrap_or(&Value::Null), "api", true)?;
        let endpoint = self.validation.ensure_string(
            args.get("endpoint").unwrap_or(&Value::Null),
            "endpoint",
            true,
        )?;
        let params = self
            .validation
            .ensure_optional_object(args.get("params"), "params")?
            .unwrap_or_default();
        let max_rows = read_usize(args.get("max_rows")).unwrap_or(preview_constants::MAX_ROWS);
        let max_depth = read_usize(args.get("max_depth")).unwrap_or(preview_constants::MAX_DEPTH);
        let truncate =
            read_usize(args.get("truncate")).unwrap_or(preview_constants::TRUNCATE_LENGTH);

        let call = self.registry.resolve(&api, &endpoint)?;
        let snapshot = self.registry.snapshot();
        let response = self.executor.execute(&call, &params, &snapshot.security).await?;

        let summary = match &response.data {
            Value::Array(items) => serde_json::json!({"kind": "sequence", "records": items.len()}),
            Value::Object(map) => serde_json::json!({"kind": "mapping", "fields": map.len()}),
            _ => serde_json::json!({"kind": "scalar"}),
        };
        Ok(serde_json::json!({
            "success": true,
            "api": api,
            "endpoint": endpoint,
            "status": response.status,
            "duration_ms": response.duration_ms,
            "summary": summary,
            "preview": preview_value(&response.data, max_depth, max_rows, truncate),
        }))
    }

    fn endpoints(&self, args: &Value) -> Result<Value, ToolError> {
        let api =
            self.validation
                .ensure_string(args.get("api").unwrap_or(&Value::Null), "api", true)?;
        let entry = self.registry.api(&api)?;
        let endpoints: Vec<Value> = entry
            .def
            .endpoints
            .iter()
            .map(|endpoint| {
                serde_json::json!({
                    "name": endpoint.name,
                    "method": endpoint.method,
                    "path": endpoint.path,
                    "description": endpoint.description,
                    "params": endpoint.params,
                })
            })
            .collect();
        Ok(serde_json::json!({
            "success": true,
            "api": api,
            "count": endpoints.len(),
            "endpoints": endpoints,
        }))
    }

    fn config_list(&self) -> Result<Value, ToolError> {
        let snapshot = self.registry.snapshot();
        let mut apis: Vec<Value> = snapshot
            .apis
            .values()
            .map(|entry| {
                serde_json::json!({
                    "name": entry.def.name,
                    "display_name": entry.def.display_name,
                    "description": entry.def.description,
                    "base_url": entry.def.base_url,
                    "enabled": entry.def.enabled,
                    "auth_type": entry.def.auth.kind(),
                    "endpoints_count": entry.def.endpoints.len(),
                })
            })
            .collect();
        apis.sort_by(|a, b| {
            let left = a.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let right = b.get("name").and_then(|v| v.as_str()).unwrap_or("");
            left.cmp(right)
        });
        Ok(serde_json::json!({
            "success": true,
            "count": apis.len(),
            "loaded_at": snapshot.loaded_at,
            "apis": redact_value(&Value::Array(apis)),
        }))
    }

    /// Connectivity check against an API's base URL. Failures come back as
    /// data, not errors, so test_all can report per-API results.
    async fn config_test(&self, args: &Value) -> Result<Value, ToolError> {
        let api =
            self.validation
                .ensure_string(args.get("api").unwrap_or(&Value::Null), "api", true)?;
        Ok(self.test_one(&api).await)
    }

    async fn config_test_all(&self) -> Result<Value, ToolError> {
        let snapshot = self.registry.snapshot();
        let mut names: Vec<String> = snapshot.apis.keys().cloned().collect();
        names.sort();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            results.push(self.test_one(&name).await);
        }
        let all_accessible = results
            .iter()
            .all(|r| r.get("accessible").and_then(|v| v.as_bool()).unwrap_or(false));
        Ok(serde_json::json!({
            "success": true,
            "all_accessible": all_accessible,
            "results": results,
        }))
    }

    async fn test_one(&self, api: &str) -> Value {
        let outcome = async {
            let (base_url, allowed_hosts) = self.registry.resolve_base(api)?;
            let snapshot = self.registry.snapshot();
            self.executor
                .probe(&base_url, &snapshot.security, allowed_hosts.as_deref())
                .await
        }
        .await;
        match outcome {
            Ok((status, duration_ms)) => serde_json::json!({
                "api": api,
                "accessible": status < 500,
                "status": status,
                "duration_ms": duration_ms,
            }),
            Err(err) => serde_json::json!({
                "api": api,
                "accessible": false,
                "error": err.message,
                "code": err.code,
            }),
        }
    }

    fn config_reload(&self) -> Result<Value, ToolError> {
        let count = self.registry.reload()?;
        Ok(serde_json::json!({ "success": true, "apis": count }))
    }

    async fn session_create(&self, args: &Value) -> Result<Value, ToolError> {
        let session_id = self.validation.ensure_string(
            args.get("session_id").unwrap_or(&Value::Null),
            "session_id",
            true,
        )?;
        let session_id = self.validation.ensure_slug(&session_id, "session_id")?;
        let api =
            self.validation
                .ensure_string(args.get("api").unwrap_or(&Value::Null), "api", true)?;
        let endpoint = self.validation.ensure_string(
            args.get("endpoint").unwrap_or(&Value::Null),
            "endpoint",
            true,
        )?;
        let description =
            self.validation
                .ensure_optional_string(args.get("description"), "description", false)?;

        // The owning pair must exist so the session names something real.
        let entry = self.registry.api(&api)?;
        if !entry.endpoints.contains_key(&endpoint) {
            return Err(ToolError::new(
                ToolErrorKind::NotFound,
                "UNKNOWN_ENDPOINT",
                format!("Endpoint does not exist: {}.{}", api, endpoint),
            ));
        }

        let meta = self
            .sessions
            .create(&session_id, &api, &endpoint, description)
            .await?;
        Ok(serde_json::json!({ "success": true, "session": meta }))
    }

    fn session_list(&self) -> Result<Value, ToolError> {
        let sessions = self.sessions.list()?;
        Ok(serde_json::json!({
            "success": true,
            "count": sessions.len(),
            "sessions": sessions,
        }))
    }

    async fn session_get(&self, args: &Value) -> Result<Value, ToolError> {
        let session_id = self.session_id_arg(args)?;
        let meta = self.sessions.get(&session_id).await?;
        Ok(serde_json::json!({ "success": true, "session": meta }))
    }

    async fn session_export(&self, args: &Value) -> Result<Value, ToolError> {
        let session_id = self.session_id_arg(args)?;
        let limit = read_usize(args.get("limit"));
        let offset = read_usize(args.get("offset")).unwrap_or(0);
        let (records, total) = self.sessions.export(&session_id, limit, offset).await?;
        Ok(serde_json::json!({
            "success": true,
            "session_id": session_id,
            "total": total,
            "returned": records.len(),
            "records": records,
        }))
    }

    async fn session_close(&self, args: &Value) -> Result<Value, ToolError> {
        let session_id = self.session_id_arg(args)?;
        let meta = self.sessions.close(&session_id).await?;
        Ok(serde_json::json!({ "success": true, "session": meta }))
    }

    async fn session_delete(&self, args: &Value) -> Result<Value, ToolError> {
        let session_id = self.session_id_arg(args)?;
        self.sessions.delete(&session_id).await?;
        Ok(serde_json::json!({ "success": true, "session_id": session_id }))
    }

    fn session_id_arg(&self, args: &Value) -> Result<String, ToolError> {
        let raw = self.validation.ensure_string(
            args.get("session_id").unwrap_or(&Value::Null),
            "session_id",
            true,
        )?;
        self.validation.ensure_slug(&raw, "session_id")
    }
}

fn read_usize(value: Option<&Value>) -> Option<usize> {
    let value = value?;
    if let Some(n) = value.as_u64() {
        return Some(n as usize);
    }
    value.as_str().and_then(|s| s.parse::<usize>().ok())
}

fn unknown_action(action: Option<&Value>) -> ToolError {
    let name = action
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    ToolError::invalid_params(format!("Unknown api action: {}", name))
        .with_hint(format!("Use one of: {}.", API_ACTIONS.join(", ")))
        .with_details(serde_json::json!({ "known_actions": API_ACTIONS }))
}

/// Truncated recursive rendering for preview, tolerant of any shape.
fn preview_value(value: &Value, depth: usize, max_rows: usize, truncate: usize) -> Value {
    match value {
        Value::String(text) => {
            if text.chars().count() > truncate {
                let cut: String = text.chars().take(truncate).collect();
                Value::String(format!("{}...", cut))
            } else {
                value.clone()
            }
        }
        Value::Array(items) => {
            if depth == 0 {
                return Value::String(format!("[sequence:{}]", items.len()));
            }
            let mut out: Vec<Value> = items
                .iter()
                .take(max_rows)
                .map(|item| preview_value(item, depth - 1, max_rows, truncate))
                .collect();
            if items.len() > max_rows {
                out.push(Value::String(format!("[... +{} more]", items.len() - max_rows)));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            if depth == 0 {
                return Value::String("[mapping]".to_string());
            }
            let mut out = serde_json::Map::new();
            for (key, item) in map.iter().take(preview_constants::MAX_KEYS) {
                out.insert(
                    key.clone(),
                    preview_value(item, depth - 1, max_rows, truncate),
                );
            }
            if map.len() > preview_constants::MAX_KEYS {
                out.insert(
                    "...".to_string(),
                    Value::String(format!("+{} more fields", map.len() - preview_constants::MAX_KEYS)),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[async_trait::async_trait]
impl crate::managers::ToolHandler for ApiManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        self.handle_action(args).await
    }
}
