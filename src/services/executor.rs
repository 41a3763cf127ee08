use crate::constants::{network as network_constants, retry as retry_constants, security as security_constants};
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::auth;
use crate::services::logger::Logger;
use crate::services::registry::{path_param_names, ParamLocation, ResolvedCall};
use crate::services::security::{SecurityConfig, SecurityGuard};
use crate::utils::redact::redact_text;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Per-API overrides for the retry policy, straight from the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryOverrides {
    #[serde(default)]
    pub max_attempts: Option<usize>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<f64>,
    #[serde(default)]
    pub status_codes: Option<Vec<u16>>,
}

/// Explicit retry policy consumed by the executor. Retries apply only to
/// idempotent methods; the policy itself is method-agnostic.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: retry_constants::MAX_ATTEMPTS,
            base_delay_ms: retry_constants::BASE_DELAY_MS,
            max_delay_ms: retry_constants::MAX_DELAY_MS,
            jitter: retry_constants::JITTER,
            status_codes: retry_constants::STATUS_CODES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Later layers win; `None` fields fall through.
    pub fn resolve(layers: &[Option<&RetryOverrides>]) -> Self {
        let mut policy = Self::default();
        for overrides in layers.iter().flatten() {
            if let Some(max_attempts) = overrides.max_attempts {
                policy.max_attempts = max_attempts.max(1);
            }
            if let Some(base_delay_ms) = overrides.base_delay_ms {
                policy.base_delay_ms = base_delay_ms;
            }
            if let Some(max_delay_ms) = overrides.max_delay_ms {
                policy.max_delay_ms = max_delay_ms;
            }
            if let Some(jitter) = overrides.jitter {
                policy.jitter = jitter.clamp(0.0, 1.0);
            }
            if let Some(status_codes) = overrides.status_codes.as_ref() {
                policy.status_codes = status_codes.clone();
            }
        }
        policy
    }

    pub fn retryable_status(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> u64 {
        let factor: f64 = 2.0;
        let mut delay =
            (self.base_delay_ms as f64) * factor.powi(attempt.saturating_sub(1) as i32);
        if delay > self.max_delay_ms as f64 {
            delay = self.max_delay_ms as f64;
        }
        if self.jitter > 0.0 {
            let delta = delay * self.jitter;
            delay = delay - delta + rand::random::<f64>() * delta * 2.0;
        }
        delay.max(0.0) as u64
    }
}

pub fn is_idempotent(method: &Method) -> bool {
    retry_constants::IDEMPOTENT_METHODS
        .iter()
        .any(|m| *m == method.as_str())
}

#[derive(Debug)]
pub enum BodyPayload {
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug)]
pub struct RequestPlan {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<BodyPayload>,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: Value,
    pub data: Value,
    pub body_bytes: u64,
    pub duration_ms: u128,
    pub attempts: usize,
}

/// Validates caller parameters against the endpoint schema and lays out the
/// concrete request. Runs before any network I/O.
pub fn build_plan(
    call: &ResolvedCall,
    params: &serde_json::Map<String, Value>,
) -> Result<RequestPlan, ToolError> {
    let endpoint = call.endpoint.as_ref();

    for name in params.keys() {
        if endpoint.param(name).is_none() {
            return Err(ToolError::new(
                ToolErrorKind::InvalidParams,
                "UNKNOWN_PARAMETER",
                format!(
                    "Unknown parameter {} for endpoint {}.{}",
                    name, call.api_name, endpoint.name
                ),
            ));
        }
    }

    let mut effective = call.param_defaults.clone();
    for (name, value) in params.iter() {
        effective.insert(name.clone(), value.clone());
    }
    for spec in endpoint.params.iter() {
        if spec.required && !effective.contains_key(&spec.name) {
            return Err(ToolError::new(
                ToolErrorKind::InvalidParams,
                "MISSING_PARAMETER",
                format!(
                    "Missing required parameter {} for endpoint {}.{}",
                    spec.name, call.api_name, endpoint.name
                ),
            ));
        }
    }

    let mut path = endpoint.path.clone();
    for name in path_param_names(&endpoint.path) {
        let value = effective.get(&name).ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::InvalidParams,
                "MISSING_PARAMETER",
                format!("Missing path parameter {}", name),
            )
        })?;
        let rendered = value_to_string(value);
        if rendered.contains(['/', '?', '#', '\\']) {
            return Err(ToolError::invalid_params(format!(
                "Path parameter {} must not contain path separators",
                name
            )));
        }
        path = path.replace(&format!("{{{}}}", name), &rendered);
    }

    let base = Url::parse(&call.base_url)
        .map_err(|_| ToolError::invalid_params("Invalid base_url after expansion"))?;
    let mut url = base
        .join(&path)
        .map_err(|_| ToolError::invalid_params("Invalid endpoint path"))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        "User-Agent",
        HeaderValue::from_static(network_constants::USER_AGENT),
    );
    headers.insert(
        "Accept",
        HeaderValue::from_static("application/json, text/plain, */*"),
    );

    let mut body_fields = serde_json::Map::new();
    for spec in endpoint.params.iter() {
        let Some(value) = effective.get(&spec.name) else {
            continue;
        };
        match spec.location {
            ParamLocation::Path => {}
            ParamLocation::Query => {
                url.query_pairs_mut()
                    .append_pair(&spec.name, &value_to_string(value));
            }
            ParamLocation::Header => {
                let name = HeaderName::from_bytes(spec.name.as_bytes())
                    .map_err(|_| ToolError::invalid_params("Invalid header parameter name"))?;
                let rendered = HeaderValue::from_str(&value_to_string(value))
                    .map_err(|_| ToolError::invalid_params("Invalid header parameter value"))?;
                headers.insert(name, rendered);
            }
            ParamLocation::Body => {
                body_fields.insert(spec.name.clone(), value.clone());
            }
        }
    }

    let method = Method::from_bytes(endpoint.method.to_uppercase().as_bytes())
        .map_err(|_| ToolError::invalid_params("Invalid HTTP method"))?;

    let body = if body_fields.is_empty() {
        None
    } else if wants_form_body(&headers) {
        Some(BodyPayload::Form(
            body_fields
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect(),
        ))
    } else {
        Some(BodyPayload::Json(Value::Object(body_fields)))
    };

    Ok(RequestPlan {
        url,
        method,
        headers,
        body,
    })
}

fn wants_form_body(headers: &HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub struct RequestExecutor {
    logger: Logger,
    guard: Arc<SecurityGuard>,
    client: Client,
}

impl RequestExecutor {
    pub fn new(logger: Logger, guard: Arc<SecurityGuard>) -> Result<Self, ToolError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(
                network_constants::MAX_REDIRECTS,
            ))
            .build()
            .map_err(|err| ToolError::internal(format!("Failed to build HTTP client: {}", err)))?;
        Ok(Self {
            logger: logger.child("executor"),
            guard,
            client,
        })
    }

    /// Performs one declarative call: parameter validation, pre-flight
    /// security check, bounded retries for idempotent methods, capped body
    /// read. Non-2xx responses surface as errors after retries exhaust.
    pub async fn execute(
        &self,
        call: &ResolvedCall,
        params: &serde_json::Map<String, Value>,
        security: &SecurityConfig,
    ) -> Result<RawResponse, ToolError> {
        let plan = build_plan(call, params)?;
        self.guard
            .check(&plan.url, security, call.allowed_hosts.as_deref())?;

        let retries_enabled = is_idempotent(&plan.method);
        let max_attempts = if retries_enabled {
            call.retry.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(call, &plan, security).await {
                Ok(mut response) => {
                    response.attempts = attempt;
                    return Ok(response);
                }
                Err(err) => {
                    if !retries_enabled || !err.retryable || attempt >= max_attempts {
                        return Err(err);
                    }
                    let delay = call.retry.delay_for_attempt(attempt);
                    self.logger.warn(
                        "HTTP retry",
                        Some(&serde_json::json!({
                            "api": call.api_name,
                            "endpoint": call.endpoint.name,
                            "attempt": attempt,
                            "delay_ms": delay,
                        })),
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// Connectivity probe used by config tests: GET the base URL, discard the
    /// body, report status and latency.
    pub async fn probe(
        &self,
        url_text: &str,
        security: &SecurityConfig,
        allowed_hosts: Option<&[String]>,
    ) -> Result<(u16, u128), ToolError> {
        let url = Url::parse(url_text).map_err(|_| ToolError::invalid_params("Invalid URL"))?;
        self.guard.check(&url, security, allowed_hosts)?;
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_millis(network_constants::TIMEOUT_PROBE_MS))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let _ = read_capped(response, security.max_response_bytes).await?;
        Ok((status, started.elapsed().as_millis()))
    }

    async fn send_once(
        &self,
        call: &ResolvedCall,
        plan: &RequestPlan,
        security: &SecurityConfig,
    ) -> Result<RawResponse, ToolError> {
        let mut req = self
            .client
            .request(plan.method.clone(), plan.url.clone())
            .headers(plan.headers.clone())
            .timeout(Duration::from_millis(call.timeout_ms));
        req = auth::apply(req, &call.auth);
        match plan.body.as_ref() {
            Some(BodyPayload::Json(value)) => {
                req = req.json(value);
            }
            Some(BodyPayload::Form(pairs)) => {
                let encoded = serde_urlencoded::to_string(pairs)
                    .map_err(|_| ToolError::invalid_params("Body must be form-encodable"))?;
                req = req.body(encoded);
            }
            None => {}
        }

        let started = Instant::now();
        let response = req.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("").to_string();
        let final_url = response.url().to_string();
        let response_headers = response.headers().clone();
        let content_type = response_headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let buffer = read_capped(response, security.max_response_bytes)
            .await
            .map_err(|err| {
                if err.code == "RESPONSE_TOO_LARGE" {
                    self.guard.response_too_large(security.max_response_bytes)
                } else {
                    err
                }
            })?;
        let duration_ms = started.elapsed().as_millis();

        if !status.is_success() {
            return Err(upstream_error(status, &buffer, &call.retry));
        }

        let data = parse_body(&buffer, &content_type);
        Ok(RawResponse {
            status: status.as_u16(),
            status_text,
            url: final_url,
            headers: headers_to_value(&response_headers),
            data,
            body_bytes: buffer.len() as u64,
            duration_ms,
            attempts: 1,
        })
    }
}

/// Streams the body up to `limit` bytes. Exceeding the limit aborts the read
/// so truncated data is never surfaced.
async fn read_capped(response: reqwest::Response, limit: u64) -> Result<Vec<u8>, ToolError> {
    if let Some(declared) = response.content_length() {
        if declared > limit {
            return Err(ToolError::new(
                ToolErrorKind::Denied,
                "RESPONSE_TOO_LARGE",
                format!("Declared response size {} exceeds the ceiling", declared),
            ));
        }
    }
    let mut buffer: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_reqwest_error)?;
        if buffer.len() as u64 + chunk.len() as u64 > limit {
            return Err(ToolError::new(
                ToolErrorKind::Denied,
                "RESPONSE_TOO_LARGE",
                "Response body exceeds the ceiling",
            ));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

fn parse_body(buffer: &[u8], content_type: &str) -> Value {
    let text = String::from_utf8_lossy(buffer).to_string();
    if content_type.contains("application/json") || looks_like_json(&text) {
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            return parsed;
        }
    }
    Value::String(text)
}

fn looks_like_json(text: &str) -> bool {
    matches!(text.trim_start().as_bytes().first(), Some(b'{') | Some(b'['))
}

fn upstream_error(status: StatusCode, buffer: &[u8], policy: &RetryPolicy) -> ToolError {
    let text = String::from_utf8_lossy(buffer);
    let snippet: String = text
        .chars()
        .take(security_constants::ERROR_SNIPPET_BYTES)
        .collect();
    let snippet = redact_text(&snippet);
    ToolError::upstream(
        status.as_u16(),
        format!(
            "Upstream returned HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        ),
    )
    .with_details(serde_json::json!({
        "status": status.as_u16(),
        "body": snippet,
    }))
    .with_retryable(policy.retryable_status(status.as_u16()))
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> ToolError {
    if err.is_timeout() {
        return ToolError::timeout("HTTP request timed out");
    }
    if err.is_connect() {
        return ToolError::new(
            ToolErrorKind::Retryable,
            "CONNECT_FAILED",
            format!("Connection failed: {}", err),
        );
    }
    ToolError::new(
        ToolErrorKind::Retryable,
        "NETWORK_ERROR",
        redact_text(&err.to_string()),
    )
}

fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in headers {
        if let Ok(text) = value.to_str() {
            map.insert(key.as_str().to_string(), Value::String(text.to_string()));
        }
    }
    Value::Object(map)
}
