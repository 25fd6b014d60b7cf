//! Hub API client
//!
//! Every call resolves to a [`HubResponse`]: transport failures, non-2xx
//! statuses and malformed bodies are values, not errors. The only `Err` a
//! verb returns is [`Error::NotConfigured`], raised before any I/O when the
//! base URL or token is missing.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::task::{HubTask, Progress, TaskUpdate};

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubFailureKind {
    /// DNS, connect, TLS, timeout or body read failure
    Network,
    /// Non-2xx status
    Http,
    /// 2xx with a body that is not the expected JSON
    InvalidResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubFailure {
    pub kind: HubFailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl HubFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: HubFailureKind::Network,
            message: message.into(),
            status: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: HubFailureKind::Http,
            message: message.into(),
            status: Some(status),
        }
    }

    /// Network failures, 429 and 5xx may succeed later; everything else
    /// needs a different request.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            HubFailureKind::Network => true,
            HubFailureKind::Http => matches!(self.status, Some(429) | Some(500..=599)),
            HubFailureKind::InvalidResponse => false,
        }
    }

    pub fn into_error(self) -> Error {
        let retryable = self.is_retryable();
        Error::Hub {
            message: self.message,
            status: self.status,
            retryable,
        }
    }
}

/// Outcome of a Hub call.
#[derive(Debug, Clone, PartialEq)]
pub enum HubResponse<T> {
    Ok { data: Option<T>, status: u16 },
    Err(HubFailure),
}

impl<T> HubResponse<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, HubResponse::Ok { .. })
    }

    pub fn failure(&self) -> Option<&HubFailure> {
        match self {
            HubResponse::Ok { .. } => None,
            HubResponse::Err(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> Result<Option<T>> {
        match self {
            HubResponse::Ok { data, .. } => Ok(data),
            HubResponse::Err(failure) => Err(failure.into_error()),
        }
    }
}

/// Filters for `GET /api/tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub project_id: Option<String>,
    pub status: Option<String>,
}

impl TaskQuery {
    fn pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::new();
        if let Some(project_id) = &self.project_id {
            pairs.push(("project_id", project_id.as_str()));
        }
        if let Some(status) = &self.status {
            pairs.push(("status", status.as_str()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub name: String,
    pub platform: String,
    pub version: String,
}

impl DeviceRegistration {
    pub fn for_this_host(device_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Entity-level writes used by the durable queue's handlers.
#[async_trait]
pub trait HubClient: Send + Sync {
    async fn create_record(&self, collection: &str, data: &Value) -> Result<HubResponse<Value>>;

    async fn update_record(
        &self,
        collection: &str,
        id: &str,
        data: &Value,
    ) -> Result<HubResponse<Value>>;

    async fn delete_record(&self, collection: &str, id: &str) -> Result<HubResponse<Value>>;

    /// Replace a singleton document such as `/api/settings`.
    async fn put_document(&self, path: &str, data: &Value) -> Result<HubResponse<Value>>;

    /// `POST` to a sub-route such as `/api/tasks/:id/progress`.
    async fn post_document(&self, path: &str, data: &Value) -> Result<HubResponse<Value>>;

    /// `PATCH` a sub-route such as `/api/tasks/:id/status`.
    async fn patch_document(&self, path: &str, data: &Value) -> Result<HubResponse<Value>>;
}

/// Authenticated HTTP client for the Hub REST API.
#[derive(Debug, Clone)]
pub struct HubApiClient {
    http: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
}

impl HubApiClient {
    pub fn new(config: &HubConfig) -> Result<Self> {
        Self::with_credentials(config.url.clone(), config.token.clone(), config.timeout())
    }

    pub fn with_credentials(
        base_url: Option<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hubsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::OperationFailed(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            token: token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some() && self.token.is_some()
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or(Error::NotConfigured("base URL"))?;
        let token = self.token.as_deref().ok_or(Error::NotConfigured("token"))?;
        Ok((base_url, token))
    }

    // =========================================================================
    // Generic verbs
    // =========================================================================

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<HubResponse<T>> {
        self.request::<T, Value>(Method::GET, path, query, None)
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<HubResponse<T>> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<HubResponse<T>> {
        self.request(Method::PUT, path, &[], Some(body)).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<HubResponse<T>> {
        self.request(Method::PATCH, path, &[], Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<HubResponse<T>> {
        self.request::<T, Value>(Method::DELETE, path, &[], None)
            .await
    }

    async fn request<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<HubResponse<T>> {
        let (base_url, token) = self.credentials()?;
        let url = format!("{base_url}{path}{}", query_string(query));
        debug!(%method, path, "hub request");

        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(%method, path, error = %err, "hub transport failure");
                return Ok(HubResponse::Err(HubFailure::network(err.to_string())));
            }
        };

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => return Ok(HubResponse::Err(HubFailure::network(err.to_string()))),
        };
        debug!(%method, path, status, "hub response");
        Ok(interpret_response(status, &text))
    }

    // =========================================================================
    // Typed endpoints
    // =========================================================================

    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<HubResponse<Vec<HubTask>>> {
        self.get("/api/tasks", &query.pairs()).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<HubResponse<HubTask>> {
        self.get(&format!("/api/tasks/{}", segment(task_id)), &[])
            .await
    }

    pub async fn create_task(&self, task: &HubTask) -> Result<HubResponse<HubTask>> {
        self.post("/api/tasks", task).await
    }

    pub async fn update_task(
        &self,
        task_id: &str,
        updates: &TaskUpdate,
    ) -> Result<HubResponse<HubTask>> {
        self.patch(&format!("/api/tasks/{}", segment(task_id)), updates)
            .await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<HubResponse<Value>> {
        self.delete(&format!("/api/tasks/{}", segment(task_id)))
            .await
    }

    pub async fn push_progress(
        &self,
        task_id: &str,
        progress: &Progress,
    ) -> Result<HubResponse<Value>> {
        self.post(
            &format!("/api/tasks/{}/progress", segment(task_id)),
            progress,
        )
        .await
    }

    /// `status` is in the Hub vocabulary.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: &str,
    ) -> Result<HubResponse<HubTask>> {
        self.patch(
            &format!("/api/tasks/{}/status", segment(task_id)),
            &serde_json::json!({ "status": status }),
        )
        .await
    }

    pub async fn execute_task(&self, task_id: &str) -> Result<HubResponse<ExecuteResponse>> {
        self.post(
            &format!("/api/tasks/{}/execute", segment(task_id)),
            &serde_json::json!({}),
        )
        .await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<HubResponse<Value>> {
        self.post(
            &format!("/api/tasks/{}/cancel", segment(task_id)),
            &serde_json::json!({}),
        )
        .await
    }

    pub async fn list_projects(&self) -> Result<HubResponse<Vec<Value>>> {
        self.get("/api/projects", &[]).await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<HubResponse<Value>> {
        self.get(&format!("/api/projects/{}", segment(project_id)), &[])
            .await
    }

    pub async fn register_device(
        &self,
        registration: &DeviceRegistration,
    ) -> Result<HubResponse<Value>> {
        self.post("/api/devices", registration).await
    }

    pub async fn heartbeat(&self, device_id: &str) -> Result<HubResponse<Value>> {
        self.post(
            &format!("/api/devices/{}/heartbeat", segment(device_id)),
            &serde_json::json!({ "at": chrono::Utc::now() }),
        )
        .await
    }
}

#[async_trait]
impl HubClient for HubApiClient {
    async fn create_record(&self, collection: &str, data: &Value) -> Result<HubResponse<Value>> {
        self.post(&format!("/api/{}", segment(collection)), data)
            .await
    }

    async fn update_record(
        &self,
        collection: &str,
        id: &str,
        data: &Value,
    ) -> Result<HubResponse<Value>> {
        self.patch(
            &format!("/api/{}/{}", segment(collection), segment(id)),
            data,
        )
        .await
    }

    async fn delete_record(&self, collection: &str, id: &str) -> Result<HubResponse<Value>> {
        self.delete(&format!("/api/{}/{}", segment(collection), segment(id)))
            .await
    }

    async fn put_document(&self, path: &str, data: &Value) -> Result<HubResponse<Value>> {
        self.put(path, data).await
    }

    async fn post_document(&self, path: &str, data: &Value) -> Result<HubResponse<Value>> {
        self.post(path, data).await
    }

    async fn patch_document(&self, path: &str, data: &Value) -> Result<HubResponse<Value>> {
        self.patch(path, data).await
    }
}

/// Percent-encode one path segment.
pub fn segment(value: &str) -> Cow<'_, str> {
    urlencoding::encode(value)
}

fn query_string(pairs: &[(&str, &str)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let encoded: Vec<String> = pairs
        .iter()
        .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
        .collect();
    format!("?{}", encoded.join("&"))
}

/// Turn a status code and raw body into a [`HubResponse`].
pub fn interpret_response<T: DeserializeOwned>(status: u16, body: &str) -> HubResponse<T> {
    if status == 204 {
        return HubResponse::Ok { data: None, status };
    }

    if (200..300).contains(&status) {
        if body.trim().is_empty() {
            return HubResponse::Ok { data: None, status };
        }
        return match serde_json::from_str(body) {
            Ok(data) => HubResponse::Ok {
                data: Some(data),
                status,
            },
            Err(err) => HubResponse::Err(HubFailure {
                kind: HubFailureKind::InvalidResponse,
                message: format!("invalid JSON in Hub response: {err}"),
                status: Some(status),
            }),
        };
    }

    HubResponse::Err(HubFailure::http(status, error_message(status, body)))
}

fn error_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        match value.get("error") {
            Some(Value::String(message)) => return message.clone(),
            Some(Value::Object(error)) => {
                if let Some(Value::String(message)) = error.get("message") {
                    return message.clone();
                }
            }
            _ => {}
        }
    }

    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {status}")
    } else {
        let truncated: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("HTTP {status}: {truncated}")
    }
}
