//! Per-entity handlers that replay queued mutations against the Hub.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::hub::{segment, HubClient, HubResponse};

/// Payload key naming the task sub-route a queued `update` replays to.
pub const TASK_OP_KEY: &str = "op";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "create" => Ok(MutationAction::Create),
            "update" => Ok(MutationAction::Update),
            "delete" => Ok(MutationAction::Delete),
            other => Err(Error::InvalidArgument(format!(
                "unknown action '{other}' (expected create|update|delete)"
            ))),
        }
    }
}

/// Applies one queued mutation. `Ok(true)` removes it from the queue;
/// `Ok(false)` or `Err` keeps it for the next pass.
#[async_trait]
pub trait MutationHandler: Send + Sync {
    async fn apply(
        &self,
        client: &dyn HubClient,
        action: MutationAction,
        data: &Value,
    ) -> Result<bool>;
}

/// REST collection under `/api/<collection>` with full create/update/delete.
pub struct CollectionHandler {
    collection: &'static str,
}

impl CollectionHandler {
    pub fn new(collection: &'static str) -> Self {
        Self { collection }
    }
}

#[async_trait]
impl MutationHandler for CollectionHandler {
    async fn apply(
        &self,
        client: &dyn HubClient,
        action: MutationAction,
        data: &Value,
    ) -> Result<bool> {
        let response = match action {
            MutationAction::Create => client.create_record(self.collection, data).await?,
            MutationAction::Update => {
                let id = record_id(data)?;
                client.update_record(self.collection, id, data).await?
            }
            MutationAction::Delete => {
                let id = record_id(data)?;
                client.delete_record(self.collection, id).await?
            }
        };
        accepted(response)
    }
}

/// Tasks replay to the same routes a direct write uses: `update` payloads
/// tagged `"op": "status"` go to `PATCH /api/tasks/:id/status`, those tagged
/// `"op": "progress"` to `POST /api/tasks/:id/progress`, untagged ones to
/// `PATCH /api/tasks/:id`.
pub struct TaskHandler;

#[async_trait]
impl MutationHandler for TaskHandler {
    async fn apply(
        &self,
        client: &dyn HubClient,
        action: MutationAction,
        data: &Value,
    ) -> Result<bool> {
        let response = match action {
            MutationAction::Create => client.create_record("tasks", data).await?,
            MutationAction::Delete => client.delete_record("tasks", record_id(data)?).await?,
            MutationAction::Update => {
                let id = record_id(data)?;
                match data.get(TASK_OP_KEY).and_then(Value::as_str) {
                    Some("status") => {
                        let status = field(data, "status")?;
                        let path = format!("/api/tasks/{}/status", segment(id));
                        client
                            .patch_document(&path, &serde_json::json!({ "status": status }))
                            .await?
                    }
                    Some("progress") => {
                        let progress = field(data, "progress")?;
                        let path = format!("/api/tasks/{}/progress", segment(id));
                        client.post_document(&path, progress).await?
                    }
                    Some(other) => {
                        return Err(Error::InvalidArgument(format!(
                            "unknown task op '{other}' (expected status|progress)"
                        )))
                    }
                    None => {
                        let mut fields = data.clone();
                        if let Value::Object(map) = &mut fields {
                            map.remove("id");
                        }
                        client.update_record("tasks", id, &fields).await?
                    }
                }
            }
        };
        accepted(response)
    }
}

/// Captures are append-only.
pub struct CaptureHandler;

#[async_trait]
impl MutationHandler for CaptureHandler {
    async fn apply(
        &self,
        client: &dyn HubClient,
        action: MutationAction,
        data: &Value,
    ) -> Result<bool> {
        match action {
            MutationAction::Create => accepted(client.create_record("captures", data).await?),
            other => {
                warn!(action = %other, "captures only support create");
                Ok(false)
            }
        }
    }
}

/// Settings are a single document replaced wholesale.
pub struct SettingsHandler;

#[async_trait]
impl MutationHandler for SettingsHandler {
    async fn apply(
        &self,
        client: &dyn HubClient,
        action: MutationAction,
        data: &Value,
    ) -> Result<bool> {
        match action {
            MutationAction::Update => accepted(client.put_document("/api/settings", data).await?),
            other => {
                warn!(action = %other, "settings only support update");
                Ok(false)
            }
        }
    }
}

fn record_id(data: &Value) -> Result<&str> {
    data.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::InvalidArgument("mutation payload has no 'id'".to_string()))
}

fn field<'a>(data: &'a Value, key: &str) -> Result<&'a Value> {
    data.get(key)
        .filter(|value| !value.is_null())
        .ok_or_else(|| Error::InvalidArgument(format!("task payload has no '{key}'")))
}

fn accepted(response: HubResponse<Value>) -> Result<bool> {
    match response {
        HubResponse::Ok { .. } => Ok(true),
        HubResponse::Err(failure) => Err(failure.into_error()),
    }
}

/// Entity name -> handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MutationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for `projects`, `tasks`, `planner_events`, `captures` and
    /// `settings`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("projects", Arc::new(CollectionHandler::new("projects")));
        registry.register("tasks", Arc::new(TaskHandler));
        registry.register(
            "planner_events",
            Arc::new(CollectionHandler::new("planner_events")),
        );
        registry.register("captures", Arc::new(CaptureHandler));
        registry.register("settings", Arc::new(SettingsHandler));
        registry
    }

    /// Add or replace the handler for `entity`.
    pub fn register(&mut self, entity: impl Into<String>, handler: Arc<dyn MutationHandler>) {
        self.handlers.insert(entity.into(), handler);
    }

    pub fn get(&self, entity: &str) -> Option<Arc<dyn MutationHandler>> {
        self.handlers.get(entity).cloned()
    }

    pub fn entities(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entities", &self.entities())
            .finish()
    }
}
