//! Task repository
//!
//! One task API over two stores. Reads and writes go to the local store,
//! which answers the caller; each successful write is then mirrored to the
//! Hub on a detached task. Execute and cancel are Hub-only and fail fast when
//! the Hub is not connected.
//!
//! With a [`SyncQueue`] attached, mirrors that fail for a retryable reason
//! are queued as `tasks` mutations so they are replayed with the rest of the
//! durable queue instead of being dropped. While the queue still holds a
//! write for a task, later writes for that task are queued behind it rather
//! than sent directly, so the Hub sees them in the order they were made.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::hub::{ExecuteResponse, HubApiClient, HubFailure, HubResponse};
use crate::queue::{MutationAction, SyncQueue, TASK_OP_KEY};
use crate::status;
use crate::store::LocalTaskStore;
use crate::task::{HubTask, Progress, TaskDraft, TaskStatus, TaskUpdate};

/// A write to replay on the Hub after the local store accepted it.
#[derive(Debug, Clone)]
enum Mirror {
    Create(HubTask),
    Update { id: String, updates: TaskUpdate },
    Status { id: String, status: String },
    Progress { id: String, progress: Progress },
    Delete { id: String },
}

impl Mirror {
    fn task_id(&self) -> &str {
        match self {
            Mirror::Create(task) => &task.id,
            Mirror::Update { id, .. }
            | Mirror::Status { id, .. }
            | Mirror::Progress { id, .. }
            | Mirror::Delete { id } => id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Mirror::Create(_) => "create",
            Mirror::Update { .. } => "update",
            Mirror::Status { .. } => "status",
            Mirror::Progress { .. } => "progress",
            Mirror::Delete { .. } => "delete",
        }
    }

    async fn send(&self, hub: &HubApiClient) -> Result<Option<HubFailure>> {
        Ok(match self {
            Mirror::Create(task) => failure_of(hub.create_task(task).await?),
            Mirror::Update { id, updates } => failure_of(hub.update_task(id, updates).await?),
            Mirror::Status { id, status } => failure_of(hub.update_task_status(id, status).await?),
            Mirror::Progress { id, progress } => failure_of(hub.push_progress(id, progress).await?),
            Mirror::Delete { id } => failure_of(hub.delete_task(id).await?),
        })
    }

    /// The same intent as a durable `tasks` mutation. Status and progress
    /// carry an op tag so the replay hits the same sub-route as [`Mirror::send`].
    fn to_mutation(&self) -> Result<(MutationAction, Value)> {
        let with_id = |id: &str, mut fields: Map<String, Value>| {
            fields.insert("id".to_string(), Value::from(id));
            Value::Object(fields)
        };
        let tagged = |op: &str, key: &str, value: Value| {
            let mut fields = Map::new();
            fields.insert(TASK_OP_KEY.to_string(), Value::from(op));
            fields.insert(key.to_string(), value);
            fields
        };
        Ok(match self {
            Mirror::Create(task) => (MutationAction::Create, serde_json::to_value(task)?),
            Mirror::Update { id, updates } => {
                let fields = match serde_json::to_value(updates)? {
                    Value::Object(fields) => fields,
                    _ => Map::new(),
                };
                (MutationAction::Update, with_id(id, fields))
            }
            Mirror::Status { id, status } => {
                let fields = tagged("status", "status", Value::from(status.as_str()));
                (MutationAction::Update, with_id(id, fields))
            }
            Mirror::Progress { id, progress } => {
                let fields = tagged("progress", "progress", serde_json::to_value(progress)?);
                (MutationAction::Update, with_id(id, fields))
            }
            Mirror::Delete { id } => (MutationAction::Delete, with_id(id, Map::new())),
        })
    }
}

const TASKS: &str = "tasks";

fn failure_of<T>(response: HubResponse<T>) -> Option<HubFailure> {
    match response {
        HubResponse::Ok { .. } => None,
        HubResponse::Err(failure) => Some(failure),
    }
}

pub struct TaskRepository {
    store: Arc<LocalTaskStore>,
    hub: Arc<HubApiClient>,
    connection: Arc<dyn ConnectionManager>,
    queue: Option<Arc<SyncQueue>>,
    mirrors: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRepository {
    pub fn new(
        store: Arc<LocalTaskStore>,
        hub: Arc<HubApiClient>,
        connection: Arc<dyn ConnectionManager>,
    ) -> Self {
        Self {
            store,
            hub,
            connection,
            queue: None,
            mirrors: Mutex::new(Vec::new()),
        }
    }

    /// Route retryable mirror failures into `queue`.
    pub fn with_queue(mut self, queue: Arc<SyncQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn store(&self) -> &LocalTaskStore {
        &self.store
    }

    // =========================================================================
    // Local-authoritative operations
    // =========================================================================

    /// Tasks of one project, or of every registered project.
    pub async fn list_tasks(&self, project_id: Option<&str>) -> Result<Vec<HubTask>> {
        let tasks = match project_id {
            Some(project_id) => self.store.list_tasks(project_id).await?,
            None => self.store.list_all_tasks().await?,
        };
        Ok(tasks.iter().map(|task| task.to_hub()).collect())
    }

    pub async fn get_task(&self, project_id: &str, task_id: &str) -> Result<HubTask> {
        Ok(self.store.get_task(project_id, task_id).await?.to_hub())
    }

    pub async fn create_task(&self, draft: TaskDraft) -> Result<HubTask> {
        let task = self.store.create_task(draft).await?.to_hub();
        info!(task_id = %task.id, project_id = %task.project_id, "task created");
        self.spawn_mirror(Mirror::Create(task.clone()));
        Ok(task)
    }

    pub async fn update_task(&self, task_id: &str, updates: TaskUpdate) -> Result<HubTask> {
        if updates.is_empty() {
            return Err(Error::InvalidArgument("nothing to update".to_string()));
        }
        let task = self.store.update_task(task_id, &updates).await?.to_hub();
        self.spawn_mirror(Mirror::Update {
            id: task.id.clone(),
            updates,
        });
        Ok(task)
    }

    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<HubTask> {
        let task = self.store.update_task_status(task_id, status).await?.to_hub();
        info!(task_id, status = %status, "task status changed");
        self.spawn_mirror(Mirror::Status {
            id: task.id.clone(),
            status: status::map_local_to_hub(status.as_str()).to_string(),
        });
        Ok(task)
    }

    pub async fn record_progress(
        &self,
        task_id: &str,
        phase: Option<String>,
        percent: u8,
    ) -> Result<HubTask> {
        let task = self
            .store
            .record_progress(task_id, phase, percent)
            .await?
            .to_hub();
        if let Some(progress) = task.progress.clone() {
            self.spawn_mirror(Mirror::Progress {
                id: task.id.clone(),
                progress,
            });
        }
        Ok(task)
    }

    /// Log lines stay local.
    pub async fn append_log(&self, task_id: &str, line: &str) -> Result<()> {
        self.store.append_log(task_id, line).await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let project_id = self
            .store
            .project_of(task_id)
            .await
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))?;
        self.store.delete_task(&project_id, task_id).await?;
        info!(task_id, project_id = %project_id, "task deleted");
        self.spawn_mirror(Mirror::Delete {
            id: task_id.to_string(),
        });
        Ok(())
    }

    // =========================================================================
    // Hub-authoritative operations
    // =========================================================================

    pub async fn execute_task(&self, task_id: &str) -> Result<ExecuteResponse> {
        if !self.connection.is_available() {
            return Err(Error::HubUnavailable);
        }
        let response = self.hub.execute_task(task_id).await?.into_result()?;
        info!(task_id, "execution requested");
        Ok(response.unwrap_or_else(|| ExecuteResponse {
            session_id: None,
            extra: Map::new(),
        }))
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<Value> {
        if !self.connection.is_available() {
            return Err(Error::HubUnavailable);
        }
        let response = self.hub.cancel_task(task_id).await?.into_result()?;
        info!(task_id, "cancellation requested");
        Ok(response.unwrap_or(Value::Null))
    }

    // =========================================================================
    // Background mirroring
    // =========================================================================

    /// Wait for every mirror spawned so far.
    pub async fn flush_mirrors(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.mirrors.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "mirror task aborted");
            }
        }
    }

    fn spawn_mirror(&self, mirror: Mirror) {
        let hub = Arc::clone(&self.hub);
        let connection = Arc::clone(&self.connection);
        let queue = self.queue.clone();
        let handle = tokio::spawn(async move {
            run_mirror(&hub, connection.as_ref(), queue.as_deref(), mirror).await;
        });

        let mut mirrors = self.mirrors.lock();
        mirrors.retain(|handle| !handle.is_finished());
        mirrors.push(handle);
    }
}

async fn run_mirror(
    hub: &HubApiClient,
    connection: &dyn ConnectionManager,
    queue: Option<&SyncQueue>,
    mirror: Mirror,
) {
    let task_id = mirror.task_id().to_string();
    let op = mirror.label();

    if !hub.is_configured() {
        debug!(task_id = %task_id, op, "hub not configured; skipping mirror");
        return;
    }
    if queue.is_some_and(|queue| queue.has_pending_for(TASKS, &task_id)) {
        debug!(task_id = %task_id, op, "earlier writes still queued; deferring mirror");
        defer(queue, &mirror);
        return;
    }
    if !connection.is_available() {
        debug!(task_id = %task_id, op, "hub offline; deferring mirror");
        defer(queue, &mirror);
        return;
    }

    match mirror.send(hub).await {
        Ok(None) => debug!(task_id = %task_id, op, "mirrored to hub"),
        Ok(Some(failure)) => {
            warn!(
                task_id = %task_id,
                op,
                status = ?failure.status,
                error = %failure.message,
                "hub mirror failed"
            );
            if failure.is_retryable() {
                defer(queue, &mirror);
            }
        }
        Err(err) => warn!(task_id = %task_id, op, error = %err, "hub mirror failed"),
    }
}

fn defer(queue: Option<&SyncQueue>, mirror: &Mirror) {
    let Some(queue) = queue else {
        return;
    };
    match mirror.to_mutation() {
        Ok((action, data)) => {
            let queued = queue.queue_mutation(TASKS, action, data);
            info!(task_id = %mirror.task_id(), mutation_id = %queued.id, "mirror deferred to sync queue");
        }
        Err(err) => error!(task_id = %mirror.task_id(), error = %err, "could not encode mirror"),
    }
}
