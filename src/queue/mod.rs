//! Durable mutation queue
//!
//! Writes destined for the Hub are recorded as [`PendingMutation`]s in a JSON
//! array file under the user's data directory. The file is rewritten
//! atomically after every structural change, so a mutation is durable once
//! [`SyncQueue::queue_mutation`] returns.
//!
//! [`SyncQueue::sync_pending`] replays the queue strictly in order. A
//! mutation leaves the queue only when its handler succeeds, when the queue
//! is cleared, or (if `max_attempts` is configured) when it is moved to the
//! dead-letter file.

mod handlers;

pub use handlers::{
    CaptureHandler, CollectionHandler, HandlerRegistry, MutationAction, MutationHandler,
    SettingsHandler, TaskHandler, TASK_OP_KEY,
};

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::connection::ConnectionManager;
use crate::hub::HubClient;
use crate::lock::{self, DEFAULT_LOCK_TIMEOUT_MS};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMutation {
    pub id: String,
    pub entity: String,
    pub action: MutationAction,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingMutation {
    pub fn new(entity: impl Into<String>, action: MutationAction, data: Value) -> Self {
        Self {
            id: Ulid::new().to_string(),
            entity: entity.into(),
            action,
            data,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Failed attempts after which a mutation is dead-lettered. `None`
    /// retries forever.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub available: bool,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest: Option<DateTime<Utc>>,
}

/// Resets the in-flight flag when a sync pass ends, including by panic.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Every call that changes the queue ([`SyncQueue::queue_mutation`],
/// [`SyncQueue::clear_pending`], the end of [`SyncQueue::sync_pending`])
/// rewrites the file synchronously under an fs2 lock and may block the
/// calling thread for up to [`DEFAULT_LOCK_TIMEOUT_MS`] while another process
/// holds it.
pub struct SyncQueue {
    path: PathBuf,
    connection: Arc<dyn ConnectionManager>,
    registry: HandlerRegistry,
    options: QueueOptions,
    pending: Mutex<Vec<PendingMutation>>,
    syncing: AtomicBool,
}

impl SyncQueue {
    /// Load the queue stored at `path`. A missing or corrupt file yields an
    /// empty queue; opening never fails.
    pub fn open(
        path: impl Into<PathBuf>,
        connection: Arc<dyn ConnectionManager>,
        registry: HandlerRegistry,
        options: QueueOptions,
    ) -> Self {
        let path = path.into();
        let pending = load_queue(&path);
        debug!(path = %path.display(), pending = pending.len(), "opened sync queue");
        Self {
            path,
            connection,
            registry,
            options,
            pending: Mutex::new(pending),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling JSONL file receiving mutations that exhausted `max_attempts`.
    pub fn dead_letter_path(&self) -> PathBuf {
        self.path.with_extension("dead-letter.jsonl")
    }

    /// Append a mutation and persist the queue before returning. Blocks on
    /// the queue file lock.
    pub fn queue_mutation(
        &self,
        entity: &str,
        action: MutationAction,
        data: Value,
    ) -> PendingMutation {
        let mutation = PendingMutation::new(entity, action, data);
        let mut pending = self.pending.lock();
        pending.push(mutation.clone());
        self.persist(&pending);
        debug!(id = %mutation.id, entity, action = %action, "queued mutation");
        mutation
    }

    /// Replay pending mutations in order and return how many succeeded.
    ///
    /// Returns 0 without doing anything when the queue is empty, the Hub is
    /// unavailable, or another pass is already running.
    pub async fn sync_pending(&self) -> usize {
        if self.syncing.swap(true, Ordering::SeqCst) {
            debug!("sync already in flight");
            return 0;
        }
        let _in_flight = InFlight(&self.syncing);

        let snapshot = self.pending.lock().clone();
        if snapshot.is_empty() || !self.connection.is_available() {
            return 0;
        }

        let client = self.connection.client();
        let mut succeeded = HashSet::new();
        let mut failures = HashMap::new();
        for mutation in &snapshot {
            match self.dispatch(&client, mutation).await {
                Ok(()) => {
                    succeeded.insert(mutation.id.clone());
                }
                Err(reason) => {
                    warn!(
                        id = %mutation.id,
                        entity = %mutation.entity,
                        action = %mutation.action,
                        reason = %reason,
                        "mutation sync failed; keeping it queued"
                    );
                    failures.insert(mutation.id.clone(), reason);
                }
            }
        }

        let (remaining, dead) = {
            let mut pending = self.pending.lock();
            // Mutations queued during the pass stay behind the failures.
            pending.retain(|mutation| !succeeded.contains(&mutation.id));
            for mutation in pending.iter_mut() {
                if let Some(reason) = failures.get(&mutation.id) {
                    mutation.attempts += 1;
                    mutation.last_error = Some(reason.clone());
                }
            }

            let mut dead = Vec::new();
            if let Some(max) = self.options.max_attempts {
                let (keep, exhausted): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
                    .into_iter()
                    .partition(|mutation| mutation.attempts < max);
                *pending = keep;
                dead = exhausted;
            }

            self.persist(&pending);
            (pending.len(), dead)
        };

        for mutation in &dead {
            self.dead_letter(mutation);
        }

        info!(
            succeeded = succeeded.len(),
            failed = failures.len(),
            dead_lettered = dead.len(),
            remaining,
            "sync pass complete"
        );
        succeeded.len()
    }

    /// Whether a mutation of `entity` whose payload `id` is `id` is still
    /// waiting, including one currently being replayed.
    pub fn has_pending_for(&self, entity: &str, id: &str) -> bool {
        self.pending.lock().iter().any(|mutation| {
            mutation.entity == entity
                && mutation.data.get("id").and_then(Value::as_str) == Some(id)
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of the queue in order.
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.pending.lock().clone()
    }

    /// Drop every pending mutation and persist the empty queue.
    pub fn clear_pending(&self) {
        let mut pending = self.pending.lock();
        let dropped = pending.len();
        pending.clear();
        self.persist(&pending);
        info!(dropped, "cleared sync queue");
    }

    pub fn should_sync(&self) -> bool {
        !self.pending.lock().is_empty() && self.connection.is_available()
    }

    pub fn status(&self) -> QueueStatus {
        let pending = self.pending.lock();
        QueueStatus {
            pending: pending.len(),
            available: self.connection.is_available(),
            path: self.path.clone(),
            oldest: pending.first().map(|mutation| mutation.created_at),
        }
    }

    /// Run one handler on its own task so a panic is contained to this
    /// mutation.
    async fn dispatch(
        &self,
        client: &Arc<dyn HubClient>,
        mutation: &PendingMutation,
    ) -> std::result::Result<(), String> {
        let handler = self
            .registry
            .get(&mutation.entity)
            .ok_or_else(|| format!("no handler for entity '{}'", mutation.entity))?;

        let client = Arc::clone(client);
        let action = mutation.action;
        let data = mutation.data.clone();
        let outcome =
            tokio::spawn(async move { handler.apply(client.as_ref(), action, &data).await }).await;

        match outcome {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("handler reported failure".to_string()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(join_err) => Err(format!("handler aborted: {join_err}")),
        }
    }

    fn persist(&self, pending: &[PendingMutation]) {
        let result = serde_json::to_vec_pretty(pending)
            .map_err(crate::Error::from)
            .and_then(|json| lock::write_atomic_locked(&self.path, &json, DEFAULT_LOCK_TIMEOUT_MS));
        if let Err(err) = result {
            error!(path = %self.path.display(), error = %err, "failed to persist sync queue");
        }
    }

    fn dead_letter(&self, mutation: &PendingMutation) {
        let path = self.dead_letter_path();
        warn!(
            id = %mutation.id,
            entity = %mutation.entity,
            attempts = mutation.attempts,
            path = %path.display(),
            "mutation exhausted retries; moved to dead letter"
        );
        let result = serde_json::to_string(mutation)
            .map_err(crate::Error::from)
            .and_then(|line| lock::append_line_locked(&path, &line, DEFAULT_LOCK_TIMEOUT_MS));
        if let Err(err) = result {
            error!(path = %path.display(), error = %err, "failed to write dead letter");
        }
    }
}

fn load_queue(path: &Path) -> Vec<PendingMutation> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            error!(path = %path.display(), error = %err, "unreadable sync queue; starting empty");
            return Vec::new();
        }
    };
    if content.trim().is_empty() {
        return Vec::new();
    }

    match serde_json::from_str(&content) {
        Ok(pending) => pending,
        Err(err) => {
            let backup = path.with_extension(format!("corrupt.{}", Utc::now().timestamp()));
            error!(
                path = %path.display(),
                backup = %backup.display(),
                error = %err,
                "corrupt sync queue; starting empty"
            );
            if let Err(err) = std::fs::rename(path, &backup) {
                warn!(error = %err, "could not back up corrupt sync queue");
            }
            Vec::new()
        }
    }
}
