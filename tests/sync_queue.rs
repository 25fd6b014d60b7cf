use std::sync::Arc;

use async_trait::async_trait;
use hubsync::hub::{HubClient, HubFailure, HubResponse};
use hubsync::queue::{HandlerRegistry, MutationAction, MutationHandler, QueueOptions, SyncQueue};
use serde_json::{json, Value};
use tokio::sync::Notify;

mod support;

use support::{ok, MockConnection, MockHub, TestProject};

fn open(
    project: &TestProject,
    connection: Arc<MockConnection>,
    registry: HandlerRegistry,
    options: QueueOptions,
) -> SyncQueue {
    SyncQueue::open(project.queue_path(), connection, registry, options)
}

#[tokio::test]
async fn create_succeeds_delete_fails_leaves_only_delete() {
    let project = TestProject::new();
    let hub = MockHub::new(|op, _, _| match op {
        "create" => ok(),
        _ => HubResponse::Err(HubFailure::http(500, "boom")),
    });
    let queue = open(
        &project,
        MockConnection::online(hub),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    );

    queue.queue_mutation("tasks", MutationAction::Create, json!({"title": "A"}));
    queue.queue_mutation("tasks", MutationAction::Delete, json!({"id": "t1"}));

    assert_eq!(queue.sync_pending().await, 1);
    assert_eq!(queue.pending_count(), 1);
    let remaining = queue.pending();
    assert_eq!(remaining[0].action, MutationAction::Delete);
    assert_eq!(remaining[0].data, json!({"id": "t1"}));
    assert_eq!(remaining[0].attempts, 1);
    assert_eq!(remaining[0].last_error.as_deref(), Some("Hub request failed: boom"));
}

#[tokio::test]
async fn successful_pass_is_idempotent() {
    let project = TestProject::new();
    let queue = open(
        &project,
        MockConnection::online(MockHub::always_ok()),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    );

    queue.queue_mutation("projects", MutationAction::Create, json!({"name": "web"}));
    queue.queue_mutation("planner_events", MutationAction::Update, json!({"id": "e1"}));
    queue.queue_mutation("captures", MutationAction::Create, json!({"text": "idea"}));
    queue.queue_mutation("settings", MutationAction::Update, json!({"theme": "dark"}));
    assert_eq!(queue.pending_count(), 4);

    assert_eq!(queue.sync_pending().await, 4);
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.sync_pending().await, 0);
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn always_failing_mutation_is_never_removed() {
    let project = TestProject::new();
    let queue = open(
        &project,
        MockConnection::online(MockHub::always_fail()),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    );

    queue.queue_mutation("tasks", MutationAction::Update, json!({"id": "t1", "title": "x"}));
    for _ in 0..5 {
        assert_eq!(queue.sync_pending().await, 0);
        assert_eq!(queue.pending_count(), 1);
    }
    assert_eq!(queue.pending()[0].attempts, 5);
}

#[tokio::test]
async fn failed_mutation_keeps_its_place_ahead_of_later_ones() {
    let project = TestProject::new();
    let hub = MockHub::new(|_, _, data| {
        if data["name"] == "A" {
            HubResponse::Err(HubFailure::network("connection reset"))
        } else {
            ok()
        }
    });
    let queue = open(
        &project,
        MockConnection::online(Arc::clone(&hub)),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    );

    queue.queue_mutation("projects", MutationAction::Create, json!({"name": "A"}));
    queue.queue_mutation("projects", MutationAction::Create, json!({"name": "B"}));
    assert_eq!(queue.sync_pending().await, 1);
    assert_eq!(queue.pending()[0].data["name"], "A");

    queue.queue_mutation("projects", MutationAction::Create, json!({"name": "C"}));
    assert_eq!(queue.sync_pending().await, 1);

    let order: Vec<Value> = hub
        .calls()
        .into_iter()
        .map(|(_, data)| data["name"].clone())
        .collect();
    assert_eq!(order, vec![json!("A"), json!("B"), json!("A"), json!("C")]);
    let remaining: Vec<_> = queue.pending().into_iter().map(|m| m.data["name"].clone()).collect();
    assert_eq!(remaining, vec![json!("A")]);
}

#[tokio::test]
async fn unavailable_connection_short_circuits() {
    let project = TestProject::new();
    let hub = MockHub::always_ok();
    let connection = MockConnection::online(Arc::clone(&hub));
    connection.set_available(false);
    let queue = open(
        &project,
        Arc::clone(&connection),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    );

    queue.queue_mutation("tasks", MutationAction::Create, json!({"title": "A"}));
    assert!(!queue.should_sync());
    assert_eq!(queue.sync_pending().await, 0);
    assert!(hub.calls().is_empty());

    connection.set_available(true);
    assert!(queue.should_sync());
    assert_eq!(queue.sync_pending().await, 1);
    assert!(!queue.should_sync());
}

#[tokio::test]
async fn unknown_entity_and_missing_id_stay_queued() {
    let project = TestProject::new();
    let queue = open(
        &project,
        MockConnection::online(MockHub::always_ok()),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    );

    queue.queue_mutation("widgets", MutationAction::Create, json!({}));
    queue.queue_mutation("tasks", MutationAction::Delete, json!({"title": "no id"}));
    queue.queue_mutation("captures", MutationAction::Delete, json!({"id": "c1"}));
    queue.queue_mutation("tasks", MutationAction::Create, json!({"title": "fine"}));

    assert_eq!(queue.sync_pending().await, 1);
    let entities: Vec<_> = queue.pending().into_iter().map(|m| m.entity).collect();
    assert_eq!(entities, vec!["widgets", "tasks", "captures"]);
    assert!(queue.pending()[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("no handler"));
}

struct Exploding;

#[async_trait]
impl MutationHandler for Exploding {
    async fn apply(
        &self,
        _client: &dyn HubClient,
        _action: MutationAction,
        _data: &Value,
    ) -> hubsync::Result<bool> {
        panic!("handler bug");
    }
}

#[tokio::test]
async fn panicking_handler_does_not_abort_the_pass() {
    let project = TestProject::new();
    let mut registry = HandlerRegistry::with_defaults();
    registry.register("explode", Arc::new(Exploding));
    let queue = open(
        &project,
        MockConnection::online(MockHub::always_ok()),
        registry,
        QueueOptions::default(),
    );

    queue.queue_mutation("explode", MutationAction::Create, json!({}));
    queue.queue_mutation("tasks", MutationAction::Create, json!({"title": "after"}));

    assert_eq!(queue.sync_pending().await, 1);
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(queue.pending()[0].entity, "explode");
}

#[tokio::test]
async fn exhausted_mutations_move_to_dead_letter() {
    let project = TestProject::new();
    let queue = open(
        &project,
        MockConnection::online(MockHub::always_fail()),
        HandlerRegistry::with_defaults(),
        QueueOptions {
            max_attempts: Some(2),
        },
    );

    let doomed = queue.queue_mutation("tasks", MutationAction::Create, json!({"title": "x"}));
    queue.sync_pending().await;
    assert_eq!(queue.pending_count(), 1);
    queue.sync_pending().await;
    assert_eq!(queue.pending_count(), 0);

    let dead = std::fs::read_to_string(queue.dead_letter_path()).unwrap();
    let lines: Vec<_> = dead.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["id"], doomed.id.as_str());
    assert_eq!(record["attempts"], 2);
}

#[tokio::test]
async fn queue_state_survives_restart_after_partial_sync() {
    let project = TestProject::new();
    let hub = MockHub::new(|op, _, _| {
        if op == "delete" {
            HubResponse::Err(HubFailure::http(502, "bad gateway"))
        } else {
            ok()
        }
    });
    let connection = MockConnection::online(hub);
    let queue = open(
        &project,
        Arc::clone(&connection),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    );
    queue.queue_mutation("tasks", MutationAction::Delete, json!({"id": "t9"}));
    queue.queue_mutation("tasks", MutationAction::Create, json!({"title": "B"}));
    queue.sync_pending().await;
    drop(queue);

    let reopened = open(
        &project,
        connection,
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    );
    let pending = reopened.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, MutationAction::Delete);
    assert_eq!(pending[0].attempts, 1);
}

/// Blocks inside `apply` until released.
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl MutationHandler for Gate {
    async fn apply(
        &self,
        _client: &dyn HubClient,
        _action: MutationAction,
        _data: &Value,
    ) -> hubsync::Result<bool> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(true)
    }
}

#[tokio::test]
async fn overlapping_sync_is_rejected_and_new_mutations_are_kept() {
    let project = TestProject::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut registry = HandlerRegistry::with_defaults();
    registry.register(
        "slow",
        Arc::new(Gate {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        }),
    );
    let queue = Arc::new(open(
        &project,
        MockConnection::online(MockHub::always_ok()),
        registry,
        QueueOptions::default(),
    ));

    queue.queue_mutation("slow", MutationAction::Update, json!({}));
    let running = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move { queue.sync_pending().await }
    });

    entered.notified().await;
    assert_eq!(queue.sync_pending().await, 0);
    let late = queue.queue_mutation("tasks", MutationAction::Create, json!({"title": "late"}));

    release.notify_one();
    assert_eq!(running.await.unwrap(), 1);
    let pending = queue.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, late.id);
}

#[tokio::test]
async fn task_updates_replay_to_their_sub_routes() {
    let project = TestProject::new();
    let hub = MockHub::always_ok();
    let connection = MockConnection::online(hub.clone());
    let queue = open(
        &project,
        connection,
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    );

    queue.queue_mutation(
        "tasks",
        MutationAction::Update,
        json!({"id": "t 1", "op": "status", "status": "completed"}),
    );
    queue.queue_mutation(
        "tasks",
        MutationAction::Update,
        json!({"id": "t1", "op": "progress", "progress": {"percent": 30}}),
    );
    queue.queue_mutation(
        "tasks",
        MutationAction::Update,
        json!({"id": "t1", "title": "Renamed"}),
    );
    queue.queue_mutation(
        "tasks",
        MutationAction::Update,
        json!({"id": "t1", "op": "rename", "title": "x"}),
    );

    assert_eq!(queue.sync_pending().await, 3);
    assert_eq!(
        hub.calls(),
        vec![
            (
                "patch /api/tasks/t%201/status".to_string(),
                json!({"status": "completed"})
            ),
            ("post /api/tasks/t1/progress".to_string(), json!({"percent": 30})),
            (
                "update tasks".to_string(),
                json!({"id": "t1", "title": "Renamed"})
            ),
        ]
    );

    let left = queue.pending();
    assert_eq!(left.len(), 1);
    assert!(left[0].last_error.as_deref().unwrap().contains("unknown task op"));
}
