use std::sync::Arc;

use hubsync::queue::{HandlerRegistry, MutationAction, QueueOptions, SyncQueue};
use hubsync::repository::TaskRepository;
use hubsync::task::{TaskDraft, TaskStatus, TaskUpdate};
use hubsync::Error;
use mockito::Matcher;
use serde_json::json;

mod support;

use support::{hub_for, TestProject};

fn draft(title: &str) -> TaskDraft {
    TaskDraft {
        project_id: "web".to_string(),
        title: title.to_string(),
        ..TaskDraft::default()
    }
}

#[tokio::test]
async fn local_write_wins_when_hub_rejects_mirror() {
    let mut server = mockito::Server::new_async().await;
    let mirror = server
        .mock("POST", "/api/tasks")
        .with_status(500)
        .with_body(r#"{"error":"db down"}"#)
        .create_async()
        .await;

    let project = TestProject::new();
    let (hub, connection) = hub_for(Some(server.url()));
    let repo = TaskRepository::new(project.store(), hub, connection);

    let created = repo.create_task(draft("Ship it")).await.unwrap();
    repo.flush_mirrors().await;
    mirror.assert_async().await;

    let fetched = repo.get_task("web", &created.id).await.unwrap();
    assert_eq!(fetched, created);
    assert_eq!(fetched.id, "001-ship-it");
    assert_eq!(fetched.status, "pending");
}

#[tokio::test]
async fn retryable_mirror_failure_is_queued() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("PATCH", "/api/tasks/001-a/status")
        .with_status(503)
        .create_async()
        .await;
    server
        .mock("POST", "/api/tasks")
        .with_status(201)
        .create_async()
        .await;

    let project = TestProject::new();
    let (hub, connection) = hub_for(Some(server.url()));
    let queue = Arc::new(SyncQueue::open(
        project.queue_path(),
        connection.clone(),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    ));
    let repo = TaskRepository::new(project.store(), hub, connection).with_queue(Arc::clone(&queue));

    let task = repo.create_task(draft("A")).await.unwrap();
    repo.flush_mirrors().await;
    assert_eq!(queue.pending_count(), 0);

    repo.update_task_status(&task.id, TaskStatus::Done)
        .await
        .unwrap();
    repo.flush_mirrors().await;

    let pending = queue.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity, "tasks");
    assert_eq!(pending[0].action, MutationAction::Update);
    assert_eq!(
        pending[0].data,
        json!({"id": "001-a", "op": "status", "status": "completed"})
    );
}

#[tokio::test]
async fn write_after_reconnect_waits_behind_queued_create() {
    let mut server = mockito::Server::new_async().await;
    let create = server
        .mock("POST", "/api/tasks")
        .match_body(Matcher::PartialJson(json!({"id": "001-draft", "title": "Draft"})))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;
    let update = server
        .mock("PATCH", "/api/tasks/001-draft")
        .match_body(Matcher::PartialJson(json!({"title": "Final"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let project = TestProject::new();
    let (hub, connection) = hub_for(Some(server.url()));
    connection.set_available(false);
    let queue = Arc::new(SyncQueue::open(
        project.queue_path(),
        connection.clone(),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    ));
    let repo = TaskRepository::new(project.store(), hub, connection.clone())
        .with_queue(Arc::clone(&queue));

    let task = repo.create_task(draft("Draft")).await.unwrap();
    repo.flush_mirrors().await;
    assert_eq!(queue.pending_count(), 1);

    connection.set_available(true);
    let updated = repo
        .update_task(
            &task.id,
            TaskUpdate {
                title: Some("Final".to_string()),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();
    repo.flush_mirrors().await;

    let pending = queue.pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].action, MutationAction::Create);
    assert_eq!(pending[1].action, MutationAction::Update);
    assert_eq!(pending[1].data["title"], "Final");

    assert_eq!(queue.sync_pending().await, 2);
    assert_eq!(queue.pending_count(), 0);
    create.assert_async().await;
    update.assert_async().await;
    assert_eq!(updated.title, "Final");
    assert_eq!(repo.get_task("web", &task.id).await.unwrap().title, "Final");
}

#[tokio::test]
async fn replayed_status_and_progress_use_direct_routes() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/tasks")
        .with_status(201)
        .create_async()
        .await;
    let status = server
        .mock("PATCH", "/api/tasks/001-a/status")
        .match_body(Matcher::Json(json!({"status": "completed"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let progress = server
        .mock("POST", "/api/tasks/001-a/progress")
        .match_body(Matcher::PartialJson(json!({"phase": "build", "percent": 50})))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let plain_patch = server
        .mock("PATCH", "/api/tasks/001-a")
        .expect(0)
        .create_async()
        .await;

    let project = TestProject::new();
    let (hub, connection) = hub_for(Some(server.url()));
    connection.set_available(false);
    let queue = Arc::new(SyncQueue::open(
        project.queue_path(),
        connection.clone(),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    ));
    let repo = TaskRepository::new(project.store(), hub, connection.clone())
        .with_queue(Arc::clone(&queue));

    let task = repo.create_task(draft("A")).await.unwrap();
    repo.update_task_status(&task.id, TaskStatus::Done)
        .await
        .unwrap();
    repo.record_progress(&task.id, Some("build".to_string()), 50)
        .await
        .unwrap();
    repo.flush_mirrors().await;
    assert_eq!(queue.pending_count(), 3);

    connection.set_available(true);
    assert_eq!(queue.sync_pending().await, 3);
    status.assert_async().await;
    progress.assert_async().await;
    plain_patch.assert_async().await;
}

#[tokio::test]
async fn rejected_mirror_is_not_queued() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/tasks")
        .with_status(422)
        .with_body(r#"{"error":{"message":"bad task"}}"#)
        .create_async()
        .await;

    let project = TestProject::new();
    let (hub, connection) = hub_for(Some(server.url()));
    let queue = Arc::new(SyncQueue::open(
        project.queue_path(),
        connection.clone(),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    ));
    let repo = TaskRepository::new(project.store(), hub, connection).with_queue(Arc::clone(&queue));

    repo.create_task(draft("A")).await.unwrap();
    repo.flush_mirrors().await;
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn offline_writes_replay_when_hub_returns() {
    let mut server = mockito::Server::new_async().await;
    let create = server
        .mock("POST", "/api/tasks")
        .match_body(Matcher::PartialJson(json!({"id": "001-draft", "title": "Draft"})))
        .with_status(201)
        .create_async()
        .await;
    let update = server
        .mock("PATCH", "/api/tasks/001-draft")
        .match_body(Matcher::PartialJson(json!({"title": "Final"})))
        .with_status(200)
        .create_async()
        .await;

    let project = TestProject::new();
    let (hub, connection) = hub_for(Some(server.url()));
    connection.set_available(false);
    let queue = Arc::new(SyncQueue::open(
        project.queue_path(),
        connection.clone(),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    ));
    let repo = TaskRepository::new(project.store(), hub, connection.clone())
        .with_queue(Arc::clone(&queue));

    let task = repo.create_task(draft("Draft")).await.unwrap();
    repo.update_task(
        &task.id,
        TaskUpdate {
            title: Some("Final".to_string()),
            ..TaskUpdate::default()
        },
    )
    .await
    .unwrap();
    repo.flush_mirrors().await;
    assert_eq!(queue.pending_count(), 2);
    assert_eq!(queue.sync_pending().await, 0);

    connection.set_available(true);
    assert_eq!(queue.sync_pending().await, 2);
    assert_eq!(queue.pending_count(), 0);
    create.assert_async().await;
    update.assert_async().await;
}

#[tokio::test]
async fn execute_requires_connection() {
    let project = TestProject::new();
    let (hub, connection) = hub_for(Some("http://127.0.0.1:1".to_string()));
    connection.set_available(false);
    let repo = TaskRepository::new(project.store(), hub, connection);

    let err = repo.execute_task("001-a").await.unwrap_err();
    assert!(matches!(err, Error::HubUnavailable));
    assert_eq!(err.to_string(), "Hub not connected");

    let err = repo.cancel_task("001-a").await.unwrap_err();
    assert!(matches!(err, Error::HubUnavailable));
}

#[tokio::test]
async fn execute_goes_to_hub_only() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/tasks/001-a/execute")
        .match_header("authorization", "Bearer secret")
        .with_status(200)
        .with_body(r#"{"session_id":"sess-1"}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/api/tasks")
        .with_status(201)
        .create_async()
        .await;

    let project = TestProject::new();
    let (hub, connection) = hub_for(Some(server.url()));
    let repo = TaskRepository::new(project.store(), hub, connection);
    let task = repo.create_task(draft("A")).await.unwrap();
    repo.flush_mirrors().await;

    let response = repo.execute_task(&task.id).await.unwrap();
    mock.assert_async().await;
    assert_eq!(response.session_id.as_deref(), Some("sess-1"));

    // Execution is Hub-authoritative; the local record is untouched.
    let local = repo.get_task("web", &task.id).await.unwrap();
    assert_eq!(local.status, "pending");
}

#[tokio::test]
async fn delete_of_unseen_task_is_unknown() {
    let project = TestProject::new();
    let (hub, connection) = hub_for(None);
    let repo = TaskRepository::new(project.store(), hub, connection);

    let err = repo.delete_task("404-missing").await.unwrap_err();
    assert!(matches!(err, Error::UnknownTask(ref id) if id == "404-missing"));
}

#[tokio::test]
async fn unconfigured_hub_keeps_everything_local() {
    let project = TestProject::new();
    let (hub, connection) = hub_for(None);
    let queue = Arc::new(SyncQueue::open(
        project.queue_path(),
        connection.clone(),
        HandlerRegistry::with_defaults(),
        QueueOptions::default(),
    ));
    let repo = TaskRepository::new(project.store(), hub, connection).with_queue(Arc::clone(&queue));

    let task = repo.create_task(draft("Solo")).await.unwrap();
    repo.record_progress(&task.id, Some("build".to_string()), 140)
        .await
        .unwrap();
    repo.delete_task(&task.id).await.unwrap();
    repo.flush_mirrors().await;

    assert_eq!(queue.pending_count(), 0);
    assert!(repo.list_tasks(Some("web")).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_update_is_rejected() {
    let project = TestProject::new();
    let (hub, connection) = hub_for(None);
    let repo = TaskRepository::new(project.store(), hub, connection);
    let task = repo.create_task(draft("A")).await.unwrap();

    let err = repo
        .update_task(&task.id, TaskUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
