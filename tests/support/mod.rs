#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hubsync::config::ProjectConfig;
use hubsync::connection::{ConnectionManager, StaticConnection};
use hubsync::hub::{HubApiClient, HubClient, HubFailure, HubResponse};
use hubsync::store::LocalTaskStore;
use serde_json::Value;
use tempfile::TempDir;

type Responder = dyn Fn(&str, &str, &Value) -> HubResponse<Value> + Send + Sync;

/// Records every call as `"<op> <collection>"` and answers with `respond`.
pub struct MockHub {
    calls: Mutex<Vec<(String, Value)>>,
    respond: Box<Responder>,
}

impl MockHub {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&str, &str, &Value) -> HubResponse<Value> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    pub fn always_ok() -> Arc<Self> {
        Self::new(|_, _, _| ok())
    }

    pub fn always_fail() -> Arc<Self> {
        Self::new(|_, _, _| HubResponse::Err(HubFailure::http(503, "unavailable")))
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, collection: &str, data: &Value) -> HubResponse<Value> {
        let key = format!("{op} {collection}");
        self.calls.lock().unwrap().push((key, data.clone()));
        (self.respond)(op, collection, data)
    }
}

pub fn ok() -> HubResponse<Value> {
    HubResponse::Ok {
        data: None,
        status: 200,
    }
}

#[async_trait]
impl HubClient for MockHub {
    async fn create_record(
        &self,
        collection: &str,
        data: &Value,
    ) -> hubsync::Result<HubResponse<Value>> {
        Ok(self.record("create", collection, data))
    }

    async fn update_record(
        &self,
        collection: &str,
        id: &str,
        data: &Value,
    ) -> hubsync::Result<HubResponse<Value>> {
        let mut data = data.clone();
        data["id"] = Value::from(id);
        Ok(self.record("update", collection, &data))
    }

    async fn delete_record(
        &self,
        collection: &str,
        id: &str,
    ) -> hubsync::Result<HubResponse<Value>> {
        Ok(self.record("delete", collection, &serde_json::json!({ "id": id })))
    }

    async fn put_document(&self, path: &str, data: &Value) -> hubsync::Result<HubResponse<Value>> {
        Ok(self.record("put", path, data))
    }

    async fn post_document(&self, path: &str, data: &Value) -> hubsync::Result<HubResponse<Value>> {
        Ok(self.record("post", path, data))
    }

    async fn patch_document(
        &self,
        path: &str,
        data: &Value,
    ) -> hubsync::Result<HubResponse<Value>> {
        Ok(self.record("patch", path, data))
    }
}

pub struct MockConnection {
    available: AtomicBool,
    client: Arc<MockHub>,
}

impl MockConnection {
    pub fn online(client: Arc<MockHub>) -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            client,
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl ConnectionManager for MockConnection {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn client(&self) -> Arc<dyn HubClient> {
        self.client.clone()
    }
}

/// A temporary project directory registered as `web`.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn projects(&self) -> Vec<ProjectConfig> {
        vec![ProjectConfig {
            id: "web".to_string(),
            path: self.dir.path().join("web"),
        }]
    }

    pub fn store(&self) -> Arc<LocalTaskStore> {
        Arc::new(LocalTaskStore::new(self.projects()))
    }

    pub fn queue_path(&self) -> std::path::PathBuf {
        self.dir.path().join("data").join("sync-queue.json")
    }
}

/// Hub client and connection pointed at `url` with a fixed token.
pub fn hub_for(url: Option<String>) -> (Arc<HubApiClient>, Arc<StaticConnection>) {
    let hub = Arc::new(
        HubApiClient::with_credentials(url, Some("secret".to_string()), Duration::from_secs(5))
            .expect("client"),
    );
    let connection = Arc::new(StaticConnection::new(Arc::clone(&hub)));
    (hub, connection)
}
