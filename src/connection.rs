//! Hub connectivity as seen by the queue and the repository.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::hub::{HubApiClient, HubClient};

/// Supplies Hub availability and a ready-to-use client.
pub trait ConnectionManager: Send + Sync {
    fn is_available(&self) -> bool;

    fn client(&self) -> Arc<dyn HubClient>;
}

/// Connection backed by a single [`HubApiClient`] with a toggleable
/// availability flag. A reconnect handler flips the flag and then drains the
/// queue.
pub struct StaticConnection {
    client: Arc<HubApiClient>,
    available: AtomicBool,
}

impl StaticConnection {
    /// Available iff the client has both a URL and a token.
    pub fn new(client: Arc<HubApiClient>) -> Self {
        let available = client.is_configured();
        Self {
            client,
            available: AtomicBool::new(available),
        }
    }

    pub fn api(&self) -> Arc<HubApiClient> {
        Arc::clone(&self.client)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl ConnectionManager for StaticConnection {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && self.client.is_configured()
    }

    fn client(&self) -> Arc<dyn HubClient> {
        self.client.clone()
    }
}
