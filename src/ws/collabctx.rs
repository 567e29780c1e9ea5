use std::sync::Arc;

use crate::clients::coordination::{CoordinationClient, MemoryCoordination};
use crate::config::CollabSettings;
use crate::services::scene_store::SceneStore;

/// Services shared by the registry and every room of one process.
#[derive(Clone)]
pub struct CollabContext {
    pub coordination: Arc<CoordinationClient>,
    pub store: SceneStore,
    pub settings: CollabSettings,
}

impl CollabContext {
    pub fn new(coordination: Arc<CoordinationClient>, store: SceneStore, settings: CollabSettings) -> Self {
        Self {
            coordination,
            store,
            settings,
        }
    }

    /// Single process context backed by in-memory coordination and storage.
    pub fn in_memory(instance_id: &str, settings: CollabSettings) -> Self {
        let hub = Arc::new(MemoryCoordination::new());
        Self::new(
            Arc::new(CoordinationClient::in_memory(hub, instance_id)),
            SceneStore::memory(),
            settings,
        )
    }

    pub fn instance_id(&self) -> &str {
        self.coordination.instance_id()
    }
}
