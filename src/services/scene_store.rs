use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::clients::app_service_client::AppServiceClient;
use crate::db::dbscene::DbScene;
use crate::models::{CollabError, SceneGraph};
use crate::utils::sync::lock;

/// A persisted checkpoint: the scene graph plus, when the service wrote it,
/// the encoded CRDT snapshot the graph was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredScene {
    pub graph: SceneGraph,
    pub crdt_snapshot: Option<Vec<u8>>,
}

impl StoredScene {
    pub fn graph_only(graph: SceneGraph) -> Self {
        Self { graph, crdt_snapshot: None }
    }
}

/// Where scene graphs are loaded from and checkpointed to.
#[derive(Clone)]
pub enum SceneStore {
    Postgres(Arc<DbScene>),
    AppService(Arc<AppServiceClient>),
    Memory(Arc<MemorySceneStore>),
}

impl SceneStore {
    pub fn memory() -> Self {
        SceneStore::Memory(Arc::new(MemorySceneStore::default()))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            SceneStore::Postgres(_) => "postgres",
            SceneStore::AppService(_) => "app-service",
            SceneStore::Memory(_) => "memory",
        }
    }

    /// Checks that the backing store answers. Only the database is probed.
    pub async fn ping(&self) -> Result<(), CollabError> {
        match self {
            SceneStore::Postgres(db) => Ok(db.ping().await?),
            SceneStore::AppService(_) | SceneStore::Memory(_) => Ok(()),
        }
    }

    /// Returns `None` when nothing has been persisted for the page version.
    pub async fn load_scene_graph(&self, page_id: &str, version: i32) -> Result<Option<StoredScene>, CollabError> {
        match self {
            SceneStore::Postgres(db) => Ok(db
                .load_scene_graph(page_id, version)
                .await?
                .map(|(graph, crdt_snapshot)| StoredScene { graph, crdt_snapshot })),
            SceneStore::AppService(client) => {
                let Some(graph) = client.get_scene_graph(page_id, version).await? else {
                    return Ok(None);
                };
                let crdt_snapshot = client.get_crdt_snapshot(page_id, version).await?;
                Ok(Some(StoredScene { graph, crdt_snapshot }))
            }
            SceneStore::Memory(store) => store.load(page_id, version),
        }
    }

    /// Persists the graph together with the CRDT snapshot it was read from.
    pub async fn save_scene_graph(
        &self,
        page_id: &str,
        version: i32,
        graph: &SceneGraph,
        crdt_snapshot: &[u8],
    ) -> Result<(), CollabError> {
        match self {
            SceneStore::Postgres(db) => Ok(db.save_scene_graph(page_id, version, graph, crdt_snapshot).await?),
            SceneStore::AppService(client) => {
                client.put_scene_graph(page_id, version, graph).await?;
                client.put_crdt_snapshot(page_id, version, crdt_snapshot).await
            }
            SceneStore::Memory(store) => store.save(page_id, version, graph, crdt_snapshot).await,
        }
    }
}

/// In-process scene storage.
#[derive(Default)]
pub struct MemorySceneStore {
    scenes: Mutex<HashMap<(String, i32), StoredScene>>,
    saves: AtomicUsize,
    save_delay: Mutex<Duration>,
    fail_saves: AtomicBool,
}

impl MemorySceneStore {
    /// Stores a graph without a CRDT snapshot, like one written by another service.
    pub fn insert(&self, page_id: &str, version: i32, graph: SceneGraph) {
        self.insert_stored(page_id, version, StoredScene::graph_only(graph));
    }

    pub fn insert_stored(&self, page_id: &str, version: i32, scene: StoredScene) {
        lock(&self.scenes).insert((page_id.to_string(), version), scene);
    }

    pub fn get(&self, page_id: &str, version: i32) -> Option<SceneGraph> {
        self.get_stored(page_id, version).map(|scene| scene.graph)
    }

    pub fn get_stored(&self, page_id: &str, version: i32) -> Option<StoredScene> {
        lock(&self.scenes).get(&(page_id.to_string(), version)).cloned()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Makes every save sleep for `delay` before writing.
    pub fn set_save_delay(&self, delay: Duration) {
        *lock(&self.save_delay) = delay;
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn load(&self, page_id: &str, version: i32) -> Result<Option<StoredScene>, CollabError> {
        Ok(self.get_stored(page_id, version))
    }

    async fn save(
        &self,
        page_id: &str,
        version: i32,
        graph: &SceneGraph,
        crdt_snapshot: &[u8],
    ) -> Result<(), CollabError> {
        let delay = *lock(&self.save_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CollabError::Protocol("scene store rejected the write".to_string()));
        }
        self.insert_stored(
            page_id,
            version,
            StoredScene {
                graph: graph.clone(),
                crdt_snapshot: Some(crdt_snapshot.to_vec()),
            },
        );
        self.saves.fetch_add(1, Ordering::SeqCst);
        debug!("Stored scene graph {}:{} in memory", page_id, version);
        Ok(())
    }
}
