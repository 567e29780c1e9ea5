//! One collaborative document: the CRDT for a `(page, version)` pair, its
//! awareness state, the local connections editing it and the timers that
//! checkpoint and evict it.

use chrono::{DateTime, Utc};
use loro::{ExportMode, LoroDoc, VersionVector};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use utoipa::ToSchema;

use crate::clients::coordination::RoomSubscription;
use crate::models::lorodoc::{hydrate, loro_doc_to_scene, snapshot_matches};
use crate::models::messages::{CollabMessage, SyncMessage};
use crate::models::{BroadcastKind, CollabError, PresenceRecord, RoomBroadcast, SceneGraph};
use crate::services::scene_store::StoredScene;
use crate::utils::sync::lock;
use crate::ws::awareness::{user_color, Awareness};
use crate::ws::collabctx::CollabContext;
use crate::ws::connection::{ClientConnection, CLOSE_NORMAL};

pub const SNAPSHOT_LOCK: &str = "snapshot";

pub fn room_key(page_id: &str, version: i32) -> String {
    format!("{}:{}", page_id, version)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Created,
    Loading,
    Active,
    Idle,
    Destroyed,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub key: String,
    pub page_id: String,
    pub version: i32,
    pub phase: RoomPhase,
    pub loaded: bool,
    pub clients: usize,
    pub users: usize,
    pub awareness_states: usize,
    pub last_snapshot_at: Option<i64>,
    pub idle_for_ms: Option<u64>,
}

struct ClientRecord {
    connection: Arc<ClientConnection>,
    user_id: String,
    presence_state: Map<String, Value>,
    connected_at: DateTime<Utc>,
    // Awareness client ids written through this connection.
    awareness_ids: HashSet<u64>,
}

struct Lifecycle {
    phase: RoomPhase,
    loaded: bool,
    idle_since: Option<Instant>,
    last_snapshot_at: Option<i64>,
    last_saved_vv: Option<VersionVector>,
}

#[derive(Default)]
struct Timers {
    checkpoint: Option<JoinHandle<()>>,
    idle: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    subscription_id: Option<u64>,
}

pub struct DocRoom {
    page_id: String,
    version: i32,
    key: String,
    ctx: CollabContext,
    weak_self: Weak<DocRoom>,
    doc: LoroDoc,
    awareness: Mutex<Awareness>,
    clients: Mutex<HashMap<u64, ClientRecord>>,
    lifecycle: Mutex<Lifecycle>,
    timers: Mutex<Timers>,
    // Serializes checkpoints of this process.
    snapshot_gate: AsyncMutex<()>,
    load_once: OnceCell<()>,
    // A destroyed room with the same key whose teardown must finish first.
    predecessor: Mutex<Option<Arc<DocRoom>>>,
    torn_down: watch::Sender<bool>,
}

impl DocRoom {
    pub fn new(page_id: &str, version: i32, ctx: CollabContext) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| DocRoom {
            page_id: page_id.to_string(),
            version,
            key: room_key(page_id, version),
            ctx,
            weak_self: weak_self.clone(),
            doc: LoroDoc::new(),
            awareness: Mutex::new(Awareness::new()),
            clients: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle {
                phase: RoomPhase::Created,
                loaded: false,
                idle_since: None,
                last_snapshot_at: None,
                last_saved_vv: None,
            }),
            timers: Mutex::new(Timers::default()),
            snapshot_gate: AsyncMutex::new(()),
            load_once: OnceCell::new(),
            predecessor: Mutex::new(None),
            torn_down: watch::channel(false).0,
        })
    }

    /// Creates a room that takes over the key of a destroyed room. Loading
    /// waits for the old room's final checkpoint.
    pub fn replacing(previous: Arc<DocRoom>, ctx: CollabContext) -> Arc<Self> {
        let room = Self::new(&previous.page_id, previous.version, ctx);
        *lock(&room.predecessor) = Some(previous);
        room
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn phase(&self) -> RoomPhase {
        lock(&self.lifecycle).phase
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.lifecycle).loaded
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase() == RoomPhase::Destroyed
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn last_snapshot_at(&self) -> Option<i64> {
        lock(&self.lifecycle).last_snapshot_at
    }

    /// How long the room has had no clients, if it has none.
    pub fn idle_for(&self) -> Option<Duration> {
        lock(&self.lifecycle).idle_since.map(|since| since.elapsed())
    }

    pub fn scene_graph(&self) -> SceneGraph {
        loro_doc_to_scene(&self.doc)
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// Awareness state of one client id, if known.
    pub fn awareness_state(&self, client_id: u64) -> Option<Value> {
        lock(&self.awareness).get_state(client_id)
    }

    /// Whether this room's own listener on the cluster channel is running.
    pub fn is_subscribed(&self) -> bool {
        let subscription_id = lock(&self.timers).subscription_id;
        subscription_id.map_or(false, |id| self.ctx.coordination.is_subscription_live(id))
    }

    /// Resolves once [`destroy`](Self::destroy) or idle eviction has finished.
    pub async fn wait_torn_down(&self) {
        let mut done = self.torn_down.subscribe();
        let _ = done.wait_for(|torn_down| *torn_down).await;
    }

    pub fn stats(&self) -> RoomStats {
        let (clients, users) = {
            let clients = lock(&self.clients);
            let users: HashSet<&str> = clients.values().map(|c| c.user_id.as_str()).collect();
            (clients.len(), users.len())
        };
        let awareness_states = lock(&self.awareness).len();
        let lifecycle = lock(&self.lifecycle);
        RoomStats {
            key: self.key.clone(),
            page_id: self.page_id.clone(),
            version: self.version,
            phase: lifecycle.phase,
            loaded: lifecycle.loaded,
            clients,
            users,
            awareness_states,
            last_snapshot_at: lifecycle.last_snapshot_at,
            idle_for_ms: lifecycle
                .idle_since
                .map(|since| u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Loads persisted state and joins the cluster channel. Runs once no
    /// matter how many callers race on it.
    pub async fn load(&self) {
        self.load_once.get_or_init(|| self.load_inner()).await;
    }

    async fn load_inner(&self) {
        let predecessor = lock(&self.predecessor).take();
        if let Some(previous) = predecessor {
            debug!(room = %self.key, "waiting for the previous room to finish closing");
            previous.wait_torn_down().await;
        }
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.phase == RoomPhase::Destroyed {
                return;
            }
            lifecycle.phase = RoomPhase::Loading;
        }
        info!("Loading room {}", self.key);

        match self.ctx.store.load_scene_graph(&self.page_id, self.version).await {
            Ok(Some(stored)) => self.restore(stored),
            Ok(None) => debug!(room = %self.key, "no persisted scene graph, starting empty"),
            Err(e) => warn!("Failed to load scene graph for {}, starting empty: {}", self.key, e),
        }
        let hydrated_vv = self.doc.oplog_vv();

        let last_snapshot_at = match self.ctx.coordination.get_last_snapshot_time(&self.key).await {
            Ok(at) => at,
            Err(e) => {
                warn!("Could not read last snapshot time for {}: {}", self.key, e);
                None
            }
        };

        match self.ctx.coordination.subscribe_to_room(&self.key).await {
            Ok(RoomSubscription { id, receiver }) => {
                let handle = self.spawn_remote_listener(receiver);
                let mut timers = lock(&self.timers);
                timers.listener = Some(handle);
                timers.subscription_id = Some(id);
            }
            Err(e) => warn!("Room {} running without cluster channel: {}", self.key, e),
        }
        self.publish(BroadcastKind::StateRequest, hydrated_vv.encode());

        let checkpoint = self.spawn_checkpoint_timer();
        lock(&self.timers).checkpoint = Some(checkpoint);

        let destroyed_meanwhile = {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.loaded = true;
            lifecycle.last_saved_vv = Some(hydrated_vv);
            lifecycle.last_snapshot_at = last_snapshot_at;
            match lifecycle.phase {
                RoomPhase::Destroyed => true,
                _ if lock(&self.clients).is_empty() => {
                    lifecycle.phase = RoomPhase::Idle;
                    lifecycle.idle_since = Some(Instant::now());
                    false
                }
                _ => {
                    lifecycle.phase = RoomPhase::Active;
                    false
                }
            }
        };
        if destroyed_meanwhile {
            let mut timers = lock(&self.timers);
            if let Some(id) = timers.subscription_id.take() {
                self.ctx.coordination.unsubscribe_from_room(&self.key, id);
            }
            for handle in [timers.checkpoint.take(), timers.listener.take()].into_iter().flatten() {
                handle.abort();
            }
            return;
        }
        info!("Room {} loaded", self.key);
    }

    // Prefers the stored CRDT snapshot so every instance shares the operation
    // history of the checkpoint. The graph is authoritative when the two
    // disagree, e.g. after the page was edited outside the service.
    fn restore(&self, stored: StoredScene) {
        if let Some(snapshot) = stored.crdt_snapshot.as_deref() {
            match snapshot_matches(snapshot, &stored.graph) {
                Ok(true) => match self.doc.import(snapshot) {
                    Ok(_) => {
                        debug!(room = %self.key, nodes = stored.graph.nodes.len(), "restored from CRDT snapshot");
                        return;
                    }
                    Err(e) => warn!("Failed to import CRDT snapshot for {}: {}", self.key, e),
                },
                Ok(false) => warn!("CRDT snapshot of {} does not match its scene graph, rebuilding", self.key),
                Err(e) => warn!("Unreadable CRDT snapshot for {}: {}", self.key, e),
            }
        }
        if let Err(e) = hydrate(&self.doc, &self.key, &stored.graph) {
            error!("Failed to hydrate room {}: {}", self.key, e);
        } else {
            debug!(room = %self.key, nodes = stored.graph.nodes.len(), "hydrated from scene graph");
        }
    }

    /// Registers a connection and sends it the initial sync state.
    pub fn add_client(
        &self,
        connection: Arc<ClientConnection>,
        user_id: &str,
        user_info: Map<String, Value>,
    ) -> Result<(), CollabError> {
        let conn_id = connection.id();
        let mut fields = user_info;
        fields.insert("userId".to_string(), Value::from(user_id));
        fields
            .entry("color")
            .or_insert_with(|| Value::from(user_color(user_id)));

        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.phase == RoomPhase::Destroyed {
                return Err(CollabError::RoomDestroyed(self.key.clone()));
            }
            lifecycle.phase = RoomPhase::Active;
            lifecycle.idle_since = None;
            lock(&self.clients).insert(
                conn_id,
                ClientRecord {
                    connection: connection.clone(),
                    user_id: user_id.to_string(),
                    presence_state: fields.clone(),
                    connected_at: Utc::now(),
                    awareness_ids: HashSet::from([conn_id]),
                },
            );
        }
        if let Some(idle) = lock(&self.timers).idle.take() {
            idle.abort();
        }

        let (seeded, snapshot) = {
            let mut awareness = lock(&self.awareness);
            let seeded = awareness.set_local_fields(conn_id, fields.clone());
            (seeded, awareness.encode_all())
        };

        connection.open();
        connection.send(CollabMessage::sync_step1(self.state_vector()).encode());
        connection.send(CollabMessage::Awareness(snapshot).encode());

        self.broadcast_local(Some(conn_id), CollabMessage::Awareness(seeded.clone()).encode());
        self.publish(BroadcastKind::Awareness, seeded);
        self.write_presence(user_id, fields);

        info!(room = %self.key, conn = conn_id, user = %user_id, "client joined");
        Ok(())
    }

    /// Deregisters a connection. Never blocks; cluster cleanup runs in the background.
    pub fn remove_client(&self, conn_id: u64) {
        let (record, user_still_here, remaining) = {
            let mut clients = lock(&self.clients);
            let Some(record) = clients.remove(&conn_id) else {
                return;
            };
            let user_still_here = clients.values().any(|c| c.user_id == record.user_id);
            (record, user_still_here, clients.len())
        };
        record.connection.mark_closed();

        let ids: Vec<u64> = record.awareness_ids.iter().copied().collect();
        let removal = lock(&self.awareness).remove_local(&ids);
        if let Some(removal) = removal {
            self.broadcast_local(None, CollabMessage::Awareness(removal.clone()).encode());
            self.publish(BroadcastKind::Awareness, removal);
        }

        if !user_still_here {
            let coordination = self.ctx.coordination.clone();
            let key = self.key.clone();
            let user_id = record.user_id.clone();
            tokio::spawn(async move {
                if let Err(e) = coordination.remove_presence(&key, &user_id).await {
                    warn!("Failed to remove presence of {} in {}: {}", user_id, key, e);
                }
            });
        }

        let connected_for = Utc::now().signed_duration_since(record.connected_at);
        info!(
            room = %self.key,
            conn = conn_id,
            user = %record.user_id,
            secs = connected_for.num_seconds(),
            "client left"
        );

        if remaining == 0 {
            self.enter_idle();
        }
    }

    fn enter_idle(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.phase == RoomPhase::Destroyed || !lock(&self.clients).is_empty() {
                return;
            }
            lifecycle.phase = RoomPhase::Idle;
            lifecycle.idle_since = Some(Instant::now());
        }
        self.arm_idle_timer();
    }

    // Activity on an idle room restarts its grace period.
    fn note_activity(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.phase != RoomPhase::Idle {
                return;
            }
            lifecycle.idle_since = Some(Instant::now());
        }
        trace!(room = %self.key, "activity while idle, restarting grace period");
        self.arm_idle_timer();
    }

    fn arm_idle_timer(&self) {
        let weak = self.weak_self.clone();
        let grace = self.ctx.settings.idle_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(room) = weak.upgrade() else {
                return;
            };
            // Activity since arming means a newer timer owns the grace period.
            if room.idle_for().map_or(false, |idle| idle < grace) {
                return;
            }
            // Detach first so destroy() does not abort this task.
            drop(lock(&room.timers).idle.take());
            if room.mark_destroyed(true) {
                info!("Room {} idle for {:?}, destroying", room.key, grace);
                room.teardown().await;
            }
        });
        if let Some(previous) = lock(&self.timers).idle.replace(handle) {
            previous.abort();
        }
    }

    /// Dispatches one frame received from a local connection.
    pub fn handle_message(&self, connection: &ClientConnection, raw: &[u8]) {
        let message = match CollabMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(room = %self.key, conn = connection.id(), "dropping malformed message: {}", e);
                return;
            }
        };

        match message {
            CollabMessage::Sync(SyncMessage::Step1(state_vector)) => {
                match self.diff_for_state_vector(&state_vector) {
                    Ok(diff) => {
                        connection.send(CollabMessage::sync_step2(diff).encode());
                    }
                    Err(e) => warn!(room = %self.key, conn = connection.id(), "bad sync step 1: {}", e),
                }
            }
            CollabMessage::Sync(SyncMessage::Step2(diff)) => {
                self.apply_local_diff(connection.id(), &diff);
                connection.send(CollabMessage::sync_step1(self.state_vector()).encode());
            }
            CollabMessage::Sync(SyncMessage::Update(diff)) => {
                self.apply_local_diff(connection.id(), &diff);
            }
            CollabMessage::Awareness(update) => self.apply_local_awareness(connection.id(), update),
            CollabMessage::Auth(_) => trace!(room = %self.key, "ignoring auth message"),
        }
    }

    fn diff_for_state_vector(&self, encoded: &[u8]) -> Result<Vec<u8>, CollabError> {
        let vv = VersionVector::decode(encoded)?;
        self.export_since(&vv)
    }

    fn export_since(&self, vv: &VersionVector) -> Result<Vec<u8>, CollabError> {
        self.doc
            .export(ExportMode::updates(vv))
            .map_err(|e| CollabError::Crdt(e.to_string()))
    }

    // Imports a diff and returns the operations it added, if any.
    fn import_diff(&self, diff: &[u8], origin: &str) -> Result<Option<Vec<u8>>, CollabError> {
        let before = self.doc.oplog_vv();
        self.doc.import_with(diff, origin)?;
        if self.doc.oplog_vv() == before {
            return Ok(None);
        }
        self.export_since(&before).map(Some)
    }

    fn apply_local_diff(&self, conn_id: u64, diff: &[u8]) {
        match self.import_diff(diff, self.ctx.instance_id()) {
            Ok(Some(delta)) => {
                trace!(room = %self.key, conn = conn_id, bytes = delta.len(), "document advanced");
                self.broadcast_local(Some(conn_id), CollabMessage::sync_update(delta.clone()).encode());
                self.publish(BroadcastKind::Update, delta);
            }
            Ok(None) => {}
            Err(e) => warn!(room = %self.key, conn = conn_id, "failed to apply update: {}", e),
        }
    }

    fn apply_local_awareness(&self, conn_id: u64, update: Vec<u8>) {
        let changes = match lock(&self.awareness).apply_update(&update) {
            Ok(changes) => changes,
            Err(e) => {
                warn!(room = %self.key, conn = conn_id, "dropping malformed awareness update: {}", e);
                return;
            }
        };
        if changes.is_empty() {
            return;
        }
        if let Some(record) = lock(&self.clients).get_mut(&conn_id) {
            record.awareness_ids.extend(changes.added.iter().chain(changes.updated.iter()));
            for id in &changes.removed {
                record.awareness_ids.remove(id);
            }
        }
        self.broadcast_local(Some(conn_id), CollabMessage::Awareness(update.clone()).encode());
        self.publish(BroadcastKind::Awareness, update);
    }

    /// Applies an envelope received from the cluster channel. Never republishes.
    pub fn apply_remote(&self, envelope: RoomBroadcast) {
        if envelope.instance_id == self.ctx.instance_id() {
            trace!(room = %self.key, "ignoring own broadcast");
            return;
        }
        if self.is_destroyed() {
            return;
        }

        match envelope.kind {
            BroadcastKind::Update => {
                let origin = format!("remote:{}", envelope.instance_id);
                match self.import_diff(&envelope.payload, &origin) {
                    Ok(Some(delta)) => {
                        self.note_activity();
                        self.broadcast_local(None, CollabMessage::sync_update(delta).encode());
                    }
                    Ok(None) => {}
                    Err(e) => warn!(room = %self.key, from = %envelope.instance_id, "failed to apply remote update: {}", e),
                }
            }
            BroadcastKind::Awareness => {
                let applied = lock(&self.awareness).apply_update(&envelope.payload);
                match applied {
                    Ok(changes) if !changes.is_empty() => {
                        self.broadcast_local(None, CollabMessage::Awareness(envelope.payload).encode());
                    }
                    Ok(_) => {}
                    Err(e) => warn!(room = %self.key, from = %envelope.instance_id, "bad remote awareness: {}", e),
                }
            }
            BroadcastKind::StateRequest => {
                let theirs = match VersionVector::decode(&envelope.payload) {
                    Ok(vv) => vv,
                    Err(e) => {
                        warn!(room = %self.key, from = %envelope.instance_id, "bad state request: {}", e);
                        return;
                    }
                };
                if !has_ops_missing_from(&self.doc.oplog_vv(), &theirs) {
                    return;
                }
                match self.export_since(&theirs) {
                    Ok(diff) => {
                        debug!(room = %self.key, to = %envelope.instance_id, "answering state request");
                        self.publish(BroadcastKind::Update, diff);
                    }
                    Err(e) => warn!(room = %self.key, "failed to answer state request: {}", e),
                }
            }
        }
    }

    /// Persists the document if it changed since the last checkpoint.
    ///
    /// Returns `Ok(false)` when nothing was written: not loaded, unchanged, or
    /// another instance holds the snapshot lock.
    pub async fn take_snapshot(&self) -> Result<bool, CollabError> {
        let _gate = self.snapshot_gate.lock().await;
        let current = self.doc.oplog_vv();
        {
            let lifecycle = lock(&self.lifecycle);
            if !lifecycle.loaded || lifecycle.last_saved_vv.as_ref() == Some(&current) {
                return Ok(false);
            }
        }

        let coordination = &self.ctx.coordination;
        let token = match coordination
            .acquire_lock(&self.key, SNAPSHOT_LOCK, self.ctx.settings.snapshot_lock_ttl)
            .await
        {
            Ok(Some(token)) => Some(token),
            Ok(None) => {
                debug!(room = %self.key, "snapshot lock held elsewhere, skipping");
                return Ok(false);
            }
            Err(e) => {
                warn!("Snapshot lock unavailable for {}, saving without it: {}", self.key, e);
                None
            }
        };

        let saved = match self.freeze() {
            Ok((snapshot, saved_vv, graph)) => self
                .ctx
                .store
                .save_scene_graph(&self.page_id, self.version, &graph, &snapshot)
                .await
                .map(|()| (saved_vv, graph)),
            Err(e) => Err(e),
        };

        if let Some(token) = token {
            match coordination.release_lock(&self.key, SNAPSHOT_LOCK, &token).await {
                Ok(true) => {}
                Ok(false) => warn!("Snapshot lock for {} expired before release", self.key),
                Err(e) => warn!("Failed to release snapshot lock for {}: {}", self.key, e),
            }
        }

        let (saved_vv, graph) = match saved {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!("Failed to save scene graph for {}: {}", self.key, e);
                return Err(e);
            }
        };

        let now = Utc::now().timestamp_millis();
        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.last_saved_vv = Some(saved_vv);
            lifecycle.last_snapshot_at = Some(now);
        }
        if let Err(e) = coordination.set_last_snapshot_time(&self.key, now).await {
            warn!("Failed to record snapshot time for {}: {}", self.key, e);
        }
        info!("Saved scene graph for {} ({} nodes)", self.key, graph.nodes.len());
        Ok(true)
    }

    // Snapshot bytes plus the version and graph read back from those bytes,
    // so all three describe the same state while edits keep arriving.
    fn freeze(&self) -> Result<(Vec<u8>, VersionVector, SceneGraph), CollabError> {
        let snapshot = self
            .doc
            .export(ExportMode::Snapshot)
            .map_err(|e| CollabError::Crdt(e.to_string()))?;
        let frozen = LoroDoc::from_snapshot(&snapshot)?;
        let graph = loro_doc_to_scene(&frozen);
        Ok((snapshot, frozen.oplog_vv(), graph))
    }

    /// Stops the room: final checkpoint, leave the cluster channel, close every
    /// connection. Calling it again is a no-op.
    pub async fn destroy(&self) {
        if self.mark_destroyed(false) {
            self.teardown().await;
        }
    }

    /// Destroys the room only if it still has no clients. Returns whether it did.
    pub async fn destroy_if_idle(&self) -> bool {
        if !self.mark_destroyed(true) {
            return false;
        }
        self.teardown().await;
        true
    }

    /// Alias of [`destroy`](Self::destroy) used on shutdown.
    pub async fn compact(&self) {
        self.destroy().await;
    }

    // Flips the room to destroyed. With `only_if_idle` the flip happens only
    // when the room still has no clients.
    fn mark_destroyed(&self, only_if_idle: bool) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.phase == RoomPhase::Destroyed {
            return false;
        }
        if only_if_idle && (lifecycle.phase != RoomPhase::Idle || !lock(&self.clients).is_empty()) {
            return false;
        }
        lifecycle.phase = RoomPhase::Destroyed;
        true
    }

    async fn teardown(&self) {
        let (listener, subscription_id) = {
            // Wait out a running checkpoint so it is never cancelled while
            // holding the snapshot lock.
            let _gate = self.snapshot_gate.lock().await;
            let mut timers = lock(&self.timers);
            for handle in [timers.checkpoint.take(), timers.idle.take()].into_iter().flatten() {
                handle.abort();
            }
            (timers.listener.take(), timers.subscription_id.take())
        };

        if let Err(e) = self.take_snapshot().await {
            error!("Final snapshot of {} failed: {}", self.key, e);
        }

        // Only this room's subscription: a replacement may already listen on the key.
        if let Some(id) = subscription_id {
            self.ctx.coordination.unsubscribe_from_room(&self.key, id);
        }
        if let Some(listener) = listener {
            listener.abort();
        }

        let clients: Vec<ClientRecord> = lock(&self.clients).drain().map(|(_, record)| record).collect();
        for record in &clients {
            record.connection.close(CLOSE_NORMAL, "room closed");
        }
        *lock(&self.awareness) = Awareness::new();

        // Users who left earlier already removed their own presence.
        let users: HashSet<&str> = clients.iter().map(|r| r.user_id.as_str()).collect();
        for user_id in users {
            if let Err(e) = self.ctx.coordination.remove_presence(&self.key, user_id).await {
                warn!("Failed to clear presence of {} in {}: {}", user_id, self.key, e);
            }
        }

        self.torn_down.send_replace(true);
        info!("Room {} destroyed ({} connections closed)", self.key, clients.len());
    }

    fn broadcast_local(&self, except: Option<u64>, frame: Vec<u8>) {
        let clients = lock(&self.clients);
        for (id, record) in clients.iter() {
            if Some(*id) != except {
                record.connection.send(frame.clone());
            }
        }
    }

    fn publish(&self, kind: BroadcastKind, payload: Vec<u8>) {
        let coordination = self.ctx.coordination.clone();
        let key = self.key.clone();
        let envelope = RoomBroadcast::new(coordination.instance_id(), kind, payload);
        tokio::spawn(async move {
            if let Err(e) = coordination.publish_to_room(&key, &envelope).await {
                warn!(room = %key, kind = ?envelope.kind, "publish failed: {}", e);
            }
        });
    }

    fn write_presence(&self, user_id: &str, state: Map<String, Value>) {
        let coordination = self.ctx.coordination.clone();
        let key = self.key.clone();
        let record = PresenceRecord::new(user_id, Value::Object(state), coordination.instance_id());
        tokio::spawn(async move {
            if let Err(e) = coordination.set_presence(&key, &record).await {
                warn!("Failed to write presence of {} in {}: {}", record.user_id, key, e);
            }
        });
    }

    fn spawn_remote_listener(&self, mut rx: mpsc::UnboundedReceiver<RoomBroadcast>) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(room) = weak.upgrade() else {
                    break;
                };
                room.apply_remote(envelope);
            }
        })
    }

    fn spawn_checkpoint_timer(&self) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        let period = self.ctx.settings.checkpoint_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(room) = weak.upgrade() else {
                    break;
                };
                if room.is_destroyed() {
                    break;
                }
                room.heartbeat();
                if let Err(e) = room.take_snapshot().await {
                    debug!(room = %room.key, "checkpoint failed, retrying next tick: {}", e);
                }
            }
        })
    }

    /// Refreshes presence of local users and drops remote awareness entries
    /// that stopped updating.
    pub fn heartbeat(&self) {
        let (users, local_ids) = {
            let clients = lock(&self.clients);
            let mut users: HashMap<String, Map<String, Value>> = HashMap::new();
            let mut local_ids = HashSet::new();
            for record in clients.values() {
                users
                    .entry(record.user_id.clone())
                    .or_insert_with(|| record.presence_state.clone());
                local_ids.extend(record.awareness_ids.iter().copied());
            }
            (users, local_ids)
        };
        for (user_id, state) in users {
            self.write_presence(&user_id, state);
        }

        let removal = {
            let mut awareness = lock(&self.awareness);
            let stale: Vec<u64> = awareness
                .stale_clients(self.ctx.settings.presence_max_age)
                .into_iter()
                .filter(|id| !local_ids.contains(id))
                .collect();
            if stale.is_empty() {
                None
            } else {
                debug!(room = %self.key, count = stale.len(), "dropping stale awareness entries");
                awareness.remove_local(&stale)
            }
        };
        if let Some(removal) = removal {
            self.broadcast_local(None, CollabMessage::Awareness(removal).encode());
        }
    }
}

impl Drop for DocRoom {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        for handle in [timers.checkpoint.take(), timers.idle.take(), timers.listener.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        if let Some(id) = timers.subscription_id.take() {
            self.ctx.coordination.unsubscribe_from_room(&self.key, id);
        }
    }
}

/// Whether `ours` holds operations that `theirs` has not seen.
pub fn has_ops_missing_from(ours: &VersionVector, theirs: &VersionVector) -> bool {
    ours.iter()
        .any(|(peer, counter)| theirs.get(peer).map_or(*counter > 0, |seen| seen < counter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollabSettings;
    use crate::models::messages::MESSAGE_SYNC;
    use crate::services::scene_store::SceneStore;
    use crate::ws::awareness::decode_entries;
    use crate::ws::connection::{ConnectionState, Outbound};
    use serde_json::json;

    fn context() -> CollabContext {
        CollabContext::in_memory("instance-test", CollabSettings::default())
    }

    fn connect(room: &DocRoom, user: &str) -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<Outbound>) {
        let (conn, rx) = ClientConnection::new();
        let conn = Arc::new(conn);
        room.add_client(conn.clone(), user, Map::new()).unwrap();
        (conn, rx)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<CollabMessage> {
        let mut out = Vec::new();
        while let Ok(Outbound::Binary(bytes)) = rx.try_recv() {
            out.push(CollabMessage::decode(&bytes).unwrap());
        }
        out
    }

    fn local_edit(doc: &LoroDoc, key: &str, value: i64) -> Vec<u8> {
        let before = doc.oplog_vv();
        doc.get_map("canvas").insert(key, value).unwrap();
        doc.commit();
        doc.export(ExportMode::updates(&before)).unwrap()
    }

    #[tokio::test]
    async fn new_client_gets_state_vector_and_awareness() {
        let room = DocRoom::new("page", 1, context());
        room.load().await;
        let (conn, mut rx) = connect(&room, "u1");
        assert_eq!(conn.state(), ConnectionState::Open);

        let received = frames(&mut rx);
        assert!(matches!(&received[0], CollabMessage::Sync(SyncMessage::Step1(sv)) if VersionVector::decode(sv).is_ok()));
        let CollabMessage::Awareness(update) = &received[1] else {
            panic!("expected awareness snapshot");
        };
        let entries = decode_entries(update).unwrap();
        assert_eq!(entries[0].0, conn.id());
        assert_eq!(entries[0].2["userId"], json!("u1"));
        assert_eq!(entries[0].2["color"], json!(user_color("u1")));
        assert_eq!(room.phase(), RoomPhase::Active);
    }

    #[tokio::test]
    async fn updates_fan_out_to_other_clients() {
        let room = DocRoom::new("page", 1, context());
        room.load().await;
        let (a, mut rx_a) = connect(&room, "u1");
        let (_b, mut rx_b) = connect(&room, "u2");
        frames(&mut rx_a);
        frames(&mut rx_b);

        let editor = LoroDoc::new();
        let diff = local_edit(&editor, "width", 800);
        room.handle_message(&a, &CollabMessage::sync_update(diff).encode());

        assert!(frames(&mut rx_a).is_empty());
        let to_b = frames(&mut rx_b);
        assert!(matches!(&to_b[0], CollabMessage::Sync(SyncMessage::Update(_))));
        assert_eq!(room.scene_graph().canvas.get("width"), Some(&json!(800)));

        // Replaying the same diff changes nothing and is not rebroadcast.
        let again = editor.export(ExportMode::all_updates()).unwrap();
        room.handle_message(&a, &CollabMessage::sync_step2(again).encode());
        assert!(frames(&mut rx_b).is_empty());
        assert!(matches!(&frames(&mut rx_a)[0], CollabMessage::Sync(SyncMessage::Step1(_))));
    }

    #[tokio::test]
    async fn step1_is_answered_with_missing_operations() {
        let room = DocRoom::new("page", 1, context());
        room.load().await;
        let (a, mut rx_a) = connect(&room, "u1");
        let editor = LoroDoc::new();
        room.handle_message(&a, &CollabMessage::sync_update(local_edit(&editor, "h", 5)).encode());
        frames(&mut rx_a);

        let fresh = LoroDoc::new();
        room.handle_message(&a, &CollabMessage::sync_step1(fresh.oplog_vv().encode()).encode());
        let CollabMessage::Sync(SyncMessage::Step2(diff)) = &frames(&mut rx_a)[0] else {
            panic!("expected step 2");
        };
        fresh.import(diff).unwrap();
        assert_eq!(loro_doc_to_scene(&fresh).canvas.get("h"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn malformed_frames_keep_the_connection() {
        let room = DocRoom::new("page", 1, context());
        room.load().await;
        let (a, mut rx_a) = connect(&room, "u1");
        frames(&mut rx_a);

        room.handle_message(&a, &[9, 9, 9]);
        room.handle_message(&a, &[MESSAGE_SYNC, 1, 3, 1, 2, 3]);
        room.handle_message(&a, &CollabMessage::Auth(vec![1]).encode());
        assert_eq!(a.state(), ConnectionState::Open);
        assert_eq!(room.client_count(), 1);
    }

    #[tokio::test]
    async fn removing_last_client_enters_idle() {
        let room = DocRoom::new("page", 1, context());
        room.load().await;
        let (a, _rx_a) = connect(&room, "u1");
        let (b, mut rx_b) = connect(&room, "u2");
        frames(&mut rx_b);

        room.remove_client(a.id());
        let CollabMessage::Awareness(removal) = &frames(&mut rx_b)[0] else {
            panic!("expected awareness removal");
        };
        assert_eq!(decode_entries(removal).unwrap()[0].2, Value::Null);
        assert_eq!(room.phase(), RoomPhase::Active);

        room.remove_client(b.id());
        assert_eq!(room.phase(), RoomPhase::Idle);
        assert!(room.idle_for().is_some());
        // Removing an unknown connection is harmless.
        room.remove_client(b.id());
    }

    #[tokio::test]
    async fn snapshot_skips_unchanged_documents() {
        let ctx = context();
        let SceneStore::Memory(store) = ctx.store.clone() else { unreachable!() };
        let room = DocRoom::new("page", 1, ctx);
        assert!(!room.take_snapshot().await.unwrap());

        room.load().await;
        assert!(!room.take_snapshot().await.unwrap());

        let (a, _rx) = connect(&room, "u1");
        room.handle_message(&a, &CollabMessage::sync_update(local_edit(&LoroDoc::new(), "w", 1)).encode());
        assert!(room.take_snapshot().await.unwrap());
        assert!(!room.take_snapshot().await.unwrap());
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.get("page", 1).unwrap().canvas.get("w"), Some(&json!(1)));
        assert!(room.last_snapshot_at().is_some());
    }

    #[tokio::test]
    async fn destroy_closes_clients_and_rejects_new_ones() {
        let room = DocRoom::new("page", 1, context());
        room.load().await;
        let (a, mut rx_a) = connect(&room, "u1");
        frames(&mut rx_a);

        room.destroy().await;
        assert!(room.is_destroyed());
        assert_eq!(
            rx_a.try_recv().unwrap(),
            Outbound::Close { code: CLOSE_NORMAL, reason: "room closed".to_string() }
        );
        assert_eq!(a.state(), ConnectionState::Closing);
        let (late, _) = ClientConnection::new();
        assert!(matches!(
            room.add_client(Arc::new(late), "u2", Map::new()),
            Err(CollabError::RoomDestroyed(_))
        ));
        room.destroy().await;
    }

    #[tokio::test]
    async fn stored_crdt_snapshot_keeps_operation_history() {
        let ctx = context();
        let SceneStore::Memory(store) = ctx.store.clone() else { unreachable!() };
        let origin = LoroDoc::new();
        local_edit(&origin, "width", 640);
        let graph = loro_doc_to_scene(&origin);
        store.insert_stored(
            "page",
            1,
            StoredScene {
                graph,
                crdt_snapshot: Some(origin.export(ExportMode::Snapshot).unwrap()),
            },
        );

        let room = DocRoom::new("page", 1, ctx);
        room.load().await;
        assert_eq!(VersionVector::decode(&room.state_vector()).unwrap(), origin.oplog_vv());
        assert_eq!(room.scene_graph().canvas.get("width"), Some(&json!(640)));
        // Loading alone is not a change worth a checkpoint.
        assert!(!room.take_snapshot().await.unwrap());
    }

    #[tokio::test]
    async fn outdated_snapshot_yields_to_the_graph() {
        let ctx = context();
        let SceneStore::Memory(store) = ctx.store.clone() else { unreachable!() };
        let origin = LoroDoc::new();
        local_edit(&origin, "width", 640);
        let mut graph = loro_doc_to_scene(&origin);
        graph.canvas.insert("width".to_string(), json!(1024));
        store.insert_stored(
            "page",
            1,
            StoredScene {
                graph: graph.clone(),
                crdt_snapshot: Some(origin.export(ExportMode::Snapshot).unwrap()),
            },
        );

        let room = DocRoom::new("page", 1, ctx);
        room.load().await;
        assert_eq!(room.scene_graph(), graph);
        assert_ne!(VersionVector::decode(&room.state_vector()).unwrap(), origin.oplog_vv());
    }

    #[tokio::test]
    async fn checkpoint_stores_a_matching_snapshot() {
        let ctx = context();
        let SceneStore::Memory(store) = ctx.store.clone() else { unreachable!() };
        let room = DocRoom::new("page", 1, ctx);
        room.load().await;
        let (a, _rx) = connect(&room, "u1");
        room.handle_message(&a, &CollabMessage::sync_update(local_edit(&LoroDoc::new(), "w", 3)).encode());
        assert!(room.take_snapshot().await.unwrap());

        let stored = store.get_stored("page", 1).unwrap();
        let snapshot = stored.crdt_snapshot.unwrap();
        assert!(snapshot_matches(&snapshot, &stored.graph).unwrap());
        let reloaded = LoroDoc::from_snapshot(&snapshot).unwrap();
        assert_eq!(VersionVector::decode(&room.state_vector()).unwrap(), reloaded.oplog_vv());
    }

    #[tokio::test]
    async fn remote_activity_restarts_idle_grace() {
        let settings = CollabSettings {
            idle_grace: Duration::from_millis(150),
            ..CollabSettings::default()
        };
        let room = DocRoom::new("page", 1, CollabContext::in_memory("instance-test", settings));
        room.load().await;
        let (a, _rx) = connect(&room, "u1");
        room.remove_client(a.id());
        assert_eq!(room.phase(), RoomPhase::Idle);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let diff = local_edit(&LoroDoc::new(), "w", 1);
        room.apply_remote(RoomBroadcast::new("instance-other", BroadcastKind::Update, diff));
        assert!(room.idle_for().unwrap() < Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!room.is_destroyed(), "grace must run from the last activity");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(room.is_destroyed());
    }

    #[tokio::test]
    async fn teardown_clears_presence_of_connected_users_only() {
        let ctx = context();
        let coordination = ctx.coordination.clone();
        let room = DocRoom::new("page", 1, ctx);
        room.load().await;
        let (_a, _rx) = connect(&room, "u1");
        // Written by another room of this instance sharing the key.
        let other = PresenceRecord::new("u2", json!({}), "instance-test");
        coordination.set_presence(room.key(), &other).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        room.destroy().await;
        let left: Vec<String> = coordination
            .get_presences(room.key())
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(left, vec!["u2".to_string()]);
    }

    #[test]
    fn missing_operations_are_detected() {
        let a = LoroDoc::new();
        let b = LoroDoc::new();
        local_edit(&a, "x", 1);
        assert!(has_ops_missing_from(&a.oplog_vv(), &b.oplog_vv()));
        assert!(!has_ops_missing_from(&b.oplog_vv(), &a.oplog_vv()));
        b.import(&a.export(ExportMode::all_updates()).unwrap()).unwrap();
        assert!(!has_ops_missing_from(&a.oplog_vv(), &b.oplog_vv()));
    }
}
