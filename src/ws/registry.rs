//! Owns every room of the process and drives client connections into them.

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::models::CollabError;
use crate::utils::scope_guard::ScopeGuard;
use crate::utils::sync::lock;
use crate::ws::collabctx::CollabContext;
use crate::ws::connection::{ClientConnection, InboundEvent, CLOSE_TRY_AGAIN_LATER};
use crate::ws::room::{room_key, DocRoom, RoomPhase, RoomStats};

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub instance_id: String,
    pub rooms: usize,
    pub active_rooms: usize,
    pub idle_rooms: usize,
    pub connections: usize,
    pub room_stats: Vec<RoomStats>,
}

pub struct RoomRegistry {
    ctx: CollabContext,
    rooms: AsyncMutex<HashMap<String, Arc<DocRoom>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl RoomRegistry {
    pub fn new(ctx: CollabContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            rooms: AsyncMutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &CollabContext {
        &self.ctx
    }

    /// Returns the live room for the key, creating and loading it if needed.
    pub async fn get_or_create(&self, page_id: &str, version: i32) -> Result<Arc<DocRoom>, CollabError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CollabError::RoomDestroyed(room_key(page_id, version)));
        }
        let key = room_key(page_id, version);
        let room = {
            let mut rooms = self.rooms.lock().await;
            match rooms.get(&key) {
                Some(room) if !room.is_destroyed() => room.clone(),
                Some(closing) => {
                    debug!(room = %key, "replacing destroyed room");
                    let room = DocRoom::replacing(closing.clone(), self.ctx.clone());
                    rooms.insert(key, room.clone());
                    room
                }
                None => {
                    debug!(room = %key, "creating room");
                    let room = DocRoom::new(page_id, version, self.ctx.clone());
                    rooms.insert(key, room.clone());
                    room
                }
            }
        };
        // Loading happens outside the registry lock; concurrent callers share it.
        // A replacement first waits for its predecessor's final checkpoint.
        room.load().await;
        Ok(room)
    }

    /// The live room for the key, if one is loaded in this process.
    pub async fn get(&self, page_id: &str, version: i32) -> Option<Arc<DocRoom>> {
        let rooms = self.rooms.lock().await;
        rooms
            .get(&room_key(page_id, version))
            .filter(|room| !room.is_destroyed() && room.is_loaded())
            .cloned()
    }

    /// Serves one connection until its event stream ends.
    pub async fn handle_connection<S>(
        &self,
        connection: Arc<ClientConnection>,
        page_id: &str,
        version: i32,
        user_id: &str,
        user_info: Map<String, Value>,
        mut events: S,
    ) where
        S: Stream<Item = InboundEvent> + Unpin,
    {
        let room = match self.get_or_create(page_id, version).await {
            Ok(room) => room,
            Err(e) => {
                warn!("Rejecting connection to {}:{}: {}", page_id, version, e);
                connection.close(CLOSE_TRY_AGAIN_LATER, "room unavailable");
                return;
            }
        };
        if room.is_destroyed() {
            connection.close(CLOSE_TRY_AGAIN_LATER, "room unavailable");
            return;
        }
        if let Err(e) = room.add_client(connection.clone(), user_id, user_info) {
            warn!("Rejecting connection to {}: {}", room.key(), e);
            connection.close(CLOSE_TRY_AGAIN_LATER, "room unavailable");
            return;
        }

        let _cleanup = {
            let room = room.clone();
            let conn_id = connection.id();
            ScopeGuard::new(move || room.remove_client(conn_id))
        };

        while let Some(event) = events.next().await {
            if room.is_destroyed() {
                break;
            }
            match event {
                InboundEvent::Message(bytes) => room.handle_message(&connection, &bytes),
                InboundEvent::Close => break,
                InboundEvent::Error(e) => {
                    debug!(room = %room.key(), conn = connection.id(), "transport error: {}", e);
                    break;
                }
            }
        }
    }

    /// Starts the periodic sweep. Calling it again replaces the running sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.ctx.settings.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.sweep().await;
            }
        });
        if let Some(previous) = lock(&self.sweeper).replace(handle) {
            previous.abort();
        }
    }

    /// Drops destroyed rooms, destroys rooms idle past the grace period and
    /// clears stale presence of live ones. Returns how many rooms were removed.
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<(String, Arc<DocRoom>)> = {
            let rooms = self.rooms.lock().await;
            rooms.iter().map(|(k, r)| (k.clone(), r.clone())).collect()
        };

        let grace = self.ctx.settings.idle_grace;
        let mut evict = Vec::new();
        for (key, room) in snapshot {
            if room.is_destroyed() {
                evict.push((key, room));
                continue;
            }
            if room.idle_for().map_or(false, |idle| idle >= grace) && room.destroy_if_idle().await {
                info!("Swept idle room {}", key);
                evict.push((key, room));
                continue;
            }
            match self
                .ctx
                .coordination
                .cleanup_presences(&key, self.ctx.settings.presence_max_age)
                .await
            {
                Ok(0) => {}
                Ok(n) => debug!(room = %key, removed = n, "cleaned stale presence"),
                Err(e) => warn!("Presence cleanup failed for {}: {}", key, e),
            }
        }

        let mut rooms = self.rooms.lock().await;
        let mut removed = 0;
        for (key, room) in evict {
            // The key may already point at a newer room.
            if rooms.get(&key).map_or(false, |current| Arc::ptr_eq(current, &room)) {
                rooms.remove(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Sweep removed {} rooms, {} remain", removed, rooms.len());
        }
        removed
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms: Vec<Arc<DocRoom>> = self.rooms.lock().await.values().cloned().collect();
        let room_stats: Vec<RoomStats> = rooms.iter().map(|room| room.stats()).collect();
        RegistryStats {
            instance_id: self.ctx.instance_id().to_string(),
            rooms: room_stats.len(),
            active_rooms: room_stats.iter().filter(|s| s.phase == RoomPhase::Active).count(),
            idle_rooms: room_stats.iter().filter(|s| s.phase == RoomPhase::Idle).count(),
            connections: room_stats.iter().map(|s| s.clients).sum(),
            room_stats,
        }
    }

    /// Checkpoints and closes every room, then releases the coordination client.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
        let rooms: Vec<Arc<DocRoom>> = {
            let mut rooms = self.rooms.lock().await;
            rooms.drain().map(|(_, room)| room).collect()
        };
        info!("Shutting down {} rooms", rooms.len());
        for room in &rooms {
            room.compact().await;
        }
        // No room of this process is left to own presence for these keys.
        for room in &rooms {
            match self.ctx.coordination.remove_instance_presences(room.key()).await {
                Ok(0) => {}
                Ok(n) => debug!(room = %room.key(), removed = n, "cleared leftover presence"),
                Err(e) => warn!("Failed to clear presence for {}: {}", room.key(), e),
            }
        }
        self.ctx.coordination.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollabSettings;
    use crate::ws::connection::{ConnectionState, Outbound};
    use futures_util::stream;
    use std::time::Duration;

    fn registry(idle_grace: Duration) -> Arc<RoomRegistry> {
        let settings = CollabSettings {
            idle_grace,
            ..CollabSettings::default()
        };
        RoomRegistry::new(CollabContext::in_memory("instance-r", settings))
    }

    #[tokio::test]
    async fn one_room_per_key() {
        let registry = registry(Duration::from_secs(300));
        let (a, b) = tokio::join!(registry.get_or_create("p", 1), registry.get_or_create("p", 1));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_loaded());

        let other = registry.get_or_create("p", 2).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.stats().await.rooms, 2);
    }

    #[tokio::test]
    async fn destroyed_rooms_are_replaced() {
        let registry = registry(Duration::from_secs(300));
        let first = registry.get_or_create("p", 1).await.unwrap();
        first.destroy().await;
        let second = registry.get_or_create("p", 1).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_destroyed());
        // The sweep must not evict the replacement.
        assert_eq!(registry.sweep().await, 0);
        assert!(registry.get("p", 1).await.is_some());
    }

    #[tokio::test]
    async fn connection_is_removed_when_stream_ends() {
        let registry = registry(Duration::from_secs(300));
        let (conn, mut rx) = ClientConnection::new();
        let conn = Arc::new(conn);
        let events = stream::iter(vec![InboundEvent::Message(vec![42]), InboundEvent::Close]);
        registry
            .handle_connection(conn.clone(), "p", 1, "u1", Map::new(), events)
            .await;

        assert!(matches!(rx.try_recv(), Ok(Outbound::Binary(_))));
        assert_eq!(conn.state(), ConnectionState::Closed);
        let room = registry.get("p", 1).await.unwrap();
        assert_eq!(room.client_count(), 0);
        assert_eq!(room.phase(), RoomPhase::Idle);
    }

    #[tokio::test]
    async fn sweep_evicts_rooms_idle_past_grace() {
        let registry = registry(Duration::from_millis(0));
        let room = registry.get_or_create("p", 1).await.unwrap();
        assert_eq!(registry.sweep().await, 1);
        assert!(room.is_destroyed());
        assert!(registry.get("p", 1).await.is_none());
        assert!(!room.is_subscribed());
        assert!(!registry.context().coordination.is_subscribed(room.key()));
    }

    #[tokio::test]
    async fn shutdown_closes_rooms_and_refuses_new_ones() {
        let registry = registry(Duration::from_secs(300));
        let room = registry.get_or_create("p", 1).await.unwrap();
        let coordination = registry.context().coordination.clone();
        let stray = crate::models::PresenceRecord::new("gone", serde_json::json!({}), "instance-r");
        coordination.set_presence(room.key(), &stray).await.unwrap();

        registry.shutdown().await;
        assert!(room.is_destroyed());
        assert!(coordination.get_presences(room.key()).await.unwrap().is_empty());
        assert!(registry.get_or_create("p", 1).await.is_err());

        let (conn, mut rx) = ClientConnection::new();
        registry
            .handle_connection(Arc::new(conn), "p", 1, "u1", Map::new(), stream::empty::<InboundEvent>())
            .await;
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Close { code: CLOSE_TRY_AGAIN_LATER, .. })
        ));
    }
}
