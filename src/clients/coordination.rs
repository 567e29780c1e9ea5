//! Shared coordination service used to keep instances of the service in step.
//!
//! Presence, room broadcast channels, distributed locks, checkpoint timestamps
//! and connection counters all live here. Production runs against Redis; the
//! memory backend stands in for a single instance and lets tests run several
//! simulated instances against one shared hub.

use futures_util::StreamExt;
use moka::sync::Cache;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{CollabError, PresenceRecord, RoomBroadcast};
use crate::utils::sync::lock;

pub const PRESENCE_TTL_SECS: i64 = 24 * 60 * 60;
pub const CONNECTION_WINDOW_SECS: i64 = 60;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub fn presence_key(room_key: &str) -> String {
    format!("collab:{}:presence", room_key)
}

pub fn broadcast_channel(room_key: &str) -> String {
    format!("collab:{}:broadcast", room_key)
}

pub fn lock_key(room_key: &str, lock_name: &str) -> String {
    format!("collab:{}:lock:{}", room_key, lock_name)
}

pub fn last_snapshot_key(room_key: &str) -> String {
    format!("collab:{}:last_snapshot", room_key)
}

pub fn connection_key(room_key: &str, source_id: &str) -> String {
    format!("collab:{}:conn:{}", room_key, source_id)
}

/// Proof of lock ownership handed out by [`CoordinationClient::acquire_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        LockToken(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A live subscription to a room channel. The id is what
/// [`CoordinationClient::unsubscribe_from_room`] takes, so a room only ever
/// cancels its own listener even when a newer room shares the key.
pub struct RoomSubscription {
    pub id: u64,
    pub receiver: mpsc::UnboundedReceiver<RoomBroadcast>,
}

struct SubscriptionEntry {
    room_key: String,
    handle: JoinHandle<()>,
}

enum Backend {
    Redis(RedisBackend),
    Memory(Arc<MemoryCoordination>),
}

struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
}

pub struct CoordinationClient {
    instance_id: String,
    backend: Backend,
    subscriptions: Mutex<HashMap<u64, SubscriptionEntry>>,
    next_subscription: AtomicU64,
}

impl CoordinationClient {
    /// Connect to Redis at `url`.
    pub async fn connect_redis(url: &str, instance_id: &str) -> Result<Self, CollabError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("Coordination client connected to Redis as instance {}", instance_id);
        Ok(Self {
            instance_id: instance_id.to_string(),
            backend: Backend::Redis(RedisBackend { client, conn }),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Use an in-process hub. Clients sharing one hub behave like instances
    /// sharing one Redis.
    pub fn in_memory(hub: Arc<MemoryCoordination>, instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            backend: Backend::Memory(hub),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Redis(_) => "redis",
            Backend::Memory(_) => "memory",
        }
    }

    // Presence

    pub async fn set_presence(&self, room_key: &str, record: &PresenceRecord) -> Result<(), CollabError> {
        let key = presence_key(room_key);
        let json = serde_json::to_string(record)?;
        match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("HSET").arg(&key).arg(&record.user_id).arg(&json).ignore()
                    .cmd("EXPIRE").arg(&key).arg(PRESENCE_TTL_SECS).ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
            Backend::Memory(m) => m.hset(&key, &record.user_id, json),
        }
    }

    pub async fn get_presences(&self, room_key: &str) -> Result<Vec<PresenceRecord>, CollabError> {
        let key = presence_key(room_key);
        let raw: HashMap<String, String> = match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?
            }
            Backend::Memory(m) => m.hgetall(&key)?,
        };
        let mut records: Vec<PresenceRecord> = raw
            .into_iter()
            .filter_map(|(user_id, json)| match serde_json::from_str(&json) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Ignoring unreadable presence for user {} in {}: {}", user_id, room_key, e);
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(records)
    }

    pub async fn remove_presence(&self, room_key: &str, user_id: &str) -> Result<(), CollabError> {
        self.remove_presence_fields(room_key, &[user_id.to_string()]).await
    }

    /// Removes presence entries older than `max_age`. Returns how many were removed.
    pub async fn cleanup_presences(&self, room_key: &str, max_age: Duration) -> Result<usize, CollabError> {
        let now = chrono::Utc::now().timestamp_millis();
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let stale: Vec<String> = self
            .get_presences(room_key)
            .await?
            .into_iter()
            .filter(|p| p.is_older_than(max_age_ms, now))
            .map(|p| p.user_id)
            .collect();
        self.remove_presence_fields(room_key, &stale).await?;
        if !stale.is_empty() {
            debug!(room = %room_key, removed = stale.len(), "removed stale presence");
        }
        Ok(stale.len())
    }

    /// Removes every presence entry this instance wrote for the room.
    pub async fn remove_instance_presences(&self, room_key: &str) -> Result<usize, CollabError> {
        let own: Vec<String> = self
            .get_presences(room_key)
            .await?
            .into_iter()
            .filter(|p| p.origin_instance_id == self.instance_id)
            .map(|p| p.user_id)
            .collect();
        self.remove_presence_fields(room_key, &own).await?;
        Ok(own.len())
    }

    async fn remove_presence_fields(&self, room_key: &str, user_ids: &[String]) -> Result<(), CollabError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let key = presence_key(room_key);
        match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: i64 = redis::cmd("HDEL").arg(&key).arg(user_ids).query_async(&mut conn).await?;
                Ok(())
            }
            Backend::Memory(m) => m.hdel(&key, user_ids),
        }
    }

    // Broadcast

    pub async fn publish_to_room(&self, room_key: &str, message: &RoomBroadcast) -> Result<(), CollabError> {
        let channel = broadcast_channel(room_key);
        let payload = message.to_bytes()?;
        match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: i64 = redis::cmd("PUBLISH").arg(&channel).arg(payload).query_async(&mut conn).await?;
                Ok(())
            }
            Backend::Memory(m) => m.publish(&channel, payload),
        }
    }

    /// Subscribes to a room channel. Envelopes arrive on the returned receiver
    /// until [`unsubscribe_from_room`](Self::unsubscribe_from_room) is called
    /// with the subscription id.
    pub async fn subscribe_to_room(&self, room_key: &str) -> Result<RoomSubscription, CollabError> {
        let channel = broadcast_channel(room_key);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = match &self.backend {
            Backend::Redis(r) => {
                let mut pubsub = r.client.get_async_pubsub().await?;
                pubsub.subscribe(&channel).await?;
                tokio::spawn(async move {
                    let mut messages = Box::pin(pubsub.into_on_message());
                    while let Some(msg) = messages.next().await {
                        let payload: Vec<u8> = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(%channel, %e, "unreadable pubsub payload");
                                continue;
                            }
                        };
                        if !forward_envelope(&channel, &payload, &tx) {
                            break;
                        }
                    }
                    debug!(%channel, "redis subscription ended");
                })
            }
            Backend::Memory(m) => {
                let mut updates = MemorySubscriber {
                    receiver: Some(m.subscribe(&channel)?),
                    hub: m.clone(),
                    channel: channel.clone(),
                };
                tokio::spawn(async move {
                    loop {
                        match updates.recv().await {
                            Ok(payload) => {
                                if !forward_envelope(&channel, &payload, &tx) {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(%channel, skipped = n, "subscriber lagged behind");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                })
            }
        };
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscriptions).insert(
            id,
            SubscriptionEntry {
                room_key: room_key.to_string(),
                handle,
            },
        );
        Ok(RoomSubscription { id, receiver: rx })
    }

    /// Cancels one subscription. Other subscriptions to the same room stay live.
    pub fn unsubscribe_from_room(&self, room_key: &str, subscription_id: u64) {
        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.get(&subscription_id).map_or(false, |s| s.room_key == room_key) {
            if let Some(entry) = subscriptions.remove(&subscription_id) {
                entry.handle.abort();
                debug!(room = %room_key, subscription = subscription_id, "unsubscribed from room channel");
            }
        }
    }

    /// Whether any subscription of this client listens to the room.
    pub fn is_subscribed(&self, room_key: &str) -> bool {
        lock(&self.subscriptions)
            .values()
            .any(|s| s.room_key == room_key && !s.handle.is_finished())
    }

    pub fn is_subscription_live(&self, subscription_id: u64) -> bool {
        lock(&self.subscriptions)
            .get(&subscription_id)
            .map_or(false, |s| !s.handle.is_finished())
    }

    // Locks

    /// Tries to take `lock_name` for the room. `None` means another holder has it.
    pub async fn acquire_lock(
        &self,
        room_key: &str,
        lock_name: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, CollabError> {
        let key = lock_key(room_key, lock_name);
        let token = LockToken::generate();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let acquired = match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let reply: Option<String> = redis::cmd("SET")
                    .arg(&key)
                    .arg(token.as_str())
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await?;
                reply.is_some()
            }
            Backend::Memory(m) => m.set_nx(&key, token.as_str(), Some(Duration::from_millis(ttl_ms)))?,
        };
        Ok(acquired.then_some(token))
    }

    /// Releases the lock if `token` still owns it. Returns whether it was released.
    pub async fn release_lock(&self, room_key: &str, lock_name: &str, token: &LockToken) -> Result<bool, CollabError> {
        let key = lock_key(room_key, lock_name);
        match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let deleted: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
                    .key(&key)
                    .arg(token.as_str())
                    .invoke_async(&mut conn)
                    .await?;
                Ok(deleted == 1)
            }
            Backend::Memory(m) => m.del_if_eq(&key, token.as_str()),
        }
    }

    // Checkpoint time

    pub async fn set_last_snapshot_time(&self, room_key: &str, epoch_ms: i64) -> Result<(), CollabError> {
        let key = last_snapshot_key(room_key);
        match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let _: () = redis::cmd("SET").arg(&key).arg(epoch_ms).query_async(&mut conn).await?;
                Ok(())
            }
            Backend::Memory(m) => m.set(&key, epoch_ms.to_string(), None),
        }
    }

    pub async fn get_last_snapshot_time(&self, room_key: &str) -> Result<Option<i64>, CollabError> {
        let key = last_snapshot_key(room_key);
        match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let value: Option<i64> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
                Ok(value)
            }
            Backend::Memory(m) => Ok(m.get(&key)?.and_then(|v| v.parse().ok())),
        }
    }

    // Connection counters

    pub async fn increment_connection(&self, room_key: &str, source_id: &str) -> Result<i64, CollabError> {
        let key = connection_key(room_key, source_id);
        match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let (count,): (i64,) = redis::pipe()
                    .atomic()
                    .cmd("INCR").arg(&key)
                    .cmd("EXPIRE").arg(&key).arg(CONNECTION_WINDOW_SECS).ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(count)
            }
            Backend::Memory(m) => m.add_counter(&key, 1),
        }
    }

    pub async fn decrement_connection(&self, room_key: &str, source_id: &str) -> Result<i64, CollabError> {
        let key = connection_key(room_key, source_id);
        match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let count: i64 = redis::cmd("DECR").arg(&key).query_async(&mut conn).await?;
                if count <= 0 {
                    let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                }
                Ok(count.max(0))
            }
            Backend::Memory(m) => m.add_counter(&key, -1),
        }
    }

    pub async fn get_connection_count(&self, room_key: &str, source_id: &str) -> Result<i64, CollabError> {
        let key = connection_key(room_key, source_id);
        match &self.backend {
            Backend::Redis(r) => {
                let mut conn = r.conn.clone();
                let count: Option<i64> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
                Ok(count.unwrap_or(0))
            }
            Backend::Memory(m) => m.get_counter(&key),
        }
    }

    /// Drops every room subscription.
    pub fn shutdown(&self) {
        let mut subscriptions = lock(&self.subscriptions);
        for (_, entry) in subscriptions.drain() {
            entry.handle.abort();
        }
        info!("Coordination client for instance {} shut down", self.instance_id);
    }
}

impl Drop for CoordinationClient {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.subscriptions).drain() {
            entry.handle.abort();
        }
    }
}

fn forward_envelope(channel: &str, payload: &[u8], tx: &mpsc::UnboundedSender<RoomBroadcast>) -> bool {
    match RoomBroadcast::from_bytes(payload) {
        Ok(envelope) => tx.send(envelope).is_ok(),
        Err(e) => {
            warn!(%channel, %e, "dropping undecodable room broadcast");
            true
        }
    }
}

// Receiver end of a hub channel. Dropping it, also when the forwarding task
// is aborted, removes the channel once nobody listens.
struct MemorySubscriber {
    receiver: Option<broadcast::Receiver<Vec<u8>>>,
    hub: Arc<MemoryCoordination>,
    channel: String,
}

impl MemorySubscriber {
    async fn recv(&mut self) -> Result<Vec<u8>, broadcast::error::RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(broadcast::error::RecvError::Closed),
        }
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        drop(self.receiver.take());
        self.hub.prune_channel(&self.channel);
    }
}

#[derive(Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, (String, Option<Instant>)>,
}

impl MemoryState {
    fn live_string(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(self.strings.get(key), Some((_, Some(at))) if *at <= Instant::now());
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(v, _)| v)
    }
}

/// In-process stand-in for the coordination service.
pub struct MemoryCoordination {
    state: Mutex<MemoryState>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    counters: Cache<String, i64>,
    available: AtomicBool,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordination {
    const CHANNEL_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            channels: Mutex::new(HashMap::new()),
            counters: Cache::builder()
                .time_to_live(Duration::from_secs(CONNECTION_WINDOW_SECS as u64))
                .build(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CollabError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CollabError::CoordinationUnavailable("memory hub offline".to_string()))
        }
    }

    fn hset(&self, key: &str, field: &str, value: String) -> Result<(), CollabError> {
        self.check()?;
        lock(&self.state)
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CollabError> {
        self.check()?;
        Ok(lock(&self.state).hashes.get(key).cloned().unwrap_or_default())
    }

    fn hdel(&self, key: &str, fields: &[String]) -> Result<(), CollabError> {
        self.check()?;
        let mut state = lock(&self.state);
        if let Some(hash) = state.hashes.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
            if hash.is_empty() {
                state.hashes.remove(key);
            }
        }
        Ok(())
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CollabError> {
        self.check()?;
        let expires = ttl.map(|t| Instant::now() + t);
        lock(&self.state).strings.insert(key.to_string(), (value, expires));
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, CollabError> {
        self.check()?;
        let mut state = lock(&self.state);
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        let expires = ttl.map(|t| Instant::now() + t);
        state.strings.insert(key.to_string(), (value.to_string(), expires));
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Option<String>, CollabError> {
        self.check()?;
        Ok(lock(&self.state).live_string(key).cloned())
    }

    fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, CollabError> {
        self.check()?;
        let mut state = lock(&self.state);
        if state.live_string(key).map(String::as_str) == Some(expected) {
            state.strings.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn add_counter(&self, key: &str, delta: i64) -> Result<i64, CollabError> {
        self.check()?;
        let entry = self
            .counters
            .entry(key.to_string())
            .and_upsert_with(|current| current.map_or(0, |e| *e.value()).saturating_add(delta).max(0));
        let count = entry.into_value();
        if count == 0 {
            self.counters.invalidate(key);
        }
        Ok(count)
    }

    fn get_counter(&self, key: &str) -> Result<i64, CollabError> {
        self.check()?;
        Ok(self.counters.get(key).unwrap_or(0))
    }

    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CollabError> {
        self.check()?;
        let mut channels = lock(&self.channels);
        if let Some(sender) = channels.get(channel) {
            // No receivers is not an error, same as PUBLISH to an empty channel.
            if sender.send(payload).is_err() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    fn prune_channel(&self, channel: &str) {
        let mut channels = lock(&self.channels);
        if channels.get(channel).map_or(false, |sender| sender.receiver_count() == 0) {
            channels.remove(channel);
        }
    }

    /// Number of channels with a sender, listened to or not.
    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>, CollabError> {
        self.check()?;
        let mut channels = lock(&self.channels);
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(Self::CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }
}
