//! Multi-instance session behaviour over the in-memory coordination hub.

use std::sync::Arc;
use std::time::Duration;

use loro::{ExportMode, LoroDoc, LoroMap, VersionVector};
use scene_collab::clients::coordination::{CoordinationClient, MemoryCoordination};
use scene_collab::config::CollabSettings;
use scene_collab::models::{BroadcastKind, CollabMessage, RoomBroadcast, SceneGraph, SyncMessage};
use scene_collab::services::scene_store::{MemorySceneStore, SceneStore};
use scene_collab::ws::collabctx::CollabContext;
use scene_collab::ws::connection::{ClientConnection, Outbound};
use scene_collab::ws::registry::RoomRegistry;
use scene_collab::ws::room::DocRoom;
use serde_json::{json, Map};
use tokio::sync::mpsc::UnboundedReceiver;

struct Cluster {
    hub: Arc<MemoryCoordination>,
    store: Arc<MemorySceneStore>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            hub: Arc::new(MemoryCoordination::new()),
            store: Arc::new(MemorySceneStore::default()),
        }
    }

    fn instance(&self, instance_id: &str, settings: CollabSettings) -> Arc<RoomRegistry> {
        let coordination = Arc::new(CoordinationClient::in_memory(self.hub.clone(), instance_id));
        let ctx = CollabContext::new(coordination, SceneStore::Memory(self.store.clone()), settings);
        RoomRegistry::new(ctx)
    }
}

/// A simulated editor: a local document plus its connection to one room.
struct Client {
    doc: LoroDoc,
    conn: Arc<ClientConnection>,
    rx: UnboundedReceiver<Outbound>,
}

impl Client {
    fn join(room: &DocRoom, user_id: &str) -> Self {
        let (conn, rx) = ClientConnection::new();
        let conn = Arc::new(conn);
        room.add_client(conn.clone(), user_id, Map::new()).unwrap();
        let client = Self { doc: LoroDoc::new(), conn, rx };
        room.handle_message(&client.conn, &CollabMessage::sync_step1(client.doc.oplog_vv().encode()).encode());
        client
    }

    /// Applies every queued document frame and returns all decoded frames.
    fn pump(&mut self) -> Vec<CollabMessage> {
        let mut received = Vec::new();
        while let Ok(Outbound::Binary(bytes)) = self.rx.try_recv() {
            let message = CollabMessage::decode(&bytes).unwrap();
            if let CollabMessage::Sync(SyncMessage::Step2(diff) | SyncMessage::Update(diff)) = &message {
                self.doc.import(diff).unwrap();
            }
            received.push(message);
        }
        received
    }

    fn set_canvas(&self, room: &DocRoom, key: &str, value: serde_json::Value) {
        let before = self.doc.oplog_vv();
        let canvas = self.doc.get_map("canvas");
        match value {
            serde_json::Value::String(s) => canvas.insert(key, s).unwrap(),
            other => canvas.insert(key, other.as_i64().unwrap()).unwrap(),
        }
        self.doc.commit();
        let diff = self.doc.export(ExportMode::updates(&before)).unwrap();
        room.handle_message(&self.conn, &CollabMessage::sync_update(diff).encode());
    }

    fn add_node(&self, room: &DocRoom, id: &str) {
        let before = self.doc.oplog_vv();
        let node = self
            .doc
            .get_movable_list("nodes")
            .insert_container(0, LoroMap::new())
            .unwrap();
        node.insert("id", id).unwrap();
        node.insert("type", "rect").unwrap();
        self.doc.commit();
        let diff = self.doc.export(ExportMode::updates(&before)).unwrap();
        room.handle_message(&self.conn, &CollabMessage::sync_update(diff).encode());
    }
}

fn seed_scene() -> SceneGraph {
    serde_json::from_value(json!({
        "version": 3,
        "canvas": { "background": "#fff" },
        "assets": { "images": { "img-1": { "src": "a.png" } }, "fonts": {} },
        "nodes": [
            { "id": "n1", "type": "frame", "position": { "x": 0, "y": 0 } },
            { "id": "n2", "type": "text", "props": { "text": "hello" } }
        ],
        "components": []
    }))
    .unwrap()
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn edits_on_two_instances_converge() {
    let cluster = Cluster::new();
    cluster.store.insert("page", 1, seed_scene());
    let a = cluster.instance("instance-a", CollabSettings::default());
    let b = cluster.instance("instance-b", CollabSettings::default());

    let room_a = a.get_or_create("page", 1).await.unwrap();
    let room_b = b.get_or_create("page", 1).await.unwrap();
    let mut alice = Client::join(&room_a, "alice");
    let mut bob = Client::join(&room_b, "bob");
    alice.pump();
    bob.pump();
    assert_eq!(alice.doc.get_deep_value(), bob.doc.get_deep_value());

    alice.set_canvas(&room_a, "width", json!(800));
    bob.set_canvas(&room_b, "height", json!(600));
    alice.set_canvas(&room_a, "background", json!("#000"));
    bob.set_canvas(&room_b, "background", json!("#111"));

    eventually("rooms to converge", || {
        let graph = room_a.scene_graph();
        graph == room_b.scene_graph() && graph.canvas.contains_key("width") && graph.canvas.contains_key("height")
    })
    .await;

    alice.pump();
    bob.pump();
    let merged = room_a.scene_graph();
    assert_eq!(merged.nodes.len(), 2, "hydrated content must not be duplicated");
    assert_eq!(merged.version, 3);
    assert_eq!(merged.canvas.get("width"), Some(&json!(800)));
    assert_eq!(merged.canvas.get("height"), Some(&json!(600)));
    assert_eq!(alice.doc.get_deep_value(), bob.doc.get_deep_value());
    assert_eq!(
        scene_collab::models::lorodoc::loro_doc_to_scene(&alice.doc),
        merged
    );
}

#[tokio::test]
async fn only_one_instance_checkpoints_at_a_time() {
    let cluster = Cluster::new();
    let a = cluster.instance("instance-a", CollabSettings::default());
    let b = cluster.instance("instance-b", CollabSettings::default());
    let room_a = a.get_or_create("page", 1).await.unwrap();
    let room_b = b.get_or_create("page", 1).await.unwrap();

    let alice = Client::join(&room_a, "alice");
    alice.set_canvas(&room_a, "width", json!(1024));
    eventually("update to reach instance b", || {
        room_b.scene_graph().canvas.contains_key("width")
    })
    .await;

    cluster.store.set_save_delay(Duration::from_millis(200));
    let (saved_a, saved_b) = tokio::join!(room_a.take_snapshot(), room_b.take_snapshot());
    let (saved_a, saved_b) = (saved_a.unwrap(), saved_b.unwrap());
    assert!(saved_a ^ saved_b, "exactly one checkpoint must win");
    assert_eq!(cluster.store.save_count(), 1);
    assert_eq!(
        cluster.store.get("page", 1).unwrap().canvas.get("width"),
        Some(&json!(1024))
    );
}

#[tokio::test]
async fn own_broadcasts_are_not_applied_as_remote() {
    let cluster = Cluster::new();
    let a = cluster.instance("instance-a", CollabSettings::default());
    let b = cluster.instance("instance-b", CollabSettings::default());
    let room_a = a.get_or_create("page", 1).await.unwrap();
    let room_b = b.get_or_create("page", 1).await.unwrap();

    let alice = Client::join(&room_a, "alice");
    let mut carol = Client::join(&room_a, "carol");
    let mut bob = Client::join(&room_b, "bob");
    carol.pump();
    bob.pump();

    alice.set_canvas(&room_a, "width", json!(640));
    eventually("update to reach instance b", || {
        room_b.scene_graph().canvas.contains_key("width")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let updates = |frames: Vec<CollabMessage>| {
        frames
            .into_iter()
            .filter(|m| matches!(m, CollabMessage::Sync(SyncMessage::Update(_))))
            .count()
    };
    assert_eq!(updates(carol.pump()), 1);
    assert_eq!(updates(bob.pump()), 1);

    // An envelope carrying this instance's id is dropped even when it is new.
    let outsider = LoroDoc::new();
    outsider.get_map("canvas").insert("forged", 1).unwrap();
    outsider.commit();
    let diff = outsider.export(ExportMode::all_updates()).unwrap();
    room_a.apply_remote(RoomBroadcast::new("instance-a", BroadcastKind::Update, diff.clone()));
    assert!(!room_a.scene_graph().canvas.contains_key("forged"));
    assert!(carol.pump().is_empty());

    room_a.apply_remote(RoomBroadcast::new("instance-b", BroadcastKind::Update, diff));
    assert!(room_a.scene_graph().canvas.contains_key("forged"));
    assert_eq!(updates(carol.pump()), 1);
}

#[tokio::test]
async fn idle_rooms_are_evicted_after_grace() {
    let cluster = Cluster::new();
    let settings = CollabSettings {
        idle_grace: Duration::from_millis(100),
        ..CollabSettings::default()
    };
    let registry = cluster.instance("instance-a", settings);
    let room = registry.get_or_create("page", 1).await.unwrap();
    let alice = Client::join(&room, "alice");
    alice.set_canvas(&room, "width", json!(300));

    room.remove_client(alice.conn.id());
    eventually("room to be torn down", || room.is_destroyed() && !room.is_subscribed()).await;
    room.wait_torn_down().await;
    // The final checkpoint persisted the edit before leaving the channel.
    assert_eq!(
        cluster.store.get("page", 1).unwrap().canvas.get("width"),
        Some(&json!(300))
    );

    let replacement = registry.get_or_create("page", 1).await.unwrap();
    assert!(!Arc::ptr_eq(&room, &replacement));
    assert_eq!(replacement.scene_graph().canvas.get("width"), Some(&json!(300)));
}

#[tokio::test]
async fn reconnect_within_grace_keeps_the_room() {
    let cluster = Cluster::new();
    let settings = CollabSettings {
        idle_grace: Duration::from_millis(200),
        ..CollabSettings::default()
    };
    let registry = cluster.instance("instance-a", settings);
    let room = registry.get_or_create("page", 1).await.unwrap();
    let alice = Client::join(&room, "alice");
    alice.set_canvas(&room, "width", json!(500));
    room.remove_client(alice.conn.id());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let again = registry.get_or_create("page", 1).await.unwrap();
    assert!(Arc::ptr_eq(&room, &again));
    let mut returning = Client::join(&again, "alice");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!room.is_destroyed());
    returning.pump();
    assert_eq!(
        scene_collab::models::lorodoc::loro_doc_to_scene(&returning.doc).canvas.get("width"),
        Some(&json!(500))
    );
}

#[tokio::test]
async fn fresh_page_starts_empty_and_syncs_immediately() {
    let cluster = Cluster::new();
    let registry = cluster.instance("instance-a", CollabSettings::default());
    let room = registry.get_or_create("brand-new", 1).await.unwrap();

    assert!(room.is_loaded());
    let graph = room.scene_graph();
    assert_eq!(graph.version, 1);
    assert!(graph.nodes.is_empty());
    assert!(graph.assets.images.is_empty());
    assert!(graph.assets.fonts.is_empty());

    let (conn, mut rx) = ClientConnection::new();
    room.add_client(Arc::new(conn), "alice", Map::new()).unwrap();
    let Ok(Outbound::Binary(first)) = rx.try_recv() else {
        panic!("expected an initial frame");
    };
    let CollabMessage::Sync(SyncMessage::Step1(state_vector)) = CollabMessage::decode(&first).unwrap() else {
        panic!("expected sync step 1 first");
    };
    assert!(VersionVector::decode(&state_vector).is_ok());
}

// Three editors branch from the same hydrated state and edit concurrently.
fn concurrent_diffs() -> Vec<Vec<u8>> {
    let base = LoroDoc::new();
    scene_collab::models::lorodoc::hydrate(&base, "page:1", &seed_scene()).unwrap();
    let base_vv = base.oplog_vv();
    (0..3i64)
        .map(|i| {
            let editor = LoroDoc::new();
            editor.import(&base.export(ExportMode::all_updates()).unwrap()).unwrap();
            let nodes = editor.get_movable_list("nodes");
            let node = nodes.insert_container(0, LoroMap::new()).unwrap();
            node.insert("id", format!("e{}", i)).unwrap();
            editor.get_map("canvas").insert("owner", i).unwrap();
            editor.get_map("canvas").insert(&format!("mark{}", i), true).unwrap();
            editor.commit();
            editor.export(ExportMode::updates(&base_vv)).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn concurrent_edits_converge_in_any_delivery_order() {
    let diffs = concurrent_diffs();
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    let mut graphs = Vec::new();
    for order in orders {
        let cluster = Cluster::new();
        cluster.store.insert("page", 1, seed_scene());
        let registry = cluster.instance("instance-a", CollabSettings::default());
        let room = registry.get_or_create("page", 1).await.unwrap();
        let client = Client::join(&room, "alice");
        for idx in order {
            room.handle_message(&client.conn, &CollabMessage::sync_update(diffs[idx].clone()).encode());
        }
        graphs.push(room.scene_graph());
    }

    assert_eq!(graphs[0].nodes.len(), 5);
    for key in ["mark0", "mark1", "mark2", "owner"] {
        assert!(graphs[0].canvas.contains_key(key));
    }
    assert!(graphs.iter().all(|graph| *graph == graphs[0]));
}

#[tokio::test]
async fn clients_on_three_instances_converge() {
    let cluster = Cluster::new();
    cluster.store.insert("page", 1, seed_scene());
    let instances: Vec<_> = ["instance-a", "instance-b", "instance-c"]
        .iter()
        .map(|id| cluster.instance(id, CollabSettings::default()))
        .collect();
    let mut rooms = Vec::new();
    for registry in &instances {
        rooms.push(registry.get_or_create("page", 1).await.unwrap());
    }
    let mut clients: Vec<Client> = rooms
        .iter()
        .enumerate()
        .map(|(i, room)| Client::join(room, &format!("user-{}", i)))
        .collect();
    for client in clients.iter_mut() {
        client.pump();
    }

    // Every editor changes the same fields without seeing the others first.
    for (i, client) in clients.iter().enumerate() {
        client.add_node(&rooms[i], &format!("new-{}", i));
        client.set_canvas(&rooms[i], "background", json!(format!("#00{}", i)));
    }

    eventually("all rooms to converge", || {
        let first = rooms[0].scene_graph();
        first.nodes.len() == 5 && rooms.iter().all(|room| room.scene_graph() == first)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    for client in clients.iter_mut() {
        client.pump();
    }
    let merged = rooms[0].scene_graph();
    for client in &clients {
        assert_eq!(scene_collab::models::lorodoc::loro_doc_to_scene(&client.doc), merged);
    }
}

#[tokio::test]
async fn awareness_of_users_on_other_instances_is_kept_apart() {
    let cluster = Cluster::new();
    let a = cluster.instance("instance-a", CollabSettings::default());
    let b = cluster.instance("instance-b", CollabSettings::default());
    let room_a = a.get_or_create("page", 1).await.unwrap();
    let room_b = b.get_or_create("page", 1).await.unwrap();

    let alice = Client::join(&room_a, "alice");
    let bob = Client::join(&room_b, "bob");
    assert_ne!(alice.conn.id(), bob.conn.id());
    eventually("both users to be visible on both instances", || {
        room_a.stats().awareness_states == 2 && room_b.stats().awareness_states == 2
    })
    .await;
    assert_eq!(room_a.awareness_state(bob.conn.id()).unwrap()["userId"], json!("bob"));

    room_b.remove_client(bob.conn.id());
    eventually("bob's departure to reach instance a", || {
        room_a.stats().awareness_states == 1
    })
    .await;
    assert_eq!(room_a.awareness_state(alice.conn.id()).unwrap()["userId"], json!("alice"));
    assert!(room_a.awareness_state(bob.conn.id()).is_none());
}

#[tokio::test]
async fn instance_joining_after_a_checkpoint_does_not_duplicate_content() {
    let cluster = Cluster::new();
    let a = cluster.instance("instance-a", CollabSettings::default());
    let room_a = a.get_or_create("page", 1).await.unwrap();
    let alice = Client::join(&room_a, "alice");
    alice.add_node(&room_a, "n1");
    assert!(room_a.take_snapshot().await.unwrap());

    let b = cluster.instance("instance-b", CollabSettings::default());
    let room_b = b.get_or_create("page", 1).await.unwrap();
    // Leave time for the state request round trip.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(room_a.scene_graph().nodes.len(), 1);
    assert_eq!(room_b.scene_graph().nodes.len(), 1);
    assert_eq!(room_a.scene_graph(), room_b.scene_graph());

    // Further edits still flow and nothing doubles on the next checkpoint.
    let mut bob = Client::join(&room_b, "bob");
    bob.pump();
    bob.add_node(&room_b, "n2");
    eventually("bob's node to reach instance a", || room_a.scene_graph().nodes.len() == 2).await;
    assert!(room_b.take_snapshot().await.unwrap());
    assert_eq!(cluster.store.get("page", 1).unwrap().nodes.len(), 2);
    assert_eq!(room_b.scene_graph().nodes.len(), 2);
}

#[tokio::test]
async fn replacement_room_keeps_its_channel_when_the_old_one_finishes_closing() {
    let cluster = Cluster::new();
    let settings = CollabSettings {
        idle_grace: Duration::from_millis(50),
        ..CollabSettings::default()
    };
    let a = cluster.instance("instance-a", settings);
    let b = cluster.instance("instance-b", CollabSettings::default());
    let room = a.get_or_create("page", 1).await.unwrap();
    let alice = Client::join(&room, "alice");
    alice.set_canvas(&room, "width", json!(320));

    cluster.store.set_save_delay(Duration::from_millis(300));
    room.remove_client(alice.conn.id());
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(room.is_destroyed(), "grace expired, final save in flight");

    let replacement = a.get_or_create("page", 1).await.unwrap();
    assert!(!Arc::ptr_eq(&room, &replacement));
    // Loading waited for the old room's final checkpoint.
    assert_eq!(replacement.scene_graph().canvas.get("width"), Some(&json!(320)));
    assert!(replacement.is_subscribed());
    assert!(!room.is_subscribed());

    let _carol = Client::join(&replacement, "carol");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(replacement.is_subscribed());

    cluster.store.set_save_delay(Duration::ZERO);
    let room_b = b.get_or_create("page", 1).await.unwrap();
    let bob = Client::join(&room_b, "bob");
    bob.set_canvas(&room_b, "height", json!(240));
    eventually("instance b's edit to reach the replacement", || {
        replacement.scene_graph().canvas.contains_key("height")
    })
    .await;
    assert!(!replacement.is_destroyed());
}
