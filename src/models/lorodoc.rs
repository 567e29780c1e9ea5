//! Mapping between [`SceneGraph`] and the containers of a [`LoroDoc`].
//!
//! Layout of the document:
//!
//! - `meta`: map holding `version`
//! - `canvas`: map
//! - `assets`: map with nested `images` and `fonts` maps
//! - `nodes`, `components`: movable lists of maps
//!
//! JSON objects become nested maps and arrays become lists, so concurrent
//! edits to different fields of the same node merge instead of overwriting.

use loro::{LoroDoc, LoroList, LoroMap, LoroMovableList, LoroResult, LoroValue, ToJson};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::warn;

use crate::models::{SceneAssets, SceneComponent, SceneGraph, SceneNode, DEFAULT_SCENE_VERSION};

pub const META: &str = "meta";
pub const CANVAS: &str = "canvas";
pub const ASSETS: &str = "assets";
pub const NODES: &str = "nodes";
pub const COMPONENTS: &str = "components";

const STRUCTURED_NODE_FIELDS: [&str; 4] = ["position", "size", "style", "props"];
const STRUCTURED_COMPONENT_FIELDS: [&str; 3] = ["position", "size", "props"];

/// Builds a fresh document holding `scene`.
pub fn scene_to_loro_doc(scene: &SceneGraph) -> LoroResult<LoroDoc> {
    let doc = LoroDoc::new();
    apply_scene(&doc, scene)?;
    doc.commit();
    Ok(doc)
}

/// Writes `scene` into the root containers of `doc`. The caller commits.
pub fn apply_scene(doc: &LoroDoc, scene: &SceneGraph) -> LoroResult<()> {
    let meta = doc.get_map(META);
    meta.insert("version", scene.version)?;

    let canvas = doc.get_map(CANVAS);
    fill_map(&canvas, &scene.canvas)?;

    let assets = doc.get_map(ASSETS);
    let images = assets.insert_container("images", LoroMap::new())?;
    fill_map(&images, &scene.assets.images)?;
    let fonts = assets.insert_container("fonts", LoroMap::new())?;
    fill_map(&fonts, &scene.assets.fonts)?;

    let nodes = doc.get_movable_list(NODES);
    for (idx, node) in scene.nodes.iter().enumerate() {
        push_object(&nodes, idx, node)?;
    }

    let components = doc.get_movable_list(COMPONENTS);
    for (idx, component) in scene.components.iter().enumerate() {
        push_object(&components, idx, component)?;
    }
    Ok(())
}

/// Hydrates `doc` from a persisted scene graph.
///
/// The operations are written under a peer id derived from `seed` and the
/// graph content, so every process hydrating the same checkpoint produces the
/// same operations and merging them is a no-op. The document's own peer id is
/// restored afterwards.
pub fn hydrate(doc: &LoroDoc, seed: &str, scene: &SceneGraph) -> LoroResult<()> {
    let live_peer = doc.peer_id();
    doc.set_peer_id(hydration_peer_id(seed, scene))?;
    let written = apply_scene(doc, scene);
    doc.commit();
    doc.set_peer_id(live_peer)?;
    written
}

pub fn hydration_peer_id(seed: &str, scene: &SceneGraph) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    // serde_json maps are ordered, so the rendering is stable for equal graphs.
    serde_json::to_string(scene).unwrap_or_default().hash(&mut hasher);
    hasher.finish()
}

/// Whether the encoded CRDT snapshot decodes to exactly `graph`.
pub fn snapshot_matches(snapshot: &[u8], graph: &SceneGraph) -> LoroResult<bool> {
    let doc = LoroDoc::from_snapshot(snapshot)?;
    Ok(loro_doc_to_scene(&doc) == *graph)
}

/// Reads the scene graph back out of `doc`. Missing or mistyped sections
/// decode to their defaults.
pub fn loro_doc_to_scene(doc: &LoroDoc) -> SceneGraph {
    let root = doc.get_deep_value().to_json_value();
    scene_from_json(&root)
}

fn scene_from_json(root: &Value) -> SceneGraph {
    let version = root
        .get(META)
        .and_then(|m| m.get("version"))
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_SCENE_VERSION);

    let assets = root.get(ASSETS);
    SceneGraph {
        version,
        canvas: object_or_default(root.get(CANVAS)),
        assets: SceneAssets {
            images: object_or_default(assets.and_then(|a| a.get("images"))),
            fonts: object_or_default(assets.and_then(|a| a.get("fonts"))),
        },
        nodes: objects(root.get(NODES), &STRUCTURED_NODE_FIELDS)
            .filter_map(|obj| decode_entry::<SceneNode>(NODES, obj))
            .collect(),
        components: objects(root.get(COMPONENTS), &STRUCTURED_COMPONENT_FIELDS)
            .filter_map(|obj| decode_entry::<SceneComponent>(COMPONENTS, obj))
            .collect(),
    }
}

fn object_or_default(value: Option<&Value>) -> Map<String, Value> {
    value.and_then(Value::as_object).cloned().unwrap_or_default()
}

// Yields the object entries of a list, dropping structured fields that are
// not objects.
fn objects<'a>(
    list: Option<&'a Value>,
    structured: &'a [&'a str],
) -> impl Iterator<Item = Map<String, Value>> + 'a {
    list.and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .map(move |obj| {
            let mut obj = obj.clone();
            obj.retain(|key, value| !structured.contains(&key.as_str()) || value.is_object());
            obj
        })
}

fn decode_entry<T: serde::de::DeserializeOwned>(section: &str, obj: Map<String, Value>) -> Option<T> {
    match serde_json::from_value(Value::Object(obj)) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("Skipping unreadable entry in {}: {}", section, e);
            None
        }
    }
}

fn push_object<T: serde::Serialize>(list: &LoroMovableList, idx: usize, entry: &T) -> LoroResult<()> {
    let value = serde_json::to_value(entry).unwrap_or(Value::Null);
    let map = list.insert_container(idx, LoroMap::new())?;
    if let Value::Object(obj) = value {
        fill_map(&map, &obj)?;
    }
    Ok(())
}

fn fill_map(map: &LoroMap, obj: &Map<String, Value>) -> LoroResult<()> {
    for (key, value) in obj {
        match value {
            Value::Object(child) => {
                let nested = map.insert_container(key, LoroMap::new())?;
                fill_map(&nested, child)?;
            }
            Value::Array(items) => {
                let nested = map.insert_container(key, LoroList::new())?;
                fill_list(&nested, items)?;
            }
            scalar => map.insert(key, scalar_to_loro(scalar))?,
        }
    }
    Ok(())
}

fn fill_list(list: &LoroList, items: &[Value]) -> LoroResult<()> {
    for (idx, value) in items.iter().enumerate() {
        match value {
            Value::Object(child) => {
                let nested = list.insert_container(idx, LoroMap::new())?;
                fill_map(&nested, child)?;
            }
            Value::Array(inner) => {
                let nested = list.insert_container(idx, LoroList::new())?;
                fill_list(&nested, inner)?;
            }
            scalar => list.insert(idx, scalar_to_loro(scalar))?,
        }
    }
    Ok(())
}

fn scalar_to_loro(value: &Value) -> LoroValue {
    match value {
        Value::Bool(b) => LoroValue::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LoroValue::from(i),
            None => LoroValue::from(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => LoroValue::from(s.as_str()),
        _ => LoroValue::Null,
    }
}
