use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_SCENE_VERSION: i64 = 1;

// Helper function to deserialize null as default value
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

fn default_scene_version() -> i64 {
    DEFAULT_SCENE_VERSION
}

/// The persisted form of a collaborative page document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneGraph {
    #[serde(default = "default_scene_version")]
    pub version: i64,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub canvas: Map<String, Value>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub assets: SceneAssets,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub nodes: Vec<SceneNode>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub components: Vec<SceneComponent>,
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self {
            version: DEFAULT_SCENE_VERSION,
            canvas: Map::new(),
            assets: SceneAssets::default(),
            nodes: Vec::new(),
            components: Vec::new(),
        }
    }
}

impl SceneGraph {
    pub fn is_empty(&self) -> bool {
        self.canvas.is_empty()
            && self.assets.images.is_empty()
            && self.assets.fonts.is_empty()
            && self.nodes.is_empty()
            && self.components.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SceneAssets {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub images: Map<String, Value>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub fonts: Map<String, Value>,
}

/// A node of the page tree. Keys other than the structured fields are kept
/// verbatim in `fields`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SceneNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub props: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SceneComponent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub props: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}
