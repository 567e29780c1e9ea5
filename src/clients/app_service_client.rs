use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{CollabError, SceneGraph};

/// Client for the application service that owns page storage.
#[derive(Debug)]
pub struct AppServiceClient {
    client: Client,
    base_url: String,
    jwt_secret: String,
    service_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(rename = "type")]
    type_: String,
    exp: usize,
}

impl AppServiceClient {
    pub fn new(base_url: &str, jwt_secret: &str, service_name: &str) -> Result<Self, CollabError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            jwt_secret: jwt_secret.to_string(),
            service_name: service_name.to_string(),
        })
    }

    fn generate_token(&self) -> Result<String, CollabError> {
        // 1 minute expiration
        let expiration = (Utc::now() + Duration::seconds(60)).timestamp();

        let claims = Claims {
            sub: self.service_name.clone(),
            type_: "service".to_string(),
            exp: expiration as usize,
        };

        encode(&Header::default(), &claims, &EncodingKey::from_secret(self.jwt_secret.as_bytes()))
            .map_err(|e| CollabError::Protocol(format!("Failed to generate service JWT: {}", e)))
    }

    /// `{base}/pages/{page_id}/versions/{version}/{resource}` with the page id
    /// escaped as a single path segment.
    fn page_url(&self, page_id: &str, version: i32, resource: &str) -> Result<Url, CollabError> {
        if page_id.is_empty() || page_id == "." || page_id == ".." {
            return Err(CollabError::Protocol(format!("Invalid page id {:?}", page_id)));
        }
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| CollabError::Protocol(format!("Invalid app service URL {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| CollabError::Protocol(format!("App service URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["pages", page_id, "versions", &version.to_string(), resource]);
        Ok(url)
    }

    fn scene_graph_url(&self, page_id: &str, version: i32) -> Result<Url, CollabError> {
        self.page_url(page_id, version, "scene-graph")
    }

    fn crdt_snapshot_url(&self, page_id: &str, version: i32) -> Result<Url, CollabError> {
        self.page_url(page_id, version, "crdt-snapshot")
    }

    /// Fetch the stored scene graph. A 404 means the page has no graph yet.
    pub async fn get_scene_graph(&self, page_id: &str, version: i32) -> Result<Option<SceneGraph>, CollabError> {
        let token = self.generate_token()?;
        let response = self
            .client
            .get(self.scene_graph_url(page_id, version)?)
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("App service has no scene graph for {}:{}", page_id, version);
            return Ok(None);
        }
        let graph = response.error_for_status()?.json::<SceneGraph>().await?;
        Ok(Some(graph))
    }

    pub async fn put_scene_graph(&self, page_id: &str, version: i32, graph: &SceneGraph) -> Result<(), CollabError> {
        let token = self.generate_token()?;
        self.client
            .put(self.scene_graph_url(page_id, version)?)
            .bearer_auth(token)
            .json(graph)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Fetch the CRDT snapshot stored next to the scene graph, if any.
    pub async fn get_crdt_snapshot(&self, page_id: &str, version: i32) -> Result<Option<Vec<u8>>, CollabError> {
        let token = self.generate_token()?;
        let response = self
            .client
            .get(self.crdt_snapshot_url(page_id, version)?)
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("App service has no CRDT snapshot for {}:{}", page_id, version);
            return Ok(None);
        }
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(Some(bytes.to_vec()))
    }

    pub async fn put_crdt_snapshot(&self, page_id: &str, version: i32, snapshot: &[u8]) -> Result<(), CollabError> {
        let token = self.generate_token()?;
        self.client
            .put(self.crdt_snapshot_url(page_id, version)?)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(snapshot.to_vec())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
