use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Error as SqlxError;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::models::SceneGraph;

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS page_scene_graphs (
        page_id     TEXT        NOT NULL,
        version     INTEGER     NOT NULL,
        scene_graph JSONB       NOT NULL,
        crdt_snapshot BYTEA,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (page_id, version)
    )
"#;

// Tables created before snapshots were stored lack the column.
const ADD_SNAPSHOT_COLUMN_SQL: &str =
    "ALTER TABLE page_scene_graphs ADD COLUMN IF NOT EXISTS crdt_snapshot BYTEA";

/// Database connection pool for persisted scene graphs
pub struct DbScene {
    pool: PgPool,
}

impl DbScene {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    ///
    /// # Returns
    /// * `Result<Self, SqlxError>` - Database connection pool or error
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        sqlx::query(ADD_SNAPSHOT_COLUMN_SQL).execute(&pool).await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Load the scene graph of a page version
    ///
    /// # Arguments
    /// * `page_id` - Page identifier
    /// * `version` - Page version
    ///
    /// # Returns
    /// * `Result<Option<(SceneGraph, Option<Vec<u8>>)>, SqlxError>` - The graph and its CRDT
    ///   snapshot, or None if nothing was saved yet
    pub async fn load_scene_graph(
        &self,
        page_id: &str,
        version: i32,
    ) -> Result<Option<(SceneGraph, Option<Vec<u8>>)>, SqlxError> {
        let row: Option<(Json<SceneGraph>, Option<Vec<u8>>)> = sqlx::query_as(
            "SELECT scene_graph, crdt_snapshot FROM page_scene_graphs WHERE page_id = $1 AND version = $2",
        )
        .bind(page_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(
                "Failed to load scene graph {}:{}: {}. Pool state: {} idle, {} total",
                page_id,
                version,
                e,
                self.pool.num_idle(),
                self.pool.size()
            );
            e
        })?;

        debug!("Loaded scene graph {}:{} (found: {})", page_id, version, row.is_some());
        Ok(row.map(|(Json(graph), snapshot)| (graph, snapshot)))
    }

    /// Insert or replace the scene graph of a page version and its CRDT snapshot
    pub async fn save_scene_graph(
        &self,
        page_id: &str,
        version: i32,
        graph: &SceneGraph,
        crdt_snapshot: &[u8],
    ) -> Result<(), SqlxError> {
        let query_sql = r#"
            INSERT INTO page_scene_graphs (page_id, version, scene_graph, crdt_snapshot, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (page_id, version)
            DO UPDATE SET scene_graph = EXCLUDED.scene_graph,
                          crdt_snapshot = EXCLUDED.crdt_snapshot,
                          updated_at = EXCLUDED.updated_at
        "#;

        sqlx::query(query_sql)
            .bind(page_id)
            .bind(version)
            .bind(Json(graph))
            .bind(crdt_snapshot)
            .execute(&self.pool)
            .await?;

        debug!("Saved scene graph {}:{}", page_id, version);
        Ok(())
    }

    /// Check that the database answers
    pub async fn ping(&self) -> Result<(), SqlxError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
