//! Application state wiring the engine to its SQLite store.
//!
//! The coordinator is generic over the checkpoint store; AppState pins it to
//! the infra implementation and owns the pipeline graph every command uses.

use std::path::PathBuf;
use std::sync::Arc;

use quill_core::workflow::{Coordinator, EngineError, GraphDefinition, InstanceSnapshot};
use quill_infra::config::load_engine_config;
use quill_infra::sqlite::pool::{database_url, resolve_data_dir};
use quill_infra::sqlite::{DatabasePool, SqliteCheckpointStore};
use uuid::Uuid;

use crate::pipeline::build_pipeline;

/// Coordinator pinned to the SQLite checkpoint store.
pub type ConcreteCoordinator = Coordinator<SqliteCheckpointStore>;

/// Shared application state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: ConcreteCoordinator,
    pub graph: Arc<GraphDefinition>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Load config, open the database, and build the pipeline graph.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let pool = DatabasePool::new(&db_url).await?;

        let coordinator = Coordinator::new(Arc::new(SqliteCheckpointStore::new(pool)), config);
        let graph = Arc::new(build_pipeline()?);

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self {
            coordinator,
            graph,
            data_dir,
        })
    }

    /// Attach a stored instance to this process so it can be driven.
    pub async fn attach(&self, instance_id: Uuid) -> Result<InstanceSnapshot, EngineError> {
        self.coordinator
            .recover(Arc::clone(&self.graph), instance_id)
            .await
    }
}
