//! Process bootstrap: wires config, SQLite state and the engine together.

use std::path::PathBuf;
use std::sync::Arc;

use conductor_core::executor::ExecutorRegistry;
use conductor_core::{Engine, Orchestrator};
use conductor_types::workflow::WorkflowDefinition;

use crate::config::{load_engine_config, resolve_data_dir};
use crate::definition::{DefinitionError, discover_workflows};
use crate::sqlite::pool::{DatabasePool, database_url};
use crate::sqlite::state_store::SqliteEngineStateStore;

/// Subdirectory of the data dir scanned for YAML definitions.
pub const WORKFLOWS_DIR: &str = "workflows";

/// A running engine plus the state store it restores from and flushes to.
#[derive(Debug, Clone)]
pub struct Conductor {
    pub engine: Arc<Engine>,
    pub store: SqliteEngineStateStore,
    pub data_dir: PathBuf,
}

impl Conductor {
    /// Initialize in the resolved data directory.
    pub async fn init(registry: Arc<ExecutorRegistry>) -> anyhow::Result<Self> {
        Self::init_in(resolve_data_dir(), registry).await
    }

    /// Initialize in `data_dir`: load `conductor.toml`, open the database,
    /// build the engine and restore its persisted state.
    pub async fn init_in(data_dir: PathBuf, registry: Arc<ExecutorRegistry>) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let pool = DatabasePool::new(&database_url(&data_dir)).await?;
        let store = SqliteEngineStateStore::new(pool);

        let engine = Arc::new(Engine::new(config, registry));
        engine.restore(&store).await?;

        tracing::info!(data_dir = %data_dir.display(), "conductor initialized");
        Ok(Self {
            engine,
            store,
            data_dir,
        })
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.engine.orchestrator()
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join(WORKFLOWS_DIR)
    }

    /// Definitions found in the workflows directory.
    pub async fn workflows(&self) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
        discover_workflows(&self.workflows_dir()).await
    }

    /// Flush engine state without stopping.
    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        self.engine.persist(&self.store).await?;
        Ok(())
    }

    /// Stop the batch queues, persist engine state and close the database.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.engine.shutdown(&self.store).await?;
        self.store.pool().close().await;
        tracing::info!("conductor shut down");
        Ok(())
    }
}
