use std::sync::Arc;

use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use db::{DBService, models::research_task::ResearchTask};
use services::services::{
    config::{Config, ConfigError},
    dispatcher::ResearchDispatcher,
    progress_bus::ProgressBus,
    research_engine::EngineError,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::sync::RwLock;

pub const RESTART_REASON: &str = "interrupted by server restart";

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn config(&self) -> &Arc<RwLock<Config>>;

    fn db(&self) -> &DBService;

    fn progress_bus(&self) -> &ProgressBus;

    fn dispatcher(&self) -> &ResearchDispatcher;

    /// Cancels tasks a previous process left unfinished. Nothing is re-run.
    async fn cleanup_orphan_tasks(&self) -> Result<usize, DeploymentError> {
        let pool = &self.db().pool;
        let orphans = ResearchTask::find_unfinished(pool).await?;
        let mut cleaned = 0;

        for task in orphans {
            if self.dispatcher().is_executing(task.id) {
                continue;
            }
            match ResearchTask::cancel(pool, task.id, RESTART_REASON).await {
                Ok(_) => {
                    cleaned += 1;
                    tracing::info!(
                        "Cancelled orphaned research task {} (was {})",
                        task.id,
                        task.status
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to cancel orphaned research task {}: {}", task.id, e);
                }
            }
        }

        Ok(cleaned)
    }

    async fn shutdown(&self) {
        self.dispatcher().shutdown().await;
    }
}
