use std::sync::Arc;

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use services::services::{
    config::{Config, load_config_from_file, save_config_to_file},
    dispatcher::ResearchDispatcher,
    progress_bus::ProgressBus,
    research_engine::{HttpResearchEngine, ResearchEngine},
};
use tokio::sync::RwLock;
use utils::assets::config_path;

#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<RwLock<Config>>,
    db: DBService,
    progress_bus: ProgressBus,
    dispatcher: ResearchDispatcher,
}

impl LocalDeployment {
    /// Wires a deployment from already-built parts.
    pub fn from_parts(config: Config, db: DBService, engine: Arc<dyn ResearchEngine>) -> Self {
        let progress_bus = ProgressBus::new(config.progress_bus.observer_queue_capacity);
        let dispatcher = ResearchDispatcher::new(
            db.pool.clone(),
            progress_bus.clone(),
            engine,
            config.limits.clone(),
            config.dispatcher.clone(),
        );

        Self {
            config: Arc::new(RwLock::new(config)),
            db,
            progress_bus,
            dispatcher,
        }
    }
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        let mut raw_config = load_config_from_file(&config_path()).await;

        // Persist file values only; environment overrides stay ephemeral.
        save_config_to_file(&raw_config, &config_path()).await?;
        raw_config.apply_env_overrides()?;

        let db = match raw_config.database_url.as_deref() {
            Some(url) => DBService::new_with_url(url).await?,
            None => DBService::new().await?,
        };

        let engine = HttpResearchEngine::new(&raw_config.engine)?;
        tracing::info!("Research engine at {}", raw_config.engine.base_url);

        Ok(Self::from_parts(raw_config, db, Arc::new(engine)))
    }

    fn config(&self) -> &Arc<RwLock<Config>> {
        &self.config
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn progress_bus(&self) -> &ProgressBus {
        &self.progress_bus
    }

    fn dispatcher(&self) -> &ResearchDispatcher {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use db::models::research_task::{
        CreateResearchTask, ResearchShape, ResearchStatus, ResearchTask,
    };
    use deployment::RESTART_REASON;
    use services::services::research_engine::ScriptedEngine;
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn orphaned_tasks_are_cancelled_not_rerun() {
        let db = DBService::new_in_memory().await.unwrap();
        let pool = &db.pool;

        let pending = ResearchTask::create(
            pool,
            &CreateResearchTask::new("left pending"),
            Uuid::new_v4(),
            ResearchShape::default(),
        )
        .await
        .unwrap();
        let running = ResearchTask::create(
            pool,
            &CreateResearchTask::new("left running"),
            Uuid::new_v4(),
            ResearchShape::default(),
        )
        .await
        .unwrap();
        ResearchTask::transition(pool, running.id, ResearchStatus::Running)
            .await
            .unwrap();

        let engine = Arc::new(ScriptedEngine::new());
        let deployment = LocalDeployment::from_parts(Config::default(), db.clone(), engine);
        let cleaned = deployment.cleanup_orphan_tasks().await.unwrap();
        assert_eq!(cleaned, 2);

        for id in [pending.id, running.id] {
            let task = ResearchTask::find_by_id(pool, id).await.unwrap().unwrap();
            assert_eq!(task.status, ResearchStatus::Cancelled);
            assert_eq!(task.error_message.as_deref(), Some(RESTART_REASON));
        }
        assert_eq!(deployment.dispatcher().execution_count(), 0);
        assert_eq!(deployment.cleanup_orphan_tasks().await.unwrap(), 0);
    }
}
