use sqlx::SqlitePool;
use uuid::Uuid;

use super::research_task::{CreateResearchTask, ResearchShape, ResearchTask};
use crate::DBService;

pub(crate) async fn setup_test_pool() -> SqlitePool {
    DBService::new_in_memory()
        .await
        .expect("failed to open sqlite memory db")
        .pool
}

pub(crate) async fn create_test_task(pool: &SqlitePool, query: &str) -> ResearchTask {
    ResearchTask::create(
        pool,
        &CreateResearchTask::new(query),
        Uuid::new_v4(),
        ResearchShape::default(),
    )
    .await
    .expect("failed to create test research task")
}
