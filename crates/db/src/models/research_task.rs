use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, Type, types::Json};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResearchTaskError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Research task not found")]
    NotFound,
    #[error("Cannot move research task from {from} to {to}")]
    InvalidTransition {
        from: ResearchStatus,
        to: ResearchStatus,
    },
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[sqlx(type_name = "research_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResearchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ResearchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResearchStatus::Completed | ResearchStatus::Failed | ResearchStatus::Cancelled
        )
    }

    /// States a task may be in for a write of `self` to succeed.
    pub fn legal_sources(self) -> &'static [ResearchStatus] {
        use ResearchStatus::*;
        match self {
            Pending => &[],
            Running => &[Pending, Paused],
            Completed | Failed => &[Running],
            Cancelled => &[Pending, Running, Paused],
            Paused => &[Running],
        }
    }

    pub fn can_transition_to(self, next: ResearchStatus) -> bool {
        next.legal_sources().contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResearchStatus::Pending => "pending",
            ResearchStatus::Running => "running",
            ResearchStatus::Completed => "completed",
            ResearchStatus::Failed => "failed",
            ResearchStatus::Cancelled => "cancelled",
            ResearchStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for ResearchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Type, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[sqlx(type_name = "report_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    #[default]
    ResearchReport,
    DetailedReport,
    ResourceReport,
    OutlineReport,
    CustomReport,
    SubtopicReport,
    Deep,
    MultiAgent,
}

impl ReportType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportType::ResearchReport => "research_report",
            ReportType::DetailedReport => "detailed_report",
            ReportType::ResourceReport => "resource_report",
            ReportType::OutlineReport => "outline_report",
            ReportType::CustomReport => "custom_report",
            ReportType::SubtopicReport => "subtopic_report",
            ReportType::Deep => "deep",
            ReportType::MultiAgent => "multi_agent",
        }
    }
}

impl std::fmt::Display for ReportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_tone() -> String {
    "Analytical".to_string()
}

fn default_language() -> String {
    "english".to_string()
}

fn default_total_words() -> i32 {
    2000
}

fn default_max_subtopics() -> i32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateResearchTask {
    pub query: String,
    #[serde(default)]
    pub report_type: ReportType,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_total_words")]
    pub total_words: i32,
    #[serde(default = "default_max_subtopics")]
    pub max_subtopics: i32,
}

impl CreateResearchTask {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            report_type: ReportType::default(),
            tone: default_tone(),
            language: default_language(),
            total_words: default_total_words(),
            max_subtopics: default_max_subtopics(),
        }
    }

    pub fn with_report_type(mut self, report_type: ReportType) -> Self {
        self.report_type = report_type;
        self
    }
}

/// Initial depth/breadth totals for a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResearchShape {
    pub total_depth: i32,
    pub total_breadth: i32,
}

impl Default for ResearchShape {
    fn default() -> Self {
        Self {
            total_depth: 1,
            total_breadth: 1,
        }
    }
}

/// Partial progress report. Absent fields leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
pub struct ProgressUpdate {
    #[serde(default, alias = "depth", skip_serializing_if = "Option::is_none")]
    pub current_depth: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_depth: Option<i32>,
    #[serde(default, alias = "breadth", skip_serializing_if = "Option::is_none")]
    pub current_breadth: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_breadth: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_queries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_queries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressUpdate {
    /// True when nothing in the update would touch the stored record.
    pub fn is_empty(&self) -> bool {
        self.current_depth.is_none()
            && self.total_depth.is_none()
            && self.current_breadth.is_none()
            && self.total_breadth.is_none()
            && self.completed_queries.is_none()
            && self.total_queries.is_none()
            && self.cost.is_none()
    }
}

/// Payload written together with the `completed` status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub report: String,
    pub sources: Vec<String>,
    pub images: Vec<String>,
    pub cost: f64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct ResearchTask {
    pub id: Uuid,
    pub query: String,
    pub report_type: ReportType,
    pub tone: String,
    pub language: String,
    pub total_words: i32,
    pub max_subtopics: i32,
    pub status: ResearchStatus,
    pub current_depth: i32,
    pub total_depth: i32,
    pub current_breadth: i32,
    pub total_breadth: i32,
    pub completed_queries: i32,
    pub total_queries: i32,
    pub cost: f64,
    pub report: Option<String>,
    #[ts(type = "Array<string> | null")]
    pub sources: Option<Json<Vec<String>>>,
    #[ts(type = "Array<string> | null")]
    pub images: Option<Json<Vec<String>>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Task snapshot as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ResearchTaskView {
    #[serde(flatten)]
    pub task: ResearchTask,
    pub progress_percentage: f64,
}

impl From<ResearchTask> for ResearchTaskView {
    fn from(task: ResearchTask) -> Self {
        let progress_percentage = task.progress_percentage();
        Self {
            task,
            progress_percentage,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResearchTaskFilter {
    pub status: Option<ResearchStatus>,
    pub offset: i64,
    pub limit: i64,
}

impl ResearchTask {
    /// Percentage of planned queries finished, 0 to 100.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_queries <= 0 {
            return 0.0;
        }
        let pct = self.completed_queries as f64 / self.total_queries as f64 * 100.0;
        pct.clamp(0.0, 100.0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn source_list(&self) -> Vec<String> {
        self.sources.as_ref().map(|s| s.0.clone()).unwrap_or_default()
    }

    pub fn image_list(&self) -> Vec<String> {
        self.images.as_ref().map(|s| s.0.clone()).unwrap_or_default()
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateResearchTask,
        id: Uuid,
        shape: ResearchShape,
    ) -> Result<Self, ResearchTaskError> {
        let task = sqlx::query_as::<_, ResearchTask>(
            r#"INSERT INTO research_tasks (
                id, query, report_type, tone, language, total_words, max_subtopics,
                status, total_depth, total_breadth
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9)
            RETURNING *"#,
        )
        .bind(id)
        .bind(&data.query)
        .bind(data.report_type)
        .bind(&data.tone)
        .bind(&data.language)
        .bind(data.total_words)
        .bind(data.max_subtopics)
        .bind(shape.total_depth)
        .bind(shape.total_breadth)
        .fetch_one(pool)
        .await?;

        Ok(task)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ResearchTask>("SELECT * FROM research_tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Newest first; ties on `created_at` fall back to insertion order.
    pub async fn list(
        pool: &SqlitePool,
        filter: &ResearchTaskFilter,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ResearchTask>(
            r#"SELECT * FROM research_tasks
               WHERE (?1 IS NULL OR status = ?1)
               ORDER BY created_at DESC, rowid DESC
               LIMIT ?2 OFFSET ?3"#,
        )
        .bind(filter.status.map(ResearchStatus::as_str))
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(pool)
        .await
    }

    /// Tasks a previous process left without a terminal status.
    pub async fn find_unfinished(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ResearchTask>(
            r#"SELECT * FROM research_tasks
               WHERE status IN ('pending', 'running', 'paused')
               ORDER BY created_at ASC"#,
        )
        .fetch_all(pool)
        .await
    }

    /// Moves the task to `to` if its current status allows it.
    pub async fn transition(
        pool: &SqlitePool,
        id: Uuid,
        to: ResearchStatus,
    ) -> Result<Self, ResearchTaskError> {
        Self::guarded_update(pool, id, to, to.legal_sources(), None, None).await
    }

    /// `paused -> running` only. A pending task is started by its execution
    /// unit, never by a resume.
    pub async fn resume(pool: &SqlitePool, id: Uuid) -> Result<Self, ResearchTaskError> {
        Self::guarded_update(
            pool,
            id,
            ResearchStatus::Running,
            &[ResearchStatus::Paused],
            None,
            None,
        )
        .await
    }

    pub async fn cancel(
        pool: &SqlitePool,
        id: Uuid,
        reason: &str,
    ) -> Result<Self, ResearchTaskError> {
        Self::guarded_update(
            pool,
            id,
            ResearchStatus::Cancelled,
            ResearchStatus::Cancelled.legal_sources(),
            Some(reason.to_string()),
            None,
        )
        .await
    }

    pub async fn fail(
        pool: &SqlitePool,
        id: Uuid,
        message: &str,
    ) -> Result<Self, ResearchTaskError> {
        Self::guarded_update(
            pool,
            id,
            ResearchStatus::Failed,
            ResearchStatus::Failed.legal_sources(),
            Some(message.to_string()),
            None,
        )
        .await
    }

    /// Writes the result payload and `completed` in one statement.
    pub async fn complete(
        pool: &SqlitePool,
        id: Uuid,
        result: &ResearchResult,
    ) -> Result<Self, ResearchTaskError> {
        Self::guarded_update(
            pool,
            id,
            ResearchStatus::Completed,
            ResearchStatus::Completed.legal_sources(),
            None,
            Some(result),
        )
        .await
    }

    async fn guarded_update(
        pool: &SqlitePool,
        id: Uuid,
        to: ResearchStatus,
        from: &[ResearchStatus],
        message: Option<String>,
        result: Option<&ResearchResult>,
    ) -> Result<Self, ResearchTaskError> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE research_tasks SET status = ");
        builder.push_bind(to.as_str());

        if to == ResearchStatus::Running {
            builder.push(", started_at = COALESCE(started_at, datetime('now', 'subsec'))");
        }
        if to.is_terminal() {
            builder.push(", completed_at = datetime('now', 'subsec')");
        }
        if let Some(message) = message {
            builder.push(", error_message = ");
            builder.push_bind(message);
        }
        if let Some(result) = result {
            builder.push(", report = ");
            builder.push_bind(result.report.clone());
            builder.push(", sources = ");
            builder.push_bind(Json(result.sources.clone()));
            builder.push(", images = ");
            builder.push_bind(Json(result.images.clone()));
            builder.push(", cost = MAX(cost, ");
            builder.push_bind(result.cost);
            builder.push(")");
        }

        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND status IN (");
        let mut sources = builder.separated(", ");
        for source in from {
            sources.push_bind(source.as_str());
        }
        sources.push_unseparated(") RETURNING *");

        let updated = builder
            .build_query_as::<ResearchTask>()
            .fetch_optional(pool)
            .await?;

        match updated {
            Some(task) => Ok(task),
            None => Err(Self::rejected(pool, id, to).await),
        }
    }

    async fn rejected(pool: &SqlitePool, id: Uuid, to: ResearchStatus) -> ResearchTaskError {
        match Self::find_by_id(pool, id).await {
            Ok(Some(current)) => ResearchTaskError::InvalidTransition {
                from: current.status,
                to,
            },
            Ok(None) => ResearchTaskError::NotFound,
            Err(e) => ResearchTaskError::Database(e),
        }
    }

    /// Merges a progress report. Counters and cost never move backwards.
    pub async fn apply_progress(
        pool: &SqlitePool,
        id: Uuid,
        update: &ProgressUpdate,
    ) -> Result<Self, ResearchTaskError> {
        let task = sqlx::query_as::<_, ResearchTask>(
            r#"UPDATE research_tasks SET
                current_depth     = MAX(current_depth,     COALESCE(?2, current_depth)),
                total_depth       = MAX(total_depth,       COALESCE(?3, total_depth)),
                current_breadth   = MAX(current_breadth,   COALESCE(?4, current_breadth)),
                total_breadth     = MAX(total_breadth,     COALESCE(?5, total_breadth)),
                completed_queries = MAX(completed_queries, COALESCE(?6, completed_queries)),
                total_queries     = MAX(total_queries,     COALESCE(?7, total_queries)),
                cost              = MAX(cost,              COALESCE(?8, cost))
            WHERE id = ?1
            RETURNING *"#,
        )
        .bind(id)
        .bind(update.current_depth.map(|v| v.max(0)))
        .bind(update.total_depth.map(|v| v.max(0)))
        .bind(update.current_breadth.map(|v| v.max(0)))
        .bind(update.total_breadth.map(|v| v.max(0)))
        .bind(update.completed_queries.map(|v| v.max(0)))
        .bind(update.total_queries.map(|v| v.max(0)))
        .bind(update.cost.filter(|c| c.is_finite()).map(|c| c.max(0.0)))
        .fetch_optional(pool)
        .await?;

        task.ok_or(ResearchTaskError::NotFound)
    }
}
