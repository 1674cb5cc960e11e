use db::models::research_task::{ProgressUpdate, ResearchStatus, ResearchTask};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Persisted progress counters as of some instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct ProgressSnapshot {
    pub current_depth: i32,
    pub total_depth: i32,
    pub current_breadth: i32,
    pub total_breadth: i32,
    pub completed_queries: i32,
    pub total_queries: i32,
    pub cost: f64,
}

impl From<&ResearchTask> for ProgressSnapshot {
    fn from(task: &ResearchTask) -> Self {
        Self {
            current_depth: task.current_depth,
            total_depth: task.total_depth,
            current_breadth: task.current_breadth,
            total_breadth: task.total_breadth,
            completed_queries: task.completed_queries,
            total_queries: task.total_queries,
            cost: task.cost,
        }
    }
}

/// Events pushed to observers of a research task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResearchEvent {
    Connected {
        task_id: Uuid,
        status: ResearchStatus,
        progress: ProgressSnapshot,
        progress_percentage: f64,
    },
    Started {
        task_id: Uuid,
        estimated_time_minutes: u32,
    },
    Progress {
        task_id: Uuid,
        data: ProgressUpdate,
    },
    Paused {
        task_id: Uuid,
    },
    Resumed {
        task_id: Uuid,
    },
    CommandRejected {
        task_id: Uuid,
        command: String,
        error: String,
    },
    Completed {
        task_id: Uuid,
        report: String,
        sources: Vec<String>,
        images: Vec<String>,
        cost: f64,
    },
    Error {
        task_id: Uuid,
        error: String,
    },
    Cancelled {
        task_id: Uuid,
        reason: String,
    },
}

impl ResearchEvent {
    pub fn connected(task: &ResearchTask) -> Self {
        ResearchEvent::Connected {
            task_id: task.id,
            status: task.status,
            progress: ProgressSnapshot::from(task),
            progress_percentage: task.progress_percentage(),
        }
    }

    /// Terminal event matching a record already in a terminal status.
    pub fn terminal_for(task: &ResearchTask) -> Option<Self> {
        let event = match task.status {
            ResearchStatus::Completed => ResearchEvent::Completed {
                task_id: task.id,
                report: task.report.clone().unwrap_or_default(),
                sources: task.source_list(),
                images: task.image_list(),
                cost: task.cost,
            },
            ResearchStatus::Failed => ResearchEvent::Error {
                task_id: task.id,
                error: task
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "research failed".to_string()),
            },
            ResearchStatus::Cancelled => ResearchEvent::Cancelled {
                task_id: task.id,
                reason: task
                    .error_message
                    .clone()
                    .unwrap_or_else(|| CANCELLED_BY_USER.to_string()),
            },
            _ => return None,
        };
        Some(event)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResearchEvent::Completed { .. }
                | ResearchEvent::Error { .. }
                | ResearchEvent::Cancelled { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResearchEvent::Connected { .. } => "connected",
            ResearchEvent::Started { .. } => "started",
            ResearchEvent::Progress { .. } => "progress",
            ResearchEvent::Paused { .. } => "paused",
            ResearchEvent::Resumed { .. } => "resumed",
            ResearchEvent::CommandRejected { .. } => "command_rejected",
            ResearchEvent::Completed { .. } => "completed",
            ResearchEvent::Error { .. } => "error",
            ResearchEvent::Cancelled { .. } => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn events_are_tagged_by_name() {
        let task_id = Uuid::new_v4();
        let event = ResearchEvent::Completed {
            task_id,
            report: "R".to_string(),
            sources: vec!["https://a.example".to_string()],
            images: vec![],
            cost: 0.2,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "completed");
        assert_eq!(value["report"], "R");
        assert_eq!(value["task_id"], json!(task_id));
        assert!(event.is_terminal());
    }

    #[test]
    fn progress_payload_skips_absent_fields() {
        let event = ResearchEvent::Progress {
            task_id: Uuid::new_v4(),
            data: ProgressUpdate {
                completed_queries: Some(5),
                cost: Some(0.05),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "progress");
        assert_eq!(value["data"], json!({ "completed_queries": 5, "cost": 0.05 }));
        assert!(!event.is_terminal());
    }

    #[test]
    fn command_rejected_uses_snake_case_tag() {
        let event = ResearchEvent::CommandRejected {
            task_id: Uuid::new_v4(),
            command: "pause".to_string(),
            error: "Execution not paused".to_string(),
        };
        assert_eq!(serde_json::to_value(&event).unwrap()["event"], "command_rejected");
        assert_eq!(event.name(), "command_rejected");
    }
}
