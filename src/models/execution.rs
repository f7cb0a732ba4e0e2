use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an execution.
///
/// Transitions are strictly forward (`Created` → `Scheduled` → `Running`
/// → `Finished`); `Finished` is terminal and covers both successful and
/// failed pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Created,
    Scheduled,
    Running,
    Finished,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Scheduled => "scheduled",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Finished => "finished",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(ExecutionStatus::Created),
            "scheduled" => Some(ExecutionStatus::Scheduled),
            "running" => Some(ExecutionStatus::Running),
            "finished" => Some(ExecutionStatus::Finished),
            _ => None,
        }
    }
}

/// One recorded attempt to run the build pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub status: ExecutionStatus,
    pub create_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl Execution {
    /// `start_date` set and `end_date` unset is the authoritative
    /// definition of a running execution; no other flag exists.
    pub fn is_running(&self) -> bool {
        self.start_date.is_some() && self.end_date.is_none()
    }
}
