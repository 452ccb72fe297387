use crate::role::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Dispatch rank; lower dispatches first.
    pub fn rank(self) -> i64 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Ok(Priority::High),
            "NORMAL" => Ok(Priority::Normal),
            "LOW" => Ok(Priority::Low),
            _ => Err(format!("unknown priority {s:?} (expected HIGH, NORMAL or LOW)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of the last execution failure, as surfaced on a `FAILED` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub retryable: bool,
    pub message: String,
}

/// Unit of work as submitted; becomes a [`Task`] once the scheduler accepts it.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub payload: Value,
    pub priority: Priority,
    pub backend: String,
    pub owner_role: Role,
    pub owner_subject: String,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub payload: Value,
    pub priority: Priority,
    pub backend: String,
    pub owner_role: Role,
    pub owner_subject: String,
    pub state: TaskState,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub eligible_after: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub aging_boost: u32,
    pub result: Option<Value>,
    pub last_error: Option<FailureInfo>,
}

impl Task {
    pub(crate) fn accept(new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            payload: new.payload,
            priority: new.priority,
            backend: new.backend,
            owner_role: new.owner_role,
            owner_subject: new.owner_subject,
            state: TaskState::Queued,
            enqueued_at: now,
            last_attempt_at: None,
            eligible_after: now,
            finished_at: None,
            attempt: 0,
            aging_boost: 0,
            result: None,
            last_error: None,
        }
    }

    /// `priority_rank - aging_boost`; may go negative for long-starved tasks.
    pub fn effective_rank(&self) -> i64 {
        self.priority.rank() - i64::from(self.aging_boost)
    }

    pub fn to_result(&self) -> TaskResult {
        TaskResult {
            task_id: self.id.clone(),
            status: self.state,
            priority: self.priority,
            attempt: self.attempt,
            result: self.result.clone(),
            error: self.last_error.clone(),
        }
    }
}

/// Externally visible snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskState,
    pub priority: Priority,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("high".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("Normal".parse::<Priority>(), Ok(Priority::Normal));
        assert_eq!("LOW".parse::<Priority>(), Ok(Priority::Low));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn higher_priority_ranks_lower() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }
}
