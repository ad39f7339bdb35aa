//! Run data models.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Run lifecycle status. Transitions only move forward:
/// pending -> running -> {completed | failed | cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Persisted, waiting in the conversation queue.
    Pending,
    /// The subprocess is alive.
    Running,
    /// Process exited with status 0.
    Completed,
    /// Launch failure, nonzero exit, timeout, or orphan recovery.
    Failed,
    /// Cancelled by request or prompt timeout.
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(format!("unknown run status: {}", s)),
        }
    }
}

// Implement conversion from String for SQLx
impl TryFrom<String> for RunStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One command execution, end-to-end, with persisted lifecycle status.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    /// Assigned identifier (rowid).
    pub id: i64,
    /// Conversation this run belongs to.
    pub conversation_id: String,
    /// Requesting user.
    pub user_id: String,
    /// Registered project id.
    pub project_id: String,
    /// Full command text (program + arguments).
    pub command: String,
    /// Current lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: RunStatus,
    /// When the run was enqueued.
    pub created_at: String,
    /// When the subprocess started.
    pub started_at: Option<String>,
    /// When the run reached a terminal status.
    pub completed_at: Option<String>,
    /// Truncated output, newest content preserved.
    pub result: Option<String>,
    /// Error text for failed runs.
    pub error: Option<String>,
}

/// A request to execute a command. Ephemeral: lives only in the queue.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Run id assigned at enqueue time.
    pub run_id: i64,
    pub conversation_id: String,
    pub user_id: String,
    pub project_id: String,
    /// Program to execute (never a shell).
    pub program: String,
    /// Explicit argument vector.
    pub args: Vec<String>,
    /// Validated working directory.
    pub workdir: PathBuf,
    pub enqueued_at: DateTime<Utc>,
}

impl RunRequest {
    /// The command as a single display string, as persisted in the store.
    pub fn command_text(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}
