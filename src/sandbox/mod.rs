//! The sandbox's process-execution interface.
//!
//! The process table is owned by the sandbox, an external authority. The
//! gateway only observes records through list queries and issues
//! start/kill commands; it never mutates a record directly.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

pub use http::HttpSandbox;

/// Lifecycle status of a process inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    Failed,
}

impl ProcessStatus {
    /// Starting or Running: the record counts against the one-instance
    /// invariant.
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One observed instance of a process in the sandbox's table. Identifiers
/// are opaque and never reused across starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: String,
    pub command: String,
    pub status: ProcessStatus,
    pub exit_code: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    /// Whether this record matches the agent-process signature.
    pub fn matches(&self, signature: &str) -> bool {
        self.command.contains(signature)
    }
}

/// Captured output of a process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Process execution surface the supervisor consumes — and nothing more.
#[async_trait]
pub trait SandboxProcesses: Send + Sync {
    /// Issue a start command. The returned record is typically `starting`.
    async fn start_process(&self, command: &str) -> Result<ProcessRecord, SandboxError>;

    /// Snapshot of the sandbox's process table.
    async fn list_processes(&self) -> Result<Vec<ProcessRecord>, SandboxError>;

    /// Issue a kill command for the given process.
    async fn kill_process(&self, id: &str) -> Result<(), SandboxError>;

    /// Captured stdout/stderr for the given process.
    async fn process_logs(&self, id: &str) -> Result<ProcessLogs, SandboxError>;

    /// Wait until `port` accepts connections inside the sandbox, bounded by
    /// `timeout`. Returns immediately when the port is already reachable.
    async fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<(), SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(command: &str, status: ProcessStatus) -> ProcessRecord {
        ProcessRecord {
            id: "p-1".to_string(),
            command: command.to_string(),
            status,
            exit_code: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[test]
    fn test_status_is_alive() {
        assert!(ProcessStatus::Starting.is_alive());
        assert!(ProcessStatus::Running.is_alive());
        assert!(!ProcessStatus::Completed.is_alive());
        assert!(!ProcessStatus::Failed.is_alive());
    }

    #[test]
    fn test_record_signature_match() {
        let r = record("sh -c 'agent serve --port 4100'", ProcessStatus::Running);
        assert!(r.matches("agent serve --port 4100"));
        assert!(!r.matches("other-daemon"));
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&ProcessStatus::Starting).unwrap();
        assert_eq!(json, "\"starting\"");
        let status: ProcessStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, ProcessStatus::Failed);
    }
}
