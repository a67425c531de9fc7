//! Task records, configuration and results

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a task
///
/// Transitions only follow `pending -> running -> {completed, failed,
/// cancelled}`; there is no transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transitions can occur
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Remote destination for delivering finished artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub target_dir: String,
}

/// Everything needed to build one repository for a set of platforms
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub repo_url: String,
    pub branch: String,
    /// Target platforms, built sequentially in list order
    pub platforms: Vec<String>,
    pub output_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadTarget>,
    /// Keep results on the building node instead of uploading them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_local: Option<bool>,
}

/// One built artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Rewritten once when the artifact lands in the output directory
    pub output_path: PathBuf,
    pub platform: String,
    pub size: u64,
    /// Wall-clock build duration in milliseconds
    pub build_time: u64,
}

/// A task record, created once and mutated in place by the orchestrator
///
/// Retained in memory for the process lifetime; only the explicit
/// clear-completed operation evicts records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub config: TaskConfig,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Vec<TaskResult>>,
    pub error: Option<String>,
    /// Advisory completion percentage, non-decreasing until terminal
    pub progress: u8,
    pub logs: Vec<String>,
    /// Most recent node observed running the task (coordinator's view)
    pub assigned_node: Option<Uuid>,
}

impl Task {
    /// Create a fresh pending record
    #[must_use]
    pub fn new(id: Uuid, config: TaskConfig) -> Self {
        Self {
            id,
            config,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            progress: 0,
            logs: Vec::new(),
            assigned_node: None,
        }
    }
}

/// One progress tick for a running task
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: Uuid,
    pub progress: u8,
    pub log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> TaskConfig {
        TaskConfig {
            repo_url: "https://example/repo.git".to_string(),
            branch: "main".to_string(),
            platforms: vec!["linux".to_string()],
            output_dir: PathBuf::from("/out"),
            build_script: None,
            install_script: None,
            env: None,
            upload: None,
            copy_local: None,
        }
    }

    #[test]
    fn new_task_is_pending() {
        let task = Task::new(Uuid::new_v4(), sample_config());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert!(task.started_at.is_none());
        assert!(task.logs.is_empty());
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn config_serializes_camel_case_and_omits_absent_fields() {
        let json = serde_json::to_string(&sample_config()).unwrap();
        assert!(json.contains("\"repoUrl\""));
        assert!(json.contains("\"outputDir\""));
        assert!(!json.contains("buildScript"));
        assert!(!json.contains("copyLocal"));
    }

    #[test]
    fn result_serializes_build_time() {
        let result = TaskResult {
            output_path: PathBuf::from("/out/build_linux_1.AppImage"),
            platform: "linux".to_string(),
            size: 1024,
            build_time: 90_000,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"buildTime\":90000"));
        assert!(json.contains("\"outputPath\""));
    }
}
