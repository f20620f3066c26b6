//! Domain types persisted in PostgreSQL.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Task lifecycle status. DONE is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    ToDo,
    Running,
    Done,
}

impl TaskStatus {
    /// Wire code stored in the `status SMALLINT` column.
    pub fn code(self) -> i16 {
        match self {
            TaskStatus::ToDo => 0,
            TaskStatus::Running => 1,
            TaskStatus::Done => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::ToDo),
            1 => Some(TaskStatus::Running),
            2 => Some(TaskStatus::Done),
            _ => None,
        }
    }
}

/// Task metadata, stored as JSONB.
///
/// `engine` and `inputs` come from the submitter; the remaining fields
/// are filled in by the scheduler as the task progresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub engine: String,
    /// Input filename → content.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Requested core count; falls back to the node's probed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ncpus: Option<u32>,
    /// Working directory on the assigned node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_dir: Option<String>,
    /// Directory the outputs were downloaded into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<String>,
    /// Output filename → error, for files that failed to download.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub download_errors: BTreeMap<String, String>,
    /// Terminal error note when a task finished abnormally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A row of `yascheduler_tasks`.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: i32,
    pub label: String,
    pub metadata: TaskMetadata,
    pub ip: Option<String>,
    pub status: TaskStatus,
}

/// A row of `yascheduler_nodes`.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub ip: String,
    pub ncpus: Option<i16>,
    pub enabled: bool,
    /// Provider tag; `None` for statically registered nodes.
    pub cloud: Option<String>,
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [TaskStatus::ToDo, TaskStatus::Running, TaskStatus::Done] {
            assert_eq!(TaskStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TaskStatus::from_code(3), None);
        assert_eq!(TaskStatus::ToDo.code(), 0);
        assert_eq!(TaskStatus::Running.code(), 1);
        assert_eq!(TaskStatus::Done.code(), 2);
    }

    #[test]
    fn metadata_omits_empty_fields() {
        let meta = TaskMetadata {
            engine: "dummy".to_string(),
            ..TaskMetadata::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json, serde_json::json!({ "engine": "dummy" }));
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let mut meta = TaskMetadata {
            engine: "dummy".to_string(),
            webhook_url: Some("https://example.org/hook".to_string()),
            ncpus: Some(8),
            ..TaskMetadata::default()
        };
        meta.inputs.insert("1.input".to_string(), "hello".to_string());
        meta.download_errors
            .insert("1.input.out".to_string(), "connection lost".to_string());

        let json = serde_json::to_value(&meta).unwrap();
        let back: TaskMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn metadata_tolerates_unknown_and_missing_fields() {
        let json = serde_json::json!({ "engine": "dummy", "someday": true });
        let meta: TaskMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(meta.engine, "dummy");
        assert!(meta.inputs.is_empty());
        assert!(meta.webhook_url.is_none());
    }
}
