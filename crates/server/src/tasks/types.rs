//! Task queue types.
//!
//! Every task function declares a typed parameter struct; the queue
//! stores the tagged union as JSON. Failures are a typed variant of the
//! result, never a serialised exception.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed parameters, one variant per task function. The serialized form
/// doubles as the dedup key: submitting the same variant with the same
/// fields twice yields the same task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum TaskParams {
    /// Pre-compute progressively smaller derivatives of a large original.
    BuildPyramid { image_id: i64, format: String },

    /// Rasterise the pages of a PDF into the temp directory.
    BurstPdf { src: String, dpi: u32 },

    /// Move a folder: database paths, cached mappings and the physical
    /// directory.
    MoveFolder { folder_id: i64, target_path: String },

    /// Permanently remove the data of a deleted folder.
    PurgeFolderData { folder_id: i64 },

    /// Delete stale temporary files.
    CleanupTempFiles { max_age_hours: u32 },
}

impl TaskParams {
    /// The function name stored alongside the parameters.
    pub fn funcname(&self) -> &'static str {
        match self {
            TaskParams::BuildPyramid { .. } => "build_pyramid",
            TaskParams::BurstPdf { .. } => "burst_pdf",
            TaskParams::MoveFolder { .. } => "move_folder",
            TaskParams::PurgeFolderData { .. } => "purge_folder_data",
            TaskParams::CleanupTempFiles { .. } => "cleanup_temp_files",
        }
    }
}

/// Task priority; lower numbers dispatch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    pub fn as_i16(self) -> i16 {
        match self {
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Complete,
}

impl TaskStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Active => 1,
            TaskStatus::Complete => 2,
        }
    }

    pub fn from_i16(v: i16) -> TaskStatus {
        match v {
            1 => TaskStatus::Active,
            2 => TaskStatus::Complete,
            _ => TaskStatus::Pending,
        }
    }
}

/// The stored result of a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        #[serde(default)]
        detail: serde_json::Value,
    },
    Failed {
        kind: String,
        message: String,
    },
}

impl TaskOutcome {
    pub fn completed(detail: serde_json::Value) -> Self {
        TaskOutcome::Completed { detail }
    }

    pub fn failed(kind: &str, message: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }
}

/// A task row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: Uuid,
    pub owner_id: Option<Uuid>,
    pub name: String,
    pub funcname: String,
    pub params: serde_json::Value,
    pub priority: i16,
    pub status: i16,
    pub result: Option<serde_json::Value>,
    pub lock_id: Option<String>,
    pub keep_for_secs: i32,
    pub keep_until: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_i16(self.status)
    }

    /// Decode the typed parameters.
    pub fn typed_params(&self) -> Option<TaskParams> {
        serde_json::from_value(self.params.clone()).ok()
    }

    /// Decode the typed outcome, when the task has one.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.result
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn params_round_trip_and_dedup_key_is_stable() {
        let params = TaskParams::BuildPyramid {
            image_id: 42,
            format: "jpg".into(),
        };
        let a = serde_json::to_value(&params).unwrap();
        let b = serde_json::to_value(&params).unwrap();
        assert_eq!(a, b);

        let back: TaskParams = serde_json::from_value(a).unwrap();
        assert_eq!(back, params);
        assert_eq!(params.funcname(), "build_pyramid");
    }

    #[test]
    fn different_params_have_different_encodings() {
        let a = serde_json::to_value(TaskParams::PurgeFolderData { folder_id: 1 }).unwrap();
        let b = serde_json::to_value(TaskParams::PurgeFolderData { folder_id: 2 }).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn outcome_failure_is_typed() {
        let outcome = TaskOutcome::failed("ImageError", "decode failed");
        let json = serde_json::to_value(&outcome).unwrap();
        let back: TaskOutcome = serde_json::from_value(json).unwrap();
        assert!(back.is_failure());
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::High.as_i16() < TaskPriority::Normal.as_i16());
        assert!(TaskPriority::Normal.as_i16() < TaskPriority::Low.as_i16());
    }
}
