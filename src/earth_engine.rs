mod client;
mod expr;
pub use client::EarthEngineClient;
pub use expr::{Expr, MAPPING_VAR};

use anyhow::Result;
use serde_json::Value;

/// A GeoTIFF export of a single image into a Drive folder
#[derive(Debug, Clone, PartialEq)]
pub struct ImageExport {
    pub image: Expr,
    pub description: String,
    pub folder: String,
    pub file_name_prefix: String,
    pub max_pixels: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Maps the operation states reported by the REST API.
    pub fn from_remote(state: &str) -> Self {
        match state {
            "RUNNING" | "CANCELLING" => Self::Running,
            "SUCCEEDED" | "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self: &Self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub error: Option<String>,
}

/// Handle on a remote export. Only ever updated from polled status.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTask {
    pub id: String,
    pub file_name: String,
    pub state: TaskState,
    pub error: Option<String>,
}

pub trait EarthEngineOps {
    async fn compute_value(self: &Self, expr: &Expr) -> Result<Value>;

    async fn start_export(self: &Self, export: &ImageExport) -> Result<ExportTask>;

    async fn task_status(self: &Self, task_id: &str) -> Result<TaskStatus>;
}
