//! API request/response types.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::monitor::ScanReport;
use crate::orchestrator::{Orchestrator, Submission};
use crate::task::{
    decode_base64_image, ReferenceImage, RequestError, Style, TaskRequest, TaskStatus,
};

/// Request to submit a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    pub prompt: String,

    /// Base64 image bytes, optionally as a `data:` URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image_name: Option<String>,

    /// `cute`, `toy` or `cyber`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out_width: Option<usize>,

    /// Successful variants required; clamped to the width
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_success: Option<usize>,
}

impl SubmitTaskRequest {
    /// Encode a domain request for the wire.
    pub fn from_task_request(request: &TaskRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            reference_image: request
                .reference_image
                .as_ref()
                .map(|image| STANDARD.encode(&image.data)),
            reference_image_name: request
                .reference_image
                .as_ref()
                .map(|image| image.file_name.clone()),
            style: request.style.map(|s| s.to_string()),
            fan_out_width: Some(request.fan_out_width),
            min_success: Some(request.min_success),
        }
    }

    /// Decode into a domain request, falling back to the server's width and K defaults.
    pub fn into_task_request(self, orchestrator: &Orchestrator) -> Result<TaskRequest, RequestError> {
        let mut request = orchestrator.prepare(self.prompt, self.fan_out_width)?;
        if let Some(min_success) = self.min_success {
            request = request.with_min_success(min_success);
        }
        if let Some(style) = self.style.filter(|s| !s.trim().is_empty()) {
            let parsed = Style::parse(&style).ok_or(RequestError::UnknownStyle(style))?;
            request = request.with_style(parsed);
        }
        if let Some(encoded) = self.reference_image.filter(|s| !s.trim().is_empty()) {
            let data = decode_base64_image(&encoded)?;
            let name = self
                .reference_image_name
                .unwrap_or_else(|| "reference.png".to_string());
            request = request.with_reference_image(ReferenceImage::new(data, name));
        }
        Ok(request)
    }
}

/// Response after submitting a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub suggested_poll_interval_ms: u64,
}

impl From<Submission> for SubmitTaskResponse {
    fn from(s: Submission) -> Self {
        Self {
            task_id: s.task_id.to_string(),
            status: s.status,
            suggested_poll_interval_ms: s.suggested_poll_interval.as_millis() as u64,
        }
    }
}

/// Error body for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            task_id: None,
            suggestion: None,
        }
    }

    /// Body for an unknown or expired task.
    pub fn expired(task_id: impl Into<String>) -> Self {
        Self {
            error: "Task not found or expired".to_string(),
            task_id: Some(task_id.into()),
            suggestion: Some("Submit the task again".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskResponse {
    pub task_id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTimeoutResponse {
    #[serde(flatten)]
    pub report: ScanReport,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store_persistent: bool,
    pub monitor_enabled: bool,
}
