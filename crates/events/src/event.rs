//! Lifecycle event envelope.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sketchforge_core::failure::JobFailure;
use sketchforge_core::job_events::{
    MSG_TYPE_CANCELLED, MSG_TYPE_COMPLETED, MSG_TYPE_CONNECTED, MSG_TYPE_ERROR,
    MSG_TYPE_PROGRESS, MSG_TYPE_STARTED, PROGRESS_DONE,
};
use sketchforge_core::types::{JobId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressEventType {
    Connected,
    Started,
    Progress,
    Completed,
    Error,
    Cancelled,
}

impl ProgressEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressEventType::Connected => MSG_TYPE_CONNECTED,
            ProgressEventType::Started => MSG_TYPE_STARTED,
            ProgressEventType::Progress => MSG_TYPE_PROGRESS,
            ProgressEventType::Completed => MSG_TYPE_COMPLETED,
            ProgressEventType::Error => MSG_TYPE_ERROR,
            ProgressEventType::Cancelled => MSG_TYPE_CANCELLED,
        }
    }

    /// Terminal events end progress tracking for their job.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressEventType::Completed | ProgressEventType::Error | ProgressEventType::Cancelled
        )
    }
}

/// One message on the shared real-time stream.
///
/// Every subscriber receives every event; consumers filter by `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,

    /// `None` only for the `connected` welcome message.
    pub job_id: Option<JobId>,

    pub message: String,

    /// Completion percentage (0-100), non-decreasing per job.
    pub progress: u8,

    pub timestamp: Timestamp,

    /// Failure detail, present on `error` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl ProgressEvent {
    fn new(
        event_type: ProgressEventType,
        job_id: Option<JobId>,
        message: impl Into<String>,
        progress: u8,
    ) -> Self {
        Self {
            event_type,
            job_id,
            message: message.into(),
            progress: progress.min(PROGRESS_DONE),
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn connected() -> Self {
        Self::new(ProgressEventType::Connected, None, "connected", 0)
    }

    pub fn started(job_id: JobId, progress: u8, message: impl Into<String>) -> Self {
        Self::new(ProgressEventType::Started, Some(job_id), message, progress)
    }

    pub fn progress(job_id: JobId, progress: u8, message: impl Into<String>) -> Self {
        Self::new(ProgressEventType::Progress, Some(job_id), message, progress)
    }

    pub fn completed(job_id: JobId, message: impl Into<String>) -> Self {
        Self::new(
            ProgressEventType::Completed,
            Some(job_id),
            message,
            PROGRESS_DONE,
        )
    }

    pub fn error(job_id: JobId, failure: JobFailure) -> Self {
        let mut event = Self::new(
            ProgressEventType::Error,
            Some(job_id),
            failure.message.clone(),
            0,
        );
        event.error = Some(failure);
        event
    }

    pub fn cancelled(job_id: JobId) -> Self {
        Self::new(ProgressEventType::Cancelled, Some(job_id), "cancelled", 0)
    }
}

#[cfg(test)]
mod tests {
    use sketchforge_core::failure::FailureKind;

    use super::*;

    #[test]
    fn serializes_type_field() {
        let job = uuid::Uuid::new_v4();
        let json = serde_json::to_value(ProgressEvent::progress(job, 25, "generating")).unwrap();

        assert_eq!(json["type"], "progress");
        assert_eq!(json["job_id"], job.to_string());
        assert_eq!(json["progress"], 25);
        assert_eq!(json["message"], "generating");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn error_event_carries_failure() {
        let job = uuid::Uuid::new_v4();
        let failure = JobFailure::new(FailureKind::Timeout, "provider timed out");
        let json = serde_json::to_value(ProgressEvent::error(job, failure)).unwrap();

        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["kind"], "timeout");
        assert_eq!(json["error"]["retryable"], true);
    }

    #[test]
    fn progress_is_clamped_to_100() {
        let event = ProgressEvent::progress(uuid::Uuid::new_v4(), 250, "x");
        assert_eq!(event.progress, 100);
    }

    #[test]
    fn welcome_has_no_job() {
        let event = ProgressEvent::connected();
        assert_eq!(event.event_type.as_str(), "connected");
        assert!(event.job_id.is_none());
    }
}
