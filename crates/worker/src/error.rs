use sketchforge_core::error::CoreError;
use sketchforge_core::scheduling::JobState;
use sketchforge_core::types::JobId;

/// Errors from queue manager operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Backpressure: too many jobs are already waiting.
    #[error("Queue is full ({depth} jobs waiting)")]
    QueueFull { depth: usize },

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The job exists but has no image to hand out.
    #[error("Job {id} is {state}, not completed")]
    NotReady { id: JobId, state: JobState },
}

impl From<CoreError> for QueueError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(msg) => QueueError::InvalidInput(msg),
            CoreError::Conflict(msg) | CoreError::Internal(msg) => QueueError::Conflict(msg),
            CoreError::NotFound { entity, id } => {
                QueueError::InvalidInput(format!("{entity} {id} not found"))
            }
        }
    }
}
