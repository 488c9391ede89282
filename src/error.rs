use crate::bridge::FailureKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("{tool} exited with code {}", code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    NonZeroExit { tool: String, code: Option<i32> },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("restricted content: {0}")]
    RestrictedContent(String),

    #[error("metadata fetch timed out after {secs}s")]
    FetchTimeout { secs: u64 },

    #[error("metadata output invalid: {0}")]
    MetadataInvalid(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unknown work item: {0}")]
    UnknownItem(String),

    #[error("download canceled")]
    Canceled,

    #[error("a process is already running on this supervisor")]
    SupervisorBusy,

    #[error("the queue is already running")]
    QueueBusy,

    #[error("http error: {0}")]
    Http(String),
}

impl EngineError {
    /// Classification used by the consumer to pick between a blocking dialog
    /// and a transient notice.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::RestrictedContent(_) => FailureKind::Restricted,
            EngineError::ExternalToolMissing { .. } => FailureKind::ToolMissing,
            EngineError::Canceled => FailureKind::Canceled,
            EngineError::FetchTimeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_exit_message_includes_code() {
        let err = EngineError::NonZeroExit {
            tool: "yt-dlp".to_string(),
            code: Some(2),
        };
        assert_eq!(err.to_string(), "yt-dlp exited with code 2");
        assert_eq!(err.failure_kind(), FailureKind::Other);
    }

    #[test]
    fn restricted_and_missing_tool_are_classified_distinctly() {
        assert_eq!(
            EngineError::RestrictedContent("members only".to_string()).failure_kind(),
            FailureKind::Restricted
        );
        assert_eq!(
            EngineError::ExternalToolMissing {
                tool: "yt-dlp".to_string()
            }
            .failure_kind(),
            FailureKind::ToolMissing
        );
        assert_eq!(EngineError::Canceled.failure_kind(), FailureKind::Canceled);
    }
}
