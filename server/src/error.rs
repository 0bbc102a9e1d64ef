use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tts_core::CodecError;

/// API Error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response structure
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message.clone(),
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Failures inside a narration session.
///
/// `Synthesis`, `Transcode` and `Unspeakable` cost one sentence and are
/// absorbed where they happen. The others end the session as failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("narration stream failed: {0:#}")]
    UpstreamStream(anyhow::Error),

    #[error("synthesis failed for sentence {index}: {reason:#}")]
    Synthesis { index: u64, reason: anyhow::Error },

    #[error("sentence {index} has nothing to speak")]
    Unspeakable { index: u64 },

    #[error("transcode failed for chunk {index}: {source}")]
    Transcode {
        index: u64,
        #[source]
        source: CodecError,
    },

    #[error("encoder setup failed: {0}")]
    EncoderSetup(#[source] CodecError),

    #[error("sink write failed: {0}")]
    SinkIo(#[from] std::io::Error),

    #[error("pipeline task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Whether the error ends the whole session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::Synthesis { .. }
                | PipelineError::Unspeakable { .. }
                | PipelineError::Transcode { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_sentence_errors_are_not_fatal() {
        let synthesis = PipelineError::Synthesis {
            index: 1,
            reason: anyhow::anyhow!("503"),
        };
        assert!(!synthesis.is_fatal());
        assert!(!PipelineError::Unspeakable { index: 0 }.is_fatal());
        assert!(!PipelineError::Transcode {
            index: 2,
            source: CodecError::NoAudioTrack
        }
        .is_fatal());
    }

    #[test]
    fn test_stream_and_sink_errors_are_fatal() {
        assert!(PipelineError::UpstreamStream(anyhow::anyhow!("reset")).is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(PipelineError::from(io).is_fatal());
    }

    #[test]
    fn test_api_error_statuses() {
        let cases = [
            (ApiError::InvalidInput("offset".into()), StatusCode::BAD_REQUEST),
            (ApiError::NotFound("session".into()), StatusCode::NOT_FOUND),
            (
                ApiError::InternalError("disk".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
