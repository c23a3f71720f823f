use thiserror::Error;

use crate::model::Stage;

/// A single failed attempt against the generation service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("generation service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed completion envelope: {0}")]
    Envelope(String),

    #[error("generation request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("generation failed after {attempts} attempt(s): {last_error}")]
    GenerationFailure {
        attempts: u32,
        last_error: GenerationError,
    },

    #[error("no structured record could be extracted from the response")]
    ParseFailure,

    #[error("stage {} produced no usable records", .0.as_str())]
    StageEmpty(Stage),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("run task aborted: {0}")]
    Aborted(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
