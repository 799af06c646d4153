//! Error taxonomy for the stream and speech halves of the pipeline.
//!
//! Cancellation is deliberately absent: a user abort ends a pipeline with
//! [`crate::pipeline::PipelineOutcome::Cancelled`], not an error.

/// Failure of the inbound event stream. Ends the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stream transport failed: {0}")]
    Transport(String),

    #[error("stream request returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Carried by an `error` frame from the backend.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("pipeline task failed: {0}")]
    Task(String),
}

/// Failure to synthesize or play one utterance. Never fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisError {
    #[error("synthesis request failed: {0}")]
    Request(String),

    #[error("synthesis returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("playback failed: {0}")]
    Playback(String),
}
