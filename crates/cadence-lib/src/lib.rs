//! cadence-lib — streaming speech engine.
//!
//! Playback controller, Kokoro synthesis with rodio output, SSE event
//! stream, pipeline orchestration, and HTTP control API.
//! Depends on cadence-core for pure types and text processing.

pub mod error;
pub mod pcm_source;
pub mod pipeline;
pub mod playback;
pub mod server;
pub mod stream;
pub mod tts;

#[cfg(test)]
pub(crate) mod testing;

// Re-export cadence-core for convenience
pub use cadence_core;
