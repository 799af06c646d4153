//! cadence-core — Pure types, stream frame decoding and text processing.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod event;
pub mod frame;
pub mod text_prep;
pub mod types;
pub mod voice;
