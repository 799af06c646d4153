//! HTTP control API for the speech engine.
//!
//! CORS-permissive so a browser front end on another localhost port can
//! stream tokens in directly.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use cadence_core::types::SpeechStatus;
use cadence_core::voice::Voice;

use crate::tts::SpeechEngine;

/// Build the axum router with a shared [`SpeechEngine`].
pub fn router(engine: SpeechEngine) -> Router {
    Router::new()
        .route("/speak", post(speak))
        .route("/stream/chunk", post(stream_chunk))
        .route("/stream/end", post(stream_end))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .route("/voices", get(voices))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

#[derive(Deserialize)]
struct TextRequest {
    text: String,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

const OK: Json<OkResponse> = Json(OkResponse { ok: true });

async fn speak(State(engine): State<SpeechEngine>, Json(req): Json<TextRequest>) -> Json<OkResponse> {
    engine.speak(&req.text);
    OK
}

async fn stream_chunk(
    State(engine): State<SpeechEngine>,
    Json(req): Json<TextRequest>,
) -> Json<OkResponse> {
    engine.feed_token(&req.text);
    OK
}

async fn stream_end(State(engine): State<SpeechEngine>) -> Json<OkResponse> {
    engine.flush();
    OK
}

async fn stop(State(engine): State<SpeechEngine>) -> Json<OkResponse> {
    engine.stop();
    OK
}

async fn status(State(engine): State<SpeechEngine>) -> Json<SpeechStatus> {
    engine.sync().await;
    Json(engine.status())
}

async fn voices(State(engine): State<SpeechEngine>) -> Json<Vec<Voice>> {
    Json(engine.voices().await)
}
