//! Server-sent event stream over reqwest.
//!
//! Turns an HTTP response body into a lazy stream of [`StreamEvent`]s using
//! the incremental [`FrameDecoder`]. Dropping the stream drops the response
//! and releases the connection.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::ACCEPT;
use serde_json::Value;
use tracing::{debug, info};

use cadence_core::frame::{FrameDecoder, StreamEvent};

use crate::error::PipelineError;

pub type EventStream = BoxStream<'static, Result<StreamEvent, PipelineError>>;

/// POST `body` to `url` and stream back the decoded events.
pub async fn open_event_stream(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
) -> Result<EventStream, PipelineError> {
    let resp = client
        .post(url)
        .header(ACCEPT, "text/event-stream")
        .json(body)
        .send()
        .await
        .map_err(|e| PipelineError::Transport(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(PipelineError::Status { status, body });
    }

    info!("event stream open: {url}");
    Ok(decode_frames(resp.bytes_stream()))
}

struct DecodeState<S> {
    bytes: Pin<Box<S>>,
    decoder: FrameDecoder,
    ready: VecDeque<StreamEvent>,
    done: bool,
}

/// Decode a byte-chunk stream into events. A read error is yielded once and
/// ends the stream.
pub fn decode_frames<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: FrameDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.ready.pop_front() {
                debug!("frame: {}", event.kind);
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.push(chunk.as_ref());
                    st.ready.extend(events);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(PipelineError::Transport(e.to_string())), st));
                }
                None => {
                    st.done = true;
                    let tail = st.decoder.finish();
                    st.ready.extend(tail);
                }
            }
        }
    })
    .boxed()
}
