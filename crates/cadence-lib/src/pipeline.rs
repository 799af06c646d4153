//! Pipeline orchestrator — decoded stream events → message sink + speech.
//!
//! ```text
//! start / progress ─▶ sink.on_progress
//! text             ─▶ sink.on_token + speech.feed_token
//! complete         ─▶ sink.on_complete + speech.flush     (Completed)
//! error            ─▶ sink.on_error + speech.stop         (Failed)
//! end of stream    ─▶ speech.flush                        (Ended)
//! ```
//!
//! A [`PipelineHandle`] owns the running pipeline. Cancelling it aborts the
//! network stream and then stops speech, exactly once; no speech call from
//! the stream task gets through after that. Dropping the handle cancels a
//! pipeline that is still running but leaves one that finished on its own
//! alone, so speech flushed on `complete` plays out.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cadence_core::event::{PipelineEvent, Progress};
use cadence_core::frame::StreamEvent;

use crate::error::PipelineError;
use crate::stream::open_event_stream;

/// Speech operations the orchestrator drives.
pub trait SpeechControl: Send + Sync + 'static {
    fn feed_token(&self, token: &str);
    fn flush(&self);
    fn stop(&self);
}

/// Receiver of the user-visible message state.
pub trait MessageSink: Send + 'static {
    fn on_progress(&mut self, progress: &Progress);
    fn on_token(&mut self, token: &str);
    fn on_complete(&mut self, completion: &Completion);
    fn on_error(&mut self, message: &str);
}

/// Final message content.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// All text tokens, concatenated.
    pub text: String,
    pub message_id: Option<String>,
    pub hypothesis: Option<String>,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    /// A `complete` event arrived.
    Completed { message_id: Option<String> },
    /// The stream ended without `complete`.
    Ended,
    Cancelled,
    Failed(PipelineError),
}

/// Drive `events` to the end, the first `complete` or `error`, or until
/// `cancel` fires.
///
/// On cancellation this returns without touching speech; stopping it is up
/// to whoever cancelled.
pub async fn run_pipeline<E, Si, Sp>(
    mut events: E,
    sink: &mut Si,
    speech: &Sp,
    cancel: &CancellationToken,
) -> PipelineOutcome
where
    E: Stream<Item = Result<StreamEvent, PipelineError>> + Unpin,
    Si: MessageSink + ?Sized,
    Sp: SpeechControl + ?Sized,
{
    let mut text = String::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("pipeline cancelled");
                return PipelineOutcome::Cancelled;
            }
            next = events.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return fail(sink, speech, e),
            None => {
                info!("event stream ended without completion");
                speech.flush();
                return PipelineOutcome::Ended;
            }
        };

        let kind = frame.kind.clone();
        let Some(event) = PipelineEvent::from_stream_event(frame) else {
            warn!("dropping malformed {kind} event");
            continue;
        };

        match event {
            PipelineEvent::Start { total_images } => sink.on_progress(&Progress {
                step: "start".into(),
                image: None,
                total_images,
            }),
            PipelineEvent::Progress(progress) => sink.on_progress(&progress),
            PipelineEvent::Text(token) => {
                if token.is_empty() {
                    continue;
                }
                text.push_str(&token);
                sink.on_token(&token);
                speech.feed_token(&token);
            }
            PipelineEvent::Complete(complete) => {
                let completion = Completion {
                    text: std::mem::take(&mut text),
                    message_id: complete.message_id,
                    hypothesis: complete.hypothesis,
                };
                info!("message complete: {} chars", completion.text.len());
                sink.on_complete(&completion);
                speech.flush();
                return PipelineOutcome::Completed {
                    message_id: completion.message_id,
                };
            }
            PipelineEvent::Error(message) => {
                return fail(sink, speech, PipelineError::Backend(message));
            }
            PipelineEvent::Other(frame) => debug!("ignoring {} event", frame.kind),
        }
    }
}

fn fail<Si, Sp>(sink: &mut Si, speech: &Sp, err: PipelineError) -> PipelineOutcome
where
    Si: MessageSink + ?Sized,
    Sp: SpeechControl + ?Sized,
{
    error!("pipeline failed: {err}");
    sink.on_error(&err.to_string());
    speech.stop();
    PipelineOutcome::Failed(err)
}

// ─── Handle ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Lifecycle {
    finished: bool,
    cancelled: bool,
}

struct Shared<Sp> {
    cancel: CancellationToken,
    abort: OnceLock<AbortHandle>,
    speech: Sp,
    lifecycle: Mutex<Lifecycle>,
}

impl<Sp: SpeechControl> Shared<Sp> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Abort the stream task, then stop speech. Runs at most once. Only a
    /// user cancel reaches a pipeline that already finished, silencing the
    /// speech it flushed.
    fn shutdown(&self, user: bool) {
        let mut state = self.lifecycle();
        if state.cancelled || (state.finished && !user) {
            return;
        }
        state.cancelled = true;
        info!("cancelling pipeline");
        self.cancel.cancel();
        if let Some(abort) = self.abort.get() {
            abort.abort();
        }
        self.speech.stop();
    }

    fn finish(&self) {
        self.lifecycle().finished = true;
    }
}

/// The pipeline task speaks through this. Each call holds the lifecycle lock
/// that `shutdown` takes, so once cancellation begins nothing from the task
/// reaches speech, even from a poll already in progress.
impl<Sp: SpeechControl> SpeechControl for Shared<Sp> {
    fn feed_token(&self, token: &str) {
        let state = self.lifecycle();
        if !state.cancelled {
            self.speech.feed_token(token);
        }
    }

    fn flush(&self) {
        let state = self.lifecycle();
        if !state.cancelled {
            self.speech.flush();
        }
    }

    fn stop(&self) {
        let state = self.lifecycle();
        if !state.cancelled {
            self.speech.stop();
        }
    }
}

/// Owner of a running pipeline. Dropping it cancels the pipeline.
pub struct PipelineHandle<Sp: SpeechControl> {
    task: Option<JoinHandle<PipelineOutcome>>,
    shared: Arc<Shared<Sp>>,
}

impl<Sp: SpeechControl> PipelineHandle<Sp> {
    /// Run a pipeline over an already-open event stream.
    pub fn spawn<E, Si>(events: E, mut sink: Si, speech: Sp) -> Self
    where
        E: Stream<Item = Result<StreamEvent, PipelineError>> + Send + Unpin + 'static,
        Si: MessageSink,
    {
        Self::launch(speech, move |shared| async move {
            run_pipeline(events, &mut sink, &*shared, &shared.cancel).await
        })
    }

    /// Open the event stream with a JSON POST and run a pipeline over it.
    /// Failing to open the stream fails the pipeline like any transport error.
    pub fn connect<Si>(
        client: reqwest::Client,
        url: String,
        body: Value,
        mut sink: Si,
        speech: Sp,
    ) -> Self
    where
        Si: MessageSink,
    {
        Self::launch(speech, move |shared| async move {
            let opened = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return PipelineOutcome::Cancelled,
                opened = open_event_stream(&client, &url, &body) => opened,
            };
            match opened {
                Ok(events) => run_pipeline(events, &mut sink, &*shared, &shared.cancel).await,
                Err(e) => fail(&mut sink, &*shared, e),
            }
        })
    }

    fn launch<F, Fut>(speech: Sp, body: F) -> Self
    where
        F: FnOnce(Arc<Shared<Sp>>) -> Fut,
        Fut: Future<Output = PipelineOutcome> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            cancel: CancellationToken::new(),
            abort: OnceLock::new(),
            speech,
            lifecycle: Mutex::new(Lifecycle::default()),
        });

        let run = body(shared.clone());
        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            let outcome = run.await;
            if !matches!(outcome, PipelineOutcome::Cancelled) {
                task_shared.finish();
            }
            outcome
        });
        let _ = shared.abort.set(task.abort_handle());

        Self {
            task: Some(task),
            shared,
        }
    }

    /// Abort the network stream, then stop speech. Idempotent. After a
    /// natural finish this still silences the flushed speech.
    pub fn cancel(&self) {
        self.shared.shutdown(true);
    }

    /// Cloneable cancel trigger, usable while [`join`](Self::join) is pending.
    pub fn canceller(&self) -> PipelineCanceller<Sp> {
        PipelineCanceller {
            shared: self.shared.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait for the pipeline to end.
    pub async fn join(mut self) -> PipelineOutcome {
        let Some(task) = self.task.take() else {
            return PipelineOutcome::Cancelled;
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => PipelineOutcome::Cancelled,
            Err(e) => PipelineOutcome::Failed(PipelineError::Task(e.to_string())),
        }
    }
}

impl<Sp: SpeechControl> Drop for PipelineHandle<Sp> {
    fn drop(&mut self) {
        self.shared.shutdown(false);
    }
}

pub struct PipelineCanceller<Sp: SpeechControl> {
    shared: Arc<Shared<Sp>>,
}

impl<Sp: SpeechControl> Clone for PipelineCanceller<Sp> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<Sp: SpeechControl> PipelineCanceller<Sp> {
    pub fn cancel(&self) {
        self.shared.shutdown(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::Poll;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Default)]
    struct FakeSpeech {
        calls: Log,
    }

    impl FakeSpeech {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SpeechControl for FakeSpeech {
        fn feed_token(&self, token: &str) {
            self.calls.lock().unwrap().push(format!("feed:{token}"));
        }
        fn flush(&self) {
            self.calls.lock().unwrap().push("flush".into());
        }
        fn stop(&self) {
            self.calls.lock().unwrap().push("stop".into());
        }
    }

    #[derive(Clone, Default)]
    struct FakeSink {
        calls: Log,
        completions: Arc<Mutex<Vec<Completion>>>,
    }

    impl FakeSink {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl MessageSink for FakeSink {
        fn on_progress(&mut self, progress: &Progress) {
            self.calls.lock().unwrap().push(format!(
                "progress:{}:{:?}:{}",
                progress.step, progress.image, progress.total_images
            ));
        }
        fn on_token(&mut self, token: &str) {
            self.calls.lock().unwrap().push(format!("token:{token}"));
        }
        fn on_complete(&mut self, completion: &Completion) {
            self.calls.lock().unwrap().push("complete".into());
            self.completions.lock().unwrap().push(completion.clone());
        }
        fn on_error(&mut self, message: &str) {
            self.calls.lock().unwrap().push(format!("error:{message}"));
        }
    }

    fn frame(kind: &str, payload: Value) -> Result<StreamEvent, PipelineError> {
        Ok(StreamEvent::new(kind, payload.as_object().cloned().unwrap()))
    }

    async fn run(
        frames: Vec<Result<StreamEvent, PipelineError>>,
    ) -> (PipelineOutcome, FakeSink, FakeSpeech) {
        let mut sink = FakeSink::default();
        let speech = FakeSpeech::default();
        let outcome = run_pipeline(
            stream::iter(frames),
            &mut sink,
            &speech,
            &CancellationToken::new(),
        )
        .await;
        (outcome, sink, speech)
    }

    #[tokio::test]
    async fn text_then_complete() {
        let (outcome, sink, speech) = run(vec![
            frame("text", json!({"text": "Hello "})),
            frame("text", json!({"text": "world."})),
            frame("complete", json!({"message_id": 42, "hypothesis": "h1"})),
        ])
        .await;

        assert!(matches!(
            outcome,
            PipelineOutcome::Completed { message_id: Some(ref id) } if id == "42"
        ));
        assert_eq!(speech.calls(), vec!["feed:Hello ", "feed:world.", "flush"]);
        assert_eq!(
            sink.completions.lock().unwrap().clone(),
            vec![Completion {
                text: "Hello world.".into(),
                message_id: Some("42".into()),
                hypothesis: Some("h1".into()),
            }]
        );
    }

    #[tokio::test]
    async fn progress_updates_only_reach_sink() {
        let (_, sink, speech) = run(vec![
            frame("start", json!({"total_images": 2})),
            frame("progress", json!({"step": "ocr", "image": 1, "total_images": 2})),
            frame("complete", json!({})),
        ])
        .await;

        assert_eq!(
            sink.calls(),
            vec!["progress:start:None:2", "progress:ocr:Some(1):2", "complete"]
        );
        assert_eq!(speech.calls(), vec!["flush"]);
    }

    #[tokio::test]
    async fn error_event_stops_speech() {
        let (outcome, sink, speech) = run(vec![
            frame("text", json!({"text": "Partial"})),
            frame("error", json!({"error": "model overloaded"})),
            frame("text", json!({"text": "never seen"})),
        ])
        .await;

        assert!(matches!(outcome, PipelineOutcome::Failed(PipelineError::Backend(ref m)) if m == "model overloaded"));
        assert_eq!(speech.calls(), vec!["feed:Partial", "stop"]);
        assert_eq!(
            sink.calls(),
            vec!["token:Partial", "error:backend error: model overloaded"]
        );
    }

    #[tokio::test]
    async fn transport_error_fails_pipeline() {
        let (outcome, sink, speech) = run(vec![
            frame("text", json!({"text": "Hi"})),
            Err(PipelineError::Transport("reset".into())),
        ])
        .await;

        assert!(matches!(outcome, PipelineOutcome::Failed(PipelineError::Transport(_))));
        assert_eq!(speech.calls(), vec!["feed:Hi", "stop"]);
        assert_eq!(sink.calls().len(), 2);
    }

    #[tokio::test]
    async fn stream_end_without_complete_flushes() {
        let (outcome, sink, speech) = run(vec![frame("text", json!({"text": "Trailing"}))]).await;

        assert!(matches!(outcome, PipelineOutcome::Ended));
        assert_eq!(speech.calls(), vec!["feed:Trailing", "flush"]);
        assert!(sink.completions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_events_are_skipped() {
        let (outcome, sink, speech) = run(vec![
            frame("text", json!({"wrong": 1})),
            frame("heartbeat", json!({})),
            frame("text", json!({"text": "Ok."})),
            frame("complete", json!({})),
        ])
        .await;

        assert!(matches!(outcome, PipelineOutcome::Completed { message_id: None }));
        assert_eq!(speech.calls(), vec!["feed:Ok.", "flush"]);
        assert_eq!(sink.calls(), vec!["token:Ok.", "complete"]);
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Live event stream fed by the test; records when it is dropped.
    fn live_stream() -> (
        mpsc::UnboundedSender<Result<StreamEvent, PipelineError>>,
        impl Stream<Item = Result<StreamEvent, PipelineError>> + Send + Unpin + 'static,
        Arc<AtomicBool>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(dropped.clone());
        let events = stream::poll_fn(move |cx| {
            let _ = &guard;
            rx.poll_recv(cx)
        });
        (tx, events, dropped)
    }

    async fn wait_for_calls(speech: &FakeSpeech, n: usize) {
        for _ in 0..100 {
            if speech.calls().len() >= n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("speech saw {:?}", speech.calls());
    }

    #[tokio::test]
    async fn cancel_aborts_stream_then_stops_once() {
        let (tx, events, dropped) = live_stream();
        let speech = FakeSpeech::default();
        let handle = PipelineHandle::spawn(events, FakeSink::default(), speech.clone());

        tx.send(frame("text", json!({"text": "Hi"}))).unwrap();
        wait_for_calls(&speech, 1).await;

        let canceller = handle.canceller();
        handle.cancel();
        canceller.cancel();

        assert!(matches!(handle.join().await, PipelineOutcome::Cancelled));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(speech.calls(), vec!["feed:Hi", "stop"]);

        // The stream is gone; later frames reach nobody.
        assert!(tx.send(frame("text", json!({"text": "late"}))).is_err());
        assert_eq!(speech.calls(), vec!["feed:Hi", "stop"]);
    }

    #[tokio::test]
    async fn dropping_handle_cancels() {
        let (_tx, events, _dropped) = live_stream();
        let speech = FakeSpeech::default();
        let handle = PipelineHandle::spawn(events, FakeSink::default(), speech.clone());

        drop(handle);
        assert_eq!(speech.calls(), vec!["stop"]);
    }

    #[tokio::test]
    async fn dropping_finished_pipeline_keeps_speaking() {
        let (tx, events, _dropped) = live_stream();
        let speech = FakeSpeech::default();
        let handle = PipelineHandle::spawn(events, FakeSink::default(), speech.clone());

        tx.send(frame("text", json!({"text": "Done."}))).unwrap();
        tx.send(frame("complete", json!({}))).unwrap();

        // `join` consumes the handle, so it is dropped once the pipeline ends.
        assert!(matches!(handle.join().await, PipelineOutcome::Completed { .. }));
        assert_eq!(speech.calls(), vec!["feed:Done.", "flush"]);
    }

    #[tokio::test]
    async fn cancel_after_complete_silences_answer_once() {
        let (tx, events, _dropped) = live_stream();
        let speech = FakeSpeech::default();
        let handle = PipelineHandle::spawn(events, FakeSink::default(), speech.clone());

        tx.send(frame("text", json!({"text": "Long answer."}))).unwrap();
        tx.send(frame("complete", json!({}))).unwrap();

        let canceller = handle.canceller();
        assert!(matches!(handle.join().await, PipelineOutcome::Completed { .. }));

        canceller.cancel();
        canceller.clone().cancel();
        assert_eq!(speech.calls(), vec!["feed:Long answer.", "flush", "stop"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_during_slow_poll_keeps_late_token_out() {
        let speech = FakeSpeech::default();
        let mut delivered = false;
        let events = stream::poll_fn(move |_cx| {
            if delivered {
                return Poll::Pending;
            }
            delivered = true;
            // A frame that is mid-decode when the cancel lands.
            std::thread::sleep(Duration::from_millis(300));
            Poll::Ready(Some(frame("text", json!({"text": "Hi."}))))
        });
        let handle = PipelineHandle::spawn(events, FakeSink::default(), speech.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        assert!(matches!(handle.join().await, PipelineOutcome::Cancelled));
        assert_eq!(speech.calls(), vec!["stop"]);
    }
}
