//! Speech engine — streamed tokens → playback controller → Kokoro → rodio.
//!
//! Pipeline:
//!
//! ```text
//! feed_token / speak / flush / stop → [cmd_tx] → controller task → KokoroSynth::speak
//!     → [job_tx] → fetcher: POST Kokoro, forward the PCM body into a PcmSource
//!     → playback thread: append source + end-of-utterance callback to the sink
//!     → [events_tx] → controller task: on_utterance_done → next sentence
//! ```
//!
//! A single task owns the [`SpeechController`], so commands and synthesis
//! completions are applied one at a time, in order. Completions already
//! queued are applied before the next command.
//!
//! Epoch-based cancellation: `KokoroSynth::cancel()` bumps an [`AtomicU64`] so
//! in-flight fetches, queued playback and sources already playing for the
//! previous epoch all end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::StreamExt;
use rodio::source::EmptyCallback;
use rodio::{OutputStream, Sink, Source};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use cadence_core::types::{PlaybackMode, SpeechConfig, SpeechStatus};
use cadence_core::voice::Voice;

use crate::error::SynthesisError;
use crate::pcm_source::{PcmFeed, PcmSource};
use crate::pipeline::SpeechControl;
use crate::playback::{Clock, SpeechController, Synthesizer, SystemClock, Utterance, UtteranceId};

/// Used until the voice catalog has loaded.
const FALLBACK_VOICE: &str = "am_michael";

/// Cloneable handle to the speech engine. All methods are non-blocking.
#[derive(Clone)]
pub struct SpeechEngine {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    status_rx: watch::Receiver<SpeechStatus>,
}

/// Notifications from a synthesis backend to the controller task.
#[derive(Debug)]
pub enum SynthEvent {
    Finished(UtteranceId),
    Failed(UtteranceId, SynthesisError),
    VoicesChanged,
}

// ─── Internal types ────────────────────────────────────────────────────────

enum Cmd {
    Token(String),
    Speak(String),
    Flush,
    Stop,
    Voices(oneshot::Sender<Vec<Voice>>),
    Sync(oneshot::Sender<()>),
}

struct FetchJob {
    utterance: Utterance,
    epoch: u64,
}

enum PlayCmd {
    Play {
        source: PcmSource,
        id: UtteranceId,
        volume: f32,
        epoch: u64,
    },
    Stop,
}

// ─── Engine handle ─────────────────────────────────────────────────────────

impl SpeechEngine {
    /// Spawn the Kokoro-backed engine. Must be called inside a tokio runtime.
    pub fn new(config: &SpeechConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let synth = KokoroSynth::spawn(config, events_tx);
        Self::with_synth(synth, SystemClock, events_rx, config)
    }

    /// Spawn the controller task over any synthesizer. The synthesizer
    /// reports utterance completions on the channel feeding `events_rx`.
    pub fn with_synth<S, C>(
        synth: S,
        clock: C,
        events_rx: mpsc::UnboundedReceiver<SynthEvent>,
        config: &SpeechConfig,
    ) -> Self
    where
        S: Synthesizer + Send + 'static,
        C: Clock + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = SpeechController::with_clock(synth, clock, config);
        let (status_tx, status_rx) = watch::channel(controller.status());

        tokio::spawn(controller_task(controller, cmd_rx, events_rx, status_tx));

        Self { cmd_tx, status_rx }
    }

    /// Append a token from a text stream.
    pub fn feed_token(&self, token: &str) {
        if !token.is_empty() {
            let _ = self.cmd_tx.send(Cmd::Token(token.to_string()));
        }
    }

    /// Cancel current speech and speak `text` in full.
    pub fn speak(&self, text: &str) {
        let _ = self.cmd_tx.send(Cmd::Speak(text.to_string()));
    }

    /// Signal the end of the token stream; remaining text is spoken.
    pub fn flush(&self) {
        let _ = self.cmd_tx.send(Cmd::Flush);
    }

    /// Stop all speech immediately.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Cmd::Stop);
    }

    pub fn status(&self) -> SpeechStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SpeechStatus> {
        self.status_rx.clone()
    }

    /// Current voice catalog of the synthesis backend.
    pub async fn voices(&self) -> Vec<Voice> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Voices(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Wait until every command sent before this call has been applied.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Sync(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until nothing is pending and nothing is playing.
    pub async fn wait_idle(&self) {
        self.sync().await;
        let mut status = self.status_rx.clone();
        let _ = status
            .wait_for(|s| s.mode == PlaybackMode::Idle && !s.speaking)
            .await;
    }
}

impl SpeechControl for SpeechEngine {
    fn feed_token(&self, token: &str) {
        SpeechEngine::feed_token(self, token);
    }

    fn flush(&self) {
        SpeechEngine::flush(self);
    }

    fn stop(&self) {
        SpeechEngine::stop(self);
    }
}

// ─── Controller task ───────────────────────────────────────────────────────

async fn controller_task<S, C>(
    mut controller: SpeechController<S, C>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    mut events_rx: mpsc::UnboundedReceiver<SynthEvent>,
    status_tx: watch::Sender<SpeechStatus>,
) where
    S: Synthesizer,
    C: Clock,
{
    controller.refresh_voices();
    publish(&status_tx, &controller);

    loop {
        tokio::select! {
            biased;

            Some(event) = events_rx.recv() => match event {
                SynthEvent::Finished(id) => controller.on_utterance_done(id, Ok(())),
                SynthEvent::Failed(id, e) => controller.on_utterance_done(id, Err(e)),
                SynthEvent::VoicesChanged => controller.refresh_voices(),
            },

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("all engine handles dropped; shutting down");
                    controller.stop();
                    break;
                };
                match cmd {
                    Cmd::Token(token) => controller.feed_token(&token),
                    Cmd::Speak(text) => controller.speak_now(&text),
                    Cmd::Flush => controller.flush(),
                    Cmd::Stop => controller.stop(),
                    Cmd::Voices(reply) => {
                        let _ = reply.send(controller.voices());
                    }
                    Cmd::Sync(reply) => {
                        let _ = reply.send(());
                    }
                }
            }
        }

        publish(&status_tx, &controller);
    }
}

fn publish<S: Synthesizer, C: Clock>(
    tx: &watch::Sender<SpeechStatus>,
    controller: &SpeechController<S, C>,
) {
    let status = controller.status();
    tx.send_if_modified(|current| {
        if *current == status {
            return false;
        }
        *current = status;
        true
    });
}

// ─── Kokoro synthesizer ────────────────────────────────────────────────────

/// [`Synthesizer`] backed by a Kokoro server and the default audio output.
pub struct KokoroSynth {
    job_tx: mpsc::UnboundedSender<FetchJob>,
    play_cmd_tx: std::sync::mpsc::Sender<PlayCmd>,
    events_tx: mpsc::UnboundedSender<SynthEvent>,
    epoch: Arc<AtomicU64>,
    catalog: Arc<RwLock<Vec<Voice>>>,
}

impl KokoroSynth {
    /// Start the fetcher task, the playback thread and the catalog loader.
    pub fn spawn(config: &SpeechConfig, events_tx: mpsc::UnboundedSender<SynthEvent>) -> Self {
        let epoch = Arc::new(AtomicU64::new(0));
        let catalog = Arc::new(RwLock::new(Vec::new()));
        let client = reqwest::Client::new();

        // Playback OS thread (rodio OutputStream is !Send)
        let (play_cmd_tx, play_cmd_rx) = std::sync::mpsc::channel();
        let play_events = events_tx.clone();
        let play_epoch = epoch.clone();
        if let Err(e) = std::thread::Builder::new()
            .name("cadence-playback".into())
            .spawn(move || playback_thread(play_cmd_rx, play_events, play_epoch))
        {
            error!("failed to spawn playback thread: {e}");
        }

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        tokio::spawn(fetcher_task(
            job_rx,
            play_cmd_tx.clone(),
            events_tx.clone(),
            epoch.clone(),
            client.clone(),
            config.kokoro_url.clone(),
        ));

        tokio::spawn(load_catalog(
            client,
            config.kokoro_url.clone(),
            catalog.clone(),
            events_tx.clone(),
        ));

        Self {
            job_tx,
            play_cmd_tx,
            events_tx,
            epoch,
            catalog,
        }
    }
}

impl Synthesizer for KokoroSynth {
    fn voices(&self) -> Vec<Voice> {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn speak(&mut self, utterance: &Utterance) {
        let job = FetchJob {
            utterance: utterance.clone(),
            epoch: self.epoch.load(Ordering::SeqCst),
        };
        if self.job_tx.send(job).is_err() {
            let err = SynthesisError::Playback("fetcher task is gone".into());
            let _ = self.events_tx.send(SynthEvent::Failed(utterance.id, err));
        }
    }

    fn cancel(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _ = self.play_cmd_tx.send(PlayCmd::Stop);
    }
}

// ─── Fetcher task ──────────────────────────────────────────────────────────

/// What became of a fetched utterance.
enum Handoff {
    /// Audio is with the playback thread, which reports the end.
    Queued,
    /// Kokoro returned no audio; nothing to play.
    Empty,
    /// Cancelled while streaming.
    Stale,
}

async fn fetcher_task(
    mut job_rx: mpsc::UnboundedReceiver<FetchJob>,
    play_cmd_tx: std::sync::mpsc::Sender<PlayCmd>,
    events_tx: mpsc::UnboundedSender<SynthEvent>,
    epoch: Arc<AtomicU64>,
    client: reqwest::Client,
    kokoro_url: String,
) {
    let url = format!("{kokoro_url}/v1/audio/speech");

    while let Some(job) = job_rx.recv().await {
        let id = job.utterance.id;
        if job.epoch != epoch.load(Ordering::SeqCst) {
            debug!("fetch {id}: discarding stale job");
            continue;
        }

        match synthesize(&client, &url, &job, &play_cmd_tx, &epoch).await {
            Ok(Handoff::Queued) | Ok(Handoff::Stale) => {}
            Ok(Handoff::Empty) => {
                warn!("fetch {id}: Kokoro returned no audio");
                let _ = events_tx.send(SynthEvent::Finished(id));
            }
            Err(e) => {
                if job.epoch == epoch.load(Ordering::SeqCst) {
                    error!("fetch {id}: {e}");
                    let _ = events_tx.send(SynthEvent::Failed(id, e));
                }
            }
        }
    }
}

async fn synthesize(
    client: &reqwest::Client,
    url: &str,
    job: &FetchJob,
    play_cmd_tx: &std::sync::mpsc::Sender<PlayCmd>,
    epoch: &Arc<AtomicU64>,
) -> Result<Handoff, SynthesisError> {
    let u = &job.utterance;
    let voice = u.voice.as_ref().map_or(FALLBACK_VOICE, |v| v.name.as_str());
    // Kokoro has no pitch control; u.pitch is not sent.
    let body = serde_json::json!({
        "input": u.text,
        "voice": voice,
        "model": "kokoro",
        "response_format": "pcm",
        "stream": true,
        "speed": u.rate,
    });

    debug!("fetch {}: POST {} chars", u.id, u.text.len());

    let resp = client
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| SynthesisError::Request(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(SynthesisError::Status { status, body });
    }

    // Hand the source to playback with the first bytes, then keep feeding it
    let mut stream = resp.bytes_stream();
    let mut pcm_tx: Option<std::sync::mpsc::Sender<PcmFeed>> = None;
    let mut stream_error = None;

    while let Some(chunk) = stream.next().await {
        if job.epoch != epoch.load(Ordering::SeqCst) {
            return Ok(Handoff::Stale);
        }

        let chunk = match chunk {
            Ok(c) if c.is_empty() => continue,
            Ok(c) => c.to_vec(),
            Err(e) => {
                stream_error = Some(e.to_string());
                break;
            }
        };

        match &pcm_tx {
            Some(tx) => {
                if tx.send(PcmFeed::Bytes(chunk)).is_err() {
                    break;
                }
            }
            None => {
                let (tx, rx) = std::sync::mpsc::channel();
                let _ = tx.send(PcmFeed::Bytes(chunk));
                let source = PcmSource::new(rx, epoch.clone(), job.epoch);
                play_cmd_tx
                    .send(PlayCmd::Play {
                        source,
                        id: u.id,
                        volume: u.volume,
                        epoch: job.epoch,
                    })
                    .map_err(|_| SynthesisError::Playback("playback thread is gone".into()))?;
                pcm_tx = Some(tx);
            }
        }
    }

    match (pcm_tx, stream_error) {
        (Some(tx), err) => {
            if let Some(e) = err {
                error!("fetch {}: stream cut short: {e}", u.id);
            }
            let _ = tx.send(PcmFeed::End);
            Ok(Handoff::Queued)
        }
        (None, Some(e)) => Err(SynthesisError::Request(e)),
        (None, None) => Ok(Handoff::Empty),
    }
}

// ─── Playback OS thread ────────────────────────────────────────────────────

fn playback_thread(
    cmd_rx: std::sync::mpsc::Receiver<PlayCmd>,
    events_tx: mpsc::UnboundedSender<SynthEvent>,
    epoch: Arc<AtomicU64>,
) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            error!("playback: failed to open audio output: {e}");
            return reject_all(cmd_rx, events_tx, format!("no audio output: {e}"));
        }
    };

    let mut sink = match Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(e) => {
            error!("playback: failed to create sink: {e}");
            return reject_all(cmd_rx, events_tx, format!("no audio sink: {e}"));
        }
    };

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            PlayCmd::Play {
                source,
                id,
                volume,
                epoch: job_epoch,
            } => {
                if job_epoch != epoch.load(Ordering::SeqCst) {
                    debug!("playback {id}: stale, dropped");
                    continue;
                }
                sink.append(source.amplify(volume));
                let done_tx = events_tx.clone();
                sink.append(EmptyCallback::<i16>::new(Box::new(move || {
                    let _ = done_tx.send(SynthEvent::Finished(id));
                })));
                debug!("playback {id}: queued");
            }
            PlayCmd::Stop => {
                sink.stop();
                sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        error!("playback: failed to recreate sink: {e}");
                        return reject_all(cmd_rx, events_tx, format!("no audio sink: {e}"));
                    }
                };
            }
        }
    }

    sink.stop();
}

/// Without an output device every utterance fails immediately, so the
/// controller keeps moving instead of waiting on audio that never plays.
fn reject_all(
    cmd_rx: std::sync::mpsc::Receiver<PlayCmd>,
    events_tx: mpsc::UnboundedSender<SynthEvent>,
    reason: String,
) {
    while let Ok(cmd) = cmd_rx.recv() {
        if let PlayCmd::Play { id, .. } = cmd {
            let _ = events_tx.send(SynthEvent::Failed(id, SynthesisError::Playback(reason.clone())));
        }
    }
}

// ─── Voice catalog ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct VoiceList {
    voices: Vec<String>,
}

async fn load_catalog(
    client: reqwest::Client,
    kokoro_url: String,
    catalog: Arc<RwLock<Vec<Voice>>>,
    events_tx: mpsc::UnboundedSender<SynthEvent>,
) {
    match fetch_voices(&client, &kokoro_url).await {
        Ok(voices) => {
            info!("voice catalog loaded: {} voices", voices.len());
            *catalog.write().unwrap_or_else(|e| e.into_inner()) = voices;
            let _ = events_tx.send(SynthEvent::VoicesChanged);
        }
        Err(e) => warn!("voice catalog unavailable: {e}"),
    }
}

/// Fetch the Kokoro voice list.
pub async fn fetch_voices(
    client: &reqwest::Client,
    kokoro_url: &str,
) -> Result<Vec<Voice>, SynthesisError> {
    let resp = client
        .get(format!("{kokoro_url}/v1/audio/voices"))
        .send()
        .await
        .map_err(|e| SynthesisError::Request(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(SynthesisError::Status { status, body });
    }

    let list: VoiceList = resp
        .json()
        .await
        .map_err(|e| SynthesisError::Request(format!("invalid voice list: {e}")))?;
    Ok(list.voices.iter().map(|name| kokoro_voice(name)).collect())
}

/// Catalog entry for a Kokoro voice. The first letter of a Kokoro voice name
/// encodes its language (`af_heart`, `bm_george`, ...).
pub fn kokoro_voice(name: &str) -> Voice {
    let language = match name.chars().next() {
        Some('a') => "en-US",
        Some('b') => "en-GB",
        Some('e') => "es-ES",
        Some('f') => "fr-FR",
        Some('h') => "hi-IN",
        Some('i') => "it-IT",
        Some('j') => "ja-JP",
        Some('p') => "pt-BR",
        Some('z') => "zh-CN",
        _ => "und",
    };
    Voice {
        name: name.to_string(),
        language: language.to_string(),
        uri: format!("kokoro:{name}"),
    }
}
