//! Speech playback controller — turns arriving tokens into one utterance at a
//! time.
//!
//! ```text
//! feed_token ─▶ [pending buffer] ─▶ extract_sentence ─▶ clean_for_speech ─▶ Synthesizer::speak
//!                    ▲                                                        │
//!                    └──────────── on_utterance_done (continue or hold) ◀─────┘
//! ```
//!
//! The controller is synchronous and owns no tasks. Whoever drives it (see
//! [`crate::tts::SpeechEngine`]) calls the operations and reports each
//! utterance's end back through [`SpeechController::on_utterance_done`].
//!
//! Every dispatched utterance gets a fresh [`UtteranceId`]. `stop()` and
//! `speak_now()` forget the in-flight id, so a late completion for cancelled
//! speech is recognised as stale and cannot schedule a continuation.
//!
//! Stream liveness is checked lazily when an utterance ends: in `Streaming`
//! mode the next sentence follows immediately only if the last token arrived
//! within the pause threshold; otherwise the controller holds silent until
//! the next token or `flush()`.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use cadence_core::text_prep::{clean_for_speech, ensure_terminal, extract_sentence, is_terminal};
use cadence_core::types::{PlaybackMode, SpeechConfig, SpeechStatus};
use cadence_core::voice::{Voice, VoicePreferences, pick_voice};

use crate::error::SynthesisError;

// ─── Engine seam ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UtteranceId(pub u64);

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// One sentence-sized speak request.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub text: String,
    pub voice: Option<Voice>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

/// Narrow capability interface over a speech synthesis engine.
///
/// `speak` must not block; the engine reports the end of each utterance
/// asynchronously to whoever drives the controller.
pub trait Synthesizer {
    fn voices(&self) -> Vec<Voice>;
    fn speak(&mut self, utterance: &Utterance);
    fn cancel(&mut self);
}

/// Time source for stream liveness.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ─── Controller ────────────────────────────────────────────────────────────

/// Mode with its pending text. `Idle` holds nothing by construction.
#[derive(Debug)]
enum Playback {
    Idle,
    /// Tokens still arriving; only whole sentences are spoken.
    Streaming { buffer: String },
    /// No more input; everything left is spoken, punctuated or not.
    Flushing { buffer: String },
}

pub struct SpeechController<S, C = SystemClock> {
    synth: S,
    clock: C,
    playback: Playback,
    last_token: Option<Instant>,
    in_flight: Option<UtteranceId>,
    next_id: u64,
    voice: Option<Voice>,
    preferences: VoicePreferences,
    pause_threshold: Duration,
    rate: f32,
    pitch: f32,
    volume: f32,
    spoken: u64,
}

impl<S: Synthesizer> SpeechController<S, SystemClock> {
    pub fn new(synth: S, config: &SpeechConfig) -> Self {
        Self::with_clock(synth, SystemClock, config)
    }
}

impl<S: Synthesizer, C: Clock> SpeechController<S, C> {
    pub fn with_clock(synth: S, clock: C, config: &SpeechConfig) -> Self {
        Self {
            synth,
            clock,
            playback: Playback::Idle,
            last_token: None,
            in_flight: None,
            next_id: 0,
            voice: None,
            preferences: config.voice_preferences.clone(),
            pause_threshold: config.pause_threshold(),
            rate: config.rate,
            pitch: config.pitch,
            volume: config.volume,
            spoken: 0,
        }
    }

    /// Append a streamed token. Starts speaking as soon as a whole sentence
    /// is buffered and nothing is playing.
    pub fn feed_token(&mut self, token: &str) {
        if token.is_empty() {
            return;
        }
        self.last_token = Some(self.clock.now());

        match &mut self.playback {
            Playback::Idle => {
                self.playback = Playback::Streaming {
                    buffer: token.to_string(),
                }
            }
            Playback::Streaming { buffer } | Playback::Flushing { buffer } => {
                buffer.push_str(token)
            }
        }

        if self.in_flight.is_none() && self.has_sentence() {
            self.pump();
        }
    }

    /// Drop whatever is pending or playing and speak `text` in full.
    pub fn speak_now(&mut self, text: &str) {
        self.synth.cancel();
        self.in_flight = None;

        let mut buffer = text.to_string();
        ensure_terminal(&mut buffer);
        debug!("speak_now: {} chars", buffer.len());
        self.playback = Playback::Flushing { buffer };
        self.pump();
    }

    /// No more tokens are coming: speak everything that remains.
    pub fn flush(&mut self) {
        self.last_token = Some(self.clock.now());

        let mut buffer = match std::mem::replace(&mut self.playback, Playback::Idle) {
            Playback::Idle => return,
            Playback::Streaming { buffer } | Playback::Flushing { buffer } => buffer,
        };
        ensure_terminal(&mut buffer);
        debug!("flush: {} chars pending", buffer.len());
        self.playback = Playback::Flushing { buffer };
        self.pump();
    }

    /// Silence output and forget all pending text. Safe to call at any time.
    pub fn stop(&mut self) {
        self.synth.cancel();
        if let Some(id) = self.in_flight.take() {
            debug!("stop: cancelled {id}");
        }
        self.playback = Playback::Idle;
        self.last_token = None;
    }

    /// Report that utterance `id` finished, successfully or not.
    ///
    /// A failed utterance is dropped and the loop carries on exactly as if it
    /// had completed.
    pub fn on_utterance_done(&mut self, id: UtteranceId, result: Result<(), SynthesisError>) {
        if self.in_flight != Some(id) {
            debug!("ignoring stale completion for {id}");
            return;
        }
        self.in_flight = None;

        match result {
            Ok(()) => self.spoken += 1,
            Err(e) => warn!("utterance {id} failed: {e}"),
        }

        if let Playback::Streaming { buffer } = &self.playback {
            if !buffer.trim().is_empty() && !self.stream_active() {
                debug!("stream paused; holding {} chars", buffer.len());
                return;
            }
        }
        self.pump();
    }

    /// Re-run voice selection against the engine's current catalog.
    pub fn refresh_voices(&mut self) {
        let catalog = self.synth.voices();
        let picked = pick_voice(&catalog, &self.preferences).cloned();
        if picked != self.voice {
            match &picked {
                Some(v) => info!("voice selected: {} ({})", v.name, v.language),
                None => info!("voice catalog empty; using engine default"),
            }
        }
        self.voice = picked;
    }

    pub fn voices(&self) -> Vec<Voice> {
        self.synth.voices()
    }

    pub fn voice(&self) -> Option<&Voice> {
        self.voice.as_ref()
    }

    pub fn mode(&self) -> PlaybackMode {
        match self.playback {
            Playback::Idle => PlaybackMode::Idle,
            Playback::Streaming { .. } => PlaybackMode::Streaming,
            Playback::Flushing { .. } => PlaybackMode::Flushing,
        }
    }

    pub fn pending(&self) -> &str {
        match &self.playback {
            Playback::Idle => "",
            Playback::Streaming { buffer } | Playback::Flushing { buffer } => buffer,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Last token arrived within the pause threshold.
    pub fn stream_active(&self) -> bool {
        self.last_token
            .is_some_and(|t| self.clock.now().duration_since(t) < self.pause_threshold)
    }

    pub fn status(&self) -> SpeechStatus {
        SpeechStatus {
            mode: self.mode(),
            speaking: self.is_speaking(),
            pending_chars: self.pending().len(),
            voice: self.voice.as_ref().map(|v| v.name.clone()),
            utterances_spoken: self.spoken,
        }
    }

    #[cfg(test)]
    pub(crate) fn synth(&self) -> &S {
        &self.synth
    }

    fn has_sentence(&self) -> bool {
        self.pending().contains(is_terminal)
    }

    /// Dispatch the next speakable unit unless something is already playing.
    fn pump(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        while let Some(unit) = self.next_unit() {
            let text = clean_for_speech(&unit);
            if text.is_empty() {
                debug!("skipping unspeakable unit {unit:?}");
                continue;
            }
            self.dispatch(text);
            return;
        }
        if self.pending().trim().is_empty() {
            self.playback = Playback::Idle;
        }
    }

    /// Take the next unit off the buffer: a whole sentence, or in `Flushing`
    /// mode whatever is left.
    fn next_unit(&mut self) -> Option<String> {
        let (buffer, flushing) = match &mut self.playback {
            Playback::Idle => return None,
            Playback::Streaming { buffer } => (buffer, false),
            Playback::Flushing { buffer } => (buffer, true),
        };

        let (sentence, rest) = extract_sentence(buffer.as_str());
        if let Some(sentence) = sentence {
            let sentence = sentence.to_string();
            let rest = rest.to_string();
            *buffer = rest;
            return Some(sentence);
        }

        if flushing && !buffer.trim().is_empty() {
            return Some(std::mem::take(buffer).trim().to_string());
        }
        None
    }

    fn dispatch(&mut self, text: String) {
        let id = UtteranceId(self.next_id);
        self.next_id += 1;

        debug!("dispatch {id}: {} chars", text.len());
        let utterance = Utterance {
            id,
            text,
            voice: self.voice.clone(),
            rate: self.rate,
            pitch: self.pitch,
            volume: self.volume,
        };
        self.synth.speak(&utterance);
        self.in_flight = Some(id);
    }
}
