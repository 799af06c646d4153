//! Deterministic fakes for the engine seams.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cadence_core::voice::Voice;

use crate::playback::{Clock, Synthesizer, Utterance};

/// Records utterances instead of speaking them. Clones share state.
#[derive(Clone, Default)]
pub struct FakeSynth {
    spoken: Arc<Mutex<Vec<Utterance>>>,
    cancels: Arc<Mutex<usize>>,
    voices: Arc<Mutex<Vec<Voice>>>,
}

impl FakeSynth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_voices(voices: Vec<Voice>) -> Self {
        let synth = Self::default();
        *synth.voices.lock().unwrap() = voices;
        synth
    }

    pub fn set_voices(&self, voices: Vec<Voice>) {
        *self.voices.lock().unwrap() = voices;
    }

    pub fn last_spoken(&self) -> Option<Utterance> {
        self.spoken.lock().unwrap().last().cloned()
    }

    pub fn spoken_texts(&self) -> Vec<String> {
        self.spoken.lock().unwrap().iter().map(|u| u.text.clone()).collect()
    }

    pub fn cancels(&self) -> usize {
        *self.cancels.lock().unwrap()
    }
}

impl Synthesizer for FakeSynth {
    fn voices(&self) -> Vec<Voice> {
        self.voices.lock().unwrap().clone()
    }

    fn speak(&mut self, utterance: &Utterance) {
        self.spoken.lock().unwrap().push(utterance.clone());
    }

    fn cancel(&mut self) {
        *self.cancels.lock().unwrap() += 1;
    }
}

/// Hand-advanced clock. Clones share the same time.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
