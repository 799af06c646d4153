//! Rodio `Source` over one utterance's Kokoro PCM body.
//!
//! The fetcher forwards raw response chunks as they arrive and the source
//! decodes them as 24 kHz mono s16le, holding back an odd trailing byte for
//! the next chunk. Playback of an utterance ends on [`PcmFeed::End`], when the
//! fetcher goes away, or as soon as the synthesizer's epoch moves past the one
//! the utterance was fetched under. A cancelled utterance therefore goes
//! silent on its own, before the sink is torn down.
//!
//! While the network lags the source pads with silence so the output device
//! stays fed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use rodio::Source;

/// Kokoro `response_format: pcm` output.
pub const SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u16 = 1;

/// How long one `next()` waits on the network before padding with silence.
const NETWORK_WAIT: Duration = Duration::from_millis(10);

pub enum PcmFeed {
    /// Response body bytes, split wherever the network split them.
    Bytes(Vec<u8>),
    /// The response body is complete.
    End,
}

pub struct PcmSource {
    rx: Receiver<PcmFeed>,
    samples: VecDeque<i16>,
    carry: Option<u8>,
    epoch: Arc<AtomicU64>,
    utterance_epoch: u64,
    input_done: bool,
}

impl PcmSource {
    pub fn new(rx: Receiver<PcmFeed>, epoch: Arc<AtomicU64>, utterance_epoch: u64) -> Self {
        Self {
            rx,
            samples: VecDeque::with_capacity(SAMPLE_RATE as usize),
            carry: None,
            epoch,
            utterance_epoch,
            input_done: false,
        }
    }

    fn cancelled(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) != self.utterance_epoch
    }

    fn accept(&mut self, feed: PcmFeed) {
        match feed {
            PcmFeed::Bytes(bytes) => {
                let (samples, carry) = decode_s16le(&bytes, self.carry.take());
                self.samples.extend(samples);
                self.carry = carry;
            }
            PcmFeed::End => self.input_done = true,
        }
    }

    fn pull(&mut self) {
        match self.rx.recv_timeout(NETWORK_WAIT) {
            Ok(feed) => self.accept(feed),
            Err(RecvTimeoutError::Timeout) => return,
            Err(RecvTimeoutError::Disconnected) => {
                self.input_done = true;
                return;
            }
        }
        while !self.input_done {
            match self.rx.try_recv() {
                Ok(feed) => self.accept(feed),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.input_done = true,
            }
        }
    }
}

impl Iterator for PcmSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        if self.cancelled() {
            self.samples.clear();
            self.input_done = true;
            return None;
        }
        if self.samples.is_empty() && !self.input_done {
            self.pull();
        }
        match self.samples.pop_front() {
            Some(sample) => Some(sample),
            None if self.input_done => None,
            None => Some(0),
        }
    }
}

impl Source for PcmSource {
    fn current_frame_len(&self) -> Option<usize> {
        if self.input_done {
            Some(self.samples.len())
        } else {
            Some(self.samples.len().max(1))
        }
    }

    fn channels(&self) -> u16 {
        CHANNELS
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Little-endian s16 samples from `bytes`, after any byte carried over from
/// the previous chunk. Returns the new odd trailing byte, if any.
pub fn decode_s16le(bytes: &[u8], carry: Option<u8>) -> (Vec<i16>, Option<u8>) {
    let mut joined: Vec<u8>;
    let data: &[u8] = match carry {
        Some(b) => {
            joined = Vec::with_capacity(bytes.len() + 1);
            joined.push(b);
            joined.extend_from_slice(bytes);
            &joined
        }
        None => bytes,
    };

    let pairs = data.chunks_exact(2);
    let rest = pairs.remainder().first().copied();
    let samples = pairs.map(|p| i16::from_le_bytes([p[0], p[1]])).collect();
    (samples, rest)
}
