//! Audio I/O seams for realtime voice providers.
//!
//! The host owns the microphone and speaker. Adapters only see:
//! - [`AudioInput`]: opens a capture that yields PCM16 mono frames.
//! - [`AudioOutput`]: plays PCM16 mono audio coming back from the backend.
//!
//! Frames from the host arrive at its native rate (typically 48kHz) and are
//! downsampled and re-chunked before they go on the wire.

use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Frames buffered per capture before new ones are dropped.
const CAPTURE_QUEUE: usize = 64;

#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Source of microphone frames.
pub trait AudioInput: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Start a capture. It stays live until the returned value is dropped.
    fn open(&self) -> Result<AudioCapture, AudioError>;

    /// Number of captures currently open.
    fn active_captures(&self) -> usize;
}

/// Sink for assistant audio.
pub trait AudioOutput: Send + Sync + 'static {
    fn play(&self, samples: &[i16], sample_rate: u32);

    /// Drop anything queued but not yet played.
    fn flush(&self) {}
}

/// A live microphone capture. Releases the device on drop.
pub struct AudioCapture {
    frames: mpsc::Receiver<Vec<i16>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AudioCapture {
    pub fn new(frames: mpsc::Receiver<Vec<i16>>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            frames,
            release: Some(Box::new(release)),
        }
    }

    /// Next frame; `None` once the device went away.
    pub async fn recv(&mut self) -> Option<Vec<i16>> {
        self.frames.recv().await
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Default)]
struct InputState {
    next_id: u64,
    captures: Vec<(u64, mpsc::Sender<Vec<i16>>)>,
    peak: usize,
}

/// Capture source fed by the host through [`ChannelAudioInput::push`].
#[derive(Clone, Default)]
pub struct ChannelAudioInput {
    state: Arc<Mutex<InputState>>,
}

impl ChannelAudioInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a frame to every open capture. Returns how many received it.
    pub fn push(&self, frame: Vec<i16>) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .captures
            .iter()
            .filter(|(_, tx)| match tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("Audio: capture queue full, dropping frame");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            })
            .count()
    }

    /// Highest number of simultaneously open captures seen so far.
    pub fn peak_captures(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peak
    }
}

impl AudioInput for ChannelAudioInput {
    fn name(&self) -> &str {
        "channel"
    }

    fn open(&self) -> Result<AudioCapture, AudioError> {
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE);
        let id = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let id = state.next_id;
            state.next_id += 1;
            state.captures.push((id, tx));
            state.peak = state.peak.max(state.captures.len());
            id
        };
        log::debug!("Audio: capture {} opened", id);

        let state = Arc::clone(&self.state);
        Ok(AudioCapture::new(rx, move || {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .captures
                .retain(|(cid, _)| *cid != id);
            log::debug!("Audio: capture {} released", id);
        }))
    }

    fn active_captures(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .captures
            .len()
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioOutput;

impl AudioOutput for NullAudioOutput {
    fn play(&self, _samples: &[i16], _sample_rate: u32) {}
}

/// Keeps played audio in memory; useful for hosts that mix it themselves.
#[derive(Debug, Default)]
pub struct BufferedAudioOutput {
    samples: Mutex<Vec<i16>>,
}

impl BufferedAudioOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<i16> {
        std::mem::take(&mut *self.samples.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl AudioOutput for BufferedAudioOutput {
    fn play(&self, samples: &[i16], _sample_rate: u32) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(samples);
    }

    fn flush(&self) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Rate converter for integer ratios (48kHz mic → 24kHz wire).
///
/// Each output sample is the mean of `ratio` input samples. A group split
/// across two capture frames is completed by the next frame instead of being
/// averaged short.
#[derive(Debug)]
pub struct Decimator {
    ratio: usize,
    sum: i64,
    count: usize,
}

impl Decimator {
    /// Rates that are zero or not an integer multiple pass audio through unchanged.
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        let ratio = match (source_rate, target_rate) {
            (0, _) | (_, 0) => {
                log::warn!("Decimator: invalid rates {}→{}, passing through", source_rate, target_rate);
                1
            }
            (s, t) if s % t != 0 => {
                log::warn!("Decimator: {}→{} is not an integer ratio, passing through", s, t);
                1
            }
            (s, t) => (s / t) as usize,
        };
        Self {
            ratio,
            sum: 0,
            count: 0,
        }
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<i16> {
        if self.ratio == 1 {
            return samples.to_vec();
        }
        let mut out = Vec::with_capacity((self.count + samples.len()) / self.ratio);
        for &sample in samples {
            self.sum += i64::from(sample);
            self.count += 1;
            if self.count == self.ratio {
                out.push((self.sum / self.ratio as i64) as i16);
                self.sum = 0;
                self.count = 0;
            }
        }
        out
    }

    /// Drop a half-filled group (mute, stream restart).
    pub fn reset(&mut self) {
        self.sum = 0;
        self.count = 0;
    }
}

/// Accumulates samples into fixed-duration chunks.
#[derive(Debug)]
pub struct AudioChunker {
    samples_per_chunk: usize,
    buffer: Vec<i16>,
}

impl AudioChunker {
    pub fn new(sample_rate: u32, chunk_duration_ms: u32) -> Self {
        let samples_per_chunk = ((sample_rate * chunk_duration_ms / 1000) as usize).max(1);
        Self {
            samples_per_chunk,
            buffer: Vec::with_capacity(samples_per_chunk * 2),
        }
    }

    pub fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }

    /// Append samples; returns every complete chunk.
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.buffer.extend_from_slice(samples);
        let mut chunks = Vec::new();
        while self.buffer.len() >= self.samples_per_chunk {
            chunks.push(self.buffer.drain(..self.samples_per_chunk).collect());
        }
        chunks
    }

    /// Remaining partial chunk, if any.
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
