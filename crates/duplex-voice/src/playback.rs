//! Speaker output: a bounded jitter buffer drained by a dedicated playback thread.
//!
//! The buffer admits chunks of one origin at a time, so cloud and agent speech never interleave.
//! Cues live in a side queue: they survive a purge and are played between chunks. The playback
//! thread re-checks the shared turn state before every cloud chunk, which catches audio that was
//! queued just before the cloud route was muted.

use crate::capture::StreamStatus;
use crate::conditioner::{expand_channels, AecHandle, Resampler};
use crate::cues::CueSound;
use crate::device::OutputFactory;
use crate::error::VoiceResult;
use crate::turn::{Origin, TurnStateCell};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Mono PCM16 speech.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub origin: Origin,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(origin: Origin, samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            origin,
            samples,
            sample_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlaybackItem {
    Chunk(AudioChunk),
    Cue(CueSound),
}

impl PlaybackItem {
    fn samples(&self) -> &[i16] {
        match self {
            PlaybackItem::Chunk(chunk) => &chunk.samples,
            PlaybackItem::Cue(cue) => cue.samples(),
        }
    }

    fn sample_rate(&self) -> u32 {
        match self {
            PlaybackItem::Chunk(chunk) => chunk.sample_rate,
            PlaybackItem::Cue(cue) => cue.sample_rate(),
        }
    }
}

/// Result of [`JitterBuffer::push`].
#[derive(Debug)]
pub enum Admission {
    Queued,
    /// Queued after evicting the oldest chunk.
    Evicted(AudioChunk),
    /// The chunk's origin is not the open one.
    Rejected,
}

struct BufferState {
    chunks: VecDeque<AudioChunk>,
    cues: VecDeque<CueSound>,
    origin: Option<Origin>,
    capacity: usize,
    /// An item has been handed out and is still being written.
    playing: bool,
    closed: bool,
    evicted: u64,
}

/// Bounded, drop-oldest queue between the scheduler and the playback thread.
pub struct JitterBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
}

impl JitterBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BufferState {
                chunks: VecDeque::with_capacity(capacity),
                cues: VecDeque::new(),
                origin: None,
                capacity,
                playing: false,
                closed: false,
                evicted: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Admit chunks of `origin` from now on. Chunks already queued keep their order.
    pub fn open_origin(&self, origin: Origin) {
        let mut state = self.state.lock();
        if state.origin != Some(origin) {
            debug!(?origin, "Playback origin opened");
            state.origin = Some(origin);
        }
    }

    pub fn origin(&self) -> Option<Origin> {
        self.state.lock().origin
    }

    pub fn push(&self, chunk: AudioChunk) -> Admission {
        let mut state = self.state.lock();
        if state.closed || state.origin != Some(chunk.origin) {
            return Admission::Rejected;
        }
        let evicted = if state.chunks.len() >= state.capacity {
            state.evicted += 1;
            if state.evicted == 1 || state.evicted % 50 == 0 {
                warn!(evicted = state.evicted, "Playback buffer full, dropping oldest chunk");
            }
            state.chunks.pop_front()
        } else {
            None
        };
        state.chunks.push_back(chunk);
        self.ready.notify_one();
        match evicted {
            Some(old) => Admission::Evicted(old),
            None => Admission::Queued,
        }
    }

    pub fn push_cue(&self, cue: CueSound) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.cues.push_back(cue);
        self.ready.notify_one();
    }

    /// Drop queued speech. Cues are kept. Returns the number of chunks dropped.
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.chunks.len();
        state.chunks.clear();
        if dropped > 0 {
            debug!(dropped, "Playback buffer purged");
        }
        dropped
    }

    /// Drop speech and cues.
    pub fn purge_all(&self) {
        let mut state = self.state.lock();
        state.chunks.clear();
        state.cues.clear();
    }

    /// Queued speech chunks (cues excluded).
    pub fn len(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing queued and nothing being written.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.chunks.is_empty() && state.cues.is_empty() && !state.playing
    }

    pub fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }

    /// Wake the playback thread and refuse further input.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Next item to play, waiting up to `timeout`. A cue goes ahead of the next chunk.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<PlaybackItem> {
        let mut state = self.state.lock();
        state.playing = false;
        if state.chunks.is_empty() && state.cues.is_empty() && !state.closed {
            self.ready.wait_for(&mut state, timeout);
        }
        let item = match state.cues.pop_front() {
            Some(cue) => Some(PlaybackItem::Cue(cue)),
            None => state.chunks.pop_front().map(PlaybackItem::Chunk),
        };
        state.playing = item.is_some();
        item
    }

    /// Mark the item handed out by [`pop_timeout`](Self::pop_timeout) as written.
    pub fn finish_item(&self) {
        self.state.lock().playing = false;
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub latency_warn: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff: Duration::from_millis(20),
            latency_warn: Duration::from_millis(100),
        }
    }
}

impl From<&crate::config::AudioConfig> for PlaybackConfig {
    fn from(audio: &crate::config::AudioConfig) -> Self {
        Self {
            max_retries: audio.max_device_retries,
            retry_backoff: Duration::from_millis(audio.retry_backoff_ms),
            latency_warn: Duration::from_millis(audio.latency_warn_ms),
        }
    }
}

/// Read-only view of a playback thread's status, for whoever drives the buffer.
/// The default watches nothing and never reports a dead stream.
#[derive(Clone, Default)]
pub struct PlaybackMonitor {
    status: Option<Arc<Mutex<StreamStatus>>>,
}

impl PlaybackMonitor {
    /// Why the stream died, if it did.
    pub fn dead_reason(&self) -> Option<String> {
        match self.status.as_ref().map(|status| status.lock().clone()) {
            Some(StreamStatus::Dead(reason)) => Some(reason),
            _ => None,
        }
    }
}

/// Handle to the playback thread.
pub struct PlaybackLoop {
    status: Arc<Mutex<StreamStatus>>,
    stop: Arc<AtomicBool>,
    buffer: Arc<JitterBuffer>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackLoop {
    /// Start draining `buffer` into the device the factory opens.
    pub fn spawn(
        factory: OutputFactory,
        buffer: Arc<JitterBuffer>,
        turn_state: TurnStateCell,
        aec: AecHandle,
        config: PlaybackConfig,
    ) -> VoiceResult<Self> {
        let status = Arc::new(Mutex::new(StreamStatus::Starting));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = PlaybackWorker {
            factory,
            buffer: buffer.clone(),
            turn_state,
            aec,
            config,
            status: status.clone(),
            stop: stop.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("duplex-playback".to_string())
            .spawn(move || worker.run())?;
        Ok(Self {
            status,
            stop,
            buffer,
            thread: Some(thread),
        })
    }

    pub fn status(&self) -> StreamStatus {
        self.status.lock().clone()
    }

    pub fn is_dead(&self) -> bool {
        matches!(*self.status.lock(), StreamStatus::Dead(_))
    }

    pub fn monitor(&self) -> PlaybackMonitor {
        PlaybackMonitor {
            status: Some(self.status.clone()),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.buffer.close();
    }

    pub fn join(mut self) -> StreamStatus {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Playback thread panicked");
            }
        }
        self.status()
    }
}

impl Drop for PlaybackLoop {
    fn drop(&mut self) {
        self.request_stop();
    }
}

struct PlaybackWorker {
    factory: OutputFactory,
    buffer: Arc<JitterBuffer>,
    turn_state: TurnStateCell,
    aec: AecHandle,
    config: PlaybackConfig,
    status: Arc<Mutex<StreamStatus>>,
    stop: Arc<AtomicBool>,
}

impl PlaybackWorker {
    fn set_status(&self, status: StreamStatus) {
        *self.status.lock() = status;
    }

    fn run(mut self) {
        let mut device = match (self.factory)() {
            Ok(device) => device,
            Err(e) => {
                error!("❌ Failed to open output device: {}", e);
                self.set_status(StreamStatus::Dead(e.to_string()));
                return;
            }
        };
        let device_rate = device.sample_rate();
        let device_channels = device.channels();
        let mut resampler: Option<Resampler> = None;

        self.set_status(StreamStatus::Running);
        info!("🔊 Playback loop running ({}Hz, {} ch)", device_rate, device_channels);

        while !self.stop.load(Ordering::SeqCst) {
            let Some(item) = self.buffer.pop_timeout(Duration::from_millis(100)) else {
                if self.buffer.is_closed() {
                    break;
                }
                continue;
            };

            if let PlaybackItem::Chunk(chunk) = &item {
                if chunk.origin == Origin::CloudS2S && self.turn_state.load().cloud_muted() {
                    debug!("Dropping cloud chunk at drain: route muted");
                    self.buffer.finish_item();
                    continue;
                }
            }

            let rate = item.sample_rate();
            if resampler.as_ref().map(Resampler::from_rate) != Some(rate) {
                resampler = Some(Resampler::new(rate, device_rate));
            }
            let mono = resampler
                .get_or_insert_with(|| Resampler::new(rate, device_rate))
                .process(item.samples());
            let out = expand_channels(&mono, device_channels);

            let started = Instant::now();
            let result = self.write_with_retry(device.as_mut(), &out);
            self.buffer.finish_item();
            if let Err(e) = result {
                error!("❌ Playback stream dead: {}", e);
                self.set_status(StreamStatus::Dead(e.to_string()));
                return;
            }
            let elapsed = started.elapsed();
            let audio_len = Duration::from_micros(mono.len() as u64 * 1_000_000 / device_rate.max(1) as u64);
            if elapsed > audio_len + self.config.latency_warn {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    audio_ms = audio_len.as_millis() as u64,
                    "Slow playback write"
                );
            }
            self.aec.feed_reference(&out, device_rate, device_channels);
        }

        self.set_status(StreamStatus::Stopped);
        info!("⏹️ Playback loop stopped");
    }

    fn write_with_retry(
        &self,
        device: &mut dyn crate::device::OutputDevice,
        samples: &[i16],
    ) -> VoiceResult<()> {
        let mut failures = 0u32;
        loop {
            match device.write(samples) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && failures < self.config.max_retries => {
                    failures += 1;
                    warn!(attempt = failures, "Transient playback error: {}", e);
                    std::thread::sleep(self.config.retry_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
