//! Microphone capture thread.
//!
//! A dedicated OS thread does nothing but blocking reads and hand-offs. The hand-off is a
//! `try_send` into a bounded channel: when the consumer falls behind the newest chunk is
//! dropped, and the hardware read is never blocked by backpressure.

use crate::device::InputFactory;
use crate::error::VoiceResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One fixed-size block of interleaved device samples.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    pub captured_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamStatus {
    Starting,
    Running,
    /// Persistent device failure; a new loop has to be spawned.
    Dead(String),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub chunk_ms: u32,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 20,
            queue_capacity: 500,
            max_retries: 5,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

impl From<&crate::config::AudioConfig> for CaptureConfig {
    fn from(audio: &crate::config::AudioConfig) -> Self {
        Self {
            chunk_ms: audio.chunk_ms,
            queue_capacity: audio.capture_queue,
            max_retries: audio.max_device_retries,
            retry_backoff: Duration::from_millis(audio.retry_backoff_ms),
        }
    }
}

/// Handle to a running capture thread.
pub struct AudioCaptureLoop {
    status: Arc<Mutex<StreamStatus>>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl AudioCaptureLoop {
    /// Start the capture thread. The device is opened on that thread.
    pub fn spawn(
        factory: InputFactory,
        config: CaptureConfig,
    ) -> VoiceResult<(Self, mpsc::Receiver<RawChunk>)> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let status = Arc::new(Mutex::new(StreamStatus::Starting));
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = CaptureWorker {
            factory,
            config,
            tx,
            status: status.clone(),
            stop: stop.clone(),
            dropped: dropped.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("duplex-capture".to_string())
            .spawn(move || worker.run())?;

        Ok((
            Self {
                status,
                stop,
                dropped,
                thread: Some(thread),
            },
            rx,
        ))
    }

    pub fn status(&self) -> StreamStatus {
        self.status.lock().clone()
    }

    pub fn is_dead(&self) -> bool {
        matches!(*self.status.lock(), StreamStatus::Dead(_))
    }

    /// Chunks discarded because the consumer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the thread to stop after its current read.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and wait for the thread to exit.
    pub fn join(mut self) -> StreamStatus {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Capture thread panicked");
            }
        }
        self.status()
    }
}

impl Drop for AudioCaptureLoop {
    fn drop(&mut self) {
        self.request_stop();
    }
}

struct CaptureWorker {
    factory: InputFactory,
    config: CaptureConfig,
    tx: mpsc::Sender<RawChunk>,
    status: Arc<Mutex<StreamStatus>>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl CaptureWorker {
    fn set_status(&self, status: StreamStatus) {
        *self.status.lock() = status;
    }

    fn run(mut self) {
        let mut device = match (self.factory)() {
            Ok(device) => device,
            Err(e) => {
                error!("❌ Failed to open input device: {}", e);
                self.set_status(StreamStatus::Dead(e.to_string()));
                return;
            }
        };

        let rate = device.sample_rate();
        let channels = device.channels();
        let frames = ((rate as u64 * self.config.chunk_ms as u64) / 1000).max(1) as usize;
        let mut buf = vec![0i16; frames * channels as usize];
        let mut failures = 0u32;

        self.set_status(StreamStatus::Running);
        info!("🎙️ Capture loop running ({}Hz, {} ch, {} frames/chunk)", rate, channels, frames);

        while !self.stop.load(Ordering::SeqCst) {
            match device.read(&mut buf) {
                Ok(()) => {
                    failures = 0;
                    let chunk = RawChunk {
                        samples: buf.clone(),
                        sample_rate: rate,
                        channels,
                        captured_at: Instant::now(),
                    };
                    if !self.handoff(chunk) {
                        debug!("Capture consumer gone, stopping");
                        self.set_status(StreamStatus::Stopped);
                        return;
                    }
                }
                Err(e) if e.is_transient() && failures < self.config.max_retries => {
                    failures += 1;
                    warn!(attempt = failures, "Transient capture error: {}", e);
                    std::thread::sleep(self.config.retry_backoff);
                }
                Err(e) => {
                    error!("❌ Capture stream dead: {}", e);
                    self.set_status(StreamStatus::Dead(e.to_string()));
                    return;
                }
            }
        }

        self.set_status(StreamStatus::Stopped);
        info!("⏹️ Capture loop stopped");
    }

    /// Returns false once the receiver is gone.
    fn handoff(&self, chunk: RawChunk) -> bool {
        match self.tx.try_send(chunk) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(dropped, "Capture queue full, dropping newest chunk");
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}
