//! Wake gate: windows standby audio for the wake-word detector and debounces its triggers.

use crate::collaborators::WakeWordDetector;
use crate::config::WakeConfig;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeEvent {
    pub score: f32,
    pub at: Instant,
}

pub struct WakeGate {
    detector: Box<dyn WakeWordDetector>,
    buffer: Vec<i16>,
    window_samples: usize,
    threshold: f32,
    debounce: Duration,
    last_fired: Option<Instant>,
    ignore_until: Option<Instant>,
}

impl WakeGate {
    pub fn new(detector: Box<dyn WakeWordDetector>, config: &WakeConfig) -> Self {
        let window_samples = config.window_samples.max(1);
        Self {
            detector,
            buffer: Vec::with_capacity(window_samples * 2),
            window_samples,
            threshold: config.threshold,
            debounce: Duration::from_millis(config.debounce_ms),
            last_fired: None,
            ignore_until: None,
        }
    }

    /// Feed gain-boosted 16 kHz mono audio. Returns a trigger at most once per call.
    pub fn feed(&mut self, now: Instant, samples: &[i16]) -> Option<WakeEvent> {
        self.buffer.extend_from_slice(samples);
        let mut fired = None;

        while self.buffer.len() >= self.window_samples {
            let window: Vec<i16> = self.buffer.drain(..self.window_samples).collect();
            if fired.is_some() || self.ignoring(now) {
                continue;
            }
            if !self.detector.process_audio(&window, self.threshold) {
                continue;
            }

            let score = self.detector.last_score();
            if let Some(last) = self.last_fired {
                if now.saturating_duration_since(last) < self.debounce {
                    debug!(score, "Wake trigger debounced");
                    continue;
                }
            }

            info!("🔔 Wake word detected (score {:.2})", score);
            self.last_fired = Some(now);
            self.detector.reset();
            fired = Some(WakeEvent { score, at: now });
        }

        fired
    }

    fn ignoring(&self, now: Instant) -> bool {
        self.ignore_until.map(|until| now < until).unwrap_or(false)
    }

    /// Discard windows until `until` (the ack cue must not retrigger the detector).
    pub fn ignore_until(&mut self, until: Instant) {
        self.ignore_until = Some(until);
    }

    pub fn clear_ignore(&mut self) {
        self.ignore_until = None;
    }

    /// Drop buffered audio and detector state. The debounce survives.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.detector.reset();
    }
}
