//! Host-side collaborators: a loudness wake trigger and a logging observer.

use duplex_voice::conditioner::rms;
use duplex_voice::{TurnEndReason, TurnObserver, WakeReason, WakeWordDetector};
use tracing::info;

/// Fires after `sustain` consecutive windows whose RMS (as a fraction of full scale)
/// reaches the threshold.
pub struct LoudnessDetector {
    sustain: usize,
    streak: usize,
    score: f32,
}

impl LoudnessDetector {
    pub fn new(sustain: usize) -> Self {
        Self {
            sustain: sustain.max(1),
            streak: 0,
            score: 0.0,
        }
    }
}

impl WakeWordDetector for LoudnessDetector {
    fn process_audio(&mut self, window: &[i16], threshold: f32) -> bool {
        if window.is_empty() {
            return false;
        }
        self.score = rms(window);

        if self.score >= threshold {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        self.streak >= self.sustain
    }

    fn last_score(&self) -> f32 {
        self.score
    }

    fn reset(&mut self) {
        self.streak = 0;
    }
}

/// Detector for deployments without an acoustic trigger.
pub struct DisabledDetector;

impl WakeWordDetector for DisabledDetector {
    fn process_audio(&mut self, _window: &[i16], _threshold: f32) -> bool {
        false
    }

    fn reset(&mut self) {}
}

/// Writes transcripts and turn transitions to the log.
pub struct LogObserver;

impl TurnObserver for LogObserver {
    fn on_final_transcript(&self, text: &str) {
        info!(transcript = %text, "📝 User said");
    }

    fn on_turn_end(&self, reason: &TurnEndReason) {
        info!(reason = reason.as_str(), "Turn ended");
    }

    fn on_wake_triggered(&self, reason: &WakeReason) {
        info!(?reason, "🔔 Woke up");
    }
}
