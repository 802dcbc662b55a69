//! Seams to the systems the engine does not own: wake-word model, agent, local TTS,
//! intent classifier and the host's media player.

use crate::error::VoiceResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Acoustic wake-word model. Called from the scheduler with fixed windows of boosted
/// 16 kHz mono audio, so implementations must return quickly.
pub trait WakeWordDetector: Send {
    fn process_audio(&mut self, window: &[i16], threshold: f32) -> bool;

    /// Score of the last processed window, if the model exposes one.
    fn last_score(&self) -> f32 {
        0.0
    }

    fn reset(&mut self);
}

/// Receives streamed agent output as it is produced.
pub type TokenCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Tool-augmented agent answering the turns the cloud is not trusted with.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Run one request to completion and return the full reply text.
    async fn run(&self, text: &str, on_token: TokenCallback<'_>) -> VoiceResult<String>;
}

/// Local speech synthesis for agent replies.
pub trait TtsClient: Send + Sync {
    /// Stream of PCM16 little-endian mono chunks at [`sample_rate`](Self::sample_rate).
    fn synthesize(&self, text: &str) -> BoxStream<'static, VoiceResult<Bytes>>;

    fn sample_rate(&self) -> u32;
}

/// Routing decision for a user utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The cloud dialogue answers with its own voice.
    Simple,
    /// The cloud is silenced and the local agent answers.
    Complex,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Verdict;
}

/// Whatever else the host is playing (music, podcasts). Stopped on wake.
pub trait LocalMedia: Send + Sync {
    fn stop(&self);
}

/// Host that never plays media of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMedia;

impl LocalMedia for NoopMedia {
    fn stop(&self) {}
}

/// Why the engine woke up.
#[derive(Debug, Clone, PartialEq)]
pub enum WakeReason {
    /// Acoustic detector fired.
    Detector { score: f32 },
    /// Wake phrase appeared in a cloud transcript.
    Phrase(String),
    /// Triggered by the host (button, console).
    Manual,
}

/// Why a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEndReason {
    /// A configured terminal server event arrived.
    ServerEvent(u32),
    /// Output went silent after speaking.
    Silence,
    BargeIn,
    /// The pending turn was force-released.
    GateTimeout,
    /// The local agent finished speaking.
    AgentDone,
    /// Server error; the session is being reset.
    SessionError,
    /// The request could not be delivered.
    Abandoned,
}

impl TurnEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnEndReason::ServerEvent(_) => "server_event",
            TurnEndReason::Silence => "silence",
            TurnEndReason::BargeIn => "barge_in",
            TurnEndReason::GateTimeout => "gate_timeout",
            TurnEndReason::AgentDone => "agent_done",
            TurnEndReason::SessionError => "session_error",
            TurnEndReason::Abandoned => "abandoned",
        }
    }
}

/// Notifications for the host application. All methods default to no-ops.
pub trait TurnObserver: Send + Sync {
    fn on_final_transcript(&self, _text: &str) {}
    fn on_turn_end(&self, _reason: &TurnEndReason) {}
    fn on_wake_triggered(&self, _reason: &WakeReason) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TurnObserver for NullObserver {}
