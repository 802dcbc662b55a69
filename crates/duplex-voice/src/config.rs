//! Engine configuration.
//!
//! Every empirically tuned threshold lives here so deployments can adjust it from the
//! config file or `DUPLEX__...` environment variables without a rebuild.

use duplex_wire::{ConnectConfig, EventCode, TransportConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Sample rate of audio uploaded to the cloud (PCM16 mono).
pub const UPLINK_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of cloud TTS audio (PCM16 mono).
pub const DOWNLINK_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cloud: CloudConfig,
    pub audio: AudioConfig,
    pub turn: TurnConfig,
    pub wake: WakeConfig,
}

/// Cloud dialogue endpoint plus the session parameters sent in StartSession.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    #[serde(flatten)]
    pub connect: ConnectConfig,
    /// Cloud TTS voice.
    pub speaker: String,
    pub bot_name: String,
    pub system_role: String,
    pub speaking_style: String,
    /// Pause between FinishSession and StartSession on hot reset.
    pub settle_delay_ms: u64,
    pub ack_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            speaker: "zh_female_vv_jupiter_bigtts".to_string(),
            bot_name: "Duplex".to_string(),
            system_role: "You are a concise, friendly voice assistant.".to_string(),
            speaking_style: "Speak naturally and briefly.".to_string(),
            settle_delay_ms: 600,
            ack_timeout_ms: 10_000,
            queue_capacity: 256,
        }
    }
}

impl CloudConfig {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            settle_delay_ms: self.settle_delay_ms,
            ack_timeout_ms: self.ack_timeout_ms,
            queue_capacity: self.queue_capacity,
            ..TransportConfig::default()
        }
    }

    /// StartSession payload: downlink as PCM16 mono 24 kHz plus the dialog persona.
    pub fn session_payload(&self) -> Value {
        json!({
            "tts": {
                "speaker": self.speaker,
                "audio_config": {
                    "channel": 1,
                    "format": "pcm_s16le",
                    "sample_rate": DOWNLINK_SAMPLE_RATE,
                },
            },
            "dialog": {
                "bot_name": self.bot_name,
                "system_role": self.system_role,
                "speaking_style": self.speaking_style,
                "extra": { "input_mod": "audio" },
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture chunk length (default 20 ms, so 500 queued chunks hold 10 s).
    pub chunk_ms: u32,
    pub capture_queue: usize,
    pub playback_capacity: usize,
    /// Preferred device rates; the device default is used when unset.
    pub capture_rate: Option<u32>,
    pub playback_rate: Option<u32>,
    pub playback_channels: Option<u16>,
    /// Transient device errors tolerated in a row before the stream is marked dead.
    pub max_device_retries: u32,
    pub retry_backoff_ms: u64,
    /// Hardware writes slower than this are logged.
    pub latency_warn_ms: u64,
    /// NLMS filter length in samples at 16 kHz.
    pub aec_taps: usize,
    pub aec_step: f32,
    pub ack_cue: Option<PathBuf>,
    pub filler_cue: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 20,
            capture_queue: 500,
            playback_capacity: 64,
            capture_rate: None,
            playback_rate: None,
            playback_channels: None,
            max_device_retries: 5,
            retry_backoff_ms: 20,
            latency_warn_ms: 100,
            aec_taps: 256,
            aec_step: 0.1,
            ack_cue: None,
            filler_cue: None,
        }
    }
}

impl AudioConfig {
    pub fn chunk_samples(&self, rate: u32) -> usize {
        ((rate as u64 * self.chunk_ms as u64) / 1000).max(1) as usize
    }
}

/// Who voices replies produced by the local agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentVoice {
    /// Local `TtsClient` into the playback buffer.
    #[default]
    Local,
    /// Cloud voice through ChatTTS.
    Cloud,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Active → Standby after this long with nobody speaking.
    pub idle_timeout_ms: u64,
    /// Pending turns are force-released after this long.
    pub gate_timeout_ms: u64,
    /// Output silence that ends a turn once something was spoken.
    pub silence_eot_ms: u64,
    /// Partial transcripts containing one of these hand the turn to the local agent.
    pub trigger_keywords: Vec<String>,
    /// Phrases that wake the engine from inside a cloud transcript.
    pub wake_phrases: Vec<String>,
    /// Server events that close a turn.
    pub terminal_events: Vec<u32>,
    /// Added to the ack cue duration when ignoring mic audio after a wake.
    pub ignore_margin_ms: u64,
    pub agent_voice: AgentVoice,
    /// Scheduler tick for timers.
    pub tick_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            gate_timeout_ms: 20_000,
            silence_eot_ms: 1_000,
            trigger_keywords: ["search", "look up", "weather", "remind me", "schedule", "calculate"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            wake_phrases: vec!["hey duplex".to_string()],
            terminal_events: vec![
                EventCode::TTS_SENTENCE_END.code(),
                EventCode::TTS_ENDED.code(),
                EventCode::SESSION_FINISHED.code(),
            ],
            ignore_margin_ms: 300,
            agent_voice: AgentVoice::Local,
            tick_ms: 50,
        }
    }
}

impl TurnConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }

    pub fn silence_eot(&self) -> Duration {
        Duration::from_millis(self.silence_eot_ms)
    }

    pub fn terminal_event_codes(&self) -> Vec<EventCode> {
        self.terminal_events.iter().copied().map(EventCode).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    pub threshold: f32,
    /// Samples per detector call at 16 kHz.
    pub window_samples: usize,
    pub debounce_ms: u64,
    /// Applied only to the copy fed to the detector.
    pub gain: f32,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            window_samples: 1280,
            debounce_ms: 2_000,
            gain: 2.0,
        }
    }
}
