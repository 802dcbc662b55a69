//! Daemon configuration: engine sections plus the HTTP backends and reconnect policy.

use duplex_voice::{AudioConfig, CloudConfig, EngineConfig, TurnConfig, WakeConfig};
use duplex_wire::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default config location when `DUPLEX_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config/duplex.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub cloud: CloudConfig,
    pub audio: AudioConfig,
    pub turn: TurnConfig,
    pub wake: WakeConfig,
    pub reconnect: ReconnectPolicy,
    pub agent: AgentConfig,
    pub tts: TtsConfig,
    pub classifier: ClassifierConfig,
    pub detector: DetectorConfig,
}

/// OpenAI-compatible chat completion backend for the local agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL without trailing slash, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    /// Tool call rounds before the agent gives up.
    pub max_tool_rounds: usize,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a voice assistant. Answer in one or two short spoken sentences, \
                            without markdown or lists."
                .to_string(),
            max_tool_rounds: 4,
            timeout_secs: 60,
        }
    }
}

/// OpenAI-compatible `/audio/speech` backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub base_url: String,
    /// Falls back to the agent key when empty.
    pub api_key: String,
    pub model: String,
    pub voice: String,
    /// Rate of the raw PCM the endpoint returns.
    pub sample_rate: u32,
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            sample_rate: 24_000,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Substrings that route a query to the agent. Empty: use `turn.trigger_keywords`.
    pub keywords: Vec<String>,
    /// Queries longer than this many words go to the agent. 0 disables the rule.
    pub long_query_words: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Wake on sustained loud input (clap, shout).
    #[default]
    Loudness,
    /// No acoustic wake; use the console or typed queries.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub kind: DetectorKind,
    /// Consecutive windows above the threshold needed to fire.
    pub sustain_windows: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Loudness,
            sustain_windows: 3,
        }
    }
}

impl DaemonConfig {
    /// Load config from file and environment. Precedence: env `DUPLEX__*` > file
    /// (`DUPLEX_CONFIG` or [`DEFAULT_CONFIG_PATH`]) > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = std::env::var("DUPLEX_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("cloud.settle_delay_ms", 600_i64)?
            .set_default("reconnect.max_delay_ms", 30_000_i64)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("DUPLEX").separator("__"))
            .build()?;

        let mut loaded: DaemonConfig = built.try_deserialize()?;
        loaded.fill_from_env();
        Ok(loaded)
    }

    /// Conventional provider variables for secrets left empty in the file.
    fn fill_from_env(&mut self) {
        if self.agent.api_key.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.agent.api_key = key;
            }
        }
        if self.tts.api_key.is_empty() {
            self.tts.api_key = std::env::var("TTS_API_KEY").unwrap_or_else(|_| self.agent.api_key.clone());
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            cloud: self.cloud.clone(),
            audio: self.audio.clone(),
            turn: self.turn.clone(),
            wake: self.wake.clone(),
        }
    }

    pub fn classifier_keywords(&self) -> Vec<String> {
        if self.classifier.keywords.is_empty() {
            self.turn.trigger_keywords.clone()
        } else {
            self.classifier.keywords.clone()
        }
    }
}
