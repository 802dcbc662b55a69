//! Short feedback sounds: the ack played on wake and the filler played while the agent works.

use crate::config::AudioConfig;
use crate::conditioner::{downmix_to_mono, f32_to_i16};
use crate::error::{VoiceError, VoiceResult};
use crate::turn::Cue;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Mono PCM16 clip.
#[derive(Debug, Clone)]
pub struct CueSound {
    samples: Arc<[i16]>,
    sample_rate: u32,
}

impl CueSound {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate: sample_rate.max(1),
        }
    }

    /// Load a WAV file, downmixing to mono.
    pub fn from_wav(path: &Path) -> VoiceResult<Self> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
            (hound::SampleFormat::Int, bits) if bits > 16 => reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> (bits - 16)) as i16))
                .collect::<Result<_, _>>()?,
            (hound::SampleFormat::Float, _) => reader
                .samples::<f32>()
                .map(|s| s.map(f32_to_i16))
                .collect::<Result<_, _>>()?,
            (format, bits) => {
                return Err(VoiceError::Config(format!(
                    "{}: unsupported WAV format {:?}/{} bits",
                    path.display(),
                    format,
                    bits
                )))
            }
        };
        let samples = downmix_to_mono(&interleaved, spec.channels);
        info!(
            "🔔 Loaded cue {} ({} ms)",
            path.display(),
            samples.len() as u64 * 1000 / spec.sample_rate.max(1) as u64
        );
        Ok(Self::new(samples, spec.sample_rate))
    }

    /// Sine tone with a short linear fade at both ends.
    pub fn tone(frequency: f32, duration: Duration, sample_rate: u32, amplitude: f32) -> Self {
        let len = (sample_rate as u128 * duration.as_millis() / 1000) as usize;
        let fade = (sample_rate as usize / 200).max(1).min(len / 2 + 1);
        let samples = (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                let envelope = (i.min(len - 1 - i) as f32 / fade as f32).min(1.0);
                let value = (2.0 * std::f32::consts::PI * frequency * t).sin();
                f32_to_i16(value * amplitude * envelope)
            })
            .collect();
        Self::new(samples, sample_rate)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

/// The cues the scheduler can play.
#[derive(Debug, Clone)]
pub struct CueSet {
    pub ack: CueSound,
    pub filler: CueSound,
}

impl Default for CueSet {
    fn default() -> Self {
        Self {
            ack: CueSound::tone(880.0, Duration::from_millis(180), 24_000, 0.3),
            filler: CueSound::tone(523.0, Duration::from_millis(250), 24_000, 0.2),
        }
    }
}

impl CueSet {
    /// Cues from the configured WAV files; generated tones where a file is unset or broken.
    pub fn load(audio: &AudioConfig) -> Self {
        let defaults = Self::default();
        Self {
            ack: load_or(audio.ack_cue.as_deref(), defaults.ack),
            filler: load_or(audio.filler_cue.as_deref(), defaults.filler),
        }
    }

    pub fn get(&self, cue: Cue) -> &CueSound {
        match cue {
            Cue::Ack => &self.ack,
            Cue::Filler => &self.filler,
        }
    }
}

fn load_or(path: Option<&Path>, fallback: CueSound) -> CueSound {
    let Some(path) = path else {
        return fallback;
    };
    match CueSound::from_wav(path) {
        Ok(cue) => cue,
        Err(e) => {
            warn!("⚠️ Failed to load cue {}: {}. Using generated tone.", path.display(), e);
            fallback
        }
    }
}
