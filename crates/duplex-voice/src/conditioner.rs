//! Signal conditioning: rate conversion, echo cancellation and gain.
//!
//! Everything here operates on PCM16 (`i16`) samples. The capture and playback paths each own
//! a [`Resampler`]; the echo canceller is shared between them through [`AecHandle`], with the
//! playback thread feeding the reference and the capture thread cancelling against it.

use crate::config::UPLINK_SAMPLE_RATE;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Stateful linear-interpolation sample rate converter (mono).
///
/// The read position and the last input sample carry over between calls, so a stream split
/// into arbitrary chunks converts to exactly the same output as the unsplit stream. The
/// position is kept as an integer in units of `1 / to_rate` input samples to avoid drift.
#[derive(Debug, Clone)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    /// Read position; `to_rate` units per input sample. 0 is `last`, k units of
    /// `to_rate` is input[k - 1].
    pos: u64,
    last: i16,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let from_rate = from_rate.max(1);
        let to_rate = to_rate.max(1);
        Self {
            from_rate,
            to_rate,
            pos: to_rate as u64,
            last: 0,
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let unit = self.to_rate as u64;
        let end = input.len() as u64 * unit;
        let expected = (end / self.from_rate as u64) as usize + 1;
        let mut out = Vec::with_capacity(expected);
        let last = self.last;
        let sample = |idx: usize| -> f64 {
            if idx == 0 {
                last as f64
            } else {
                input[idx - 1] as f64
            }
        };

        while self.pos < end {
            let idx = (self.pos / unit) as usize;
            let frac = (self.pos % unit) as f64 / unit as f64;
            let a = sample(idx);
            let b = sample(idx + 1);
            out.push((a + (b - a) * frac).round() as i16);
            self.pos += self.from_rate as u64;
        }

        self.pos -= end;
        self.last = input[input.len() - 1];
        out
    }

    pub fn reset(&mut self) {
        self.pos = self.to_rate as u64;
        self.last = 0;
    }
}

/// Normalised LMS adaptive filter removing the played-back signal from the mic signal.
///
/// Runs at the uplink rate (16 kHz mono). The reference ring is bounded; the oldest
/// reference samples are discarded when playback runs ahead of capture.
pub struct EchoCanceller {
    weights: Vec<f32>,
    history: Vec<f32>,
    head: usize,
    power: f32,
    step: f32,
    reference: VecDeque<i16>,
    reference_cap: usize,
    reference_resampler: Resampler,
}

const NLMS_EPSILON: f32 = 1e-6;

impl EchoCanceller {
    pub fn new(taps: usize, step: f32) -> Self {
        let taps = taps.max(1);
        Self {
            weights: vec![0.0; taps],
            history: vec![0.0; taps],
            head: 0,
            power: 0.0,
            step,
            reference: VecDeque::with_capacity(UPLINK_SAMPLE_RATE as usize),
            reference_cap: UPLINK_SAMPLE_RATE as usize,
            reference_resampler: Resampler::new(UPLINK_SAMPLE_RATE, UPLINK_SAMPLE_RATE),
        }
    }

    /// Record samples that were just written to the speaker.
    pub fn feed_reference(&mut self, played: &[i16], rate: u32, channels: u16) {
        let mono = downmix_to_mono(played, channels);
        if self.reference_resampler.from_rate() != rate {
            self.reference_resampler = Resampler::new(rate, UPLINK_SAMPLE_RATE);
        }
        let converted = self.reference_resampler.process(&mono);
        self.reference.extend(converted);
        while self.reference.len() > self.reference_cap {
            self.reference.pop_front();
        }
    }

    /// Remove the estimated echo from a 16 kHz mono mic chunk.
    pub fn cancel(&mut self, mic: &[i16]) -> Vec<i16> {
        let taps = self.weights.len();
        let mut out = Vec::with_capacity(mic.len());

        for &d in mic {
            let x_new = i16_to_f32(self.reference.pop_front().unwrap_or(0));
            let x_old = self.history[self.head];
            self.history[self.head] = x_new;
            self.power += x_new * x_new - x_old * x_old;
            if self.power < 0.0 {
                self.power = 0.0;
            }

            // y = w · x, with history[head] the newest sample
            let mut estimate = 0.0f32;
            for k in 0..taps {
                let idx = (self.head + taps - k) % taps;
                estimate += self.weights[k] * self.history[idx];
            }

            let desired = i16_to_f32(d);
            let error = desired - estimate;
            let norm = self.step * error / (self.power + NLMS_EPSILON);
            if self.power > NLMS_EPSILON {
                for k in 0..taps {
                    let idx = (self.head + taps - k) % taps;
                    self.weights[k] += norm * self.history[idx];
                }
            }

            self.head = (self.head + 1) % taps;
            out.push(clip(error * 32768.0));
        }
        out
    }

    /// Clear filter taps and the reference ring.
    pub fn reset(&mut self) {
        self.weights.iter_mut().for_each(|w| *w = 0.0);
        self.history.iter_mut().for_each(|x| *x = 0.0);
        self.head = 0;
        self.power = 0.0;
        self.reference.clear();
        self.reference_resampler.reset();
    }

    pub fn reference_len(&self) -> usize {
        self.reference.len()
    }
}

/// Shared handle to the echo canceller used by both audio threads.
#[derive(Clone)]
pub struct AecHandle {
    inner: Arc<Mutex<EchoCanceller>>,
}

impl AecHandle {
    pub fn new(taps: usize, step: f32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EchoCanceller::new(taps, step))),
        }
    }

    pub fn feed_reference(&self, played: &[i16], rate: u32, channels: u16) {
        self.inner.lock().feed_reference(played, rate, channels);
    }

    pub fn cancel(&self, mic: &[i16]) -> Vec<i16> {
        self.inner.lock().cancel(mic)
    }

    pub fn reset(&self) {
        self.inner.lock().reset();
    }
}

/// Fixed gain with clipping. Only for the wake detector's copy.
pub fn boost_gain(samples: &[i16], gain: f32) -> Vec<i16> {
    samples.iter().map(|&s| clip(s as f32 * gain)).collect()
}

pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Duplicate each mono sample across `channels`.
pub fn expand_channels(mono: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return mono.to_vec();
    }
    let mut out = Vec::with_capacity(mono.len() * channels as usize);
    for &s in mono {
        for _ in 0..channels {
            out.push(s);
        }
    }
    out
}

pub fn mono_to_stereo(mono: &[i16]) -> Vec<i16> {
    expand_channels(mono, 2)
}

pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Root mean square level in 0.0..=1.0.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

pub fn f32_to_i16(sample: f32) -> i16 {
    clip(sample * 32767.0)
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

fn clip(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Mic output after conditioning.
#[derive(Debug, Clone)]
pub struct ConditionedChunk {
    /// 16 kHz mono, echo cancelled. Sent to the cloud.
    pub uplink: Vec<i16>,
    /// Same signal with the wake gain applied.
    pub wake: Vec<i16>,
}

/// Capture-side chain: downmix, resample to 16 kHz, cancel echo, boost a copy.
pub struct CapturePipeline {
    channels: u16,
    resampler: Resampler,
    aec: AecHandle,
    wake_gain: f32,
}

impl CapturePipeline {
    pub fn new(device_rate: u32, channels: u16, aec: AecHandle, wake_gain: f32) -> Self {
        Self {
            channels,
            resampler: Resampler::new(device_rate, UPLINK_SAMPLE_RATE),
            aec,
            wake_gain,
        }
    }

    pub fn process(&mut self, raw: &[i16]) -> ConditionedChunk {
        let mono = downmix_to_mono(raw, self.channels);
        let resampled = self.resampler.process(&mono);
        let uplink = self.aec.cancel(&resampled);
        let wake = boost_gain(&uplink, self.wake_gain);
        ConditionedChunk { uplink, wake }
    }
}
