//! Hardware adapters.
//!
//! The capture and playback threads want blocking `read`/`write` calls; cpal delivers audio
//! through callbacks. The adapters here bridge the two with a small condvar-guarded queue.
//! cpal streams are `!Send` on some hosts, so adapters are created on the thread that uses
//! them, through an [`InputFactory`] / [`OutputFactory`].

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, Stream, StreamConfig};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Blocking source of interleaved PCM16 samples.
pub trait InputDevice {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// Fill `buf` completely, blocking until enough samples arrived.
    fn read(&mut self, buf: &mut [i16]) -> VoiceResult<()>;
}

/// Blocking sink of interleaved PCM16 samples.
pub trait OutputDevice {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// Hand samples to the hardware, blocking while its queue is full.
    fn write(&mut self, samples: &[i16]) -> VoiceResult<()>;
}

pub type InputFactory = Box<dyn FnMut() -> VoiceResult<Box<dyn InputDevice>> + Send>;
pub type OutputFactory = Box<dyn FnMut() -> VoiceResult<Box<dyn OutputDevice>> + Send>;

/// How long a blocking call may wait before reporting a transient timeout.
const DEVICE_WAIT: Duration = Duration::from_secs(1);

struct Shared {
    queue: Mutex<SharedQueue>,
    ready: Condvar,
}

struct SharedQueue {
    samples: VecDeque<i16>,
    capacity: usize,
    failure: Option<VoiceError>,
    overflowed: u64,
}

impl Shared {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(SharedQueue {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                failure: None,
                overflowed: 0,
            }),
            ready: Condvar::new(),
        })
    }

    fn fail(&self, err: cpal::StreamError) {
        warn!("Audio stream error: {}", err);
        let mut q = self.queue.lock();
        q.failure = Some(err.into());
        self.ready.notify_all();
    }
}

/// Microphone through cpal.
pub struct CpalInput {
    _stream: Stream,
    shared: Arc<Shared>,
    sample_rate: u32,
    channels: u16,
}

impl CpalInput {
    /// Open the default input device, optionally at a preferred rate.
    pub fn open(preferred_rate: Option<u32>) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::persistent("No input device available"))?;
        info!(
            "🎤 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let default_config = device.default_input_config()?;
        let sample_format = default_config.sample_format();
        let mut config: StreamConfig = default_config.into();
        if let Some(rate) = preferred_rate {
            config.sample_rate = cpal::SampleRate(rate);
        }

        // One second of headroom between the callback and the reader.
        let shared = Shared::new(config.sample_rate.0 as usize * config.channels as usize);
        let stream = match sample_format {
            cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, shared.clone())?,
            cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, shared.clone())?,
            cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, shared.clone())?,
            other => {
                return Err(VoiceError::persistent(format!(
                    "Unsupported input sample format {:?}",
                    other
                )))
            }
        };
        stream.play()?;
        info!(
            "✅ Audio capture started ({}Hz, {} channels)",
            config.sample_rate.0, config.channels
        );

        Ok(Self {
            _stream: stream,
            shared,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        })
    }

    /// Factory for [`AudioCaptureLoop`](crate::capture::AudioCaptureLoop).
    pub fn factory(preferred_rate: Option<u32>) -> InputFactory {
        Box::new(move || Ok(Box::new(CpalInput::open(preferred_rate)?) as Box<dyn InputDevice>))
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<Shared>,
) -> VoiceResult<Stream>
where
    T: SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    let err_shared = shared.clone();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mut q = shared.queue.lock();
            for &s in data {
                if q.samples.len() >= q.capacity {
                    q.samples.pop_front();
                    q.overflowed += 1;
                }
                q.samples.push_back(i16::from_sample(s));
            }
            shared.ready.notify_one();
        },
        move |err| err_shared.fail(err),
        None,
    )?;
    Ok(stream)
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, buf: &mut [i16]) -> VoiceResult<()> {
        let mut q = self.shared.queue.lock();
        while q.samples.len() < buf.len() {
            if let Some(err) = q.failure.take() {
                return Err(err);
            }
            if self.shared.ready.wait_for(&mut q, DEVICE_WAIT).timed_out()
                && q.samples.len() < buf.len()
            {
                return Err(VoiceError::transient("input read timed out"));
            }
        }
        if q.overflowed > 0 {
            // Benign: the reader fell behind and the oldest samples were discarded.
            debug!(samples = q.overflowed, "Input overflow");
            q.overflowed = 0;
        }
        for slot in buf.iter_mut() {
            *slot = q.samples.pop_front().unwrap_or(0);
        }
        Ok(())
    }
}

/// Speaker through cpal.
pub struct CpalOutput {
    _stream: Stream,
    shared: Arc<Shared>,
    sample_rate: u32,
    channels: u16,
}

impl CpalOutput {
    /// Open the default output device, optionally at a preferred rate/channel count.
    pub fn open(preferred_rate: Option<u32>, preferred_channels: Option<u16>) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| VoiceError::persistent("No output device available"))?;
        info!(
            "🔊 Using output device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let default_config = device.default_output_config()?;
        let sample_format = default_config.sample_format();
        let mut config: StreamConfig = default_config.into();
        if let Some(rate) = preferred_rate {
            config.sample_rate = cpal::SampleRate(rate);
        }
        if let Some(channels) = preferred_channels {
            config.channels = channels;
        }

        // ~100 ms queued ahead of the hardware keeps write() paced to real time.
        let shared = Shared::new((config.sample_rate.0 as usize * config.channels as usize) / 10);
        let stream = match sample_format {
            cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, shared.clone())?,
            cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, shared.clone())?,
            cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, shared.clone())?,
            other => {
                return Err(VoiceError::persistent(format!(
                    "Unsupported output sample format {:?}",
                    other
                )))
            }
        };
        stream.play()?;
        info!(
            "✅ Audio playback started ({}Hz, {} channels)",
            config.sample_rate.0, config.channels
        );

        Ok(Self {
            _stream: stream,
            shared,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        })
    }

    pub fn factory(preferred_rate: Option<u32>, preferred_channels: Option<u16>) -> OutputFactory {
        Box::new(move || {
            Ok(Box::new(CpalOutput::open(preferred_rate, preferred_channels)?) as Box<dyn OutputDevice>)
        })
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<Shared>,
) -> VoiceResult<Stream>
where
    T: SizedSample + FromSample<i16> + Send + 'static,
{
    let err_shared = shared.clone();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut q = shared.queue.lock();
            for slot in data.iter_mut() {
                // Underflow plays silence.
                let s = q.samples.pop_front().unwrap_or(0);
                *slot = T::from_sample(s);
            }
            shared.ready.notify_one();
        },
        move |err| err_shared.fail(err),
        None,
    )?;
    Ok(stream)
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn write(&mut self, samples: &[i16]) -> VoiceResult<()> {
        let mut q = self.shared.queue.lock();
        let mut rest = samples;
        while !rest.is_empty() {
            if let Some(err) = q.failure.take() {
                return Err(err);
            }
            let room = q.capacity.saturating_sub(q.samples.len());
            if room == 0 {
                if self.shared.ready.wait_for(&mut q, DEVICE_WAIT).timed_out()
                    && q.samples.len() >= q.capacity
                {
                    return Err(VoiceError::transient("output write timed out"));
                }
                continue;
            }
            let n = room.min(rest.len());
            q.samples.extend(&rest[..n]);
            rest = &rest[n..];
        }
        Ok(())
    }
}

/// Names of the available input devices.
pub fn list_input_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    Ok(host.input_devices()?.filter_map(|d| d.name().ok()).collect())
}

/// Names of the available output devices.
pub fn list_output_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    Ok(host.output_devices()?.filter_map(|d| d.name().ok()).collect())
}
