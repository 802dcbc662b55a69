//! # Duplex Voice - Full-Duplex Dialogue Engine
//!
//! Audio pipeline, wake gate and turn arbitration on top of [`duplex_wire`].
//!
//! ## Architecture
//!
//! ```text
//!  mic ─→ AudioCaptureLoop ─→ CapturePipeline (resample, AEC) ─┬─→ WakeGate   (standby)
//!         (own thread)                                         └─→ transport  (active)
//!
//!  cloud frames ──┐
//!  commands ──────┼─→ TurnCoordinator ─→ TurnMachine ─→ effects ─→ JitterBuffer
//!  agent / TTS ───┤        (select loop)                              │
//!  tick ──────────┘              │                                     ▼
//!                          TurnStateCell ─────────────────→ PlaybackLoop ─→ speaker
//!                                                           (own thread, feeds AEC)
//! ```
//!
//! The coordinator is the only writer of the turn state; the audio threads read snapshots.

pub mod capture;
pub mod collaborators;
pub mod conditioner;
pub mod config;
pub mod coordinator;
pub mod cues;
pub mod device;
pub mod error;
pub mod playback;
pub mod tools;
pub mod turn;
pub mod wake;

pub use capture::{AudioCaptureLoop, CaptureConfig, RawChunk, StreamStatus};
pub use collaborators::{
    AgentRuntime, IntentClassifier, LocalMedia, NoopMedia, NullObserver, TokenCallback,
    TtsClient, TurnEndReason, TurnObserver, Verdict, WakeReason, WakeWordDetector,
};
pub use conditioner::{AecHandle, CapturePipeline, EchoCanceller, Resampler};
pub use config::{
    AgentVoice, AudioConfig, CloudConfig, EngineConfig, TurnConfig, WakeConfig,
    DOWNLINK_SAMPLE_RATE, UPLINK_SAMPLE_RATE,
};
pub use coordinator::{
    AudioRig, AudioThreads, EngineCommand, EngineContext, EngineHandle, EngineIo, RunExit,
    TurnCoordinator,
};
pub use cues::{CueSet, CueSound};
pub use device::{
    list_input_devices, list_output_devices, CpalInput, CpalOutput, InputDevice, InputFactory,
    OutputDevice, OutputFactory,
};
pub use error::{DeviceError, VoiceError, VoiceResult};
pub use playback::{
    Admission, AudioChunk, JitterBuffer, PlaybackConfig, PlaybackItem, PlaybackLoop,
    PlaybackMonitor,
};
pub use tools::{Tool, ToolCategory, ToolRegistry, TypedTool};
pub use turn::{
    ActiveTurn, CloudRoute, Cue, Effect, Gate, GateBusy, Origin, TurnMachine, TurnParams,
    TurnState, TurnStateCell,
};
pub use wake::{WakeEvent, WakeGate};
