//! Error types for the duplex voice engine

use duplex_wire::WireError;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Whether a device failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Overflow/underflow or a busy device: retry after a short pause.
    Transient,
    /// The device is gone or unusable: mark the stream dead.
    Persistent,
}

/// Errors that can occur in the voice engine
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error ({kind:?}): {message}")]
    Device { kind: DeviceError, message: String },

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Turn gate timed out after {0:?}")]
    TurnTimeout(std::time::Duration),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    pub fn transient(message: impl Into<String>) -> Self {
        VoiceError::Device {
            kind: DeviceError::Transient,
            message: message.into(),
        }
    }

    pub fn persistent(message: impl Into<String>) -> Self {
        VoiceError::Device {
            kind: DeviceError::Persistent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VoiceError::Device {
                kind: DeviceError::Transient,
                ..
            }
        )
    }

    /// A device is gone; the audio threads have to be rebuilt.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            VoiceError::Device {
                kind: DeviceError::Persistent,
                ..
            }
        )
    }

    /// Errors that must end the scheduler run so the supervisor can reconnect.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, VoiceError::Wire(e) if e.is_connection_fatal())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::persistent(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::persistent(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::persistent(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::persistent(err.to_string())
    }
}

impl From<cpal::StreamError> for VoiceError {
    fn from(err: cpal::StreamError) -> Self {
        match err {
            cpal::StreamError::DeviceNotAvailable => VoiceError::persistent(err.to_string()),
            _ => VoiceError::transient(err.to_string()),
        }
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Config(format!("WAV decode failed: {}", err))
    }
}
