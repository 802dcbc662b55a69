//! Frame model for the realtime dialogue protocol.
//!
//! A frame is a 4-byte header (version, header size, message type, flags, serialization,
//! compression) followed by optional sequence / error code / event / id fields and a
//! length-prefixed payload. Layout and byte order live in [`crate::codec`].

use bytes::Bytes;
use serde_json::Value;
use std::fmt;

/// Protocol version written into the high nibble of byte 0.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size in 4-byte words (the low nibble of byte 0).
pub const DEFAULT_HEADER_SIZE: u8 = 0b0001;

/// Message type (high nibble of byte 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    FullClientRequest,
    AudioOnlyClient,
    FullServerResponse,
    AudioOnlyServer,
    FrontEndResultServer,
    Error,
}

impl MessageType {
    pub fn bits(self) -> u8 {
        match self {
            MessageType::FullClientRequest => 0b0001,
            MessageType::AudioOnlyClient => 0b0010,
            MessageType::FullServerResponse => 0b1001,
            MessageType::AudioOnlyServer => 0b1011,
            MessageType::FrontEndResultServer => 0b1100,
            MessageType::Error => 0b1111,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b0001 => Some(MessageType::FullClientRequest),
            0b0010 => Some(MessageType::AudioOnlyClient),
            0b1001 => Some(MessageType::FullServerResponse),
            0b1011 => Some(MessageType::AudioOnlyServer),
            0b1100 => Some(MessageType::FrontEndResultServer),
            0b1111 => Some(MessageType::Error),
            _ => None,
        }
    }

    /// Client-originated frames are the only ones that carry a sequence number.
    pub fn is_client(self) -> bool {
        matches!(self, MessageType::FullClientRequest | MessageType::AudioOnlyClient)
    }
}

/// Message-type specific flags (low nibble of byte 1).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0b0000);
    /// A positive sequence number follows the header.
    pub const POSITIVE_SEQUENCE: Flags = Flags(0b0001);
    /// Last frame of a submission, without a sequence number.
    pub const LAST_NO_SEQUENCE: Flags = Flags(0b0010);
    /// Last frame of a submission, with a negative sequence number.
    pub const NEGATIVE_SEQUENCE: Flags = Flags(0b0011);
    /// An event id (and, for session events, a session id) follows.
    pub const WITH_EVENT: Flags = Flags(0b0100);

    pub fn from_bits(bits: u8) -> Self {
        Flags(bits & 0x0f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bit 0 set: a 4-byte sequence number is present (positive or negative).
    pub fn is_sequenced(self) -> bool {
        self.0 & 0b0001 != 0
    }

    pub fn has_event(self) -> bool {
        self.0 & Flags::WITH_EVENT.0 != 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({:#06b})", self.0)
    }
}

/// Payload serialization method (high nibble of byte 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Serialization {
    Raw,
    Json,
}

impl Serialization {
    pub fn bits(self) -> u8 {
        match self {
            Serialization::Raw => 0b0000,
            Serialization::Json => 0b0001,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b0000 => Some(Serialization::Raw),
            0b0001 => Some(Serialization::Json),
            _ => None,
        }
    }
}

/// Payload compression (low nibble of byte 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn bits(self) -> u8 {
        match self {
            Compression::None => 0b0000,
            Compression::Gzip => 0b0001,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b0000 => Some(Compression::None),
            0b0001 => Some(Compression::Gzip),
            _ => None,
        }
    }
}

/// Event id carried by frames with the `WITH_EVENT` flag.
///
/// Unknown ids are kept as-is so newer server events pass through the codec untouched.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventCode(pub u32);

impl EventCode {
    // Connection lifecycle
    pub const START_CONNECTION: EventCode = EventCode(1);
    pub const FINISH_CONNECTION: EventCode = EventCode(2);
    pub const CONNECTION_STARTED: EventCode = EventCode(50);
    pub const CONNECTION_FAILED: EventCode = EventCode(51);
    pub const CONNECTION_FINISHED: EventCode = EventCode(52);

    // Session lifecycle
    pub const START_SESSION: EventCode = EventCode(100);
    pub const CANCEL_SESSION: EventCode = EventCode(101);
    pub const FINISH_SESSION: EventCode = EventCode(102);
    pub const SESSION_STARTED: EventCode = EventCode(150);
    pub const SESSION_FINISHED: EventCode = EventCode(152);
    pub const SESSION_FAILED: EventCode = EventCode(153);

    // Client requests
    pub const TASK_REQUEST: EventCode = EventCode(200);
    pub const UPDATE_CONFIG: EventCode = EventCode(201);
    pub const CHAT_TTS: EventCode = EventCode(500);
    pub const TEXT_INPUT: EventCode = EventCode(501);

    // Server output
    pub const TTS_SENTENCE_START: EventCode = EventCode(350);
    pub const TTS_SENTENCE_END: EventCode = EventCode(351);
    pub const TTS_RESPONSE: EventCode = EventCode(352);
    pub const TTS_ENDED: EventCode = EventCode(359);
    pub const ASR_INFO: EventCode = EventCode(450);
    pub const ASR_RESPONSE: EventCode = EventCode(451);
    pub const ASR_ENDED: EventCode = EventCode(459);
    pub const CHAT_RESPONSE: EventCode = EventCode(550);
    pub const CHAT_ENDED: EventCode = EventCode(559);
    pub const DIALOG_COMMON_ERROR: EventCode = EventCode(599);

    pub fn code(self) -> u32 {
        self.0
    }

    /// Connection-scoped events never carry a session id.
    pub fn is_connection_level(self) -> bool {
        matches!(self.0, 1 | 2 | 50 | 51 | 52)
    }

    /// Server acknowledgements of the connection handshake, which echo a connect id.
    pub fn carries_connect_id(self) -> bool {
        matches!(self.0, 50 | 51 | 52)
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            1 => "StartConnection",
            2 => "FinishConnection",
            50 => "ConnectionStarted",
            51 => "ConnectionFailed",
            52 => "ConnectionFinished",
            100 => "StartSession",
            101 => "CancelSession",
            102 => "FinishSession",
            150 => "SessionStarted",
            152 => "SessionFinished",
            153 => "SessionFailed",
            200 => "TaskRequest",
            201 => "UpdateConfig",
            350 => "TTSSentenceStart",
            351 => "TTSSentenceEnd",
            352 => "TTSResponse",
            359 => "TTSEnded",
            450 => "ASRInfo",
            451 => "ASRResponse",
            459 => "ASREnded",
            500 => "ChatTTS",
            501 => "TextInput",
            550 => "ChatResponse",
            559 => "ChatEnded",
            599 => "DialogCommonError",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "Event({})", self.0),
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<u32> for EventCode {
    fn from(code: u32) -> Self {
        EventCode(code)
    }
}

/// Decoded frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON document (serialization = JSON). An empty payload decodes to `Value::Null`.
    Json(Value),
    /// Opaque bytes, usually PCM audio.
    Raw(Bytes),
}

impl Payload {
    pub fn empty_json() -> Self {
        Payload::Json(Value::Object(Default::default()))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Payload::Raw(b) => Some(b),
            Payload::Json(_) => None,
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: u8,
    pub header_size: u8,
    pub message_type: MessageType,
    pub flags: Flags,
    pub serialization: Serialization,
    pub compression: Compression,
    pub event: Option<EventCode>,
    pub session_id: Option<String>,
    /// Connect id echoed by the server on connection-level acknowledgements.
    pub connect_id: Option<String>,
    pub sequence: Option<i32>,
    pub error_code: Option<u32>,
    pub payload: Payload,
}

impl Frame {
    fn base(message_type: MessageType, flags: Flags, payload: Payload) -> Self {
        let serialization = match payload {
            Payload::Json(_) => Serialization::Json,
            Payload::Raw(_) => Serialization::Raw,
        };
        Self {
            version: PROTOCOL_VERSION,
            header_size: DEFAULT_HEADER_SIZE,
            message_type,
            flags,
            serialization,
            compression: Compression::None,
            event: None,
            session_id: None,
            connect_id: None,
            sequence: None,
            error_code: None,
            payload,
        }
    }

    /// Connection-scoped client request (no session id).
    pub fn control(event: EventCode, payload: Value) -> Self {
        let mut frame = Self::base(
            MessageType::FullClientRequest,
            Flags::WITH_EVENT,
            Payload::Json(payload),
        );
        frame.event = Some(event);
        frame
    }

    /// Session-scoped JSON client request.
    pub fn session(event: EventCode, session_id: impl Into<String>, payload: Value) -> Self {
        let mut frame = Self::control(event, payload);
        frame.session_id = Some(session_id.into());
        frame
    }

    /// Gzip-compressed PCM upload wrapped as `TaskRequest`.
    pub fn audio(session_id: impl Into<String>, pcm: Bytes) -> Self {
        let mut frame = Self::base(MessageType::AudioOnlyClient, Flags::WITH_EVENT, Payload::Raw(pcm));
        frame.compression = Compression::Gzip;
        frame.event = Some(EventCode::TASK_REQUEST);
        frame.session_id = Some(session_id.into());
        frame
    }

    /// Final audio chunk of a submission; `sequence` is made negative.
    pub fn last_audio(session_id: impl Into<String>, pcm: Bytes, sequence: i32) -> Self {
        let mut frame = Self::audio(session_id, pcm);
        frame.flags = Flags::NEGATIVE_SEQUENCE | Flags::WITH_EVENT;
        frame.sequence = Some(sequence.checked_abs().map_or(i32::MIN, |s| -s));
        frame
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// True when this frame marks the last chunk of an audio submission.
    pub fn is_last_chunk(&self) -> bool {
        self.sequence.map(|s| s < 0).unwrap_or(false)
            || (self.flags.contains(Flags::LAST_NO_SEQUENCE) && !self.flags.is_sequenced())
    }

    /// Whether the marshalled form carries a session id for this frame.
    pub fn expects_session_id(&self) -> bool {
        self.flags.has_event()
            && self
                .event
                .map(|e| !e.is_connection_level())
                .unwrap_or(false)
    }

    /// Whether the marshalled form carries a connect id for this frame.
    pub fn expects_connect_id(&self) -> bool {
        self.flags.has_event()
            && !self.message_type.is_client()
            && self.event.map(|e| e.carries_connect_id()).unwrap_or(false)
    }
}
