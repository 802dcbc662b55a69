//! # Duplex Wire - Realtime Dialogue Protocol
//!
//! Binary frame codec and session transport for the cloud speech-to-speech dialogue
//! service. One persistent websocket carries all traffic; one session lives on it at a
//! time and can be rotated ("hot reset") without reconnecting.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    SessionTransport                        │
//! │  TransportHandle ─┐                                        │
//! │  TransportHandle ─┼─→ [command queue] ─→ writer ─→ WireSink │
//! │  TransportHandle ─┘     (stamps session id)                │
//! │                                                            │
//! │  FrameReceiver ←── codec::parse ←────────────── WireSource │
//! └───────────────────────────────────────────────────────────┘
//! ```

pub mod backoff;
pub mod codec;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use backoff::{Backoff, ReconnectPolicy};
pub use codec::{marshal, parse};
pub use connection::{
    connect_ws, memory_pair, ConnectConfig, MemoryPeer, MemorySink, MemorySource, WireSink,
    WireSource, WsSink, WsSource,
};
pub use error::{WireError, WireResult};
pub use protocol::{
    Compression, EventCode, Flags, Frame, MessageType, Payload, Serialization,
};
pub use session::Session;
pub use transport::{
    session_error, FrameReceiver, SessionTransport, TransportConfig, TransportHandle,
};
