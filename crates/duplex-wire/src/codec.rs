//! Byte-level encoding of [`Frame`]s.
//!
//! All multi-byte integers are big-endian. Field order after the padded header:
//! sequence (sequenced client frames), error code (error frames), event id plus
//! session id or connect id (event frames), then the length-prefixed payload.

use crate::error::{WireError, WireResult};
use crate::protocol::{
    Compression, EventCode, Flags, Frame, MessageType, Payload, Serialization,
};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// Encode a frame into a single binary websocket message.
pub fn marshal(frame: &Frame) -> WireResult<Vec<u8>> {
    if frame.header_size == 0 || frame.header_size > 0x0f {
        return Err(WireError::protocol(format!(
            "header size {} out of range",
            frame.header_size
        )));
    }
    if frame.version > 0x0f {
        return Err(WireError::protocol(format!("version {} out of range", frame.version)));
    }

    let body = encode_payload(frame)?;
    let header_len = frame.header_size as usize * 4;
    let mut out = Vec::with_capacity(header_len + 32 + body.len());

    out.push((frame.version << 4) | frame.header_size);
    out.push((frame.message_type.bits() << 4) | frame.flags.bits());
    out.push((frame.serialization.bits() << 4) | frame.compression.bits());
    out.push(0x00);
    out.resize(header_len, 0x00);

    if frame.flags.is_sequenced() && frame.message_type.is_client() {
        let seq = frame
            .sequence
            .ok_or_else(|| WireError::protocol("sequenced frame without a sequence number"))?;
        out.extend_from_slice(&seq.to_be_bytes());
    }

    if frame.message_type == MessageType::Error {
        out.extend_from_slice(&frame.error_code.unwrap_or(0).to_be_bytes());
    }

    if frame.flags.has_event() {
        let event = frame
            .event
            .ok_or_else(|| WireError::protocol("WITH_EVENT flag set without an event id"))?;
        out.extend_from_slice(&event.code().to_be_bytes());
        if frame.expects_session_id() {
            write_string(&mut out, frame.session_id.as_deref().unwrap_or(""))?;
        } else if frame.expects_connect_id() {
            write_string(&mut out, frame.connect_id.as_deref().unwrap_or(""))?;
        }
    }

    let len = u32::try_from(body.len())
        .map_err(|_| WireError::protocol("payload larger than 4 GiB"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one binary message into a [`Frame`].
pub fn parse(data: &[u8]) -> WireResult<Frame> {
    let mut reader = Reader::new(data);
    let header = reader.take(4).map_err(|_| WireError::protocol("frame shorter than header"))?;

    let version = header[0] >> 4;
    let header_size = header[0] & 0x0f;
    if header_size < 1 {
        return Err(WireError::protocol("header size smaller than one word"));
    }
    let message_type = MessageType::from_bits(header[1] >> 4).ok_or_else(|| {
        WireError::protocol(format!("unknown message type {:#06b}", header[1] >> 4))
    })?;
    let flags = Flags::from_bits(header[1]);
    let serialization = Serialization::from_bits(header[2] >> 4).ok_or_else(|| {
        WireError::protocol(format!("unknown serialization {:#06b}", header[2] >> 4))
    })?;
    let compression = Compression::from_bits(header[2] & 0x0f).ok_or_else(|| {
        WireError::protocol(format!("unknown compression {:#06b}", header[2] & 0x0f))
    })?;

    // Skip header extension words.
    reader.take(header_size as usize * 4 - 4)?;

    let mut frame = Frame {
        version,
        header_size,
        message_type,
        flags,
        serialization,
        compression,
        event: None,
        session_id: None,
        connect_id: None,
        sequence: None,
        error_code: None,
        payload: Payload::Json(serde_json::Value::Null),
    };

    if flags.is_sequenced() && message_type.is_client() {
        frame.sequence = Some(reader.i32()?);
    }

    if message_type == MessageType::Error {
        frame.error_code = Some(reader.u32()?);
    }

    if flags.has_event() {
        frame.event = Some(EventCode(reader.u32()?));
        if frame.expects_session_id() {
            frame.session_id = non_empty(reader.string()?);
        } else if frame.expects_connect_id() {
            frame.connect_id = non_empty(reader.string()?);
        }
    }

    let payload_len = reader.u32()? as usize;
    let raw = reader.take(payload_len)?;
    let raw = match compression {
        Compression::None => raw.to_vec(),
        Compression::Gzip => gunzip(raw)?,
    };

    frame.payload = match serialization {
        Serialization::Json if raw.is_empty() => Payload::Json(serde_json::Value::Null),
        Serialization::Json => Payload::Json(
            serde_json::from_slice(&raw)
                .map_err(|e| WireError::protocol(format!("invalid JSON payload: {}", e)))?,
        ),
        Serialization::Raw => Payload::Raw(Bytes::from(raw)),
    };

    Ok(frame)
}

fn encode_payload(frame: &Frame) -> WireResult<Vec<u8>> {
    let plain = match &frame.payload {
        Payload::Json(serde_json::Value::Null) => Vec::new(),
        Payload::Json(value) => serde_json::to_vec(value)?,
        Payload::Raw(bytes) => bytes.to_vec(),
    };
    match frame.compression {
        Compression::None => Ok(plain),
        Compression::Gzip => gzip(&plain),
    }
}

fn gzip(data: &[u8]) -> WireResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> WireResult<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| WireError::protocol(format!("gzip decode failed: {}", e)))?;
    Ok(out)
}

fn write_string(out: &mut Vec<u8>, value: &str) -> WireResult<()> {
    let len = u32::try_from(value.len()).map_err(|_| WireError::protocol("id too long"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                WireError::protocol(format!(
                    "truncated frame: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.data.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> WireResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> WireResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> WireResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WireError::protocol("id is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_session_header_bytes() {
        let frame = Frame::session(EventCode::START_SESSION, "abc", json!({}));
        let bytes = marshal(&frame).unwrap();
        assert_eq!(bytes[0], 0x11);
        assert_eq!(bytes[1], 0x14);
        assert_eq!(bytes[2], 0x10);
        assert_eq!(bytes[3], 0x00);
        // event id
        assert_eq!(&bytes[4..8], &100u32.to_be_bytes());
        // session id
        assert_eq!(&bytes[8..12], &3u32.to_be_bytes());
        assert_eq!(&bytes[12..15], b"abc");
        // payload "{}"
        assert_eq!(&bytes[15..19], &2u32.to_be_bytes());
        assert_eq!(&bytes[19..], b"{}");
    }

    #[test]
    fn start_connection_has_no_session_field() {
        let frame = Frame::control(EventCode::START_CONNECTION, json!({}));
        let bytes = marshal(&frame).unwrap();
        assert_eq!(&bytes[4..8], &1u32.to_be_bytes());
        // payload length follows the event id directly
        assert_eq!(&bytes[8..12], &2u32.to_be_bytes());
        assert_eq!(bytes.len(), 14);
    }

    #[test]
    fn error_frame_carries_code() {
        let mut frame = Frame::session(EventCode::SESSION_FAILED, "s1", json!({"error": "limit exceeded"}));
        frame.message_type = MessageType::Error;
        frame.error_code = Some(45_000_001);
        let parsed = parse(&marshal(&frame).unwrap()).unwrap();
        assert_eq!(parsed.error_code, Some(45_000_001));
        assert_eq!(parsed.event, Some(EventCode::SESSION_FAILED));
        assert_eq!(parsed.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn connection_started_keeps_connect_id() {
        let mut frame = Frame::control(EventCode::CONNECTION_STARTED, json!({}));
        frame.message_type = MessageType::FullServerResponse;
        frame.connect_id = Some("conn-7".to_string());
        let parsed = parse(&marshal(&frame).unwrap()).unwrap();
        assert_eq!(parsed.connect_id.as_deref(), Some("conn-7"));
        assert_eq!(parsed.session_id, None);
    }

    #[test]
    fn gzip_audio_round_trip() {
        let pcm = Bytes::from(vec![1u8, 2, 3, 4, 5, 6, 7, 8]);
        let frame = Frame::last_audio("sess", pcm.clone(), 12);
        let bytes = marshal(&frame).unwrap();
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.sequence, Some(-12));
        assert!(parsed.is_last_chunk());
        assert_eq!(parsed.payload, Payload::Raw(pcm));
    }

    #[test]
    fn header_padding_is_skipped() {
        let mut frame = Frame::control(EventCode::FINISH_CONNECTION, json!({"a": 1}));
        frame.header_size = 2;
        let bytes = marshal(&frame).unwrap();
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn unknown_event_is_preserved() {
        let mut frame = Frame::session(EventCode(777), "s", json!({"x": true}));
        frame.message_type = MessageType::FullServerResponse;
        let parsed = parse(&marshal(&frame).unwrap()).unwrap();
        assert_eq!(parsed.event, Some(EventCode(777)));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(parse(&[0x11, 0x14]), Err(WireError::Protocol(_))));
        assert!(matches!(parse(&[0x10, 0x14, 0x10, 0x00]), Err(WireError::Protocol(_))));
        // message type 0b0111 is not defined
        assert!(matches!(
            parse(&[0x11, 0x70, 0x10, 0x00, 0, 0, 0, 0]),
            Err(WireError::Protocol(_))
        ));
        // declared payload length past the end of the buffer
        assert!(matches!(
            parse(&[0x11, 0x90, 0x10, 0x00, 0, 0, 0, 9, b'{']),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_invalid_utf8_session_id() {
        let mut bytes = vec![0x11, 0x94, 0x10, 0x00];
        bytes.extend_from_slice(&150u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(parse(&bytes), Err(WireError::Protocol(_))));
    }

    #[test]
    fn rejects_bad_gzip_and_bad_json() {
        let mut bytes = vec![0x11, 0x90, 0x11, 0x00];
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(b"zzz");
        assert!(matches!(parse(&bytes), Err(WireError::Protocol(_))));

        let mut bytes = vec![0x11, 0x90, 0x10, 0x00];
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(b"{{{");
        assert!(matches!(parse(&bytes), Err(WireError::Protocol(_))));
    }

    #[test]
    fn empty_json_payload_is_null() {
        let mut bytes = vec![0x11, 0x90, 0x10, 0x00];
        bytes.extend_from_slice(&0u32.to_be_bytes());
        let frame = parse(&bytes).unwrap();
        assert_eq!(frame.payload, Payload::Json(serde_json::Value::Null));
    }
}
