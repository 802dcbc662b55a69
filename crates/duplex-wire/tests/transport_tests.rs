//! Session transport behaviour over the in-memory connection.

use bytes::Bytes;
use duplex_wire::{
    memory_pair, EventCode, Frame, MemoryPeer, MessageType, SessionTransport, TransportConfig,
    WireError,
};
use serde_json::json;
use std::time::Duration;

fn fast_config() -> TransportConfig {
    TransportConfig {
        settle_delay_ms: 100,
        ack_timeout_ms: 1_000,
        ..Default::default()
    }
}

fn drain(peer: &mut MemoryPeer) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(frame) = peer.try_recv_frame() {
        frames.push(frame.expect("client wrote a malformed frame"));
    }
    frames
}

fn reply(event: EventCode, session: Option<&str>) -> Frame {
    let mut frame = match session {
        Some(id) => Frame::session(event, id, json!({})),
        None => Frame::control(event, json!({})),
    };
    frame.message_type = MessageType::FullServerResponse;
    frame
}

#[tokio::test]
async fn test_handshake_waits_for_acks() {
    let (sink, source, mut peer) = memory_pair();
    let mut transport = SessionTransport::new(sink, source, fast_config());

    let server = tokio::spawn(async move {
        let hello = peer.recv_frame().await.unwrap().unwrap();
        assert_eq!(hello.event, Some(EventCode::START_CONNECTION));
        assert_eq!(hello.session_id, None);
        peer.send_frame(&reply(EventCode::CONNECTION_STARTED, None)).unwrap();

        let start = peer.recv_frame().await.unwrap().unwrap();
        assert_eq!(start.event, Some(EventCode::START_SESSION));
        let id = start.session_id.clone().unwrap();
        // Unrelated output before the ack is skipped.
        peer.send_frame(&reply(EventCode::ASR_INFO, Some(&id))).unwrap();
        peer.send_frame(&reply(EventCode::SESSION_STARTED, Some(&id))).unwrap();
        (peer, id)
    });

    tokio_test::assert_ok!(transport.start_connection().await);
    let id = transport
        .start_session(json!({"dialog": {}}), true)
        .await
        .expect("session should start");
    let (_peer, seen) = server.await.unwrap();
    assert_eq!(id.to_string(), seen);
    assert!(transport.handle().session().is_active);
}

#[tokio::test]
async fn test_start_session_surfaces_session_failed() {
    let (sink, source, mut peer) = memory_pair();
    let mut transport = SessionTransport::new(sink, source, fast_config());

    let server = tokio::spawn(async move {
        let start = peer.recv_frame().await.unwrap().unwrap();
        let id = start.session_id.unwrap();
        let mut failed = Frame::session(EventCode::SESSION_FAILED, id, json!({"error": "limit exceeded"}));
        failed.message_type = MessageType::Error;
        failed.error_code = Some(45_000_003);
        peer.send_frame(&failed).unwrap();
        peer
    });

    let err = transport.start_session(json!({}), true).await.unwrap_err();
    match err {
        WireError::Session { code, message } => {
            assert_eq!(code, 45_000_003);
            assert_eq!(message, "limit exceeded");
        }
        other => panic!("expected session error, got {other:?}"),
    }
    let _peer = server.await.unwrap();
}

#[tokio::test]
async fn test_ack_timeout() {
    let (sink, source, _peer) = memory_pair();
    let mut transport = SessionTransport::new(
        sink,
        source,
        TransportConfig {
            ack_timeout_ms: 50,
            ..Default::default()
        },
    );
    let err = transport.start_connection().await.unwrap_err();
    assert!(matches!(err, WireError::AckTimeout(_)));
}

#[tokio::test]
async fn test_single_writer_keeps_frames_whole() {
    let (sink, source, mut peer) = memory_pair();
    let mut transport = SessionTransport::new(sink, source, fast_config());
    let id = transport.start_session(json!({}), false).await.unwrap();
    let handle = transport.handle();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle.send_audio(Bytes::from(vec![i as u8; 320])).unwrap();
            handle.send_text(&format!("query {i}")).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    // Everything queued before this ack has been written.
    handle.update_config(json!({"speaker": "x"})).await.unwrap();

    let frames = drain(&mut peer);
    assert_eq!(frames[0].event, Some(EventCode::START_SESSION));
    let texts = frames
        .iter()
        .filter(|f| f.event == Some(EventCode::TEXT_INPUT))
        .count();
    let audio = frames
        .iter()
        .filter(|f| f.event == Some(EventCode::TASK_REQUEST))
        .count();
    assert_eq!(texts, 16);
    assert_eq!(audio, 16);
    let id = id.to_string();
    assert!(frames.iter().all(|f| f.session_id.as_deref() == Some(id.as_str())));
}

#[tokio::test]
async fn test_hot_reset_rotates_id_and_drops_audio_while_settling() {
    let (sink, source, mut peer) = memory_pair();
    let mut transport = SessionTransport::new(sink, source, fast_config());
    let first = transport.start_session(json!({}), false).await.unwrap();
    let handle = transport.handle();

    handle.send_audio(Bytes::from_static(&[1, 0, 1, 0])).unwrap();

    let resetter = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.hot_reset(json!({"dialog": {}})).await })
    };
    // Lands inside the settle delay.
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.send_audio(Bytes::from_static(&[2, 0, 2, 0])).unwrap();

    let second = resetter.await.unwrap().expect("hot reset");
    assert_ne!(first, second);
    assert_eq!(handle.session_id(), second);

    handle.send_audio(Bytes::from_static(&[3, 0, 3, 0])).unwrap();
    handle.send_text("after reset").await.unwrap();

    let frames = drain(&mut peer);
    let events: Vec<u32> = frames.iter().filter_map(|f| f.event.map(|e| e.code())).collect();
    assert_eq!(events, vec![100, 200, 102, 100, 200, 501]);

    let first = first.to_string();
    let second = second.to_string();
    let start_of_second = frames
        .iter()
        .rposition(|f| f.event == Some(EventCode::START_SESSION))
        .unwrap();
    for frame in &frames[..start_of_second] {
        assert_eq!(frame.session_id.as_deref(), Some(first.as_str()));
    }
    for frame in &frames[start_of_second..] {
        assert_eq!(frame.session_id.as_deref(), Some(second.as_str()));
    }
}

#[tokio::test]
async fn test_dropping_everything_closes_sink() {
    let (sink, source, mut peer) = memory_pair();
    let transport = SessionTransport::new(sink, source, fast_config());
    let (handle, receiver) = transport.into_parts();
    drop(handle);
    drop(receiver);
    // Writer task exits and closes its sink, so the peer sees end of stream.
    let next = tokio::time::timeout(Duration::from_secs(1), peer.recv_frame())
        .await
        .expect("writer should stop");
    assert!(next.is_none());
}
