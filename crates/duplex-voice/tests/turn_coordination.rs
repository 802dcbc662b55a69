//! Coordinator behaviour against a scripted in-memory cloud.

use async_trait::async_trait;
use bytes::Bytes;
use duplex_voice::{
    AecHandle, AgentRuntime, CueSet, CueSound, EngineConfig, EngineContext, EngineHandle,
    EngineIo, IntentClassifier, JitterBuffer, NoopMedia, Origin, PlaybackItem, RawChunk, RunExit,
    TokenCallback, TtsClient, TurnCoordinator, TurnEndReason, TurnObserver, Verdict, VoiceResult,
    WakeConfig, WakeGate, WakeReason, WakeWordDetector,
};
use duplex_wire::{
    memory_pair, EventCode, Frame, MemoryPeer, MessageType, Payload, Serialization,
    SessionTransport,
};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct ScriptedAgent {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl AgentRuntime for ScriptedAgent {
    async fn run(&self, text: &str, on_token: TokenCallback<'_>) -> VoiceResult<String> {
        self.calls.lock().push(text.to_string());
        on_token("It is sunny.");
        Ok("It is sunny.".to_string())
    }
}

/// Three 20 ms chunks of silence at 24 kHz.
struct SilentTts;

impl TtsClient for SilentTts {
    fn synthesize(&self, _text: &str) -> BoxStream<'static, VoiceResult<Bytes>> {
        stream::iter((0..3).map(|_| Ok(Bytes::from(vec![0u8; 960])))).boxed()
    }

    fn sample_rate(&self) -> u32 {
        24_000
    }
}

struct FixedVerdict(Verdict);

#[async_trait]
impl IntentClassifier for FixedVerdict {
    async fn classify(&self, _text: &str) -> Verdict {
        self.0
    }
}

#[derive(Default)]
struct RecordingObserver {
    finals: Mutex<Vec<String>>,
    ends: Mutex<Vec<TurnEndReason>>,
    wakes: Mutex<Vec<WakeReason>>,
}

impl TurnObserver for RecordingObserver {
    fn on_final_transcript(&self, text: &str) {
        self.finals.lock().push(text.to_string());
    }

    fn on_turn_end(&self, reason: &TurnEndReason) {
        self.ends.lock().push(reason.clone());
    }

    fn on_wake_triggered(&self, reason: &WakeReason) {
        self.wakes.lock().push(reason.clone());
    }
}

/// Fires on any loud window.
struct LoudDetector;

impl WakeWordDetector for LoudDetector {
    fn process_audio(&mut self, window: &[i16], _threshold: f32) -> bool {
        window.iter().any(|s| s.unsigned_abs() > 20_000)
    }

    fn last_score(&self) -> f32 {
        0.9
    }

    fn reset(&mut self) {}
}

struct Harness {
    handle: EngineHandle,
    peer: MemoryPeer,
    session: String,
    buffer: Arc<JitterBuffer>,
    agent: Arc<ScriptedAgent>,
    observer: Arc<RecordingObserver>,
    mic: mpsc::Sender<RawChunk>,
    run: JoinHandle<VoiceResult<RunExit>>,
}

async fn start(verdict: Verdict) -> Harness {
    let mut config = EngineConfig::default();
    config.cloud.settle_delay_ms = 20;
    config.cloud.ack_timeout_ms = 2_000;
    config.turn.ignore_margin_ms = 0;

    let agent = Arc::new(ScriptedAgent {
        calls: Mutex::new(Vec::new()),
    });
    let observer = Arc::new(RecordingObserver::default());
    let ctx = EngineContext {
        config: config.clone(),
        agent: agent.clone(),
        tts: Arc::new(SilentTts),
        classifier: Arc::new(FixedVerdict(verdict)),
        media: Arc::new(NoopMedia),
        observer: observer.clone(),
    };

    let (mic_tx, mic_rx) = mpsc::channel(16);
    let buffer = Arc::new(JitterBuffer::new(config.audio.playback_capacity));
    let tiny = CueSound::new(vec![0; 24], 24_000);
    let io = EngineIo {
        mic: mic_rx,
        playback: buffer.clone(),
        aec: AecHandle::new(16, 0.1),
        wake: WakeGate::new(Box::new(LoudDetector), &WakeConfig::default()),
        cues: CueSet {
            ack: tiny.clone(),
            filler: tiny,
        },
        state: Default::default(),
        playback_status: Default::default(),
    };

    let mut coordinator = TurnCoordinator::new(ctx, io);
    let handle = coordinator.handle();
    let (sink, source, mut peer) = memory_pair();
    let transport = SessionTransport::new(sink, source, config.cloud.transport());
    let run = tokio::spawn(async move { coordinator.run(transport).await });

    let hello = next(&mut peer).await;
    assert_eq!(hello.event, Some(EventCode::START_CONNECTION));
    peer.send_frame(&server(EventCode::CONNECTION_STARTED, None, json!({})))
        .unwrap();
    let session = accept_session(&mut peer).await;

    Harness {
        handle,
        peer,
        session,
        buffer,
        agent,
        observer,
        mic: mic_tx,
        run,
    }
}

async fn next(peer: &mut MemoryPeer) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), peer.recv_frame())
        .await
        .expect("client went quiet")
        .expect("client closed")
        .expect("client wrote a malformed frame")
}

/// Read frames until StartSession, acknowledge it and return the new session id.
async fn accept_session(peer: &mut MemoryPeer) -> String {
    loop {
        let frame = next(peer).await;
        if frame.event == Some(EventCode::START_SESSION) {
            let id = frame.session_id.expect("StartSession carries the id");
            peer.send_frame(&server(EventCode::SESSION_STARTED, Some(&id), json!({})))
                .unwrap();
            return id;
        }
    }
}

fn server(event: EventCode, session: Option<&str>, payload: Value) -> Frame {
    let mut frame = match session {
        Some(id) => Frame::session(event, id, payload),
        None => Frame::control(event, payload),
    };
    frame.message_type = MessageType::FullServerResponse;
    frame
}

fn cloud_audio(session: &str) -> Frame {
    cloud_audio_marked(session, 0)
}

/// Cloud PCM whose samples all equal `mark`, so a test can tell replies apart.
fn cloud_audio_marked(session: &str, mark: i16) -> Frame {
    let mut frame = server(EventCode::TTS_RESPONSE, Some(session), json!({}));
    frame.message_type = MessageType::AudioOnlyServer;
    frame.serialization = Serialization::Raw;
    let pcm: Vec<u8> = std::iter::repeat(mark.to_le_bytes()).take(480).flatten().collect();
    frame.payload = Payload::Raw(Bytes::from(pcm));
    frame
}

fn asr(session: &str, text: &str, interim: bool) -> Frame {
    server(
        EventCode::ASR_RESPONSE,
        Some(session),
        json!({ "results": [{ "text": text, "is_interim": interim }] }),
    )
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn drain_marks(buffer: &JitterBuffer) -> Vec<i16> {
    let mut marks = Vec::new();
    while let Some(item) = buffer.pop_timeout(Duration::ZERO) {
        if let PlaybackItem::Chunk(chunk) = item {
            marks.push(chunk.samples[0]);
        }
    }
    marks
}

fn drain_origins(buffer: &JitterBuffer) -> Vec<Origin> {
    let mut origins = Vec::new();
    while let Some(item) = buffer.pop_timeout(Duration::ZERO) {
        if let PlaybackItem::Chunk(chunk) = item {
            origins.push(chunk.origin);
        }
    }
    origins
}

#[tokio::test]
async fn test_simple_text_query_goes_to_cloud() {
    let mut h = start(Verdict::Simple).await;
    tokio_test::assert_ok!(h.handle.submit_text("tell me a joke").await);

    let frame = next(&mut h.peer).await;
    assert_eq!(frame.event, Some(EventCode::TEXT_INPUT));
    assert_eq!(frame.session_id.as_deref(), Some(h.session.as_str()));
    assert_eq!(
        frame.payload.as_json().and_then(|v| v.get("content")).cloned(),
        Some(json!("tell me a joke"))
    );
    assert!(h.handle.state().gate_pending());

    h.peer.send_frame(&cloud_audio(&h.session)).unwrap();
    h.peer
        .send_frame(&server(EventCode::TTS_ENDED, Some(&h.session), json!({})))
        .unwrap();
    let observer = h.observer.clone();
    wait_for("turn end", || !observer.ends.lock().is_empty()).await;
    assert_eq!(*h.observer.ends.lock(), vec![TurnEndReason::ServerEvent(359)]);
    assert_eq!(drain_origins(&h.buffer), vec![Origin::CloudS2S]);
}

#[tokio::test]
async fn test_barge_in_purges_cloud_speech() {
    let mut h = start(Verdict::Simple).await;
    h.handle.submit_text("read me a poem").await.unwrap();
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::TEXT_INPUT));

    for _ in 0..3 {
        h.peer.send_frame(&cloud_audio(&h.session)).unwrap();
    }
    let buffer = h.buffer.clone();
    wait_for("cloud speech queued", || buffer.len() == 3).await;

    h.peer
        .send_frame(&server(EventCode::ASR_INFO, Some(&h.session), json!({})))
        .unwrap();
    let observer = h.observer.clone();
    wait_for("barge-in", || !observer.ends.lock().is_empty()).await;
    assert_eq!(h.buffer.len(), 0);
    assert_eq!(*h.observer.ends.lock(), vec![TurnEndReason::BargeIn]);
    assert_eq!(h.handle.state().speaker(), None);
}

#[tokio::test]
async fn test_early_mute_keeps_cloud_out_of_playback() {
    let mut h = start(Verdict::Simple).await;
    tokio_test::assert_ok!(h.handle.wake().await);

    // Wake rotates the session.
    let finish = next(&mut h.peer).await;
    assert_eq!(finish.event, Some(EventCode::FINISH_SESSION));
    assert_eq!(finish.session_id.as_deref(), Some(h.session.as_str()));
    let session = accept_session(&mut h.peer).await;
    assert_ne!(session, h.session);

    h.peer
        .send_frame(&server(EventCode::ASR_INFO, Some(&session), json!({})))
        .unwrap();
    h.peer.send_frame(&asr(&session, "what's the weather", true)).unwrap();
    for _ in 0..5 {
        h.peer.send_frame(&cloud_audio(&session)).unwrap();
    }
    h.peer
        .send_frame(&asr(&session, "what's the weather in Oslo", false))
        .unwrap();
    h.peer
        .send_frame(&server(EventCode::ASR_ENDED, Some(&session), json!({})))
        .unwrap();
    // The cloud's own reply ends after the handoff.
    h.peer
        .send_frame(&server(EventCode::TTS_ENDED, Some(&session), json!({})))
        .unwrap();

    let observer = h.observer.clone();
    wait_for("agent turn end", || {
        observer.ends.lock().contains(&TurnEndReason::AgentDone)
    })
    .await;

    assert_eq!(*h.agent.calls.lock(), vec!["what's the weather in Oslo".to_string()]);
    assert_eq!(
        *h.observer.finals.lock(),
        vec!["what's the weather in Oslo".to_string()]
    );
    assert_eq!(*h.observer.wakes.lock(), vec![WakeReason::Manual]);
    assert_eq!(drain_origins(&h.buffer), vec![Origin::LocalAgent; 3]);
}

#[tokio::test]
async fn test_complex_text_query_runs_agent() {
    let mut h = start(Verdict::Complex).await;
    h.handle.submit_text("plan a trip").await.unwrap();

    let observer = h.observer.clone();
    wait_for("agent turn end", || !observer.ends.lock().is_empty()).await;
    assert_eq!(*h.agent.calls.lock(), vec!["plan a trip".to_string()]);
    assert_eq!(*h.observer.ends.lock(), vec![TurnEndReason::AgentDone]);
    assert_eq!(drain_origins(&h.buffer), vec![Origin::LocalAgent; 3]);
    // Nothing was sent to the cloud for this query.
    assert!(h.peer.try_recv_frame().is_none());
}

#[tokio::test]
async fn test_wake_word_rotates_session_and_opens_uplink() {
    let mut h = start(Verdict::Simple).await;
    let loud = RawChunk {
        samples: vec![25_000; 320],
        sample_rate: 16_000,
        channels: 1,
        captured_at: Instant::now(),
    };
    // Four 20 ms chunks fill one detector window.
    for _ in 0..4 {
        h.mic.send(loud.clone()).await.unwrap();
    }

    let finish = next(&mut h.peer).await;
    assert_eq!(finish.event, Some(EventCode::FINISH_SESSION));
    let session = accept_session(&mut h.peer).await;
    assert!(matches!(
        h.observer.wakes.lock().first(),
        Some(WakeReason::Detector { .. })
    ));

    tokio::time::sleep(Duration::from_millis(10)).await;
    h.mic.send(loud).await.unwrap();
    let audio = next(&mut h.peer).await;
    assert_eq!(audio.message_type, MessageType::AudioOnlyClient);
    assert_eq!(audio.event, Some(EventCode::TASK_REQUEST));
    assert_eq!(audio.session_id.as_deref(), Some(session.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_gate_timeout_releases_queued_query() {
    let mut h = start(Verdict::Simple).await;
    h.handle.submit_text("first").await.unwrap();
    h.handle.submit_text("second").await.unwrap();

    let first = next(&mut h.peer).await;
    assert_eq!(
        first.payload.as_json().and_then(|v| v.get("content")).cloned(),
        Some(json!("first"))
    );

    // The cloud never answers; the gate fails open after 20 s.
    let started = tokio::time::Instant::now();
    let second = tokio::time::timeout(Duration::from_secs(60), h.peer.recv_frame())
        .await
        .expect("second query was never released")
        .unwrap()
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(19));
    assert_eq!(
        second.payload.as_json().and_then(|v| v.get("content")).cloned(),
        Some(json!("second"))
    );
    assert_eq!(*h.observer.ends.lock(), vec![TurnEndReason::GateTimeout]);
}

#[tokio::test]
async fn test_barge_in_after_reply_end_purges_queued_audio() {
    let mut h = start(Verdict::Simple).await;
    h.handle.submit_text("read me a poem").await.unwrap();
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::TEXT_INPUT));

    for _ in 0..3 {
        h.peer.send_frame(&cloud_audio(&h.session)).unwrap();
    }
    h.peer
        .send_frame(&server(EventCode::TTS_ENDED, Some(&h.session), json!({})))
        .unwrap();
    let observer = h.observer.clone();
    wait_for("reply end", || !observer.ends.lock().is_empty()).await;
    // The cloud is done producing, the speaker is not done playing.
    assert_eq!(h.buffer.len(), 3);
    h.buffer.push_cue(CueSound::new(vec![1; 24], 24_000));

    h.peer
        .send_frame(&server(EventCode::ASR_INFO, Some(&h.session), json!({})))
        .unwrap();
    let buffer = h.buffer.clone();
    wait_for("purge", || buffer.is_idle()).await;
    assert_eq!(h.buffer.len(), 0);
    assert!(h.buffer.pop_timeout(Duration::ZERO).is_none());
    assert_eq!(*h.observer.ends.lock(), vec![TurnEndReason::ServerEvent(359)]);
    assert!(h.handle.state().gate_pending());
}

#[tokio::test]
async fn test_suppressed_reply_stays_muted_after_agent_finishes() {
    let mut h = start(Verdict::Simple).await;
    h.handle.wake().await.unwrap();
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::FINISH_SESSION));
    let session = accept_session(&mut h.peer).await;

    h.peer
        .send_frame(&server(EventCode::ASR_INFO, Some(&session), json!({})))
        .unwrap();
    h.peer.send_frame(&asr(&session, "what's the weather", true)).unwrap();
    h.peer.send_frame(&asr(&session, "what's the weather", false)).unwrap();
    h.peer
        .send_frame(&server(EventCode::ASR_ENDED, Some(&session), json!({})))
        .unwrap();
    let observer = h.observer.clone();
    wait_for("agent turn end", || {
        observer.ends.lock().contains(&TurnEndReason::AgentDone)
    })
    .await;

    // The cloud is still streaming its own answer to the handed-off question.
    for _ in 0..4 {
        h.peer.send_frame(&cloud_audio_marked(&session, 1)).unwrap();
    }
    h.peer
        .send_frame(&server(EventCode::TTS_ENDED, Some(&session), json!({})))
        .unwrap();
    h.peer.send_frame(&cloud_audio_marked(&session, 2)).unwrap();

    let buffer = h.buffer.clone();
    wait_for("next cloud reply queued", || buffer.len() == 4).await;
    assert_eq!(drain_marks(&h.buffer), vec![0, 0, 0, 2]);
    assert_eq!(*h.observer.ends.lock(), vec![TurnEndReason::AgentDone]);
}

#[tokio::test]
async fn test_old_session_audio_never_follows_new_session() {
    let mut h = start(Verdict::Simple).await;
    h.handle.submit_text("first").await.unwrap();
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::TEXT_INPUT));
    for _ in 0..2 {
        h.peer.send_frame(&cloud_audio_marked(&h.session, 1)).unwrap();
    }
    let buffer = h.buffer.clone();
    wait_for("first reply queued", || buffer.len() == 2).await;

    h.handle.wake().await.unwrap();
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::FINISH_SESSION));
    let session = accept_session(&mut h.peer).await;

    h.handle.submit_text("second").await.unwrap();
    let query = next(&mut h.peer).await;
    assert_eq!(query.event, Some(EventCode::TEXT_INPUT));
    assert_eq!(query.session_id.as_deref(), Some(session.as_str()));

    // The old session keeps streaming its reply between the new one's chunks.
    h.peer.send_frame(&cloud_audio_marked(&session, 2)).unwrap();
    h.peer.send_frame(&cloud_audio_marked(&h.session, 1)).unwrap();
    h.peer.send_frame(&cloud_audio_marked(&session, 2)).unwrap();
    h.peer.send_frame(&cloud_audio_marked(&h.session, 1)).unwrap();
    h.peer
        .send_frame(&server(EventCode::TTS_ENDED, Some(&session), json!({})))
        .unwrap();

    let observer = h.observer.clone();
    wait_for("second reply end", || observer.ends.lock().len() == 2).await;
    assert_eq!(
        *h.observer.ends.lock(),
        vec![TurnEndReason::BargeIn, TurnEndReason::ServerEvent(359)]
    );
    assert_eq!(drain_marks(&h.buffer), vec![2, 2]);
}

#[tokio::test]
async fn test_queued_text_replies_play_in_order() {
    let mut h = start(Verdict::Simple).await;
    h.handle.submit_text("first").await.unwrap();
    h.handle.submit_text("second").await.unwrap();
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::TEXT_INPUT));

    for _ in 0..2 {
        h.peer.send_frame(&cloud_audio_marked(&h.session, 1)).unwrap();
    }
    h.peer
        .send_frame(&server(EventCode::TTS_ENDED, Some(&h.session), json!({})))
        .unwrap();

    let second = next(&mut h.peer).await;
    assert_eq!(
        second.payload.as_json().and_then(|v| v.get("content")).cloned(),
        Some(json!("second"))
    );
    for _ in 0..2 {
        h.peer.send_frame(&cloud_audio_marked(&h.session, 2)).unwrap();
    }
    h.peer
        .send_frame(&server(EventCode::TTS_ENDED, Some(&h.session), json!({})))
        .unwrap();

    let observer = h.observer.clone();
    wait_for("both replies", || observer.ends.lock().len() == 2).await;
    assert_eq!(drain_marks(&h.buffer), vec![1, 1, 2, 2]);
}

#[tokio::test]
async fn test_mic_loss_closes_uplink_and_ends_run() {
    let h = start(Verdict::Simple).await;
    let Harness {
        handle,
        mut peer,
        mic,
        run,
        ..
    } = h;
    handle.wake().await.unwrap();
    assert_eq!(next(&mut peer).await.event, Some(EventCode::FINISH_SESSION));
    let session = accept_session(&mut peer).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    mic.send(RawChunk {
        samples: vec![100; 320],
        sample_rate: 16_000,
        channels: 1,
        captured_at: Instant::now(),
    })
    .await
    .unwrap();
    let audio = next(&mut peer).await;
    assert_eq!(audio.message_type, MessageType::AudioOnlyClient);
    assert!(!audio.is_last_chunk());

    drop(mic);
    let closing = next(&mut peer).await;
    assert!(closing.is_last_chunk());
    assert_eq!(closing.session_id.as_deref(), Some(session.as_str()));

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not end")
        .unwrap();
    assert!(matches!(result, Err(ref e) if e.is_device_failure()));
}

#[tokio::test]
async fn test_shutdown_cancels_streaming_reply() {
    let mut h = start(Verdict::Simple).await;
    h.handle.submit_text("tell me a long story").await.unwrap();
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::TEXT_INPUT));

    h.handle.shutdown().await.unwrap();
    let cancel = next(&mut h.peer).await;
    assert_eq!(cancel.event, Some(EventCode::CANCEL_SESSION));
    assert_eq!(cancel.session_id.as_deref(), Some(h.session.as_str()));
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::FINISH_CONNECTION));
    let result = h.run.await.unwrap();
    assert!(matches!(result, Ok(RunExit::Shutdown)));
}

#[tokio::test]
async fn test_idle_shutdown_finishes_session() {
    let mut h = start(Verdict::Simple).await;
    h.handle.shutdown().await.unwrap();
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::FINISH_SESSION));
    assert_eq!(next(&mut h.peer).await.event, Some(EventCode::FINISH_CONNECTION));
}
