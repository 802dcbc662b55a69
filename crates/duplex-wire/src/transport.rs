//! Single-writer session transport.
//!
//! Every outbound frame goes through one bounded command queue. The writer task at the
//! other end owns the sink and stamps the current session id when it dequeues a command,
//! so a frame can never carry an id that was rotated away before it was written.

use crate::codec;
use crate::connection::{connect_ws, ConnectConfig, WireSink, WireSource};
use crate::error::{WireError, WireResult};
use crate::protocol::{EventCode, Frame, MessageType, Payload};
use crate::session::Session;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events that close out a server response.
const RESPONSE_END_EVENTS: [EventCode; 3] = [
    EventCode::TTS_ENDED,
    EventCode::SESSION_FINISHED,
    EventCode::CHAT_ENDED,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Pause between FinishSession and the next StartSession during a hot reset.
    pub settle_delay_ms: u64,
    /// How long `start_connection` / `start_session(.., true)` wait for the ack.
    pub ack_timeout_ms: u64,
    pub queue_capacity: usize,
    pub session_ttl_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 600,
            ack_timeout_ms: 10_000,
            queue_capacity: 256,
            session_ttl_ms: 30_000,
        }
    }
}

impl TransportConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

type Ack = Option<oneshot::Sender<WireResult<()>>>;

enum Command {
    Connection {
        event: EventCode,
        payload: Value,
        done: Ack,
    },
    Session {
        event: EventCode,
        payload: Value,
        done: Ack,
    },
    Audio {
        pcm: Bytes,
        last: bool,
    },
    BeginSession {
        payload: Value,
        rotate: bool,
        done: oneshot::Sender<WireResult<Uuid>>,
    },
    EndSession {
        event: EventCode,
        done: Ack,
    },
    Close {
        done: Ack,
    },
}

struct Shared {
    session: Mutex<Session>,
    closed: AtomicBool,
    dropped_audio: AtomicU64,
}

impl Shared {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn closed_error() -> WireError {
    WireError::ConnectionClosed("transport writer stopped".to_string())
}

/// Cloneable producer side of the transport. All clones feed the same writer.
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    config: Arc<TransportConfig>,
}

impl TransportHandle {
    fn ensure_open(&self) -> WireResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    async fn request(&self, make: impl FnOnce(Ack) -> Command) -> WireResult<()> {
        self.ensure_open()?;
        let (done, wait) = oneshot::channel();
        self.tx
            .send(make(Some(done)))
            .await
            .map_err(|_| closed_error())?;
        wait.await.map_err(|_| closed_error())?
    }

    /// Queue one PCM chunk (16 kHz mono s16le). Never waits: a full queue drops the chunk.
    pub fn send_audio(&self, pcm: Bytes) -> WireResult<()> {
        self.push_audio(pcm, false)
    }

    /// Queue the final chunk of a submission (negative sequence number).
    pub fn send_last_audio(&self, pcm: Bytes) -> WireResult<()> {
        self.push_audio(pcm, true)
    }

    fn push_audio(&self, pcm: Bytes, last: bool) -> WireResult<()> {
        self.ensure_open()?;
        match self.tx.try_send(Command::Audio { pcm, last }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.shared.dropped_audio.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 50 == 0 {
                    warn!(dropped, "Transport queue full, dropping audio chunk");
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(closed_error()),
        }
    }

    /// Send a typed text query to the cloud dialogue (TextInput).
    pub async fn send_text(&self, text: &str) -> WireResult<()> {
        let payload = json!({ "content": text });
        self.request(|done| Command::Session {
            event: EventCode::TEXT_INPUT,
            payload,
            done,
        })
        .await
    }

    /// Have the cloud voice speak `text` verbatim (ChatTTS). `start`/`end` delimit a
    /// streamed utterance.
    pub async fn send_chat_tts(&self, text: &str, start: bool, end: bool) -> WireResult<()> {
        let payload = json!({ "start": start, "content": text, "end": end });
        self.request(|done| Command::Session {
            event: EventCode::CHAT_TTS,
            payload,
            done,
        })
        .await
    }

    pub async fn update_config(&self, payload: Value) -> WireResult<()> {
        self.request(|done| Command::Session {
            event: EventCode::UPDATE_CONFIG,
            payload,
            done,
        })
        .await
    }

    pub async fn finish_session(&self) -> WireResult<()> {
        self.request(|done| Command::EndSession {
            event: EventCode::FINISH_SESSION,
            done,
        })
        .await
    }

    pub async fn cancel_session(&self) -> WireResult<()> {
        self.request(|done| Command::EndSession {
            event: EventCode::CANCEL_SESSION,
            done,
        })
        .await
    }

    pub async fn finish_connection(&self) -> WireResult<()> {
        self.request(|done| Command::Connection {
            event: EventCode::FINISH_CONNECTION,
            payload: json!({}),
            done,
        })
        .await
    }

    /// Send StartSession, optionally under a freshly rotated id. Does not wait for the ack.
    pub async fn begin_session(&self, payload: Value, rotate: bool) -> WireResult<Uuid> {
        self.ensure_open()?;
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::BeginSession {
                payload,
                rotate,
                done,
            })
            .await
            .map_err(|_| closed_error())?;
        wait.await.map_err(|_| closed_error())?
    }

    /// Rotate the session without dropping the connection.
    ///
    /// FinishSession, then the settle delay (the remote slot must free up or the next
    /// StartSession is refused), then StartSession under a new id. The ack is left to
    /// whoever is reading frames.
    pub async fn hot_reset(&self, payload: Value) -> WireResult<Uuid> {
        let old = self.session_id();
        self.finish_session().await?;
        tokio::time::sleep(self.config.settle_delay()).await;
        let new = self.begin_session(payload, true).await?;
        info!(old = %old, new = %new, "🔄 Session hot reset");
        Ok(new)
    }

    /// Close the sink. Later sends fail with `ConnectionClosed`.
    pub async fn close(&self) -> WireResult<()> {
        self.request(|done| Command::Close { done }).await
    }

    pub fn session(&self) -> Session {
        self.shared.session.lock().clone()
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.session.lock().id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Consumer of inbound frames.
pub struct FrameReceiver {
    source: Box<dyn WireSource>,
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Next well-formed frame. Malformed frames are logged and skipped; the end of the
    /// stream is reported as `ConnectionClosed`.
    pub async fn next_frame(&mut self) -> WireResult<Frame> {
        loop {
            match self.source.next_binary().await {
                None => {
                    self.shared.mark_closed();
                    return Err(WireError::ConnectionClosed("stream ended".to_string()));
                }
                Some(Err(e)) => {
                    if e.is_connection_fatal() {
                        self.shared.mark_closed();
                    }
                    return Err(e);
                }
                Some(Ok(bytes)) => match codec::parse(&bytes) {
                    Ok(frame) => {
                        self.observe(&frame);
                        return Ok(frame);
                    }
                    Err(e) => {
                        warn!(error = %e, len = bytes.len(), "Dropping malformed frame");
                    }
                },
            }
        }
    }

    fn observe(&self, frame: &Frame) {
        let Some(event) = frame.event else {
            return;
        };
        debug!(event = %event, session = ?frame.session_id, "← frame");

        let mut session = self.shared.session.lock();
        let current = session.id.to_string();
        if frame.session_id.as_deref() != Some(current.as_str()) {
            return;
        }
        session.touch();
        if event == EventCode::SESSION_FAILED || frame.message_type == MessageType::Error {
            session.is_active = false;
            session.pending_response = false;
        } else if RESPONSE_END_EVENTS.contains(&event) {
            session.pending_response = false;
        }
    }
}

/// A connected transport before it is split into producer and consumer halves.
pub struct SessionTransport {
    handle: TransportHandle,
    receiver: FrameReceiver,
    config: Arc<TransportConfig>,
}

impl SessionTransport {
    /// Wrap an already open connection and spawn the writer task.
    pub fn new<S, R>(sink: S, source: R, config: TransportConfig) -> Self
    where
        S: WireSink + 'static,
        R: WireSource + 'static,
    {
        let config = Arc::new(config);
        let shared = Arc::new(Shared {
            session: Mutex::new(Session::new(Duration::from_millis(config.session_ttl_ms))),
            closed: AtomicBool::new(false),
            dropped_audio: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        tokio::spawn(writer_loop(Box::new(sink), rx, shared.clone()));

        Self {
            handle: TransportHandle {
                tx,
                shared: shared.clone(),
                config: config.clone(),
            },
            receiver: FrameReceiver {
                source: Box::new(source),
                shared,
            },
            config,
        }
    }

    /// Open the websocket described by `connect` and wrap it.
    pub async fn connect(connect: &ConnectConfig, config: TransportConfig) -> WireResult<Self> {
        let (sink, source) = connect_ws(connect).await?;
        Ok(Self::new(sink, source, config))
    }

    /// StartConnection, then wait for ConnectionStarted.
    pub async fn start_connection(&mut self) -> WireResult<()> {
        self.handle
            .request(|done| Command::Connection {
                event: EventCode::START_CONNECTION,
                payload: json!({}),
                done,
            })
            .await?;
        let frame = self
            .await_event(
                &[EventCode::CONNECTION_STARTED, EventCode::CONNECTION_FAILED],
                "ConnectionStarted",
            )
            .await?;
        if frame.event == Some(EventCode::CONNECTION_FAILED) {
            return Err(session_error(&frame));
        }
        info!(connect_id = ?frame.connect_id, "✅ Connection started");
        Ok(())
    }

    /// StartSession with `payload` as the session config.
    pub async fn start_session(&mut self, payload: Value, wait_for_ack: bool) -> WireResult<Uuid> {
        let id = self.handle.begin_session(payload, false).await?;
        if wait_for_ack {
            let frame = self
                .await_event(
                    &[EventCode::SESSION_STARTED, EventCode::SESSION_FAILED],
                    "SessionStarted",
                )
                .await?;
            if frame.event == Some(EventCode::SESSION_FAILED) {
                return Err(session_error(&frame));
            }
            info!(session = %id, "✅ Session started");
        }
        Ok(id)
    }

    pub async fn finish_session(&self) -> WireResult<()> {
        self.handle.finish_session().await
    }

    pub async fn hot_reset(&self, payload: Value) -> WireResult<Uuid> {
        self.handle.hot_reset(payload).await
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub fn into_parts(self) -> (TransportHandle, FrameReceiver) {
        (self.handle, self.receiver)
    }

    async fn await_event(&mut self, wanted: &[EventCode], label: &str) -> WireResult<Frame> {
        let deadline = tokio::time::Instant::now() + self.config.ack_timeout();
        loop {
            let frame = tokio::time::timeout_at(deadline, self.receiver.next_frame())
                .await
                .map_err(|_| WireError::AckTimeout(label.to_string()))??;
            if frame.message_type == MessageType::Error {
                return Err(session_error(&frame));
            }
            match frame.event {
                Some(event) if wanted.contains(&event) => return Ok(frame),
                other => debug!(event = ?other, waiting_for = label, "Skipping frame during handshake"),
            }
        }
    }
}

/// Turn an error/failed frame into `WireError::Session`.
pub fn session_error(frame: &Frame) -> WireError {
    let code = frame
        .error_code
        .or_else(|| frame.event.map(|e| e.code()))
        .unwrap_or(0);
    let message = match &frame.payload {
        Payload::Json(Value::Object(map)) => map
            .get("error")
            .or_else(|| map.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        Payload::Json(other) => other.to_string(),
        Payload::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    };
    WireError::Session { code, message }
}

async fn writer_loop(
    mut sink: Box<dyn WireSink>,
    mut rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
) {
    let mut audio_seq: i32 = 0;

    while let Some(command) = rx.recv().await {
        let (frame, done) = match command {
            Command::Connection {
                event,
                payload,
                done,
            } => (Frame::control(event, payload), done),

            Command::Session {
                event,
                payload,
                done,
            } => {
                let mut session = shared.session.lock();
                if !session.is_active {
                    debug!(event = %event, "Dropping session request, no active session");
                    reply(done, Err(WireError::SessionInactive));
                    continue;
                }
                session.pending_response = true;
                session.touch();
                (Frame::session(event, session.id_string(), payload), done)
            }

            Command::Audio { pcm, last } => {
                let session = shared.session.lock();
                if !session.is_active {
                    debug!(bytes = pcm.len(), "Dropping audio, no active session");
                    continue;
                }
                audio_seq = audio_seq.saturating_add(1);
                let frame = if last {
                    Frame::last_audio(session.id_string(), pcm, audio_seq)
                } else {
                    Frame::audio(session.id_string(), pcm)
                };
                (frame, None)
            }

            Command::BeginSession {
                payload,
                rotate,
                done,
            } => {
                let frame = {
                    let mut session = shared.session.lock();
                    if rotate {
                        session.rotate();
                    }
                    Frame::session(EventCode::START_SESSION, session.id_string(), payload)
                };
                match send(&mut sink, &frame).await {
                    Ok(()) => {
                        let mut session = shared.session.lock();
                        session.is_active = true;
                        session.pending_response = false;
                        session.touch();
                        audio_seq = 0;
                        let _ = done.send(Ok(session.id));
                    }
                    Err(e) => {
                        let _ = done.send(Err(e));
                        shared.mark_closed();
                        break;
                    }
                }
                continue;
            }

            Command::EndSession { event, done } => {
                let mut session = shared.session.lock();
                if !session.is_active {
                    debug!(event = %event, "No active session to end");
                    reply(done, Ok(()));
                    continue;
                }
                session.is_active = false;
                session.pending_response = false;
                (Frame::session(event, session.id_string(), json!({})), done)
            }

            Command::Close { done } => {
                shared.mark_closed();
                let result = sink.close().await;
                reply(done, result);
                break;
            }
        };

        debug!(event = ?frame.event, session = ?frame.session_id, "→ frame");
        match send(&mut sink, &frame).await {
            Ok(()) => reply(done, Ok(())),
            Err(e) => {
                warn!(error = %e, "Transport write failed");
                reply(done, Err(e));
                shared.mark_closed();
                break;
            }
        }
    }

    if !shared.closed.swap(true, Ordering::SeqCst) {
        let _ = sink.close().await;
    }
    debug!("Transport writer stopped");
}

async fn send(sink: &mut Box<dyn WireSink>, frame: &Frame) -> WireResult<()> {
    let bytes = codec::marshal(frame)?;
    sink.send_binary(bytes).await
}

fn reply(done: Ack, result: WireResult<()>) {
    if let Some(done) = done {
        let _ = done.send(result);
    }
}
