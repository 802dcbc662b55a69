//! Turn coordinator: the single scheduler that owns the turn state.
//!
//! One `tokio::select!` loop consumes cloud frames, conditioned mic audio, host commands,
//! results of spawned work (classification, agent runs, session resets) and a timer tick.
//! Every input is fed to the [`TurnMachine`]; the returned effects are executed here and the
//! new state is published to the audio threads through the [`TurnStateCell`].
//!
//! The coordinator outlives connections: [`TurnCoordinator::run`] drives one connection and
//! returns when it is lost, so a supervisor can reconnect without rebuilding the audio path.

use crate::capture::{AudioCaptureLoop, CaptureConfig, RawChunk};
use crate::collaborators::{
    AgentRuntime, IntentClassifier, LocalMedia, TtsClient, TurnEndReason, TurnObserver, Verdict,
    WakeReason,
};
use crate::conditioner::{pcm_from_le_bytes, pcm_to_le_bytes, AecHandle, CapturePipeline};
use crate::config::{AgentVoice, EngineConfig, DOWNLINK_SAMPLE_RATE};
use crate::cues::CueSet;
use crate::device::{InputFactory, OutputFactory};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioChunk, JitterBuffer, PlaybackConfig, PlaybackLoop, PlaybackMonitor};
use crate::turn::{Effect, Origin, TurnMachine, TurnParams, TurnState, TurnStateCell};
use crate::wake::WakeGate;
use bytes::Bytes;
use duplex_wire::{
    session_error, EventCode, Frame, FrameReceiver, MessageType, Payload, SessionTransport,
    TransportHandle, WireError,
};
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Collaborators and configuration shared by every connection.
#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub agent: Arc<dyn AgentRuntime>,
    pub tts: Arc<dyn TtsClient>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub media: Arc<dyn LocalMedia>,
    pub observer: Arc<dyn TurnObserver>,
}

/// Audio-side endpoints the coordinator drives.
pub struct EngineIo {
    pub mic: mpsc::Receiver<RawChunk>,
    pub playback: Arc<JitterBuffer>,
    pub aec: AecHandle,
    pub wake: WakeGate,
    pub cues: CueSet,
    pub state: TurnStateCell,
    /// Status of the thread draining `playback`. A dead stream ends the run.
    pub playback_status: PlaybackMonitor,
}

/// 20 ms of 16 kHz silence, sent as the closing chunk of an uplink submission.
static CLOSING_CHUNK: [u8; 640] = [0; 640];

/// Running capture and playback threads plus the endpoints they expose.
pub struct AudioRig {
    pub capture: AudioCaptureLoop,
    pub playback: PlaybackLoop,
    pub mic: mpsc::Receiver<RawChunk>,
    pub buffer: Arc<JitterBuffer>,
    pub aec: AecHandle,
    pub state: TurnStateCell,
}

impl AudioRig {
    /// Spawn the capture and playback threads on the given devices. The playback thread
    /// reads turn snapshots from `state`; pass [`TurnCoordinator::state_cell`] when
    /// reopening devices under a running coordinator.
    pub fn start(
        config: &EngineConfig,
        state: TurnStateCell,
        input: InputFactory,
        output: OutputFactory,
    ) -> VoiceResult<Self> {
        let audio = &config.audio;
        let aec = AecHandle::new(audio.aec_taps, audio.aec_step);
        let buffer = Arc::new(JitterBuffer::new(audio.playback_capacity));
        let (capture, mic) = AudioCaptureLoop::spawn(input, CaptureConfig::from(audio))?;
        let playback = PlaybackLoop::spawn(
            output,
            buffer.clone(),
            state.clone(),
            aec.clone(),
            PlaybackConfig::from(audio),
        )?;
        Ok(Self {
            capture,
            playback,
            mic,
            buffer,
            aec,
            state,
        })
    }

    /// Split into the endpoints for [`TurnCoordinator::new`] and the thread handles.
    pub fn into_io(self, wake: WakeGate, cues: CueSet) -> (EngineIo, AudioThreads) {
        (
            EngineIo {
                mic: self.mic,
                playback: self.buffer,
                aec: self.aec,
                wake,
                cues,
                state: self.state,
                playback_status: self.playback.monitor(),
            },
            AudioThreads {
                capture: self.capture,
                playback: self.playback,
            },
        )
    }
}

pub struct AudioThreads {
    pub capture: AudioCaptureLoop,
    pub playback: PlaybackLoop,
}

impl AudioThreads {
    pub fn stop(self) {
        self.capture.join();
        self.playback.join();
    }
}

/// Requests from the host application.
#[derive(Debug)]
pub enum EngineCommand {
    /// Typed query. Queued behind the turn in progress.
    Text(String),
    /// Wake as if the wake word had been heard.
    Wake,
    Shutdown,
}

/// Cloneable handle for the host.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    state: TurnStateCell,
}

impl EngineHandle {
    async fn send(&self, command: EngineCommand) -> VoiceResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| VoiceError::ChannelClosed("coordinator stopped".to_string()))
    }

    pub async fn submit_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(EngineCommand::Text(text.into())).await
    }

    pub async fn wake(&self) -> VoiceResult<()> {
        self.send(EngineCommand::Wake).await
    }

    pub async fn shutdown(&self) -> VoiceResult<()> {
        self.send(EngineCommand::Shutdown).await
    }

    pub fn state(&self) -> TurnState {
        self.state.load()
    }
}

/// How a [`TurnCoordinator::run`] ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
}

/// Results of work the coordinator spawned.
enum Internal {
    Verdict {
        generation: u64,
        verdict: Verdict,
        /// Typed query text; `None` for the current voice utterance.
        query: Option<String>,
    },
    AgentAudio {
        generation: u64,
        pcm: Bytes,
    },
    /// Agent reply to be voiced by the cloud.
    AgentReply {
        generation: u64,
        text: String,
    },
    AgentDone {
        generation: u64,
    },
    ResetDone(Result<Uuid, WireError>),
}

pub struct TurnCoordinator {
    ctx: EngineContext,
    machine: TurnMachine,
    params: TurnParams,
    mic: mpsc::Receiver<RawChunk>,
    mic_open: bool,
    pipeline: Option<(u32, u16, CapturePipeline)>,
    playback: Arc<JitterBuffer>,
    playback_status: PlaybackMonitor,
    aec: AecHandle,
    wake: WakeGate,
    cues: CueSet,
    state: TurnStateCell,
    /// Mic audio went to the cloud since the last closing chunk.
    uplink_live: bool,
    commands_tx: mpsc::Sender<EngineCommand>,
    commands: mpsc::Receiver<EngineCommand>,
    internal_tx: mpsc::Sender<Internal>,
    internal: mpsc::Receiver<Internal>,
    /// Typed queries waiting for the gate.
    queue: VecDeque<String>,
    /// Bumped on every cancellation; results of older generations are ignored.
    generation: u64,
    synthesis: Option<CancellationToken>,
    resetting: bool,
    transport: Option<TransportHandle>,
}

/// Scheduler time. Follows tokio's clock so paused-time tests drive the timers.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl TurnCoordinator {
    pub fn new(ctx: EngineContext, io: EngineIo) -> Self {
        let params = TurnParams::from_config(&ctx.config.turn, io.cues.ack.duration());
        let (commands_tx, commands) = mpsc::channel(32);
        let (internal_tx, internal) = mpsc::channel(64);
        io.state.store(TurnState::Standby);
        Self {
            machine: TurnMachine::new(params.clone()),
            params,
            ctx,
            mic: io.mic,
            mic_open: true,
            pipeline: None,
            playback: io.playback,
            playback_status: io.playback_status,
            aec: io.aec,
            wake: io.wake,
            cues: io.cues,
            state: io.state,
            uplink_live: false,
            commands_tx,
            commands,
            internal_tx,
            internal,
            queue: VecDeque::new(),
            generation: 0,
            synthesis: None,
            resetting: false,
            transport: None,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.commands_tx.clone(),
            state: self.state.clone(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.machine.state()
    }

    /// The cell audio threads must read turn snapshots from.
    pub fn state_cell(&self) -> TurnStateCell {
        self.state.clone()
    }

    /// Swap in freshly opened devices after a device failure. Call between runs.
    pub fn replace_audio(&mut self, io: EngineIo) {
        self.params = TurnParams::from_config(&self.ctx.config.turn, io.cues.ack.duration());
        self.mic = io.mic;
        self.mic_open = true;
        self.pipeline = None;
        self.playback = io.playback;
        self.playback_status = io.playback_status;
        self.aec = io.aec;
        self.wake = io.wake;
        self.cues = io.cues;
        self.state = io.state;
        self.uplink_live = false;
        self.publish();
    }

    /// Drive one connection: handshake, then schedule until the connection is lost
    /// (error) or the host asks to shut down.
    pub async fn run(&mut self, mut transport: SessionTransport) -> VoiceResult<RunExit> {
        transport.start_connection().await?;
        transport
            .start_session(self.ctx.config.cloud.session_payload(), true)
            .await?;
        let (handle, mut frames) = transport.into_parts();

        self.transport = Some(handle.clone());
        self.machine = TurnMachine::new(self.params.clone());
        self.resetting = false;
        self.uplink_live = false;
        self.cancel_synthesis();
        self.playback.purge();
        self.publish();

        let result = self.schedule(&handle, &mut frames).await;

        self.cancel_synthesis();
        self.playback.purge();
        self.transport = None;
        self.machine = TurnMachine::new(self.params.clone());
        self.publish();

        if matches!(result, Ok(RunExit::Shutdown)) {
            let finish = async {
                // A reply still streaming is cut short rather than waited for.
                if handle.session().pending_response {
                    handle.cancel_session().await?;
                } else {
                    handle.finish_session().await?;
                }
                handle.finish_connection().await?;
                handle.close().await
            };
            if let Err(e) = tokio::time::timeout(Duration::from_secs(2), finish)
                .await
                .unwrap_or_else(|_| Err(WireError::AckTimeout("shutdown".to_string())))
            {
                debug!("Graceful shutdown incomplete: {}", e);
            }
        }
        result
    }

    async fn schedule(
        &mut self,
        transport: &TransportHandle,
        frames: &mut FrameReceiver,
    ) -> VoiceResult<RunExit> {
        let mut tick = tokio::time::interval(Duration::from_millis(self.ctx.config.turn.tick_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                frame = frames.next_frame() => match frame {
                    Ok(frame) => self.on_frame(transport, frame),
                    Err(e) if e.is_connection_fatal() => {
                        warn!("🔌 Connection lost: {}", e);
                        return Err(e.into());
                    }
                    Err(e) => warn!("Frame error: {}", e),
                },
                chunk = self.mic.recv(), if self.mic_open => match chunk {
                    Some(chunk) => self.on_mic(transport, chunk),
                    None => {
                        error!("❌ Microphone stream ended");
                        self.mic_open = false;
                        self.close_uplink();
                        return Err(VoiceError::persistent("microphone stream ended"));
                    }
                },
                Some(command) = self.commands.recv() => match command {
                    EngineCommand::Text(text) => {
                        self.queue.push_back(text);
                        self.serve_queue();
                    }
                    EngineCommand::Wake => {
                        let effects = self.machine.wake(now(), WakeReason::Manual);
                        self.apply(effects);
                    }
                    EngineCommand::Shutdown => {
                        info!("Shutdown requested");
                        return Ok(RunExit::Shutdown);
                    }
                },
                Some(internal) = self.internal.recv() => {
                    self.on_internal(transport, internal)?;
                }
                _ = tick.tick() => {
                    if let Some(reason) = self.playback_status.dead_reason() {
                        error!("❌ Playback stream dead: {}", reason);
                        return Err(VoiceError::persistent(format!("playback stream dead: {}", reason)));
                    }
                    let effects = self.machine.tick(now(), self.playback.is_idle());
                    self.apply(effects);
                }
            }
        }
    }

    fn publish(&self) {
        self.state.store(self.machine.state());
    }

    fn on_frame(&mut self, transport: &TransportHandle, frame: Frame) {
        if let Some(session) = frame.session_id.as_deref() {
            if session != transport.session_id().to_string() {
                debug!(session, "Ignoring frame from a previous session");
                return;
            }
        }

        let now = now();
        if frame.message_type == MessageType::Error {
            error!("❌ Session error: {}", session_error(&frame));
            let effects = self.machine.session_error(now);
            self.apply(effects);
            return;
        }
        let Some(event) = frame.event else {
            return;
        };

        let effects = match event {
            EventCode::TTS_RESPONSE => match frame.payload {
                Payload::Raw(pcm) => self.machine.cloud_audio(now, pcm),
                Payload::Json(_) => Vec::new(),
            },
            EventCode::ASR_INFO => self
                .machine
                .user_speech_started(now, !self.playback.is_idle()),
            EventCode::ASR_RESPONSE => {
                let mut effects = Vec::new();
                for (text, interim) in asr_results(&frame.payload) {
                    effects.extend(self.machine.transcript(now, &text, interim));
                }
                effects
            }
            EventCode::ASR_ENDED => self.machine.asr_ended(now),
            EventCode::SESSION_FAILED | EventCode::DIALOG_COMMON_ERROR => {
                error!("❌ Session error: {}", session_error(&frame));
                self.machine.session_error(now)
            }
            EventCode::SESSION_STARTED => {
                info!("✅ Session started");
                Vec::new()
            }
            EventCode::CHAT_RESPONSE => {
                if let Some(content) = frame
                    .payload
                    .as_json()
                    .and_then(|v| v.get("content"))
                    .and_then(Value::as_str)
                {
                    debug!(content, "Cloud reply text");
                }
                Vec::new()
            }
            _ => Vec::new(),
        };
        self.apply(effects);

        if event != EventCode::TTS_RESPONSE {
            let effects = self.machine.server_event(now, event);
            self.apply(effects);
        }
    }

    fn on_mic(&mut self, transport: &TransportHandle, chunk: RawChunk) {
        let stale = !matches!(
            &self.pipeline,
            Some((rate, channels, _)) if *rate == chunk.sample_rate && *channels == chunk.channels
        );
        if stale {
            let pipeline = CapturePipeline::new(
                chunk.sample_rate,
                chunk.channels,
                self.aec.clone(),
                self.ctx.config.wake.gain,
            );
            self.pipeline = Some((chunk.sample_rate, chunk.channels, pipeline));
        }
        let Some((_, _, pipeline)) = self.pipeline.as_mut() else {
            return;
        };
        let conditioned = pipeline.process(&chunk.samples);
        let now = now();

        if self.machine.accepts_mic(now) {
            let pcm = Bytes::from(pcm_to_le_bytes(&conditioned.uplink));
            match transport.send_audio(pcm) {
                Ok(()) => self.uplink_live = true,
                Err(e) => debug!("Uplink audio not sent: {}", e),
            }
        } else if self.machine.state().is_standby() {
            if let Some(event) = self.wake.feed(now, &conditioned.wake) {
                let effects = self
                    .machine
                    .wake(now, WakeReason::Detector { score: event.score });
                self.apply(effects);
            }
        }
    }

    fn on_internal(&mut self, transport: &TransportHandle, internal: Internal) -> VoiceResult<()> {
        let now = now();
        match internal {
            Internal::Verdict {
                generation,
                verdict,
                query,
            } => {
                if generation != self.generation {
                    debug!("Dropping stale verdict");
                    return Ok(());
                }
                match query {
                    None => {
                        let effects = self.machine.verdict(now, verdict);
                        self.apply(effects);
                    }
                    Some(text) if verdict == Verdict::Complex => {
                        let effects = self.machine.route_to_agent(now, text);
                        self.apply(effects);
                    }
                    Some(text) => {
                        let transport = transport.clone();
                        let tx = self.internal_tx.clone();
                        let generation = self.generation;
                        tokio::spawn(async move {
                            if let Err(e) = transport.send_text(&text).await {
                                warn!("Text query not delivered: {}", e);
                                // Release the gate rather than wait for its timeout.
                                let _ = tx.send(Internal::AgentDone { generation }).await;
                            }
                        });
                    }
                }
            }
            Internal::AgentAudio { generation, pcm } => {
                if generation == self.generation {
                    let effects = self.machine.agent_audio(now, pcm);
                    self.apply(effects);
                }
            }
            Internal::AgentReply { generation, text } => {
                if generation == self.generation {
                    self.machine.agent_reply_via_cloud(now);
                    self.publish();
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.send_chat_tts(&text, true, true).await {
                            warn!("ChatTTS not delivered: {}", e);
                        }
                    });
                }
            }
            Internal::AgentDone { generation } => {
                if generation == self.generation {
                    self.synthesis = None;
                    let effects = if self.machine.state().speaker() == Some(Origin::LocalAgent) {
                        self.machine.agent_finished(now)
                    } else {
                        self.machine.abandon_request(now)
                    };
                    self.apply(effects);
                }
            }
            Internal::ResetDone(result) => {
                self.resetting = false;
                match result {
                    Ok(id) => debug!(session = %id, "Session reset complete"),
                    Err(e) if e.is_connection_fatal() => return Err(e.into()),
                    Err(e) => warn!("Session reset failed: {}", e),
                }
            }
        }
        Ok(())
    }

    /// Start the next queued typed query if the gate is free.
    fn serve_queue(&mut self) {
        if self.queue.is_empty() || self.machine.begin_request(now()).is_err() {
            return;
        }
        self.publish();
        if let Some(text) = self.queue.pop_front() {
            info!("📝 Text query: {}", text);
            self.spawn_classifier(text.clone(), Some(text));
        }
    }

    fn spawn_classifier(&self, text: String, query: Option<String>) {
        let classifier = self.ctx.classifier.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let verdict = classifier.classify(&text).await;
            debug!(?verdict, "Classified");
            let _ = tx
                .send(Internal::Verdict {
                    generation,
                    verdict,
                    query,
                })
                .await;
        });
    }

    fn cancel_synthesis(&mut self) {
        self.generation += 1;
        if let Some(token) = self.synthesis.take() {
            token.cancel();
        }
    }

    fn spawn_agent(&mut self, text: String) {
        self.cancel_synthesis();
        let generation = self.generation;
        let tx = self.internal_tx.clone();
        if text.trim().is_empty() {
            tokio::spawn(async move {
                let _ = tx.send(Internal::AgentDone { generation }).await;
            });
            return;
        }

        let token = CancellationToken::new();
        self.synthesis = Some(token.clone());
        self.playback.open_origin(Origin::LocalAgent);
        let agent = self.ctx.agent.clone();
        let tts = self.ctx.tts.clone();
        let voice = self.ctx.config.turn.agent_voice;

        tokio::spawn(async move {
            let on_token = |piece: &str| debug!(piece, "agent token");
            let reply = tokio::select! {
                _ = token.cancelled() => return,
                reply = agent.run(&text, &on_token) => reply,
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    error!("❌ Agent failed: {}", e);
                    let _ = tx.send(Internal::AgentDone { generation }).await;
                    return;
                }
            };
            info!("🤖 Agent reply: {}", reply);

            if voice == AgentVoice::Cloud {
                let _ = tx.send(Internal::AgentReply { generation, text: reply }).await;
                return;
            }

            let mut stream = tts.synthesize(&reply);
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(pcm)) => {
                        if tx.send(Internal::AgentAudio { generation, pcm }).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("TTS failed mid-reply: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            let _ = tx.send(Internal::AgentDone { generation }).await;
        });
    }

    /// End the current uplink submission with a last-chunk frame.
    fn close_uplink(&mut self) {
        if !std::mem::take(&mut self.uplink_live) {
            return;
        }
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        if let Err(e) = transport.send_last_audio(Bytes::from_static(&CLOSING_CHUNK)) {
            debug!("Closing uplink chunk not sent: {}", e);
        }
    }

    fn spawn_reset(&mut self) {
        if self.resetting {
            debug!("Session reset already in flight");
            return;
        }
        let Some(transport) = self.transport.clone() else {
            return;
        };
        self.resetting = true;
        let payload = self.ctx.config.cloud.session_payload();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.hot_reset(payload).await;
            let _ = tx.send(Internal::ResetDone(result)).await;
        });
    }

    /// Carry out effects in order, then publish the new state.
    fn apply(&mut self, effects: Vec<Effect>) {
        let mut gate_released = false;
        for effect in effects {
            match effect {
                Effect::PlayCue(cue) => self.playback.push_cue(self.cues.get(cue).clone()),
                Effect::StopLocalMedia => self.ctx.media.stop(),
                Effect::HotReset => {
                    // The rotated session starts a new submission.
                    self.uplink_live = false;
                    self.spawn_reset();
                }
                Effect::ResetAec => self.aec.reset(),
                Effect::ClearDiscardWindows => self.wake.clear_ignore(),
                Effect::IgnoreAudioUntil(until) => self.wake.ignore_until(until),
                Effect::OpenOrigin(origin) => self.playback.open_origin(origin),
                Effect::PlayCloud(pcm) => {
                    self.playback.push(AudioChunk::new(
                        Origin::CloudS2S,
                        pcm_from_le_bytes(&pcm),
                        DOWNLINK_SAMPLE_RATE,
                    ));
                }
                Effect::PlayAgent(pcm) => {
                    self.playback.push(AudioChunk::new(
                        Origin::LocalAgent,
                        pcm_from_le_bytes(&pcm),
                        self.ctx.tts.sample_rate(),
                    ));
                }
                Effect::PurgePlayback => {
                    self.playback.purge();
                }
                Effect::PurgeAll => self.playback.purge_all(),
                Effect::CancelSynthesis => self.cancel_synthesis(),
                Effect::Classify { text } => self.spawn_classifier(text, None),
                Effect::InvokeAgent { text } => self.spawn_agent(text),
                Effect::FinalTranscript(text) => self.ctx.observer.on_final_transcript(&text),
                Effect::WakeTriggered(reason) => self.ctx.observer.on_wake_triggered(&reason),
                Effect::TurnEnded(reason) => {
                    if reason == TurnEndReason::GateTimeout {
                        let error = VoiceError::TurnTimeout(self.params.gate_timeout);
                        warn!("⏱️ {}, releasing", error);
                    }
                    info!("🏁 Turn ended: {}", reason.as_str());
                    self.ctx.observer.on_turn_end(&reason);
                    gate_released = true;
                }
                Effect::EnterStandby => {
                    self.close_uplink();
                    self.wake.reset();
                    self.pipeline = None;
                }
            }
        }
        self.publish();
        if gate_released {
            self.serve_queue();
        }
    }
}

/// `(text, interim)` pairs from an ASRResponse payload.
fn asr_results(payload: &Payload) -> Vec<(String, bool)> {
    let Some(results) = payload
        .as_json()
        .and_then(|v| v.get("results"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    results
        .iter()
        .filter_map(|r| {
            let text = r.get("text")?.as_str()?.to_string();
            let interim = r.get("is_interim").and_then(Value::as_bool).unwrap_or(false);
            Some((text, interim))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_asr_results() {
        let payload = Payload::Json(json!({
            "results": [
                {"text": "hello", "is_interim": true},
                {"text": "hello there"},
                {"alternatives": []}
            ]
        }));
        assert_eq!(
            asr_results(&payload),
            vec![("hello".to_string(), true), ("hello there".to_string(), false)]
        );
        assert!(asr_results(&Payload::empty_json()).is_empty());
    }
}
