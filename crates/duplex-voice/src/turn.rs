//! Turn arbitration state machine.
//!
//! `TurnMachine` is pure: every input takes the current time and returns the [`Effect`]s the
//! scheduler must carry out. It never touches devices, sockets or timers itself, which keeps
//! every transition unit-testable with synthetic clocks.

use crate::collaborators::{TurnEndReason, Verdict, WakeReason};
use crate::config::TurnConfig;
use arc_swap::ArcSwap;
use bytes::Bytes;
use duplex_wire::EventCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where a chunk of output audio came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    CloudS2S,
    LocalAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Idle,
    Pending { deadline: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudRoute {
    Open,
    /// Cloud output is suppressed. With `handoff`, the transcript goes to the agent at the
    /// end of the user's turn.
    Muted { handoff: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTurn {
    pub speaker: Option<Origin>,
    pub gate: Gate,
    pub route: CloudRoute,
    pub active_until: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Standby,
    Active(ActiveTurn),
}

impl TurnState {
    pub fn is_standby(&self) -> bool {
        matches!(self, TurnState::Standby)
    }

    pub fn speaker(&self) -> Option<Origin> {
        match self {
            TurnState::Active(turn) => turn.speaker,
            TurnState::Standby => None,
        }
    }

    pub fn gate_pending(&self) -> bool {
        matches!(
            self,
            TurnState::Active(ActiveTurn {
                gate: Gate::Pending { .. },
                ..
            })
        )
    }

    /// Cloud audio must not reach the speaker.
    pub fn cloud_muted(&self) -> bool {
        match self {
            TurnState::Standby => true,
            TurnState::Active(turn) => matches!(turn.route, CloudRoute::Muted { .. }),
        }
    }
}

/// Atomic snapshot of the turn state for the audio threads. Written only by the scheduler.
#[derive(Clone)]
pub struct TurnStateCell {
    inner: Arc<ArcSwap<TurnState>>,
}

impl TurnStateCell {
    pub fn new(state: TurnState) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(state)),
        }
    }

    pub fn load(&self) -> TurnState {
        **self.inner.load()
    }

    pub fn store(&self, state: TurnState) {
        self.inner.store(Arc::new(state));
    }
}

impl Default for TurnStateCell {
    fn default() -> Self {
        Self::new(TurnState::Standby)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// Played when the engine wakes.
    Ack,
    /// Played while the agent works on a handed-off turn.
    Filler,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PlayCue(Cue),
    StopLocalMedia,
    /// Rotate the cloud session.
    HotReset,
    ResetAec,
    /// Clear any ignore window and mic suppression.
    ClearDiscardWindows,
    /// Mic uplink and cloud audio are ignored until this instant.
    IgnoreAudioUntil(Instant),
    /// Switch the playback buffer to this origin.
    OpenOrigin(Origin),
    PlayCloud(Bytes),
    PlayAgent(Bytes),
    /// Drop buffered chunks (cues survive).
    PurgePlayback,
    /// Drop buffered chunks and cues.
    PurgeAll,
    CancelSynthesis,
    Classify { text: String },
    InvokeAgent { text: String },
    FinalTranscript(String),
    WakeTriggered(WakeReason),
    /// The gate is free again; waiting requests may proceed.
    TurnEnded(TurnEndReason),
    EnterStandby,
}

/// Tuning for [`TurnMachine`], derived from [`TurnConfig`].
#[derive(Debug, Clone)]
pub struct TurnParams {
    pub idle_timeout: Duration,
    pub gate_timeout: Duration,
    pub silence_eot: Duration,
    pub trigger_keywords: Vec<String>,
    pub wake_phrases: Vec<String>,
    pub terminal_events: Vec<EventCode>,
    pub ignore_margin: Duration,
    /// Length of the ack cue; the ignore window covers it.
    pub ack_duration: Duration,
}

impl TurnParams {
    pub fn from_config(config: &TurnConfig, ack_duration: Duration) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            gate_timeout: config.gate_timeout(),
            silence_eot: config.silence_eot(),
            trigger_keywords: config.trigger_keywords.iter().map(|k| k.to_lowercase()).collect(),
            wake_phrases: config.wake_phrases.iter().map(|p| p.to_lowercase()).collect(),
            terminal_events: config.terminal_event_codes(),
            ignore_margin: Duration::from_millis(config.ignore_margin_ms),
            ack_duration,
        }
    }
}

impl Default for TurnParams {
    fn default() -> Self {
        Self::from_config(&TurnConfig::default(), Duration::from_millis(300))
    }
}

/// Returned by [`TurnMachine::begin_request`] when a turn is already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateBusy;

pub struct TurnMachine {
    params: TurnParams,
    state: TurnState,
    /// Final transcript segments of the current user utterance.
    transcript: String,
    /// Latest interim hypothesis not yet covered by a final segment.
    partial: String,
    last_output: Option<Instant>,
    ignore_until: Option<Instant>,
    /// The cloud may still be streaming a reply nobody should hear. The route stays muted
    /// until that reply's closing event or this deadline.
    muted_reply_until: Option<Instant>,
}

impl TurnMachine {
    pub fn new(params: TurnParams) -> Self {
        Self {
            params,
            state: TurnState::Standby,
            transcript: String::new(),
            partial: String::new(),
            last_output: None,
            ignore_until: None,
            muted_reply_until: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn params(&self) -> &TurnParams {
        &self.params
    }

    /// Mic audio goes to the cloud (as opposed to the wake gate or nowhere).
    pub fn accepts_mic(&self, now: Instant) -> bool {
        !self.state.is_standby() && !self.in_ignore_window(now)
    }

    fn in_ignore_window(&self, now: Instant) -> bool {
        self.ignore_until.map(|until| now < until).unwrap_or(false)
    }

    fn active_mut(&mut self) -> Option<&mut ActiveTurn> {
        match &mut self.state {
            TurnState::Active(turn) => Some(turn),
            TurnState::Standby => None,
        }
    }

    /// Current turn, entering Active from Standby if needed.
    fn activate(&mut self, now: Instant) -> ActiveTurn {
        match self.state {
            TurnState::Active(turn) => turn,
            TurnState::Standby => {
                let turn = ActiveTurn {
                    speaker: None,
                    gate: Gate::Idle,
                    route: CloudRoute::Open,
                    active_until: now + self.params.idle_timeout,
                };
                self.state = TurnState::Active(turn);
                turn
            }
        }
    }

    fn clear_utterance(&mut self) {
        self.transcript.clear();
        self.partial.clear();
    }

    fn utterance(&self) -> String {
        let mut text = self.transcript.trim().to_string();
        let partial = self.partial.trim();
        if !partial.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(partial);
        }
        text
    }

    fn contains_any(text: &str, needles: &[String]) -> Option<String> {
        let lower = text.to_lowercase();
        needles
            .iter()
            .find(|n| !n.is_empty() && lower.contains(n.as_str()))
            .cloned()
    }

    /// Events after which the cloud sends nothing more for the current reply.
    fn closes_cloud_reply(event: EventCode) -> bool {
        matches!(event, EventCode::TTS_ENDED | EventCode::SESSION_FINISHED)
    }

    /// Route for a turn that is not handing off: muted while a suppressed reply is live.
    fn settled_route(&self) -> CloudRoute {
        if self.muted_reply_until.is_some() {
            CloudRoute::Muted { handoff: false }
        } else {
            CloudRoute::Open
        }
    }

    /// The suppressed reply is over. Unmutes unless the agent still holds the turn.
    fn release_muted_reply(&mut self) {
        self.muted_reply_until = None;
        if let Some(turn) = self.active_mut() {
            if turn.route == (CloudRoute::Muted { handoff: false })
                && turn.speaker != Some(Origin::LocalAgent)
            {
                debug!("Suppressed cloud reply finished, route open");
                turn.route = CloudRoute::Open;
            }
        }
    }

    /// Wake trigger from the detector, a phrase or the host.
    pub fn wake(&mut self, now: Instant, reason: WakeReason) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let TurnState::Active(turn) = self.state {
            // Waking over an active turn drops it.
            if turn.speaker.is_some() {
                effects.push(Effect::PurgeAll);
                effects.push(Effect::CancelSynthesis);
            }
            if turn.gate != Gate::Idle || turn.speaker.is_some() {
                effects.push(Effect::TurnEnded(TurnEndReason::BargeIn));
            }
            self.state = TurnState::Standby;
        }

        info!("👂 Wake: {:?}", reason);
        self.clear_utterance();
        self.last_output = None;
        self.ignore_until = None;
        // The session rotates; nothing of the old reply can arrive.
        self.muted_reply_until = None;
        effects.push(Effect::ClearDiscardWindows);
        self.activate(now);

        let until = now + self.params.ack_duration + self.params.ignore_margin;
        self.ignore_until = Some(until);
        effects.extend([
            Effect::PlayCue(Cue::Ack),
            Effect::StopLocalMedia,
            Effect::HotReset,
            Effect::ResetAec,
            Effect::IgnoreAudioUntil(until),
            Effect::WakeTriggered(reason),
        ]);
        effects
    }

    /// ASRInfo: the user started talking. `playback_busy` is true while the speaker is
    /// still draining audio, which can outlast the turn that produced it.
    pub fn user_speech_started(&mut self, now: Instant, playback_busy: bool) -> Vec<Effect> {
        let TurnState::Active(mut turn) = self.state else {
            return Vec::new();
        };
        turn.active_until = now + self.params.idle_timeout;

        // While a handoff is collecting the utterance only the filler cue can be queued.
        let collecting = turn.route == (CloudRoute::Muted { handoff: true });
        let mut effects = Vec::new();
        if turn.speaker.is_some() || (playback_busy && !collecting) {
            info!("⚡ Barge-in: user speaking over {:?}", turn.speaker);
            let claimed = turn.speaker.is_some() || turn.gate != Gate::Idle;
            turn.speaker = None;
            turn.route = CloudRoute::Open;
            turn.gate = Gate::Idle;
            effects.extend([
                Effect::PurgeAll,
                Effect::CancelSynthesis,
                Effect::ClearDiscardWindows,
            ]);
            if claimed {
                effects.push(Effect::TurnEnded(TurnEndReason::BargeIn));
            }
            self.ignore_until = None;
            self.last_output = None;
        }

        // A new utterance gets a new reply; the cloud drops the one it was streaming.
        if turn.route != (CloudRoute::Muted { handoff: true }) {
            self.muted_reply_until = None;
            turn.route = CloudRoute::Open;
        }

        if turn.gate == Gate::Idle {
            turn.gate = Gate::Pending {
                deadline: now + self.params.gate_timeout,
            };
        }
        if turn.route == CloudRoute::Open {
            self.clear_utterance();
        }
        self.state = TurnState::Active(turn);
        effects
    }

    /// ASRResponse text. Interim text can trigger early mute; finals are accumulated.
    pub fn transcript(&mut self, now: Instant, text: &str, interim: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        let text = text.trim();
        if text.is_empty() {
            return effects;
        }

        if self.state.is_standby() {
            if let Some(phrase) = Self::contains_any(text, &self.params.wake_phrases) {
                return self.wake(now, WakeReason::Phrase(phrase));
            }
            return effects;
        }

        if interim {
            self.partial = text.to_string();
        } else {
            if !self.transcript.is_empty() {
                self.transcript.push(' ');
            }
            self.transcript.push_str(text);
            self.partial.clear();
            effects.push(Effect::FinalTranscript(text.to_string()));
        }

        let keyword = Self::contains_any(text, &self.params.trigger_keywords);
        let idle = self.params.idle_timeout;
        let mut muted = false;
        if let Some(turn) = self.active_mut() {
            turn.active_until = now + idle;
            if let (Some(keyword), CloudRoute::Open) = (keyword, turn.route) {
                if turn.speaker != Some(Origin::LocalAgent) {
                    info!("🔇 Early mute on keyword '{}'", keyword);
                    effects.extend(Self::mute_cloud(turn));
                    muted = true;
                }
            }
        }
        if muted {
            self.muted_reply_until = Some(now + self.params.gate_timeout);
        }
        effects
    }

    fn mute_cloud(turn: &mut ActiveTurn) -> Vec<Effect> {
        turn.route = CloudRoute::Muted { handoff: true };
        if turn.speaker == Some(Origin::CloudS2S) {
            turn.speaker = None;
        }
        vec![Effect::PurgePlayback, Effect::PlayCue(Cue::Filler)]
    }

    /// ASREnded: the user's utterance is complete.
    pub fn asr_ended(&mut self, now: Instant) -> Vec<Effect> {
        let TurnState::Active(turn) = self.state else {
            return Vec::new();
        };
        let text = self.utterance();
        match turn.route {
            CloudRoute::Muted { handoff: true } => self.hand_off(now, text),
            CloudRoute::Open if !text.is_empty() && turn.speaker != Some(Origin::LocalAgent) => {
                vec![Effect::Classify { text }]
            }
            _ => Vec::new(),
        }
    }

    /// Classifier result for the current voice utterance.
    pub fn verdict(&mut self, now: Instant, verdict: Verdict) -> Vec<Effect> {
        if verdict == Verdict::Simple {
            return Vec::new();
        }
        let text = self.utterance();
        let Some(turn) = self.active_mut() else {
            return Vec::new();
        };
        if turn.route != CloudRoute::Open || turn.speaker == Some(Origin::LocalAgent) {
            return Vec::new();
        }
        let mut effects = Self::mute_cloud(turn);
        self.muted_reply_until = Some(now + self.params.gate_timeout);
        effects.extend(self.hand_off(now, text));
        effects
    }

    /// Move the turn to the local agent. Runs at most once per utterance because it
    /// clears the handoff flag and the transcript.
    fn hand_off(&mut self, now: Instant, text: String) -> Vec<Effect> {
        let gate_timeout = self.params.gate_timeout;
        let Some(turn) = self.active_mut() else {
            return Vec::new();
        };
        turn.route = CloudRoute::Muted { handoff: false };
        turn.speaker = Some(Origin::LocalAgent);
        turn.gate = Gate::Pending {
            deadline: now + gate_timeout,
        };
        self.clear_utterance();
        if text.is_empty() {
            warn!("Handoff with empty transcript");
        }
        info!("🤝 Handing turn to local agent: {}", text);
        vec![Effect::InvokeAgent { text }]
    }

    /// PCM from the cloud.
    pub fn cloud_audio(&mut self, now: Instant, pcm: Bytes) -> Vec<Effect> {
        if self.in_ignore_window(now) {
            return Vec::new();
        }
        let Some(turn) = self.active_mut() else {
            return Vec::new();
        };
        if matches!(turn.route, CloudRoute::Muted { .. }) || turn.speaker == Some(Origin::LocalAgent)
        {
            return Vec::new();
        }
        let mut effects = Vec::with_capacity(2);
        if turn.speaker != Some(Origin::CloudS2S) {
            turn.speaker = Some(Origin::CloudS2S);
            effects.push(Effect::OpenOrigin(Origin::CloudS2S));
        }
        self.last_output = Some(now);
        effects.push(Effect::PlayCloud(pcm));
        effects
    }

    /// PCM synthesized for the agent's reply.
    pub fn agent_audio(&mut self, now: Instant, pcm: Bytes) -> Vec<Effect> {
        let Some(turn) = self.active_mut() else {
            return Vec::new();
        };
        if turn.speaker != Some(Origin::LocalAgent) {
            debug!("Dropping stale agent audio");
            return Vec::new();
        }
        self.last_output = Some(now);
        vec![Effect::PlayAgent(pcm)]
    }

    /// The agent's reply will be spoken by the cloud voice (ChatTTS). The route opens once
    /// any suppressed cloud reply has finished.
    pub fn agent_reply_via_cloud(&mut self, now: Instant) {
        let gate_timeout = self.params.gate_timeout;
        let route = self.settled_route();
        if let Some(turn) = self.active_mut() {
            if turn.speaker == Some(Origin::LocalAgent) {
                turn.speaker = None;
                turn.route = route;
                turn.gate = Gate::Pending {
                    deadline: now + gate_timeout,
                };
            }
        }
    }

    /// The agent finished (or failed); its turn is over.
    pub fn agent_finished(&mut self, now: Instant) -> Vec<Effect> {
        if self.state.speaker() != Some(Origin::LocalAgent) {
            return Vec::new();
        }
        self.end_turn(now, TurnEndReason::AgentDone)
    }

    /// A claimed request could not be carried out; free the gate.
    pub fn abandon_request(&mut self, now: Instant) -> Vec<Effect> {
        if !self.state.gate_pending() || self.state.speaker().is_some() {
            return Vec::new();
        }
        self.end_turn(now, TurnEndReason::Abandoned)
    }

    /// A server event with no payload semantics of its own.
    pub fn server_event(&mut self, now: Instant, event: EventCode) -> Vec<Effect> {
        let closes_reply = Self::closes_cloud_reply(event);
        if !self.params.terminal_events.contains(&event) && !closes_reply {
            return Vec::new();
        }
        let TurnState::Active(turn) = self.state else {
            return Vec::new();
        };
        if turn.route == (CloudRoute::Muted { handoff: true })
            && turn.speaker != Some(Origin::LocalAgent)
        {
            // The cloud finished a reply nobody heard; the user turn is over too.
            if closes_reply {
                self.muted_reply_until = None;
            }
            let text = self.utterance();
            return self.hand_off(now, text);
        }
        if self.muted_reply_until.is_some() {
            // Events of the suppressed reply never end a turn.
            if closes_reply {
                self.release_muted_reply();
            }
            return Vec::new();
        }
        if !self.params.terminal_events.contains(&event) {
            return Vec::new();
        }
        if turn.speaker == Some(Origin::LocalAgent) {
            return Vec::new();
        }
        if turn.speaker.is_none() && turn.gate == Gate::Idle {
            return Vec::new();
        }
        self.end_turn(now, TurnEndReason::ServerEvent(event.code()))
    }

    fn end_turn(&mut self, now: Instant, reason: TurnEndReason) -> Vec<Effect> {
        let idle = self.params.idle_timeout;
        let route = self.settled_route();
        let Some(turn) = self.active_mut() else {
            return Vec::new();
        };
        turn.speaker = None;
        turn.gate = Gate::Idle;
        turn.route = route;
        turn.active_until = now + idle;
        self.last_output = None;
        debug!("Turn ended: {}", reason.as_str());
        vec![Effect::TurnEnded(reason)]
    }

    /// Claim the gate for a new request. Wakes the engine silently from standby.
    pub fn begin_request(&mut self, now: Instant) -> Result<(), GateBusy> {
        let mut turn = self.activate(now);
        if turn.gate != Gate::Idle {
            return Err(GateBusy);
        }
        turn.gate = Gate::Pending {
            deadline: now + self.params.gate_timeout,
        };
        turn.route = self.settled_route();
        self.state = TurnState::Active(turn);
        Ok(())
    }

    /// A claimed request goes straight to the agent (text queries classified Complex).
    pub fn route_to_agent(&mut self, now: Instant, text: String) -> Vec<Effect> {
        let Some(turn) = self.active_mut() else {
            return Vec::new();
        };
        let mut effects = Vec::new();
        if turn.speaker == Some(Origin::CloudS2S) {
            effects.push(Effect::PurgePlayback);
        }
        effects.extend(self.hand_off(now, text));
        effects
    }

    /// Server error: drop the turn and reset the session.
    pub fn session_error(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = vec![Effect::PurgePlayback, Effect::CancelSynthesis];
        self.clear_utterance();
        self.muted_reply_until = None;
        if !self.state.is_standby() {
            effects.extend(self.end_turn(now, TurnEndReason::SessionError));
        }
        effects.push(Effect::HotReset);
        effects
    }

    /// Timers: gate timeout, silence end-of-turn, activity timeout.
    pub fn tick(&mut self, now: Instant, playback_idle: bool) -> Vec<Effect> {
        let TurnState::Active(turn) = self.state else {
            return Vec::new();
        };

        if self.muted_reply_until.is_some_and(|until| now >= until) {
            warn!("Suppressed cloud reply never closed, unmuting");
            self.release_muted_reply();
        }

        if let Gate::Pending { deadline } = turn.gate {
            if now >= deadline {
                let mut effects = Vec::new();
                if turn.speaker == Some(Origin::LocalAgent) {
                    effects.push(Effect::CancelSynthesis);
                }
                effects.extend(self.end_turn(now, TurnEndReason::GateTimeout));
                return effects;
            }
        }

        if turn.speaker == Some(Origin::CloudS2S) && playback_idle {
            if let Some(last) = self.last_output {
                if now.saturating_duration_since(last) > self.params.silence_eot {
                    return self.end_turn(now, TurnEndReason::Silence);
                }
            }
        }

        if turn.speaker.is_none() && turn.gate == Gate::Idle && now > turn.active_until {
            info!("💤 Idle timeout, back to standby");
            self.state = TurnState::Standby;
            self.clear_utterance();
            return vec![Effect::EnterStandby];
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> TurnMachine {
        TurnMachine::new(TurnParams::default())
    }

    fn has(effects: &[Effect], wanted: &Effect) -> bool {
        effects.iter().any(|e| e == wanted)
    }

    #[test]
    fn test_wake_from_standby() {
        let mut m = machine();
        let t0 = Instant::now();
        let effects = m.wake(t0, WakeReason::Manual);
        assert!(has(&effects, &Effect::PlayCue(Cue::Ack)));
        assert!(has(&effects, &Effect::HotReset));
        assert!(has(&effects, &Effect::StopLocalMedia));
        assert!(has(&effects, &Effect::ResetAec));
        assert!(matches!(m.state(), TurnState::Active(_)));
        // ack (300 ms) + margin (300 ms)
        assert!(!m.accepts_mic(t0 + Duration::from_millis(500)));
        assert!(m.accepts_mic(t0 + Duration::from_millis(700)));
    }

    #[test]
    fn test_wake_phrase_in_standby_transcript() {
        let mut m = machine();
        let effects = m.transcript(Instant::now(), "Hey Duplex what's up", true);
        assert!(has(&effects, &Effect::WakeTriggered(WakeReason::Phrase("hey duplex".into()))));
        assert!(!m.state().is_standby());
    }

    #[test]
    fn test_cloud_audio_claims_speaker_once() {
        let mut m = machine();
        let t0 = Instant::now();
        m.begin_request(t0).unwrap();
        let first = m.cloud_audio(t0, Bytes::from_static(&[0, 0]));
        assert_eq!(first[0], Effect::OpenOrigin(Origin::CloudS2S));
        let second = m.cloud_audio(t0, Bytes::from_static(&[0, 0]));
        assert_eq!(second.len(), 1);
        assert_eq!(m.state().speaker(), Some(Origin::CloudS2S));
    }

    #[test]
    fn test_terminal_event_releases_gate() {
        let mut m = machine();
        let t0 = Instant::now();
        m.begin_request(t0).unwrap();
        assert_eq!(m.begin_request(t0), Err(GateBusy));
        m.cloud_audio(t0, Bytes::from_static(&[1, 0]));
        assert!(m.server_event(t0, EventCode::TTS_SENTENCE_START).is_empty());
        let effects = m.server_event(t0, EventCode::TTS_ENDED);
        assert_eq!(effects, vec![Effect::TurnEnded(TurnEndReason::ServerEvent(359))]);
        assert!(m.begin_request(t0).is_ok());
    }

    #[test]
    fn test_silence_ends_turn_only_when_playback_idle() {
        let mut m = machine();
        let t0 = Instant::now();
        m.begin_request(t0).unwrap();
        m.cloud_audio(t0, Bytes::from_static(&[1, 0]));
        let later = t0 + Duration::from_millis(1_100);
        assert!(m.tick(later, false).is_empty());
        assert_eq!(
            m.tick(later, true),
            vec![Effect::TurnEnded(TurnEndReason::Silence)]
        );
    }

    #[test]
    fn test_gate_fails_open() {
        let mut m = machine();
        let t0 = Instant::now();
        m.begin_request(t0).unwrap();
        assert!(m.tick(t0 + Duration::from_secs(19), true).is_empty());
        let effects = m.tick(t0 + Duration::from_secs(20), true);
        assert!(has(&effects, &Effect::TurnEnded(TurnEndReason::GateTimeout)));
        assert!(!m.state().gate_pending());
    }

    #[test]
    fn test_idle_timeout_requires_idle_gate() {
        let mut m = machine();
        let t0 = Instant::now();
        m.wake(t0, WakeReason::Manual);
        m.begin_request(t0).unwrap();
        // Gate pending at 31 s would have timed out first; check the ordering.
        let effects = m.tick(t0 + Duration::from_secs(21), true);
        assert!(has(&effects, &Effect::TurnEnded(TurnEndReason::GateTimeout)));
        assert!(!m.state().is_standby());
        let effects = m.tick(t0 + Duration::from_secs(52), true);
        assert_eq!(effects, vec![Effect::EnterStandby]);
        assert!(m.state().is_standby());
    }

    #[test]
    fn test_barge_in() {
        let mut m = machine();
        let t0 = Instant::now();
        m.begin_request(t0).unwrap();
        m.cloud_audio(t0, Bytes::from_static(&[1, 0]));
        let effects = m.user_speech_started(t0, true);
        assert!(has(&effects, &Effect::PurgeAll));
        assert!(has(&effects, &Effect::CancelSynthesis));
        assert!(has(&effects, &Effect::TurnEnded(TurnEndReason::BargeIn)));
        assert_eq!(m.state().speaker(), None);
        // The new utterance owns the gate.
        assert!(m.state().gate_pending());
    }

    #[test]
    fn test_early_mute_hands_off_once() {
        let mut m = machine();
        let t0 = Instant::now();
        m.wake(t0, WakeReason::Manual);
        let t1 = t0 + Duration::from_secs(1);
        m.user_speech_started(t1, false);
        let effects = m.transcript(t1, "what's the weather", true);
        assert!(has(&effects, &Effect::PurgePlayback));
        assert!(has(&effects, &Effect::PlayCue(Cue::Filler)));
        assert!(m.state().cloud_muted());

        assert!(m.cloud_audio(t1, Bytes::from_static(&[1, 0])).is_empty());
        m.transcript(t1, "what's the weather in Oslo", false);

        let effects = m.asr_ended(t1);
        assert_eq!(
            effects,
            vec![Effect::InvokeAgent {
                text: "what's the weather in Oslo".to_string()
            }]
        );
        // The cloud's own end of turn must not hand off again.
        assert!(m.server_event(t1, EventCode::TTS_ENDED).is_empty());
        assert!(m.asr_ended(t1).is_empty());
        assert!(m.cloud_audio(t1, Bytes::from_static(&[1, 0])).is_empty());

        let done = m.agent_finished(t1);
        assert_eq!(done, vec![Effect::TurnEnded(TurnEndReason::AgentDone)]);
        assert!(!m.state().cloud_muted());
    }

    #[test]
    fn test_barge_in_over_draining_audio() {
        let mut m = machine();
        let t0 = Instant::now();
        m.begin_request(t0).unwrap();
        m.cloud_audio(t0, Bytes::from_static(&[1, 0]));
        m.server_event(t0, EventCode::TTS_ENDED);
        assert_eq!(m.state().speaker(), None);

        // The turn is over but its audio is still queued.
        let effects = m.user_speech_started(t0, true);
        assert!(has(&effects, &Effect::PurgeAll));
        assert!(has(&effects, &Effect::CancelSynthesis));
        assert!(!effects.iter().any(|e| matches!(e, Effect::TurnEnded(_))));
        assert!(m.state().gate_pending());

        // Nothing queued: plain start of an utterance.
        let mut m = machine();
        m.begin_request(t0).unwrap();
        m.server_event(t0, EventCode::TTS_ENDED);
        assert!(m.user_speech_started(t0, false).is_empty());
    }

    #[test]
    fn test_filler_does_not_count_as_barge_in() {
        let mut m = machine();
        let t0 = Instant::now();
        m.wake(t0, WakeReason::Manual);
        let t1 = t0 + Duration::from_secs(1);
        m.user_speech_started(t1, false);
        m.transcript(t1, "what's the weather", true);
        // Second speech onset within the same utterance, filler still queued.
        assert!(m.user_speech_started(t1, true).is_empty());
        assert_eq!(m.state().speaker(), None);
        assert!(m.state().cloud_muted());
        assert_eq!(
            m.asr_ended(t1),
            vec![Effect::InvokeAgent {
                text: "what's the weather".to_string()
            }]
        );
    }

    #[test]
    fn test_mute_outlasts_agent_until_cloud_reply_ends() {
        let mut m = machine();
        let t0 = Instant::now();
        m.wake(t0, WakeReason::Manual);
        let t1 = t0 + Duration::from_secs(1);
        m.user_speech_started(t1, false);
        m.transcript(t1, "what's the weather", true);
        m.transcript(t1, "what's the weather", false);
        m.asr_ended(t1);

        // The agent is done before the cloud finished its suppressed reply.
        assert_eq!(
            m.agent_finished(t1),
            vec![Effect::TurnEnded(TurnEndReason::AgentDone)]
        );
        assert!(m.state().cloud_muted());
        assert!(!m.state().gate_pending());
        assert!(m.cloud_audio(t1, Bytes::from_static(&[1, 0])).is_empty());
        // Sentence ends of the suppressed reply change nothing.
        assert!(m.server_event(t1, EventCode::TTS_SENTENCE_END).is_empty());
        assert!(m.state().cloud_muted());

        assert!(m.server_event(t1, EventCode::TTS_ENDED).is_empty());
        assert!(!m.state().cloud_muted());
        let effects = m.cloud_audio(t1, Bytes::from_static(&[1, 0]));
        assert!(has(&effects, &Effect::OpenOrigin(Origin::CloudS2S)));
    }

    #[test]
    fn test_queued_request_waits_for_suppressed_reply() {
        let mut m = machine();
        let t0 = Instant::now();
        m.wake(t0, WakeReason::Manual);
        let t1 = t0 + Duration::from_secs(1);
        m.user_speech_started(t1, false);
        m.transcript(t1, "weather tomorrow", false);
        m.asr_ended(t1);
        m.agent_finished(t1);

        m.begin_request(t1).unwrap();
        assert!(m.cloud_audio(t1, Bytes::from_static(&[1, 0])).is_empty());
        // The old reply's end does not end the new request.
        assert!(m.server_event(t1, EventCode::TTS_ENDED).is_empty());
        assert!(m.state().gate_pending());
        assert!(!m.cloud_audio(t1, Bytes::from_static(&[1, 0])).is_empty());
    }

    #[test]
    fn test_suppressed_reply_unmutes_on_deadline() {
        let mut m = machine();
        let t0 = Instant::now();
        m.wake(t0, WakeReason::Manual);
        m.user_speech_started(t0, false);
        m.transcript(t0, "weather please", false);
        m.asr_ended(t0);
        m.agent_finished(t0);
        assert!(m.state().cloud_muted());

        assert!(m.tick(t0 + Duration::from_secs(5), true).is_empty());
        assert!(m.state().cloud_muted());
        m.tick(t0 + Duration::from_secs(20), true);
        assert!(!m.state().cloud_muted());
    }

    #[test]
    fn test_wake_over_speech_drops_cues() {
        let mut m = machine();
        let t0 = Instant::now();
        m.begin_request(t0).unwrap();
        m.cloud_audio(t0, Bytes::from_static(&[1, 0]));
        let effects = m.wake(t0, WakeReason::Manual);
        let purge = effects.iter().position(|e| *e == Effect::PurgeAll);
        let ack = effects.iter().position(|e| *e == Effect::PlayCue(Cue::Ack));
        assert!(purge.unwrap() < ack.unwrap());
        assert!(has(&effects, &Effect::TurnEnded(TurnEndReason::BargeIn)));
    }

    #[test]
    fn test_complex_verdict_mutes_and_invokes_agent() {
        let mut m = machine();
        let t0 = Instant::now();
        m.wake(t0, WakeReason::Manual);
        let t1 = t0 + Duration::from_secs(1);
        m.user_speech_started(t1, false);
        m.transcript(t1, "plan my trip to Rome", false);
        let effects = m.asr_ended(t1);
        assert_eq!(
            effects,
            vec![Effect::Classify {
                text: "plan my trip to Rome".to_string()
            }]
        );
        let effects = m.verdict(t1, Verdict::Complex);
        assert!(has(&effects, &Effect::PurgePlayback));
        assert!(has(
            &effects,
            &Effect::InvokeAgent {
                text: "plan my trip to Rome".to_string()
            }
        ));
        assert_eq!(m.state().speaker(), Some(Origin::LocalAgent));
    }

    #[test]
    fn test_snapshot_cell() {
        let cell = TurnStateCell::default();
        assert!(cell.load().cloud_muted());
        let mut m = machine();
        m.begin_request(Instant::now()).unwrap();
        cell.store(m.state());
        assert!(!cell.load().cloud_muted());
        assert!(cell.load().gate_pending());
    }
}
