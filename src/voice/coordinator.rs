//! # Voice Session Coordinator
//!
//! Owns one browser's voice session: the upstream connection, the audio queue
//! used while the connection is still coming up, the partial transcripts, the
//! tool-call bookkeeping and the conversation history. Every browser command and
//! every upstream signal is handled here, one at a time; the caller (an actor)
//! guarantees that nothing runs concurrently.
//!
//! ## States:
//! `Idle → Connecting → Active → Closed`. `Closed` is terminal; the gateway
//! builds a new coordinator (carrying the history over) to start again.
//!
//! ## Interruption:
//! When the user starts speaking over a generation, the generation is cancelled
//! and its id is remembered. Output belonging to it is discarded at the emit
//! boundary, so late deltas that were already in flight never reach the browser.

use super::events::{self, FunctionCallItem, ResponseEnd, UpstreamEvent, UserItem};
use super::protocol::{
    ClientEvent, ContentPart, ConversationItem, SessionSettings, ToolDefinition, ToolResult, TranscriptionSettings,
    TurnDetection, UpstreamFrame, MODALITIES,
};
use super::tools::{output_for, ToolCallTracker};
use super::transcript::TranscriptAccumulator;
use super::upstream::{ConnectRequest, ConnectionId, UpstreamLink, UpstreamSignal};
use crate::config::AppConfig;
use crate::store::{Role, Turn};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Audio frames held while the upstream connection is not ready yet.
pub const AUDIO_QUEUE_CAPACITY: usize = 8;

const PCM_SAMPLE_RATE: u64 = 24_000;
const PCM_BYTES_PER_SAMPLE: u64 = 2;

/// Error code the provider uses when a cancel found nothing to cancel.
const CANCEL_NOT_ACTIVE: &str = "response_cancel_not_active";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Active,
    Closed,
}

/// Where events for the browser go.
pub trait Downstream {
    fn emit(&mut self, event: ClientEvent);

    /// Called once for every turn appended to the history.
    fn persist(&mut self, _turn: &Turn) {}
}

/// Everything needed to open and configure an upstream session.
#[derive(Debug, Clone)]
pub struct VoiceSettings {
    pub url: String,
    pub api_key: String,
    pub instructions: String,
    pub voice: String,
    pub transcription_model: String,
    pub transcription_language: String,
}

impl VoiceSettings {
    pub fn from_config(config: &AppConfig, instructions: String) -> Self {
        Self {
            url: config.connect_url(),
            api_key: config.realtime.api_key.clone(),
            instructions,
            voice: config.realtime.voice.clone(),
            transcription_model: config.realtime.transcription_model.clone(),
            transcription_language: config.realtime.transcription_language.clone(),
        }
    }

    pub fn connect_request(&self) -> ConnectRequest {
        ConnectRequest {
            url: self.url.clone(),
            headers: vec![
                ("Authorization".to_string(), format!("Bearer {}", self.api_key)),
                ("OpenAI-Beta".to_string(), "realtime=v1".to_string()),
            ],
        }
    }

    pub fn session(&self, tools: &[ToolDefinition]) -> SessionSettings {
        let language = self.transcription_language.trim();
        SessionSettings {
            modalities: MODALITIES.iter().map(|m| m.to_string()).collect(),
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionSettings {
                model: self.transcription_model.clone(),
                language: (!language.is_empty()).then(|| language.to_string()),
            },
            tools: (!tools.is_empty()).then(|| tools.iter().map(ToolDefinition::to_upstream).collect()),
            turn_detection: TurnDetection::default(),
        }
    }
}

/// Decides which generation's output may still reach the browser.
#[derive(Debug, Default)]
struct OutputGate {
    interrupted: bool,
    current: Option<String>,
    cancelled: HashSet<String>,
    /// A cancelled generation whose `response.created` has not arrived yet
    cancel_unannounced: bool,
}

impl OutputGate {
    /// Returns false when the new generation is the one that was already cancelled.
    fn open(&mut self, response_id: Option<String>) -> bool {
        if self.cancel_unannounced {
            self.cancel_unannounced = false;
            if let Some(id) = response_id {
                self.cancelled.insert(id);
            }
            return false;
        }
        self.interrupted = false;
        self.current = response_id;
        true
    }

    fn interrupt(&mut self, awaiting_created: bool) {
        self.interrupted = true;
        match self.current.take() {
            Some(id) => {
                self.cancelled.insert(id);
            }
            None => self.cancel_unannounced = awaiting_created,
        }
    }

    fn admits(&self, response_id: Option<&str>) -> bool {
        if response_id.is_some_and(|id| self.cancelled.contains(id)) {
            return false;
        }
        !self.interrupted
    }

    /// Nothing is left to cancel, so no cancelled generation will be announced.
    fn settle(&mut self) {
        self.cancel_unannounced = false;
    }

    fn is_cancelled(&self, response_id: Option<&str>) -> bool {
        response_id.is_some_and(|id| self.cancelled.contains(id))
    }

    fn finish(&mut self, response_id: Option<&str>) {
        if let Some(id) = response_id {
            self.cancelled.remove(id);
            if self.current.as_deref() == Some(id) {
                self.current = None;
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Markers for history turns replayed into a fresh upstream session.
#[derive(Debug, Default)]
struct SeedLedger {
    outstanding: HashSet<String>,
    consumed: HashSet<String>,
    pending: usize,
}

impl SeedLedger {
    /// Item ids are limited to 32 characters upstream.
    fn new_id() -> String {
        let hex = Uuid::new_v4().simple().to_string();
        format!("seed{}", &hex[..28])
    }

    fn mark(&mut self) -> String {
        let id = Self::new_id();
        self.outstanding.insert(id.clone());
        self.pending += 1;
        id
    }

    /// True when the item is the provider re-announcing a seeded turn.
    ///
    /// Each echo counts against `pending` at most once, even when the same item
    /// is announced as both created and updated.
    fn is_echo(&mut self, item: &UserItem) -> bool {
        if let Some(id) = item.id.as_deref() {
            if self.outstanding.remove(id) {
                self.consumed.insert(id.to_string());
                self.pending = self.pending.saturating_sub(1);
                return true;
            }
            if self.consumed.contains(id) {
                return true;
            }
        }
        if self.pending > 0 && item.has_text && !item.has_audio {
            self.pending -= 1;
            if let Some(id) = &item.id {
                self.consumed.insert(id.clone());
            }
            return true;
        }
        false
    }

    fn clear(&mut self) {
        self.outstanding.clear();
        self.consumed.clear();
        self.pending = 0;
    }
}

/// Milliseconds of assistant audio received, per generation.
#[derive(Debug, Default)]
struct PlaybackClock {
    generation_bytes: u64,
    high_water_ms: u64,
}

impl PlaybackClock {
    fn advance(&mut self, audio_base64: &str) {
        self.generation_bytes += base64::decoded_len_estimate(audio_base64.len()) as u64;
    }

    fn generation_ms(&self) -> u64 {
        self.generation_bytes / PCM_BYTES_PER_SAMPLE * 1000 / PCM_SAMPLE_RATE
    }

    fn finish_generation(&mut self) {
        self.high_water_ms = self.high_water_ms.max(self.generation_ms());
        self.generation_bytes = 0;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct Coordinator<U: UpstreamLink, D: Downstream> {
    session_id: String,
    settings: VoiceSettings,
    upstream: U,
    downstream: D,
    phase: SessionPhase,
    connection: Option<ConnectionId>,
    history: Vec<Turn>,
    tools: Vec<ToolDefinition>,
    queue: VecDeque<String>,
    dropped_frames: usize,
    buffer_has_audio: bool,
    responding: bool,
    awaiting_created: bool,
    cancel_pending: bool,
    deferred_response: bool,
    gate: OutputGate,
    transcripts: TranscriptAccumulator,
    tool_calls: ToolCallTracker,
    seeds: SeedLedger,
    playback: PlaybackClock,
}

impl<U: UpstreamLink, D: Downstream> Coordinator<U, D> {
    pub fn new(settings: VoiceSettings, upstream: U, downstream: D, history: Vec<Turn>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            settings,
            upstream,
            downstream,
            phase: SessionPhase::Idle,
            connection: None,
            history,
            tools: Vec::new(),
            queue: VecDeque::with_capacity(AUDIO_QUEUE_CAPACITY),
            dropped_frames: 0,
            buffer_has_audio: false,
            responding: false,
            awaiting_created: false,
            cancel_pending: false,
            deferred_response: false,
            gate: OutputGate::default(),
            transcripts: TranscriptAccumulator::new(),
            tool_calls: ToolCallTracker::new(),
            seeds: SeedLedger::default(),
            playback: PlaybackClock::default(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn into_history(self) -> Vec<Turn> {
        self.history
    }

    #[cfg(test)]
    pub(crate) fn history(&self) -> &[Turn] {
        &self.history
    }

    #[cfg(test)]
    pub(crate) fn upstream(&self) -> &U {
        &self.upstream
    }

    #[cfg(test)]
    pub(crate) fn downstream(&self) -> &D {
        &self.downstream
    }

    #[cfg(test)]
    fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    fn is_responding(&self) -> bool {
        self.responding
    }

    #[cfg(test)]
    fn pending_seeds(&self) -> usize {
        self.seeds.pending
    }

    #[cfg(test)]
    fn playback_high_water_ms(&self) -> u64 {
        self.playback.high_water_ms
    }

    /// Opens the upstream connection. Duplicate starts are ignored.
    pub fn start(&mut self, tools: Option<Vec<ToolDefinition>>) {
        if let Some(tools) = tools {
            self.tools = tools;
        }
        match self.phase {
            SessionPhase::Idle => {
                let connection = self.upstream.connect(self.settings.connect_request());
                self.connection = Some(connection);
                self.phase = SessionPhase::Connecting;
                info!(session_id = %self.session_id, connection, tools = self.tools.len(), "Voice session connecting");
            }
            SessionPhase::Connecting | SessionPhase::Active => {
                debug!(session_id = %self.session_id, "Duplicate voice start ignored");
            }
            SessionPhase::Closed => {
                warn!(session_id = %self.session_id, "Start on a closed voice session ignored");
            }
        }
    }

    /// Forwards one microphone chunk, or queues it while the connection comes up.
    pub fn submit_audio_frame(&mut self, audio: String) {
        match self.phase {
            SessionPhase::Active => {
                self.buffer_has_audio = true;
                self.send(UpstreamFrame::InputAudioBufferAppend { audio });
            }
            SessionPhase::Connecting => {
                self.buffer_has_audio = true;
                if self.queue.len() < AUDIO_QUEUE_CAPACITY {
                    self.queue.push_back(audio);
                } else {
                    self.dropped_frames += 1;
                    trace!(session_id = %self.session_id, dropped = self.dropped_frames, "Audio queue full, frame dropped");
                }
            }
            SessionPhase::Idle | SessionPhase::Closed => {
                debug!(session_id = %self.session_id, phase = ?self.phase, "Audio frame outside a session ignored");
            }
        }
    }

    /// Closes the session. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        if self.connection.is_some() {
            self.upstream.close();
        }
        info!(session_id = %self.session_id, "Voice session stopped");
        self.teardown();
    }

    /// Like [`stop`](Self::stop), but the provider is not told anything.
    pub fn on_client_disconnect(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        if self.connection.is_some() {
            self.upstream.abort();
        }
        info!(session_id = %self.session_id, "Voice session dropped with client");
        self.teardown();
    }

    pub fn submit_tool_results(&mut self, results: Vec<ToolResult>) {
        if self.phase != SessionPhase::Active {
            warn!(session_id = %self.session_id, phase = ?self.phase, "Tool results outside an active session ignored");
            return;
        }

        let mut forwarded = 0;
        for result in &results {
            let Some(call_id) = result.tool_call_id.as_deref().filter(|id| !id.is_empty()) else {
                warn!(session_id = %self.session_id, "Tool result without tool_call_id ignored");
                continue;
            };
            self.send(UpstreamFrame::ConversationItemCreate {
                item: ConversationItem::FunctionCallOutput {
                    call_id: call_id.to_string(),
                    output: output_for(result),
                },
            });
            forwarded += 1;
        }

        debug!(session_id = %self.session_id, forwarded, "Tool results forwarded");
        if forwarded > 0 && !self.responding {
            self.request_response();
        }
    }

    /// Entry point for everything the upstream connection reports.
    pub fn on_upstream(&mut self, connection: ConnectionId, signal: UpstreamSignal) {
        if self.connection != Some(connection) {
            trace!(session_id = %self.session_id, connection, "Signal from stale connection ignored");
            return;
        }

        match signal {
            UpstreamSignal::Ready => self.on_ready(),
            UpstreamSignal::Message(raw) => match events::parse(&raw) {
                Some(event) => self.on_upstream_event(event),
                None => trace!(session_id = %self.session_id, "Unhandled upstream frame"),
            },
            UpstreamSignal::Error(detail) => {
                warn!(session_id = %self.session_id, "Realtime connection error: {}", detail);
                self.downstream
                    .emit(ClientEvent::error_with_detail("OpenAI realtime connection failed.", detail));
            }
            UpstreamSignal::Closed(reason) => {
                info!(session_id = %self.session_id, reason = ?reason, "Realtime connection closed");
                self.upstream.abort();
                self.teardown();
            }
        }
    }

    pub fn on_upstream_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::SpeechStarted => self.on_speech_started(),
            UpstreamEvent::SpeechStopped => self.on_speech_stopped(),
            UpstreamEvent::ResponseCreated { response_id } => self.on_response_created(response_id),
            UpstreamEvent::FunctionCallAdded(item) => {
                if self.gate.admits(None) {
                    self.tool_calls.begin(&item);
                }
            }
            UpstreamEvent::FunctionCallArgumentsDelta { item_id, call_id, delta } => {
                if self.gate.admits(None)
                    && !self
                        .tool_calls
                        .append_arguments(item_id.as_deref(), call_id.as_deref(), &delta)
                {
                    debug!(session_id = %self.session_id, "Arguments for unknown tool call dropped");
                }
            }
            UpstreamEvent::FunctionCallDone(item) => self.on_function_call_done(item),
            UpstreamEvent::AudioDelta { response_id, audio } => {
                if audio.is_empty() || !self.gate.admits(response_id.as_deref()) {
                    return;
                }
                self.playback.advance(&audio);
                self.downstream.emit(ClientEvent::AssistantAudioDelta { audio });
            }
            UpstreamEvent::AudioDone { response_id } => {
                if !self.gate.admits(response_id.as_deref()) {
                    return;
                }
                self.playback.finish_generation();
                self.downstream.emit(ClientEvent::AssistantAudioDone);
            }
            UpstreamEvent::AssistantTextDelta { response_id, delta } => {
                if !self.gate.admits(response_id.as_deref()) {
                    return;
                }
                self.transcripts.push_assistant(&delta);
                self.downstream.emit(ClientEvent::AssistantVoiceTextDelta { delta });
            }
            UpstreamEvent::AssistantTextDone { response_id } => {
                if self.gate.admits(response_id.as_deref()) {
                    self.commit_assistant();
                }
            }
            UpstreamEvent::InputTranscriptionDelta { delta } => {
                self.transcripts.push_user_delta(&delta);
                self.downstream.emit(ClientEvent::UserVoiceTextDelta { delta });
            }
            UpstreamEvent::InputTranscriptionCompleted { transcript } => {
                let text = self.transcripts.resolve_user(transcript.as_deref());
                self.commit_user(&text);
                self.downstream.emit(ClientEvent::UserVoiceTextDone);
                self.transcripts.finish_user();
            }
            UpstreamEvent::UserItem(item) => self.on_user_item(item),
            UpstreamEvent::Error { message, code, detail } => {
                warn!(session_id = %self.session_id, code = %code, "Upstream error: {}", message);
                if code == CANCEL_NOT_ACTIVE {
                    self.on_cancel_not_active();
                }
                self.downstream
                    .emit(ClientEvent::AssistantVoiceError { message, code, detail });
            }
            UpstreamEvent::ResponseEnded { end, response_id } => self.on_response_ended(end, response_id),
        }
    }

    fn on_ready(&mut self) {
        if self.phase != SessionPhase::Connecting {
            return;
        }
        self.upstream.mark_ready();
        self.phase = SessionPhase::Active;

        let session = self.settings.session(&self.tools);
        self.send(UpstreamFrame::SessionUpdate { session });
        self.seed_history();

        let queued = self.queue.len();
        while let Some(audio) = self.queue.pop_front() {
            self.send(UpstreamFrame::InputAudioBufferAppend { audio });
        }
        info!(
            session_id = %self.session_id,
            queued,
            dropped = self.dropped_frames,
            seeded = self.seeds.pending,
            "Voice session active"
        );
    }

    /// Replays the non-system history so the provider has the context.
    fn seed_history(&mut self) {
        let mut frames = Vec::new();
        for turn in &self.history {
            if turn.role == Role::System || turn.content.is_empty() {
                continue;
            }
            let (id, part) = match turn.role {
                Role::User => (
                    self.seeds.mark(),
                    ContentPart::InputText {
                        text: turn.content.clone(),
                    },
                ),
                _ => (
                    SeedLedger::new_id(),
                    ContentPart::OutputText {
                        text: turn.content.clone(),
                    },
                ),
            };
            frames.push(UpstreamFrame::ConversationItemCreate {
                item: ConversationItem::Message {
                    id: Some(id),
                    role: turn.role,
                    content: vec![part],
                },
            });
        }
        for frame in frames {
            self.send(frame);
        }
    }

    fn on_speech_started(&mut self) {
        self.transcripts.reset_user();
        self.downstream.emit(ClientEvent::UserVoiceStart);

        if !self.responding {
            return;
        }
        debug!(session_id = %self.session_id, "Barge-in, cancelling response");
        self.send(UpstreamFrame::ResponseCancel);
        self.downstream.emit(ClientEvent::AssistantAudioInterrupt);
        self.transcripts.discard_assistant();
        self.tool_calls.clear();
        self.gate.interrupt(self.awaiting_created);
        self.responding = false;
        self.awaiting_created = false;
        self.cancel_pending = true;
    }

    fn on_speech_stopped(&mut self) {
        if !self.buffer_has_audio {
            trace!(session_id = %self.session_id, "Speech stop without buffered audio ignored");
            return;
        }
        self.send(UpstreamFrame::InputAudioBufferCommit);
        self.buffer_has_audio = false;
        if !self.responding {
            self.request_response();
        }
    }

    /// Asks for a generation, or defers it while a cancel is unacknowledged.
    fn request_response(&mut self) {
        if self.cancel_pending {
            self.deferred_response = true;
            return;
        }
        self.send(UpstreamFrame::response_create());
        self.responding = true;
        self.awaiting_created = true;
    }

    fn on_response_created(&mut self, response_id: Option<String>) {
        if !self.gate.open(response_id.clone()) {
            debug!(session_id = %self.session_id, response_id = ?response_id, "Cancelled response announced late");
            return;
        }
        self.responding = true;
        self.awaiting_created = false;
        self.cancel_pending = false;
        self.deferred_response = false;
        self.tool_calls.clear();
    }

    fn on_function_call_done(&mut self, item: FunctionCallItem) {
        if !self.gate.admits(None) {
            return;
        }
        let call = self.tool_calls.finalize(&item);
        info!(session_id = %self.session_id, tool = %call.function.name, call_id = %call.call_id, "Tool call requested");
        self.downstream.emit(ClientEvent::AssistantVoiceToolCalls { tool_calls: vec![call] });
    }

    fn on_response_ended(&mut self, end: ResponseEnd, response_id: Option<String>) {
        let stale = self.gate.is_cancelled(response_id.as_deref())
            || (response_id.is_none() && self.cancel_pending && !self.responding);
        self.gate.finish(response_id.as_deref());
        if stale {
            self.on_cancel_settled();
            return;
        }

        self.responding = false;
        self.awaiting_created = false;
        if end == ResponseEnd::Completed {
            self.commit_assistant();
        }
    }

    /// The cancel found nothing running, so a requested generation never started.
    fn on_cancel_not_active(&mut self) {
        self.gate.settle();
        if self.gate.current.is_none() {
            self.responding = false;
            self.awaiting_created = false;
        }
        self.on_cancel_settled();
    }

    /// The provider is done with the cancelled generation.
    fn on_cancel_settled(&mut self) {
        if !self.cancel_pending {
            return;
        }
        self.cancel_pending = false;
        if self.deferred_response {
            self.deferred_response = false;
            self.request_response();
        }
    }

    fn on_user_item(&mut self, item: UserItem) {
        if self.seeds.is_echo(&item) {
            trace!(session_id = %self.session_id, item_id = ?item.id, "Seeded turn echo suppressed");
            return;
        }
        let Some(text) = item.transcript().map(str::to_string) else {
            return;
        };
        if self.commit_user(&text) {
            self.downstream.emit(ClientEvent::UserVoiceTextDone);
            self.transcripts.finish_user();
        }
    }

    /// Returns whether a turn was committed.
    fn commit_user(&mut self, text: &str) -> bool {
        if !self.transcripts.accept_user(text) {
            return false;
        }
        if !self.transcripts.user_delta_forwarded() {
            self.downstream.emit(ClientEvent::UserVoiceTextDelta {
                delta: text.to_string(),
            });
        }
        self.append_turn(Turn::user(text));
        true
    }

    fn commit_assistant(&mut self) {
        let Some(text) = self.transcripts.take_assistant() else {
            return;
        };
        self.append_turn(Turn::assistant(text));
        self.downstream.emit(ClientEvent::AssistantVoiceTextDone);
    }

    fn append_turn(&mut self, turn: Turn) {
        self.downstream.persist(&turn);
        self.history.push(turn);
    }

    fn send(&mut self, frame: UpstreamFrame) {
        if !self.upstream.send(&frame) {
            debug!(session_id = %self.session_id, frame = frame.kind(), "Upstream not ready, frame dropped");
        }
    }

    fn teardown(&mut self) {
        self.phase = SessionPhase::Closed;
        self.connection = None;
        self.queue.clear();
        self.buffer_has_audio = false;
        self.responding = false;
        self.awaiting_created = false;
        self.cancel_pending = false;
        self.deferred_response = false;
        self.gate.reset();
        self.transcripts.clear();
        self.tool_calls.clear();
        self.seeds.clear();
        self.playback.reset();
    }
}
