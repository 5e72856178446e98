//! # Voice Session Slot
//!
//! A browser connection outlives its voice sessions: the user can stop, start
//! again, switch conversations, and the provider may hang up in between.
//! [`VoiceSession`] keeps the conversation history across all of that. The
//! history sits inside the live [`Coordinator`] while there is one and is taken
//! back when the coordinator is replaced or stopped.
//!
//! Coordinators are built lazily through a caller-supplied closure, so the slot
//! knows nothing about sockets or actors.

use super::coordinator::{Coordinator, Downstream, SessionPhase};
use super::protocol::{ToolDefinition, ToolResult};
use super::upstream::{ConnectionId, UpstreamLink, UpstreamSignal};
use crate::store::Turn;

pub struct VoiceSession<U: UpstreamLink, D: Downstream> {
    coordinator: Option<Coordinator<U, D>>,
    history: Vec<Turn>,
}

impl<U: UpstreamLink, D: Downstream> VoiceSession<U, D> {
    pub fn new(history: Vec<Turn>) -> Self {
        Self {
            coordinator: None,
            history,
        }
    }

    /// The live coordinator, or a fresh one carrying the history over.
    fn live(&mut self, build: impl FnOnce(Vec<Turn>) -> Coordinator<U, D>) -> &mut Coordinator<U, D> {
        let coordinator = match self.coordinator.take() {
            Some(coordinator) if coordinator.phase() != SessionPhase::Closed => coordinator,
            previous => {
                if let Some(closed) = previous {
                    self.history = closed.into_history();
                }
                build(std::mem::take(&mut self.history))
            }
        };
        self.coordinator.insert(coordinator)
    }

    /// Returns true when this call opened a new upstream connection.
    pub fn start(
        &mut self,
        tools: Option<Vec<ToolDefinition>>,
        build: impl FnOnce(Vec<Turn>) -> Coordinator<U, D>,
    ) -> bool {
        let coordinator = self.live(build);
        let was_idle = coordinator.phase() == SessionPhase::Idle;
        coordinator.start(tools);
        was_idle && coordinator.phase() == SessionPhase::Connecting
    }

    /// Submits one microphone chunk, starting the session first when it is idle.
    ///
    /// Returns true when the chunk opened a new upstream connection.
    pub fn submit_audio(&mut self, audio: String, build: impl FnOnce(Vec<Turn>) -> Coordinator<U, D>) -> bool {
        let coordinator = self.live(build);
        let opened = coordinator.phase() == SessionPhase::Idle && {
            coordinator.start(None);
            coordinator.phase() == SessionPhase::Connecting
        };
        coordinator.submit_audio_frame(audio);
        opened
    }

    pub fn stop(&mut self) {
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.stop();
        }
    }

    /// Returns false when there is no session to take the results.
    pub fn submit_tool_results(&mut self, results: Vec<ToolResult>) -> bool {
        match self.coordinator.as_mut() {
            Some(coordinator) => {
                coordinator.submit_tool_results(results);
                true
            }
            None => false,
        }
    }

    /// Returns false when no coordinator exists to receive the signal.
    pub fn on_upstream(&mut self, connection: ConnectionId, signal: UpstreamSignal) -> bool {
        match self.coordinator.as_mut() {
            Some(coordinator) => {
                coordinator.on_upstream(connection, signal);
                true
            }
            None => false,
        }
    }

    pub fn on_client_disconnect(&mut self) {
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.on_client_disconnect();
        }
    }

    /// Stops any session and replaces the history.
    ///
    /// Returns true when a running session had to be stopped.
    pub fn replace_history(&mut self, history: Vec<Turn>) -> bool {
        let stopped = match self.coordinator.take() {
            Some(mut coordinator) => {
                let running = coordinator.phase() != SessionPhase::Closed;
                coordinator.stop();
                running
            }
            None => false,
        };
        self.history = history;
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::coordinator::VoiceSettings;
    use crate::voice::testing::{FakeLink, Recorder};
    use serde_json::json;

    type TestSession = VoiceSession<FakeLink, Recorder>;

    fn settings() -> VoiceSettings {
        VoiceSettings {
            url: "wss://realtime.test/v1/realtime?model=gpt-realtime".to_string(),
            api_key: "sk-test".to_string(),
            instructions: "Be brief.".to_string(),
            voice: "alloy".to_string(),
            transcription_model: "gpt-4o-mini-transcribe".to_string(),
            transcription_language: "en".to_string(),
        }
    }

    fn build(history: Vec<Turn>) -> Coordinator<FakeLink, Recorder> {
        Coordinator::new(settings(), FakeLink::default(), Recorder::default(), history)
    }

    fn live(session: &TestSession) -> &Coordinator<FakeLink, Recorder> {
        session.coordinator.as_ref().unwrap()
    }

    /// FakeLink numbers its connections from 1, per link.
    fn ready(session: &mut TestSession) {
        let connection = live(session).upstream().next_id;
        session.on_upstream(connection, UpstreamSignal::Ready);
    }

    fn message(session: &mut TestSession, payload: serde_json::Value) {
        let connection = live(session).upstream().next_id;
        session.on_upstream(connection, UpstreamSignal::Message(payload.to_string()));
    }

    fn seeded_texts(session: &TestSession) -> Vec<String> {
        live(session)
            .upstream()
            .sent
            .iter()
            .filter(|f| f["type"] == "conversation.item.create")
            .filter_map(|f| f["item"]["content"][0]["text"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_audio_chunk_starts_idle_session() {
        let mut session = TestSession::new(vec![Turn::system("Be brief.")]);
        assert!(session.submit_audio("chunk-1".to_string(), build));
        assert!(!session.submit_audio("chunk-2".to_string(), build));
        assert_eq!(live(&session).phase(), SessionPhase::Connecting);
        assert_eq!(live(&session).upstream().requests.len(), 1);

        ready(&mut session);
        let appended: Vec<&str> = live(&session)
            .upstream()
            .sent
            .iter()
            .filter_map(|f| f["audio"].as_str())
            .collect();
        assert_eq!(appended, vec!["chunk-1", "chunk-2"]);
    }

    #[test]
    fn test_one_connect_per_start() {
        let mut session = TestSession::new(Vec::new());
        assert!(session.start(None, build));
        assert!(!session.start(None, build));
        assert_eq!(live(&session).upstream().requests.len(), 1);
    }

    #[test]
    fn test_history_survives_restart() {
        let mut session = TestSession::new(vec![Turn::system("Be brief."), Turn::user("kept")]);
        session.start(None, build);
        ready(&mut session);
        message(
            &mut session,
            json!({ "type": "conversation.item.input_audio_transcription.completed", "transcript": "hello" }),
        );
        session.stop();
        assert_eq!(live(&session).phase(), SessionPhase::Closed);

        assert!(session.start(None, build));
        assert_eq!(live(&session).upstream().requests.len(), 1);
        assert_eq!(
            live(&session).history(),
            &[Turn::system("Be brief."), Turn::user("kept"), Turn::user("hello")]
        );

        ready(&mut session);
        assert_eq!(seeded_texts(&session), vec!["kept", "hello"]);
    }

    #[test]
    fn test_upstream_close_then_restart_keeps_history() {
        let mut session = TestSession::new(vec![Turn::user("kept")]);
        session.start(None, build);
        let connection = live(&session).upstream().next_id;
        session.on_upstream(connection, UpstreamSignal::Closed(None));
        assert_eq!(live(&session).phase(), SessionPhase::Closed);

        assert!(session.submit_audio("chunk".to_string(), build));
        assert_eq!(live(&session).history(), &[Turn::user("kept")]);
    }

    #[test]
    fn test_replace_history_stops_running_session() {
        let mut session = TestSession::new(vec![Turn::user("old")]);
        assert!(!session.replace_history(vec![Turn::user("older")]));

        session.start(None, build);
        ready(&mut session);
        assert!(session.replace_history(vec![Turn::user("fresh")]));
        assert!(session.coordinator.is_none());
        assert!(!session.submit_tool_results(Vec::new()));

        session.start(None, build);
        ready(&mut session);
        assert_eq!(seeded_texts(&session), vec!["fresh"]);
    }

    #[test]
    fn test_signals_without_session_are_dropped() {
        let mut session = TestSession::new(Vec::new());
        assert!(!session.on_upstream(1, UpstreamSignal::Ready));
        session.stop();
        session.on_client_disconnect();
        assert!(session.coordinator.is_none());
    }
}
