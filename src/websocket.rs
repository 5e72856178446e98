//! # Voice WebSocket Gateway
//!
//! Browsers connect to `/ws` and exchange JSON messages with the voice relay.
//! Each connection is one [`VoiceWebSocket`] actor, and that actor is the single
//! owner of the connection's voice [`Coordinator`]. Browser frames, upstream
//! socket notices and the coordinator's own output all arrive through the
//! actor's mailbox, so the coordinator only ever runs one handler at a time.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: rejected with 503 when `max_concurrent_sessions` is reached
//! 2. **Voice**: `audio_start`, `audio_chunk`, `audio_stop`, `voice_tool_results`
//! 3. **Conversations**: `conversation_new`, `conversation_select`
//! 4. **Errors**: bad payloads get an `error` event; the socket stays open
//! 5. **Heartbeat**: server pings, clients that stay silent past the timeout are dropped
//!
//! ## Message Format:
//! - **Client → Server**: [`ClientCommand`] JSON text frames
//! - **Server → Client**: [`ClientEvent`] JSON text frames

use crate::config::AppConfig;
use crate::error::AppError;
use crate::prompt;
use crate::state::AppState;
use crate::store::{Role, StoredMessage, Turn};
use crate::voice::{
    ClientCommand, ClientEvent, Coordinator, Downstream, RealtimeClient, UpstreamNotice, VoiceSession,
    VoiceSettings,
};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const UNTITLED_CONVERSATION: &str = "Untitled Conversation";

type VoiceCoordinator = Coordinator<RealtimeClient, GatewayOutput>;

/// Coordinator output, delivered back through the actor's mailbox.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(ClientEvent);

/// A committed turn to write to the conversation store.
#[derive(Message)]
#[rtype(result = "()")]
struct PersistTurn(Turn);

/// [`Downstream`] handed to the coordinator.
pub struct GatewayOutput {
    addr: Addr<VoiceWebSocket>,
}

impl Downstream for GatewayOutput {
    fn emit(&mut self, event: ClientEvent) {
        self.addr.do_send(Outbound(event));
    }

    fn persist(&mut self, turn: &Turn) {
        self.addr.do_send(PersistTurn(turn.clone()));
    }
}

/// One browser connection.
pub struct VoiceWebSocket {
    client_id: Uuid,
    state: AppState,
    voice: VoiceSession<RealtimeClient, GatewayOutput>,
    conversation_id: Option<String>,

    /// System prompt of the current conversation, date stamp included
    system_prompt: String,

    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(state: AppState) -> Self {
        let system_prompt = prompt::with_current_time(&state.system_prompt);
        Self {
            client_id: Uuid::new_v4(),
            voice: VoiceSession::new(vec![Turn::system(system_prompt.clone())]),
            state,
            conversation_id: None,
            system_prompt,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: ClientEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(client_id = %self.client_id, "Failed to serialize {}: {}", event.kind(), err),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match parse_command(text) {
            Ok(command) => self.handle_command(command, ctx),
            Err(event) => self.send_event(ctx, event),
        }
    }

    fn handle_command(&mut self, command: ClientCommand, ctx: &mut ws::WebsocketContext<Self>) {
        let addr = ctx.address();
        let state = &self.state;
        let system_prompt = &self.system_prompt;
        let build = |history| build_coordinator(state, system_prompt, addr, history);

        match command {
            ClientCommand::AudioStart { tools } => {
                if self.voice.start(tools, build) {
                    self.state.record_voice_session_started();
                }
            }
            ClientCommand::AudioChunk { audio } => {
                if self.voice.submit_audio(audio, build) {
                    self.state.record_voice_session_started();
                }
            }
            ClientCommand::AudioStop {} => self.voice.stop(),
            ClientCommand::VoiceToolResults { results } => {
                if !self.voice.submit_tool_results(results) {
                    warn!(client_id = %self.client_id, "Tool results without a voice session ignored");
                }
            }
            ClientCommand::ConversationNew {} => self.new_conversation(),
            ClientCommand::ConversationSelect { conversation_id } => self.select_conversation(conversation_id, ctx),
        }
    }

    fn new_conversation(&mut self) {
        self.system_prompt = prompt::with_current_time(&self.state.system_prompt);
        let stopped = self.voice.replace_history(vec![Turn::system(self.system_prompt.clone())]);
        self.conversation_id = None;
        info!(client_id = %self.client_id, voice_stopped = stopped, "New conversation");
    }

    fn select_conversation(&mut self, conversation_id: String, ctx: &mut ws::WebsocketContext<Self>) {
        let loaded = self.state.store.get_conversation(&conversation_id).and_then(|conversation| {
            match conversation {
                Some(conversation) => Ok(Some((conversation, self.state.store.list_messages(&conversation_id)?))),
                None => Ok(None),
            }
        });

        match loaded {
            Ok(Some((conversation, messages))) => {
                let (history, system_prompt) =
                    resume_history(&messages, &self.state.system_prompt, prompt::current_time_message());
                let turns = history.len();
                let stopped = self.voice.replace_history(history);
                info!(
                    client_id = %self.client_id,
                    conversation_id = %conversation.id,
                    turns,
                    voice_stopped = stopped,
                    "Conversation resumed"
                );
                self.system_prompt = system_prompt;
                self.conversation_id = Some(conversation.id);
            }
            Ok(None) => self.send_event(ctx, ClientEvent::error("Conversation not found.")),
            Err(err) => {
                warn!(client_id = %self.client_id, "Failed to load conversation: {}", err);
                self.send_event(ctx, ClientEvent::error_with_detail("Failed to load conversation.", err.message()));
            }
        }
    }

    /// Appends a committed turn, creating the stored conversation on first use.
    fn persist(&mut self, turn: &Turn, ctx: &mut ws::WebsocketContext<Self>) {
        if turn.content.is_empty() {
            return;
        }

        let conversation_id = match &self.conversation_id {
            Some(id) => id.clone(),
            None => match self.start_conversation(ctx) {
                Some(id) => id,
                None => return,
            },
        };

        if let Err(err) = self.state.store.add_message(&conversation_id, turn.role, &turn.content) {
            warn!(client_id = %self.client_id, conversation_id = %conversation_id, "Failed to save turn: {}", err);
            self.send_event(
                ctx,
                ClientEvent::error_with_detail("Failed to save conversation history.", err.message()),
            );
        }
    }

    fn start_conversation(&mut self, ctx: &mut ws::WebsocketContext<Self>) -> Option<String> {
        let store = self.state.store.clone();
        let created = store.create_conversation(UNTITLED_CONVERSATION).and_then(|conversation| {
            store.add_message(&conversation.id, Role::System, &self.system_prompt)?;
            Ok(conversation)
        });

        match created {
            Ok(conversation) => {
                info!(client_id = %self.client_id, conversation_id = %conversation.id, "Conversation started");
                let id = conversation.id.clone();
                self.conversation_id = Some(id.clone());
                self.send_event(ctx, ClientEvent::ConversationStarted { conversation });
                self.send_event(ctx, ClientEvent::ConversationsUpdated);
                Some(id)
            }
            Err(err) => {
                warn!(client_id = %self.client_id, "Failed to start conversation: {}", err);
                self.send_event(
                    ctx,
                    ClientEvent::error_with_detail("Failed to start conversation storage.", err.message()),
                );
                None
            }
        }
    }
}

fn build_coordinator(
    state: &AppState,
    system_prompt: &str,
    addr: Addr<VoiceWebSocket>,
    history: Vec<Turn>,
) -> VoiceCoordinator {
    let config = state.get_config();
    let instructions = prompt::voice_instructions(system_prompt, &config.realtime.voice_style);
    let settings = VoiceSettings::from_config(&config, instructions);
    let upstream = RealtimeClient::new(addr.clone().recipient());
    Coordinator::new(settings, upstream, GatewayOutput { addr }, history)
}

/// Parses one client frame, or returns the `error` event to answer it with.
fn parse_command(text: &str) -> Result<ClientCommand, ClientEvent> {
    let value: Value = serde_json::from_str(text).map_err(|_| ClientEvent::error("Invalid JSON."))?;
    let command: ClientCommand = serde_json::from_value(value).map_err(|err| {
        debug!("Rejected client payload: {}", err);
        ClientEvent::error("Invalid message payload.")
    })?;

    match &command {
        ClientCommand::AudioChunk { audio } if audio.is_empty() => Err(ClientEvent::error("Invalid message payload.")),
        ClientCommand::ConversationSelect { conversation_id } if conversation_id.trim().is_empty() => {
            Err(ClientEvent::error("Invalid conversation selection."))
        }
        _ => Ok(command),
    }
}

/// History and system prompt for a resumed conversation.
///
/// Stored turns are replayed as-is. The default prompt is prepended when the
/// conversation has no system turn, and a fresh date/time system turn is
/// appended. The prompt is the first system turn followed by that date/time line.
fn resume_history(messages: &[StoredMessage], default_prompt: &str, time_message: String) -> (Vec<Turn>, String) {
    let mut history: Vec<Turn> = messages.iter().map(Turn::from).collect();
    if !history.iter().any(|turn| turn.role == Role::System) {
        history.insert(0, Turn::system(default_prompt));
    }
    history.push(Turn::system(time_message.clone()));

    let base = history
        .iter()
        .find(|turn| turn.role == Role::System)
        .map(|turn| turn.content.as_str())
        .unwrap_or(default_prompt);
    let system_prompt = format!("{}\n\n{}", base, time_message);
    (history, system_prompt)
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "Voice WebSocket connection started");

        let performance = self.state.get_config().performance;
        let client_timeout = Duration::from_secs(performance.client_timeout_secs);
        ctx.run_interval(Duration::from_secs(performance.heartbeat_interval_secs), move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(client_id = %act.client_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.voice.on_client_disconnect();
        self.state.close_session();
        info!(client_id = %self.client_id, "Voice WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                match std::str::from_utf8(&data) {
                    Ok(text) => self.handle_text(text, ctx),
                    Err(_) => self.send_event(ctx, ClientEvent::error("Invalid JSON.")),
                }
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client_id = %self.client_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        if matches!(msg.0, ClientEvent::AssistantVoiceError { .. }) {
            self.state.record_upstream_error();
        }
        self.send_event(ctx, msg.0);
    }
}

impl Handler<PersistTurn> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: PersistTurn, ctx: &mut Self::Context) {
        self.persist(&msg.0, ctx);
    }
}

impl Handler<UpstreamNotice> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamNotice, _ctx: &mut Self::Context) {
        let connection = msg.connection;
        if !self.voice.on_upstream(connection, msg.signal) {
            trace!(client_id = %self.client_id, connection, "Upstream notice without a session");
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// A session slot is reserved before the upgrade and released when the actor
/// stops (or right away if the handshake fails).
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config: AppConfig = app_state.get_config();
    let limit = config.performance.max_concurrent_sessions;

    if !app_state.try_open_session(limit) {
        warn!(limit, "Voice session limit reached, rejecting connection");
        return Err(AppError::Unavailable(format!("Voice session limit of {} reached", limit)).into());
    }

    info!("New voice WebSocket connection from: {:?}", req.connection_info().peer_addr());

    let actor = VoiceWebSocket::new(app_state.get_ref().clone());
    let response = ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(config.performance.max_frame_bytes)
        .start();

    if response.is_err() {
        app_state.close_session();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test as actix_test;
    use actix_web::App;
    use chrono::Utc;

    fn stored(role: Role, content: &str) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: "c1".to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_command_errors() {
        assert_eq!(parse_command("{oops").unwrap_err(), ClientEvent::error("Invalid JSON."));
        assert_eq!(
            parse_command(r#"{"type":"audio_chunk"}"#).unwrap_err(),
            ClientEvent::error("Invalid message payload.")
        );
        assert_eq!(
            parse_command(r#"{"type":"audio_chunk","audio":""}"#).unwrap_err(),
            ClientEvent::error("Invalid message payload.")
        );
        assert_eq!(
            parse_command(r#"{"type":"dance"}"#).unwrap_err(),
            ClientEvent::error("Invalid message payload.")
        );
        assert_eq!(
            parse_command(r#"{"type":"conversation_select"}"#).unwrap_err(),
            ClientEvent::error("Invalid conversation selection.")
        );
        assert!(matches!(
            parse_command(r#"{"type":"audio_start"}"#),
            Ok(ClientCommand::AudioStart { tools: None })
        ));
    }

    #[test]
    fn test_resume_history_keeps_stored_system_prompt() {
        let messages = vec![
            stored(Role::System, "Speak like a pirate."),
            stored(Role::User, "hello"),
            stored(Role::Assistant, "ahoy"),
        ];
        let (history, system_prompt) =
            resume_history(&messages, "Be brief.", "The current date and time is now.".to_string());

        assert_eq!(
            history,
            vec![
                Turn::system("Speak like a pirate."),
                Turn::user("hello"),
                Turn::assistant("ahoy"),
                Turn::system("The current date and time is now."),
            ]
        );
        assert_eq!(system_prompt, "Speak like a pirate.\n\nThe current date and time is now.");
    }

    #[test]
    fn test_resume_history_prepends_default_prompt() {
        let messages = vec![stored(Role::User, "hello")];
        let (history, system_prompt) = resume_history(&messages, "Be brief.", "Now.".to_string());
        assert_eq!(history.first(), Some(&Turn::system("Be brief.")));
        assert_eq!(history.len(), 3);
        assert_eq!(system_prompt, "Be brief.\n\nNow.");
    }

    #[actix_web::test]
    async fn test_upgrade_rejected_at_session_limit() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = AppState::new(config, "Be brief.");
        assert!(state.try_open_session(1));

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
    }

    #[actix_web::test]
    async fn test_failed_handshake_releases_slot() {
        let state = AppState::new(AppConfig::default(), "Be brief.");
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(voice_websocket)),
        )
        .await;

        // Plain GET without upgrade headers
        let req = actix_test::TestRequest::get().uri("/ws").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }
}
