//! # Voice Wire Protocol
//!
//! Message shapes on both sides of the relay:
//! - [`ClientCommand`]: JSON the browser sends over `/ws`
//! - [`ClientEvent`]: JSON the server sends back to the browser
//! - [`UpstreamFrame`]: JSON the server sends to the realtime provider
//!
//! Provider-to-server events are not modelled here; they are normalized in
//! `voice::events` because the provider is inconsistent about field names.
//!
//! Audio is 16-bit signed PCM, mono, 24 kHz, base64-encoded in both directions
//! and passed through untouched.

use crate::store::Role;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Modalities requested for every generation and session.
pub const MODALITIES: [&str; 2] = ["audio", "text"];

/// Commands the browser sends over the voice WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    /// Open the upstream session, optionally declaring tools the browser can run
    #[serde(rename = "audio_start")]
    AudioStart {
        #[serde(default)]
        tools: Option<Vec<ToolDefinition>>,
    },

    /// One base64 PCM16 microphone chunk
    #[serde(rename = "audio_chunk")]
    AudioChunk { audio: String },

    #[serde(rename = "audio_stop")]
    AudioStop {},

    /// Results for tool calls previously announced with `assistant_voice_tool_calls`
    #[serde(rename = "voice_tool_results")]
    VoiceToolResults {
        #[serde(default)]
        results: Vec<ToolResult>,
    },

    /// Forget the current history and start over
    #[serde(rename = "conversation_new")]
    ConversationNew {},

    /// Resume a stored conversation
    #[serde(rename = "conversation_select")]
    ConversationSelect {
        #[serde(rename = "conversationId", default)]
        conversation_id: String,
    },
}

/// A tool the browser is able to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "parametersSchema", alias = "inputSchema")]
    pub parameters: Option<Value>,
}

impl ToolDefinition {
    /// Function-tool shape expected inside `session.update`.
    pub fn to_upstream(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description.clone().unwrap_or_default(),
            "parameters": self
                .parameters
                .clone()
                .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
        })
    }
}

/// One tool result from the browser.
///
/// The output is taken from `content`, falling back to `result`. A result that
/// reports `error` is turned into a structured failure payload instead.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    /// A failure code string, or any other truthy value for a generic failure
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub message: Option<Value>,
}

/// A finalized tool call as shown to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub call_id: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub arguments: String,
}

/// Events the server pushes to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    UserVoiceStart,
    UserVoiceTextDelta {
        delta: String,
    },
    UserVoiceTextDone,
    AssistantVoiceTextDelta {
        delta: String,
    },
    AssistantVoiceTextDone,
    AssistantAudioDelta {
        audio: String,
    },
    AssistantAudioDone,
    AssistantAudioInterrupt,
    AssistantVoiceToolCalls {
        #[serde(rename = "toolCalls")]
        tool_calls: Vec<ToolCall>,
    },
    AssistantVoiceError {
        message: String,
        code: String,
        detail: Value,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ConversationStarted {
        conversation: crate::store::Conversation,
    },
    ConversationsUpdated,
}

impl ClientEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ClientEvent::Error {
            message: message.into(),
            detail: None,
        }
    }

    pub fn error_with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        ClientEvent::Error {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::UserVoiceStart => "user_voice_start",
            ClientEvent::UserVoiceTextDelta { .. } => "user_voice_text_delta",
            ClientEvent::UserVoiceTextDone => "user_voice_text_done",
            ClientEvent::AssistantVoiceTextDelta { .. } => "assistant_voice_text_delta",
            ClientEvent::AssistantVoiceTextDone => "assistant_voice_text_done",
            ClientEvent::AssistantAudioDelta { .. } => "assistant_audio_delta",
            ClientEvent::AssistantAudioDone => "assistant_audio_done",
            ClientEvent::AssistantAudioInterrupt => "assistant_audio_interrupt",
            ClientEvent::AssistantVoiceToolCalls { .. } => "assistant_voice_tool_calls",
            ClientEvent::AssistantVoiceError { .. } => "assistant_voice_error",
            ClientEvent::Error { .. } => "error",
            ClientEvent::ConversationStarted { .. } => "conversation_started",
            ClientEvent::ConversationsUpdated => "conversations_updated",
        }
    }
}

/// Frames sent to the realtime provider. This is a fixed wire contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum UpstreamFrame {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseOptions },

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl UpstreamFrame {
    pub fn response_create() -> Self {
        UpstreamFrame::ResponseCreate {
            response: ResponseOptions {
                modalities: MODALITIES.iter().map(|m| m.to_string()).collect(),
            },
        }
    }

    /// Wire `type` value, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamFrame::SessionUpdate { .. } => "session.update",
            UpstreamFrame::ConversationItemCreate { .. } => "conversation.item.create",
            UpstreamFrame::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            UpstreamFrame::InputAudioBufferCommit => "input_audio_buffer.commit",
            UpstreamFrame::ResponseCreate { .. } => "response.create",
            UpstreamFrame::ResponseCancel => "response.cancel",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseOptions {
    pub modalities: Vec<String>,
}

/// Body of `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    pub turn_detection: TurnDetection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        role: Role,
        content: Vec<ContentPart>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    OutputText { text: String },
}
