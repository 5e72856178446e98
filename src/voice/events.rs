//! Upstream event normalization.
//!
//! The realtime provider renames events between API revisions (`response.audio.delta`
//! vs `response.output_audio.delta`) and is inconsistent about payload fields
//! (`delta` vs `text`, `id` vs `call_id`). Everything is folded into
//! [`UpstreamEvent`] here so the coordinator never looks at raw JSON.
//!
//! Frames that fail to parse, or that we have no use for, yield `None`.

use serde_json::Value;

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEnd {
    Completed,
    Done,
    Cancelled,
}

/// A function-call output item as announced by `response.output_item.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCallItem {
    pub item_id: String,
    pub call_id: String,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// A user message item from `conversation.item.created` / `conversation.item.updated`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserItem {
    pub id: Option<String>,
    pub has_text: bool,
    pub has_audio: bool,
    pub text: Option<String>,
    pub audio_transcript: Option<String>,
}

impl UserItem {
    /// Direct text wins over an audio transcript.
    pub fn transcript(&self) -> Option<&str> {
        self.text
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.audio_transcript.as_deref().filter(|t| !t.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    SpeechStarted,
    SpeechStopped,
    ResponseCreated {
        response_id: Option<String>,
    },
    FunctionCallAdded(FunctionCallItem),
    FunctionCallArgumentsDelta {
        item_id: Option<String>,
        call_id: Option<String>,
        delta: String,
    },
    FunctionCallDone(FunctionCallItem),
    AudioDelta {
        response_id: Option<String>,
        audio: String,
    },
    AudioDone {
        response_id: Option<String>,
    },
    AssistantTextDelta {
        response_id: Option<String>,
        delta: String,
    },
    AssistantTextDone {
        response_id: Option<String>,
    },
    InputTranscriptionDelta {
        delta: String,
    },
    InputTranscriptionCompleted {
        transcript: Option<String>,
    },
    UserItem(UserItem),
    Error {
        message: String,
        code: String,
        detail: Value,
    },
    ResponseEnded {
        end: ResponseEnd,
        response_id: Option<String>,
    },
}

/// First non-empty string among `keys`.
fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn response_id(payload: &Value) -> Option<String> {
    text_field(payload, &["response_id"])
        .or_else(|| payload.get("response").and_then(|r| text_field(r, &["id"])))
}

fn function_call_item(payload: &Value) -> Option<FunctionCallItem> {
    let item = payload.get("item")?;
    if item.get("type").and_then(Value::as_str) != Some("function_call") {
        return None;
    }
    let item_id = text_field(item, &["id", "call_id"])?;
    let call_id = text_field(item, &["call_id", "id"])?;
    Some(FunctionCallItem {
        item_id,
        call_id,
        name: text_field(item, &["name"]),
        arguments: item.get("arguments").and_then(Value::as_str).map(str::to_string),
    })
}

fn user_item(payload: &Value) -> Option<UserItem> {
    let item = payload.get("item")?;
    if item.get("role").and_then(Value::as_str) != Some("user") {
        return None;
    }
    let parts = item.get("content")?.as_array()?;
    let part_of = |kind: &str| {
        parts
            .iter()
            .find(|part| part.get("type").and_then(Value::as_str) == Some(kind))
    };
    let text_part = part_of("input_text");
    let audio_part = part_of("input_audio");
    Some(UserItem {
        id: text_field(item, &["id"]),
        has_text: text_part.is_some(),
        has_audio: audio_part.is_some(),
        text: text_part.and_then(|p| text_field(p, &["text"])),
        audio_transcript: audio_part.and_then(|p| text_field(p, &["transcript"])),
    })
}

fn error_event(payload: &Value) -> UpstreamEvent {
    let nested = payload.get("error").filter(|e| e.is_object());
    let message = nested
        .and_then(|e| text_field(e, &["message"]))
        .or_else(|| text_field(payload, &["message"]))
        .unwrap_or_else(|| "Voice error".to_string());
    let code = nested
        .and_then(|e| text_field(e, &["code"]))
        .or_else(|| text_field(payload, &["code"]))
        .unwrap_or_default();
    UpstreamEvent::Error {
        message,
        code,
        detail: nested.cloned().unwrap_or_else(|| payload.clone()),
    }
}

/// Parse one raw upstream text frame.
pub fn parse(raw: &str) -> Option<UpstreamEvent> {
    let payload: Value = serde_json::from_str(raw).ok()?;
    normalize(&payload)
}

pub fn normalize(payload: &Value) -> Option<UpstreamEvent> {
    let kind = payload.get("type")?.as_str()?;
    let event = match kind {
        "input_audio_buffer.speech_started" => UpstreamEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => UpstreamEvent::SpeechStopped,
        "response.created" => UpstreamEvent::ResponseCreated {
            response_id: response_id(payload),
        },
        "response.output_item.added" => UpstreamEvent::FunctionCallAdded(function_call_item(payload)?),
        "response.output_item.done" => UpstreamEvent::FunctionCallDone(function_call_item(payload)?),
        "response.function_call_arguments.delta" => UpstreamEvent::FunctionCallArgumentsDelta {
            item_id: text_field(payload, &["item_id"]),
            call_id: text_field(payload, &["call_id"]),
            delta: text_field(payload, &["delta"])?,
        },
        "response.audio.delta" | "response.output_audio.delta" => UpstreamEvent::AudioDelta {
            response_id: response_id(payload),
            audio: text_field(payload, &["delta", "audio"]).unwrap_or_default(),
        },
        "response.audio.done" | "response.output_audio.done" => UpstreamEvent::AudioDone {
            response_id: response_id(payload),
        },
        "response.text.delta"
        | "response.output_text.delta"
        | "response.audio_transcript.delta"
        | "response.output_audio_transcript.delta" => UpstreamEvent::AssistantTextDelta {
            response_id: response_id(payload),
            delta: text_field(payload, &["delta", "text"])?,
        },
        "response.text.done"
        | "response.output_text.done"
        | "response.audio_transcript.done"
        | "response.output_audio_transcript.done" => UpstreamEvent::AssistantTextDone {
            response_id: response_id(payload),
        },
        "conversation.item.input_audio_transcription.delta" | "input_audio_transcription.delta" => {
            UpstreamEvent::InputTranscriptionDelta {
                delta: text_field(payload, &["delta", "text"])?,
            }
        }
        "conversation.item.input_audio_transcription.completed" | "input_audio_transcription.completed" => {
            UpstreamEvent::InputTranscriptionCompleted {
                transcript: text_field(payload, &["transcript", "text"]),
            }
        }
        "conversation.item.created" | "conversation.item.updated" => UpstreamEvent::UserItem(user_item(payload)?),
        "error" => error_event(payload),
        "response.completed" => UpstreamEvent::ResponseEnded {
            end: ResponseEnd::Completed,
            response_id: response_id(payload),
        },
        "response.done" => UpstreamEvent::ResponseEnded {
            end: ResponseEnd::Done,
            response_id: response_id(payload),
        },
        "response.cancelled" => UpstreamEvent::ResponseEnded {
            end: ResponseEnd::Cancelled,
            response_id: response_id(payload),
        },
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_dropped() {
        assert_eq!(parse("{not json"), None);
        assert_eq!(parse(r#"{"no_type":true}"#), None);
        assert_eq!(parse(r#"{"type":"rate_limits.updated"}"#), None);
    }

    #[test]
    fn test_audio_delta_aliases() {
        let a = parse(r#"{"type":"response.audio.delta","response_id":"resp_1","delta":"AAA="}"#);
        let b = parse(r#"{"type":"response.output_audio.delta","response_id":"resp_1","audio":"AAA="}"#);
        let expected = Some(UpstreamEvent::AudioDelta {
            response_id: Some("resp_1".into()),
            audio: "AAA=".into(),
        });
        assert_eq!(a, expected);
        assert_eq!(b, expected);
    }

    #[test]
    fn test_text_delta_prefers_delta_and_drops_empty() {
        assert_eq!(
            parse(r#"{"type":"response.audio_transcript.delta","delta":"Hel","text":"x"}"#),
            Some(UpstreamEvent::AssistantTextDelta {
                response_id: None,
                delta: "Hel".into()
            })
        );
        assert_eq!(
            parse(r#"{"type":"response.output_text.delta","text":"lo"}"#),
            Some(UpstreamEvent::AssistantTextDelta {
                response_id: None,
                delta: "lo".into()
            })
        );
        assert_eq!(parse(r#"{"type":"response.text.delta","delta":""}"#), None);
    }

    #[test]
    fn test_function_call_item_ids_fall_back_to_each_other() {
        let event = parse(
            r#"{"type":"response.output_item.added","item":{"type":"function_call","call_id":"call_9","name":"lookup"}}"#,
        );
        assert_eq!(
            event,
            Some(UpstreamEvent::FunctionCallAdded(FunctionCallItem {
                item_id: "call_9".into(),
                call_id: "call_9".into(),
                name: Some("lookup".into()),
                arguments: None,
            }))
        );

        let message_item = parse(r#"{"type":"response.output_item.added","item":{"type":"message","id":"m1"}}"#);
        assert_eq!(message_item, None);
    }

    #[test]
    fn test_response_created_reads_nested_id() {
        assert_eq!(
            parse(r#"{"type":"response.created","response":{"id":"resp_7"}}"#),
            Some(UpstreamEvent::ResponseCreated {
                response_id: Some("resp_7".into())
            })
        );
    }

    #[test]
    fn test_user_item_content_parts() {
        let event = parse(
            r#"{"type":"conversation.item.updated","item":{"id":"item_1","role":"user","content":[{"type":"input_audio","transcript":"hello"}]}}"#,
        );
        let Some(UpstreamEvent::UserItem(item)) = event else {
            panic!("expected user item");
        };
        assert!(item.has_audio);
        assert!(!item.has_text);
        assert_eq!(item.transcript(), Some("hello"));

        let assistant = parse(
            r#"{"type":"conversation.item.created","item":{"role":"assistant","content":[{"type":"text","text":"hi"}]}}"#,
        );
        assert_eq!(assistant, None);
    }

    #[test]
    fn test_error_event_prefers_nested_error() {
        let event = parse(
            r#"{"type":"error","error":{"message":"Conversation already has an active response","code":"conversation_already_has_active_response"}}"#,
        )
        .unwrap();
        match event {
            UpstreamEvent::Error { message, code, detail } => {
                assert_eq!(message, "Conversation already has an active response");
                assert_eq!(code, "conversation_already_has_active_response");
                assert_eq!(detail["code"], "conversation_already_has_active_response");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let bare = parse(r#"{"type":"error"}"#).unwrap();
        assert!(matches!(bare, UpstreamEvent::Error { ref message, ref code, .. } if message == "Voice error" && code.is_empty()));
    }

    #[test]
    fn test_transcription_completed_falls_back_to_text() {
        assert_eq!(
            parse(r#"{"type":"input_audio_transcription.completed","text":"hello"}"#),
            Some(UpstreamEvent::InputTranscriptionCompleted {
                transcript: Some("hello".into())
            })
        );
        assert_eq!(
            parse(r#"{"type":"conversation.item.input_audio_transcription.completed"}"#),
            Some(UpstreamEvent::InputTranscriptionCompleted { transcript: None })
        );
    }
}
