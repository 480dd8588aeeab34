//! Cloud session wire vocabulary
//!
//! The speech agent speaks newline-free JSON text messages, each tagged by a
//! `type` string, with binary audio base64-encoded inline. Outbound builders
//! return [`serde_json::Value`]; inbound text is parsed by [`parse_event`]
//! into the subset of server events the bridge reacts to, with everything
//! else preserved as [`ServerEvent::Unhandled`] for trace logging.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::{Value, json};

use super::{SessionConfig, TurnDetection};
use crate::{Error, Result};

/// Server events the agent reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// `session.created` / `session.updated`
    SessionReady,
    /// Server VAD heard the user start speaking
    SpeechStarted,
    /// Server VAD decided the user stopped speaking
    SpeechStopped,
    /// The input audio buffer was committed into the conversation
    Committed,
    /// Server-side transcription of the user's turn finished
    InputTranscript { transcript: String },
    /// A response began streaming
    ResponseCreated,
    /// A tool invocation started; id and name arrive here
    ToolCallAdded { call_id: String, name: String },
    /// A piece of streamed tool-call arguments
    ToolArgsDelta { call_id: String, delta: String },
    /// Tool-call arguments are complete
    ToolArgsDone {
        call_id: String,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// One chunk of response audio, already base64-decoded
    AudioDelta(Bytes),
    /// Response audio finished streaming
    AudioDone,
    /// A piece of the spoken-response transcript
    TranscriptDelta { delta: String },
    /// The spoken-response transcript is complete
    TranscriptDone { transcript: String },
    /// The whole response finished; `tool_continuation` is set when its
    /// output contained a tool call and a follow-up response is expected
    ResponseDone { tool_continuation: bool },
    /// The server reported an error
    ServerError { code: String, message: String },
    /// Anything the bridge does not model
    Unhandled { kind: String },
}

/// Parse one inbound text message.
///
/// # Errors
///
/// Returns [`Error::Serialization`] when the text is not JSON and
/// [`Error::Realtime`] when an audio delta fails to base64-decode. Unknown
/// event types are not errors.
pub fn parse_event(text: &str) -> Result<ServerEvent> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let event = match kind.as_str() {
        "session.created" | "session.updated" => ServerEvent::SessionReady,
        "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => ServerEvent::SpeechStopped,
        "input_audio_buffer.committed" => ServerEvent::Committed,
        "conversation.item.input_audio_transcription.completed" => ServerEvent::InputTranscript {
            transcript: str_field(&value, "transcript"),
        },
        "response.created" => ServerEvent::ResponseCreated,
        "response.output_item.added" => {
            let item = value.get("item");
            if item.and_then(|i| i.get("type")).and_then(Value::as_str) == Some("function_call") {
                ServerEvent::ToolCallAdded {
                    call_id: item
                        .and_then(|i| i.get("call_id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: item
                        .and_then(|i| i.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }
            } else {
                ServerEvent::Unhandled { kind }
            }
        }
        "response.function_call_arguments.delta" => ServerEvent::ToolArgsDelta {
            call_id: str_field(&value, "call_id"),
            delta: str_field(&value, "delta"),
        },
        "response.function_call_arguments.done" => ServerEvent::ToolArgsDone {
            call_id: str_field(&value, "call_id"),
            name: opt_str_field(&value, "name"),
            arguments: opt_str_field(&value, "arguments"),
        },
        "response.audio.delta" => {
            let encoded = value.get("delta").and_then(Value::as_str).unwrap_or_default();
            let decoded = BASE64
                .decode(encoded)
                .map_err(|e| Error::Realtime(format!("undecodable audio delta: {e}")))?;
            ServerEvent::AudioDelta(Bytes::from(decoded))
        }
        "response.audio.done" => ServerEvent::AudioDone,
        "response.audio_transcript.delta" => ServerEvent::TranscriptDelta {
            delta: str_field(&value, "delta"),
        },
        "response.audio_transcript.done" => ServerEvent::TranscriptDone {
            transcript: str_field(&value, "transcript"),
        },
        "response.done" => {
            let tool_continuation = value
                .pointer("/response/output")
                .and_then(Value::as_array)
                .is_some_and(|items| {
                    items.iter().any(|item| {
                        item.get("type").and_then(Value::as_str) == Some("function_call")
                    })
                });
            ServerEvent::ResponseDone { tool_continuation }
        }
        "error" => {
            let error = value.get("error");
            ServerEvent::ServerError {
                code: error
                    .and_then(|e| e.get("code"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                message: error
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }
        }
        _ => ServerEvent::Unhandled { kind },
    };
    Ok(event)
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(ToString::to_string)
}

/// Session-configuration message, sent immediately after the socket opens.
#[must_use]
pub fn session_update(config: &SessionConfig, tools: &[Value]) -> Value {
    let turn_detection = match config.turn_detection {
        TurnDetection::ServerVad => json!({ "type": "server_vad" }),
        TurnDetection::Disabled => Value::Null,
    };
    let transcription = config.language.as_ref().map_or_else(
        || json!({ "model": "whisper-1" }),
        |language| json!({ "model": "whisper-1", "language": language }),
    );
    json!({
        "type": "session.update",
        "session": {
            "model": config.model,
            "instructions": config.instructions,
            "voice": config.voice,
            "modalities": ["audio", "text"],
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": transcription,
            "turn_detection": turn_detection,
            "tools": tools,
        }
    })
}

/// Append one pcm16 chunk to the input audio buffer.
#[must_use]
pub fn audio_append(pcm: &[u8]) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": BASE64.encode(pcm),
    })
}

/// Commit the input audio buffer, closing the user's turn.
#[must_use]
pub fn audio_commit() -> Value {
    json!({ "type": "input_audio_buffer.commit" })
}

/// Ask the model to produce a response.
#[must_use]
pub fn response_create() -> Value {
    json!({ "type": "response.create" })
}

/// Inject a tool result into the conversation. Must be sent before the
/// follow-up [`response_create`].
#[must_use]
pub fn tool_result(call_id: &str, payload: &Value) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": payload.to_string(),
        }
    })
}
