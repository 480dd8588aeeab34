//! Native-API frame codec
//!
//! Wire format: `[0x00 preamble][varint payload_len][varint message_type]
//! [payload]`, payloads protobuf-encoded. [`decode_frame`] is total over
//! partial input: it returns `Ok(None)` until a complete frame is buffered
//! and never panics on truncation. Frame-level damage (wrong preamble,
//! absurd length) is an error that tears the connection down; a damaged or
//! unmodeled payload inside a well-formed frame is reported per frame so the
//! stream keeps flowing.

use super::proto::{Reader, Writer, decode_varint, encode_varint};
use crate::{Error, Result};

/// Plaintext frame marker. The encrypted transport (0x01) is not spoken.
pub const FRAME_PREAMBLE: u8 = 0x00;

/// Upper bound on a sane payload. Anything larger means the stream is
/// desynchronized and length bytes are being misread.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Voice-assistant event identifiers carried by
/// [`ApiMessage::VoiceAssistantEventResponse`].
pub mod voice_event {
    pub const ERROR: u32 = 0;
    pub const RUN_START: u32 = 1;
    pub const RUN_END: u32 = 2;
    pub const STT_START: u32 = 3;
    pub const STT_END: u32 = 4;
    pub const INTENT_START: u32 = 5;
    pub const INTENT_END: u32 = 6;
    pub const TTS_START: u32 = 7;
    pub const TTS_END: u32 = 8;
}

mod msg_type {
    pub const HELLO_REQUEST: u64 = 1;
    pub const HELLO_RESPONSE: u64 = 2;
    pub const CONNECT_REQUEST: u64 = 3;
    pub const CONNECT_RESPONSE: u64 = 4;
    pub const DISCONNECT_REQUEST: u64 = 5;
    pub const DISCONNECT_RESPONSE: u64 = 6;
    pub const PING_REQUEST: u64 = 7;
    pub const PING_RESPONSE: u64 = 8;
    pub const DEVICE_INFO_REQUEST: u64 = 9;
    pub const DEVICE_INFO_RESPONSE: u64 = 10;
    pub const LIST_ENTITIES_REQUEST: u64 = 11;
    pub const LIST_ENTITIES_SWITCH_RESPONSE: u64 = 17;
    pub const LIST_ENTITIES_DONE_RESPONSE: u64 = 19;
    pub const SUBSCRIBE_STATES_REQUEST: u64 = 20;
    pub const SWITCH_STATE_RESPONSE: u64 = 26;
    pub const SWITCH_COMMAND_REQUEST: u64 = 33;
    pub const LIST_ENTITIES_NUMBER_RESPONSE: u64 = 49;
    pub const NUMBER_STATE_RESPONSE: u64 = 50;
    pub const LIST_ENTITIES_MEDIA_PLAYER_RESPONSE: u64 = 63;
    pub const MEDIA_PLAYER_STATE_RESPONSE: u64 = 64;
    pub const MEDIA_PLAYER_COMMAND_REQUEST: u64 = 65;
    pub const SUBSCRIBE_VOICE_ASSISTANT_REQUEST: u64 = 89;
    pub const VOICE_ASSISTANT_REQUEST: u64 = 90;
    pub const VOICE_ASSISTANT_RESPONSE: u64 = 91;
    pub const VOICE_ASSISTANT_EVENT_RESPONSE: u64 = 92;
    pub const VOICE_ASSISTANT_AUDIO: u64 = 106;
    pub const VOICE_ASSISTANT_CONFIGURATION_REQUEST: u64 = 121;
    pub const VOICE_ASSISTANT_CONFIGURATION_RESPONSE: u64 = 122;
}

/// Every native-API message the bridge speaks, in both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiMessage {
    HelloRequest {
        client_info: String,
        api_version_major: u32,
        api_version_minor: u32,
    },
    HelloResponse {
        api_version_major: u32,
        api_version_minor: u32,
        server_info: String,
        name: String,
    },
    ConnectRequest {
        password: String,
    },
    ConnectResponse {
        invalid_password: bool,
    },
    DisconnectRequest,
    DisconnectResponse,
    PingRequest,
    PingResponse,
    DeviceInfoRequest,
    DeviceInfoResponse {
        name: String,
        mac_address: String,
        esphome_version: String,
        model: String,
        friendly_name: String,
        voice_assistant_feature_flags: u32,
    },
    ListEntitiesRequest,
    ListEntitiesSwitchResponse {
        object_id: String,
        key: u32,
        name: String,
    },
    ListEntitiesDoneResponse,
    SubscribeStatesRequest,
    SwitchStateResponse {
        key: u32,
        state: bool,
    },
    SwitchCommandRequest {
        key: u32,
        state: bool,
    },
    ListEntitiesNumberResponse {
        object_id: String,
        key: u32,
        name: String,
        min_value: f32,
        max_value: f32,
        step: f32,
    },
    NumberStateResponse {
        key: u32,
        state: f32,
        missing_state: bool,
    },
    ListEntitiesMediaPlayerResponse {
        object_id: String,
        key: u32,
        name: String,
        supports_pause: bool,
    },
    MediaPlayerStateResponse {
        key: u32,
        state: u32,
        volume: f32,
        muted: bool,
    },
    MediaPlayerCommandRequest {
        key: u32,
        command: Option<u32>,
        volume: Option<f32>,
        media_url: Option<String>,
        announcement: Option<bool>,
    },
    SubscribeVoiceAssistantRequest {
        subscribe: bool,
        flags: u32,
    },
    VoiceAssistantRequest {
        start: bool,
        conversation_id: String,
        flags: u32,
        wake_word_phrase: String,
    },
    VoiceAssistantResponse {
        port: u32,
        error: bool,
    },
    VoiceAssistantEventResponse {
        event_type: u32,
        data: Vec<(String, String)>,
    },
    VoiceAssistantAudio {
        data: Vec<u8>,
        end: bool,
    },
    VoiceAssistantConfigurationRequest,
    VoiceAssistantConfigurationResponse {
        available_wake_words: Vec<String>,
        active_wake_words: Vec<String>,
        max_active_wake_words: u32,
    },
}

/// Outcome of decoding one complete frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A message the bridge models
    Message(ApiMessage),
    /// A well-formed frame of a type the bridge does not model; skipped
    Unknown { msg_type: u64 },
    /// A known type whose payload would not parse; dropped, stream continues
    Malformed { msg_type: u64, reason: String },
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns the decoded frame and the total bytes consumed, or `Ok(None)`
/// when `buf` does not yet hold a complete frame.
///
/// # Errors
///
/// Returns [`Error::Device`] when the framing itself is unreadable (bad
/// preamble, over-long varint, payload length past [`MAX_PAYLOAD_LEN`]);
/// the connection cannot be resynchronized past that point.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Decoded, usize)>> {
    let Some((&preamble, rest)) = buf.split_first() else {
        return Ok(None);
    };
    if preamble != FRAME_PREAMBLE {
        return Err(Error::Device(format!(
            "bad frame preamble 0x{preamble:02x} (encrypted transport is not supported)"
        )));
    }

    let Some((payload_len, n_len)) = decode_varint(rest)? else {
        return Ok(None);
    };
    let payload_len = usize::try_from(payload_len)
        .map_err(|_| Error::Device("payload length out of range".to_string()))?;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::Device(format!(
            "payload length {payload_len} exceeds limit, stream desynchronized"
        )));
    }

    let Some((msg_type, n_type)) = decode_varint(&rest[n_len..])? else {
        return Ok(None);
    };

    let header = 1 + n_len + n_type;
    let total = header + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let payload = &buf[header..total];
    let decoded = match ApiMessage::decode_payload(msg_type, payload) {
        Ok(Some(message)) => Decoded::Message(message),
        Ok(None) => Decoded::Unknown { msg_type },
        Err(e) => Decoded::Malformed {
            msg_type,
            reason: e.to_string(),
        },
    };
    Ok(Some((decoded, total)))
}

/// Encode one message as a complete frame.
#[must_use]
pub fn encode_frame(message: &ApiMessage) -> Vec<u8> {
    let payload = message.encode_payload();
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.push(FRAME_PREAMBLE);
    encode_varint(&mut frame, payload.len() as u64);
    encode_varint(&mut frame, message.message_type());
    frame.extend_from_slice(&payload);
    frame
}

impl ApiMessage {
    /// Wire name, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::HelloRequest { .. } => "HelloRequest",
            Self::HelloResponse { .. } => "HelloResponse",
            Self::ConnectRequest { .. } => "ConnectRequest",
            Self::ConnectResponse { .. } => "ConnectResponse",
            Self::DisconnectRequest => "DisconnectRequest",
            Self::DisconnectResponse => "DisconnectResponse",
            Self::PingRequest => "PingRequest",
            Self::PingResponse => "PingResponse",
            Self::DeviceInfoRequest => "DeviceInfoRequest",
            Self::DeviceInfoResponse { .. } => "DeviceInfoResponse",
            Self::ListEntitiesRequest => "ListEntitiesRequest",
            Self::ListEntitiesSwitchResponse { .. } => "ListEntitiesSwitchResponse",
            Self::ListEntitiesDoneResponse => "ListEntitiesDoneResponse",
            Self::SubscribeStatesRequest => "SubscribeStatesRequest",
            Self::SwitchStateResponse { .. } => "SwitchStateResponse",
            Self::SwitchCommandRequest { .. } => "SwitchCommandRequest",
            Self::ListEntitiesNumberResponse { .. } => "ListEntitiesNumberResponse",
            Self::NumberStateResponse { .. } => "NumberStateResponse",
            Self::ListEntitiesMediaPlayerResponse { .. } => "ListEntitiesMediaPlayerResponse",
            Self::MediaPlayerStateResponse { .. } => "MediaPlayerStateResponse",
            Self::MediaPlayerCommandRequest { .. } => "MediaPlayerCommandRequest",
            Self::SubscribeVoiceAssistantRequest { .. } => "SubscribeVoiceAssistantRequest",
            Self::VoiceAssistantRequest { .. } => "VoiceAssistantRequest",
            Self::VoiceAssistantResponse { .. } => "VoiceAssistantResponse",
            Self::VoiceAssistantEventResponse { .. } => "VoiceAssistantEventResponse",
            Self::VoiceAssistantAudio { .. } => "VoiceAssistantAudio",
            Self::VoiceAssistantConfigurationRequest => "VoiceAssistantConfigurationRequest",
            Self::VoiceAssistantConfigurationResponse { .. } => {
                "VoiceAssistantConfigurationResponse"
            }
        }
    }

    const fn message_type(&self) -> u64 {
        match self {
            Self::HelloRequest { .. } => msg_type::HELLO_REQUEST,
            Self::HelloResponse { .. } => msg_type::HELLO_RESPONSE,
            Self::ConnectRequest { .. } => msg_type::CONNECT_REQUEST,
            Self::ConnectResponse { .. } => msg_type::CONNECT_RESPONSE,
            Self::DisconnectRequest => msg_type::DISCONNECT_REQUEST,
            Self::DisconnectResponse => msg_type::DISCONNECT_RESPONSE,
            Self::PingRequest => msg_type::PING_REQUEST,
            Self::PingResponse => msg_type::PING_RESPONSE,
            Self::DeviceInfoRequest => msg_type::DEVICE_INFO_REQUEST,
            Self::DeviceInfoResponse { .. } => msg_type::DEVICE_INFO_RESPONSE,
            Self::ListEntitiesRequest => msg_type::LIST_ENTITIES_REQUEST,
            Self::ListEntitiesSwitchResponse { .. } => msg_type::LIST_ENTITIES_SWITCH_RESPONSE,
            Self::ListEntitiesDoneResponse => msg_type::LIST_ENTITIES_DONE_RESPONSE,
            Self::SubscribeStatesRequest => msg_type::SUBSCRIBE_STATES_REQUEST,
            Self::SwitchStateResponse { .. } => msg_type::SWITCH_STATE_RESPONSE,
            Self::SwitchCommandRequest { .. } => msg_type::SWITCH_COMMAND_REQUEST,
            Self::ListEntitiesNumberResponse { .. } => msg_type::LIST_ENTITIES_NUMBER_RESPONSE,
            Self::NumberStateResponse { .. } => msg_type::NUMBER_STATE_RESPONSE,
            Self::ListEntitiesMediaPlayerResponse { .. } => {
                msg_type::LIST_ENTITIES_MEDIA_PLAYER_RESPONSE
            }
            Self::MediaPlayerStateResponse { .. } => msg_type::MEDIA_PLAYER_STATE_RESPONSE,
            Self::MediaPlayerCommandRequest { .. } => msg_type::MEDIA_PLAYER_COMMAND_REQUEST,
            Self::SubscribeVoiceAssistantRequest { .. } => {
                msg_type::SUBSCRIBE_VOICE_ASSISTANT_REQUEST
            }
            Self::VoiceAssistantRequest { .. } => msg_type::VOICE_ASSISTANT_REQUEST,
            Self::VoiceAssistantResponse { .. } => msg_type::VOICE_ASSISTANT_RESPONSE,
            Self::VoiceAssistantEventResponse { .. } => msg_type::VOICE_ASSISTANT_EVENT_RESPONSE,
            Self::VoiceAssistantAudio { .. } => msg_type::VOICE_ASSISTANT_AUDIO,
            Self::VoiceAssistantConfigurationRequest => {
                msg_type::VOICE_ASSISTANT_CONFIGURATION_REQUEST
            }
            Self::VoiceAssistantConfigurationResponse { .. } => {
                msg_type::VOICE_ASSISTANT_CONFIGURATION_RESPONSE
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::HelloRequest {
                client_info,
                api_version_major,
                api_version_minor,
            } => {
                w.string(1, client_info);
                w.varint(2, u64::from(*api_version_major));
                w.varint(3, u64::from(*api_version_minor));
            }
            Self::HelloResponse {
                api_version_major,
                api_version_minor,
                server_info,
                name,
            } => {
                w.varint(1, u64::from(*api_version_major));
                w.varint(2, u64::from(*api_version_minor));
                w.string(3, server_info);
                w.string(4, name);
            }
            Self::ConnectRequest { password } => w.string(1, password),
            Self::ConnectResponse { invalid_password } => w.bool(1, *invalid_password),
            Self::DeviceInfoResponse {
                name,
                mac_address,
                esphome_version,
                model,
                friendly_name,
                voice_assistant_feature_flags,
            } => {
                w.string(2, name);
                w.string(3, mac_address);
                w.string(4, esphome_version);
                w.string(6, model);
                w.string(13, friendly_name);
                w.varint(17, u64::from(*voice_assistant_feature_flags));
            }
            Self::ListEntitiesSwitchResponse {
                object_id,
                key,
                name,
            } => {
                w.string(1, object_id);
                w.fixed32(2, *key);
                w.string(3, name);
            }
            Self::SwitchStateResponse { key, state } => {
                w.fixed32(1, *key);
                w.bool(2, *state);
            }
            Self::SwitchCommandRequest { key, state } => {
                w.fixed32(1, *key);
                w.bool(2, *state);
            }
            Self::ListEntitiesNumberResponse {
                object_id,
                key,
                name,
                min_value,
                max_value,
                step,
            } => {
                w.string(1, object_id);
                w.fixed32(2, *key);
                w.string(3, name);
                w.float(6, *min_value);
                w.float(7, *max_value);
                w.float(8, *step);
            }
            Self::NumberStateResponse {
                key,
                state,
                missing_state,
            } => {
                w.fixed32(1, *key);
                w.float(2, *state);
                w.bool(3, *missing_state);
            }
            Self::ListEntitiesMediaPlayerResponse {
                object_id,
                key,
                name,
                supports_pause,
            } => {
                w.string(1, object_id);
                w.fixed32(2, *key);
                w.string(3, name);
                w.bool(8, *supports_pause);
            }
            Self::MediaPlayerStateResponse {
                key,
                state,
                volume,
                muted,
            } => {
                w.fixed32(1, *key);
                w.varint(2, u64::from(*state));
                w.float(3, *volume);
                w.bool(4, *muted);
            }
            Self::MediaPlayerCommandRequest {
                key,
                command,
                volume,
                media_url,
                announcement,
            } => {
                w.fixed32(1, *key);
                if let Some(command) = command {
                    w.bool(2, true);
                    w.varint(3, u64::from(*command));
                }
                if let Some(volume) = volume {
                    w.bool(4, true);
                    w.float(5, *volume);
                }
                if let Some(media_url) = media_url {
                    w.bool(6, true);
                    w.string(7, media_url);
                }
                if let Some(announcement) = announcement {
                    w.bool(8, true);
                    w.bool(9, *announcement);
                }
            }
            Self::SubscribeVoiceAssistantRequest { subscribe, flags } => {
                w.bool(1, *subscribe);
                w.varint(2, u64::from(*flags));
            }
            Self::VoiceAssistantRequest {
                start,
                conversation_id,
                flags,
                wake_word_phrase,
            } => {
                w.bool(1, *start);
                w.string(2, conversation_id);
                w.varint(3, u64::from(*flags));
                w.string(5, wake_word_phrase);
            }
            Self::VoiceAssistantResponse { port, error } => {
                w.varint(1, u64::from(*port));
                w.bool(2, *error);
            }
            Self::VoiceAssistantEventResponse { event_type, data } => {
                w.varint(1, u64::from(*event_type));
                for (name, value) in data {
                    let mut entry = Writer::new();
                    entry.string(1, name);
                    entry.string(2, value);
                    w.message(2, &entry);
                }
            }
            Self::VoiceAssistantAudio { data, end } => {
                w.bytes(1, data);
                w.bool(2, *end);
            }
            Self::VoiceAssistantConfigurationResponse {
                available_wake_words,
                active_wake_words,
                max_active_wake_words,
            } => {
                for wake_word in available_wake_words {
                    let mut entry = Writer::new();
                    entry.string(1, wake_word);
                    entry.string(2, wake_word);
                    w.message(1, &entry);
                }
                for id in active_wake_words {
                    w.string(2, id);
                }
                w.varint(3, u64::from(*max_active_wake_words));
            }
            // Empty-payload requests
            Self::DisconnectRequest
            | Self::DisconnectResponse
            | Self::PingRequest
            | Self::PingResponse
            | Self::DeviceInfoRequest
            | Self::ListEntitiesRequest
            | Self::ListEntitiesDoneResponse
            | Self::SubscribeStatesRequest
            | Self::VoiceAssistantConfigurationRequest => {}
        }
        w.into_bytes()
    }

    /// Decode a payload of a known message type.
    ///
    /// Returns `Ok(None)` for message types the bridge does not model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when the payload's protobuf encoding is
    /// damaged.
    #[allow(clippy::too_many_lines)]
    pub fn decode_payload(msg_type: u64, payload: &[u8]) -> Result<Option<Self>> {
        let mut r = Reader::new(payload);
        let message = match msg_type {
            msg_type::HELLO_REQUEST => {
                let mut client_info = String::new();
                let (mut major, mut minor) = (0, 0);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => client_info = value.as_string(),
                        2 => major = value.as_u32(),
                        3 => minor = value.as_u32(),
                        _ => {}
                    }
                }
                Self::HelloRequest {
                    client_info,
                    api_version_major: major,
                    api_version_minor: minor,
                }
            }
            msg_type::HELLO_RESPONSE => {
                let (mut major, mut minor) = (0, 0);
                let mut server_info = String::new();
                let mut name = String::new();
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => major = value.as_u32(),
                        2 => minor = value.as_u32(),
                        3 => server_info = value.as_string(),
                        4 => name = value.as_string(),
                        _ => {}
                    }
                }
                Self::HelloResponse {
                    api_version_major: major,
                    api_version_minor: minor,
                    server_info,
                    name,
                }
            }
            msg_type::CONNECT_REQUEST => {
                let mut password = String::new();
                while let Some((field, value)) = r.read_field()? {
                    if field == 1 {
                        password = value.as_string();
                    }
                }
                Self::ConnectRequest { password }
            }
            msg_type::CONNECT_RESPONSE => {
                let mut invalid_password = false;
                while let Some((field, value)) = r.read_field()? {
                    if field == 1 {
                        invalid_password = value.as_bool();
                    }
                }
                Self::ConnectResponse { invalid_password }
            }
            msg_type::DISCONNECT_REQUEST => Self::DisconnectRequest,
            msg_type::DISCONNECT_RESPONSE => Self::DisconnectResponse,
            msg_type::PING_REQUEST => Self::PingRequest,
            msg_type::PING_RESPONSE => Self::PingResponse,
            msg_type::DEVICE_INFO_REQUEST => Self::DeviceInfoRequest,
            msg_type::DEVICE_INFO_RESPONSE => {
                let mut name = String::new();
                let mut mac_address = String::new();
                let mut esphome_version = String::new();
                let mut model = String::new();
                let mut friendly_name = String::new();
                let mut flags = 0;
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        2 => name = value.as_string(),
                        3 => mac_address = value.as_string(),
                        4 => esphome_version = value.as_string(),
                        6 => model = value.as_string(),
                        13 => friendly_name = value.as_string(),
                        17 => flags = value.as_u32(),
                        _ => {}
                    }
                }
                Self::DeviceInfoResponse {
                    name,
                    mac_address,
                    esphome_version,
                    model,
                    friendly_name,
                    voice_assistant_feature_flags: flags,
                }
            }
            msg_type::LIST_ENTITIES_REQUEST => Self::ListEntitiesRequest,
            msg_type::LIST_ENTITIES_SWITCH_RESPONSE => {
                let (mut object_id, mut key, mut name) = (String::new(), 0, String::new());
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => object_id = value.as_string(),
                        2 => key = value.as_u32(),
                        3 => name = value.as_string(),
                        _ => {}
                    }
                }
                Self::ListEntitiesSwitchResponse {
                    object_id,
                    key,
                    name,
                }
            }
            msg_type::LIST_ENTITIES_DONE_RESPONSE => Self::ListEntitiesDoneResponse,
            msg_type::SUBSCRIBE_STATES_REQUEST => Self::SubscribeStatesRequest,
            msg_type::SWITCH_STATE_RESPONSE => {
                let (mut key, mut state) = (0, false);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => key = value.as_u32(),
                        2 => state = value.as_bool(),
                        _ => {}
                    }
                }
                Self::SwitchStateResponse { key, state }
            }
            msg_type::SWITCH_COMMAND_REQUEST => {
                let (mut key, mut state) = (0, false);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => key = value.as_u32(),
                        2 => state = value.as_bool(),
                        _ => {}
                    }
                }
                Self::SwitchCommandRequest { key, state }
            }
            msg_type::LIST_ENTITIES_NUMBER_RESPONSE => {
                let (mut object_id, mut key, mut name) = (String::new(), 0, String::new());
                let (mut min_value, mut max_value, mut step) = (0.0, 0.0, 0.0);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => object_id = value.as_string(),
                        2 => key = value.as_u32(),
                        3 => name = value.as_string(),
                        6 => min_value = value.as_f32(),
                        7 => max_value = value.as_f32(),
                        8 => step = value.as_f32(),
                        _ => {}
                    }
                }
                Self::ListEntitiesNumberResponse {
                    object_id,
                    key,
                    name,
                    min_value,
                    max_value,
                    step,
                }
            }
            msg_type::NUMBER_STATE_RESPONSE => {
                let (mut key, mut state, mut missing_state) = (0, 0.0, false);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => key = value.as_u32(),
                        2 => state = value.as_f32(),
                        3 => missing_state = value.as_bool(),
                        _ => {}
                    }
                }
                Self::NumberStateResponse {
                    key,
                    state,
                    missing_state,
                }
            }
            msg_type::LIST_ENTITIES_MEDIA_PLAYER_RESPONSE => {
                let (mut object_id, mut key, mut name) = (String::new(), 0, String::new());
                let mut supports_pause = false;
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => object_id = value.as_string(),
                        2 => key = value.as_u32(),
                        3 => name = value.as_string(),
                        8 => supports_pause = value.as_bool(),
                        _ => {}
                    }
                }
                Self::ListEntitiesMediaPlayerResponse {
                    object_id,
                    key,
                    name,
                    supports_pause,
                }
            }
            msg_type::MEDIA_PLAYER_STATE_RESPONSE => {
                let (mut key, mut state, mut volume, mut muted) = (0, 0, 0.0, false);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => key = value.as_u32(),
                        2 => state = value.as_u32(),
                        3 => volume = value.as_f32(),
                        4 => muted = value.as_bool(),
                        _ => {}
                    }
                }
                Self::MediaPlayerStateResponse {
                    key,
                    state,
                    volume,
                    muted,
                }
            }
            msg_type::MEDIA_PLAYER_COMMAND_REQUEST => {
                let mut key = 0;
                let (mut has_command, mut command) = (false, 0);
                let (mut has_volume, mut volume) = (false, 0.0);
                let (mut has_media_url, mut media_url) = (false, String::new());
                let (mut has_announcement, mut announcement) = (false, false);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => key = value.as_u32(),
                        2 => has_command = value.as_bool(),
                        3 => command = value.as_u32(),
                        4 => has_volume = value.as_bool(),
                        5 => volume = value.as_f32(),
                        6 => has_media_url = value.as_bool(),
                        7 => media_url = value.as_string(),
                        8 => has_announcement = value.as_bool(),
                        9 => announcement = value.as_bool(),
                        _ => {}
                    }
                }
                Self::MediaPlayerCommandRequest {
                    key,
                    command: has_command.then_some(command),
                    volume: has_volume.then_some(volume),
                    media_url: has_media_url.then_some(media_url),
                    announcement: has_announcement.then_some(announcement),
                }
            }
            msg_type::SUBSCRIBE_VOICE_ASSISTANT_REQUEST => {
                let (mut subscribe, mut flags) = (false, 0);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => subscribe = value.as_bool(),
                        2 => flags = value.as_u32(),
                        _ => {}
                    }
                }
                Self::SubscribeVoiceAssistantRequest { subscribe, flags }
            }
            msg_type::VOICE_ASSISTANT_REQUEST => {
                let (mut start, mut conversation_id) = (false, String::new());
                let (mut flags, mut wake_word_phrase) = (0, String::new());
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => start = value.as_bool(),
                        2 => conversation_id = value.as_string(),
                        3 => flags = value.as_u32(),
                        5 => wake_word_phrase = value.as_string(),
                        _ => {}
                    }
                }
                Self::VoiceAssistantRequest {
                    start,
                    conversation_id,
                    flags,
                    wake_word_phrase,
                }
            }
            msg_type::VOICE_ASSISTANT_RESPONSE => {
                let (mut port, mut error) = (0, false);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => port = value.as_u32(),
                        2 => error = value.as_bool(),
                        _ => {}
                    }
                }
                Self::VoiceAssistantResponse { port, error }
            }
            msg_type::VOICE_ASSISTANT_EVENT_RESPONSE => {
                let mut event_type = 0;
                let mut data = Vec::new();
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => event_type = value.as_u32(),
                        2 => {
                            let mut entry = Reader::new(value.as_bytes());
                            let (mut name, mut val) = (String::new(), String::new());
                            while let Some((f, v)) = entry.read_field()? {
                                match f {
                                    1 => name = v.as_string(),
                                    2 => val = v.as_string(),
                                    _ => {}
                                }
                            }
                            data.push((name, val));
                        }
                        _ => {}
                    }
                }
                Self::VoiceAssistantEventResponse { event_type, data }
            }
            msg_type::VOICE_ASSISTANT_AUDIO => {
                let (mut data, mut end) = (Vec::new(), false);
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => data = value.as_bytes().to_vec(),
                        2 => end = value.as_bool(),
                        _ => {}
                    }
                }
                Self::VoiceAssistantAudio { data, end }
            }
            msg_type::VOICE_ASSISTANT_CONFIGURATION_REQUEST => {
                Self::VoiceAssistantConfigurationRequest
            }
            msg_type::VOICE_ASSISTANT_CONFIGURATION_RESPONSE => {
                let mut available_wake_words = Vec::new();
                let mut active_wake_words = Vec::new();
                let mut max_active_wake_words = 0;
                while let Some((field, value)) = r.read_field()? {
                    match field {
                        1 => {
                            let mut entry = Reader::new(value.as_bytes());
                            let mut wake_word = String::new();
                            while let Some((f, v)) = entry.read_field()? {
                                if f == 2 {
                                    wake_word = v.as_string();
                                }
                            }
                            available_wake_words.push(wake_word);
                        }
                        2 => active_wake_words.push(value.as_string()),
                        3 => max_active_wake_words = value.as_u32(),
                        _ => {}
                    }
                }
                Self::VoiceAssistantConfigurationResponse {
                    available_wake_words,
                    active_wake_words,
                    max_active_wake_words,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: &ApiMessage) {
        let frame = encode_frame(message);
        let (decoded, consumed) = decode_frame(&frame)
            .expect("well-formed frame")
            .expect("complete frame");
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, Decoded::Message(message.clone()), "{}", message.name());
    }

    #[test]
    fn round_trips_handshake_messages() {
        round_trip(&ApiMessage::HelloRequest {
            client_info: "chirp-bridge 0.1.0".to_string(),
            api_version_major: 1,
            api_version_minor: 10,
        });
        round_trip(&ApiMessage::HelloResponse {
            api_version_major: 1,
            api_version_minor: 10,
            server_info: "esphome v2024.6.0".to_string(),
            name: "kitchen-satellite".to_string(),
        });
        round_trip(&ApiMessage::ConnectRequest {
            password: "hunter2".to_string(),
        });
        round_trip(&ApiMessage::ConnectResponse {
            invalid_password: false,
        });
        round_trip(&ApiMessage::DisconnectRequest);
        round_trip(&ApiMessage::PingRequest);
        round_trip(&ApiMessage::PingResponse);
    }

    #[test]
    fn round_trips_discovery_messages() {
        round_trip(&ApiMessage::DeviceInfoResponse {
            name: "kitchen-satellite".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            esphome_version: "2024.6.0".to_string(),
            model: "esp32-s3-box-3".to_string(),
            friendly_name: "Kitchen Satellite".to_string(),
            voice_assistant_feature_flags: 3,
        });
        round_trip(&ApiMessage::ListEntitiesSwitchResponse {
            object_id: "mute".to_string(),
            key: 0xdead_beef,
            name: "Mute".to_string(),
        });
        round_trip(&ApiMessage::ListEntitiesNumberResponse {
            object_id: "volume_db".to_string(),
            key: 7,
            name: "Volume dB".to_string(),
            min_value: -30.0,
            max_value: 6.0,
            step: 0.5,
        });
        round_trip(&ApiMessage::ListEntitiesMediaPlayerResponse {
            object_id: "speaker".to_string(),
            key: 42,
            name: "Speaker".to_string(),
            supports_pause: true,
        });
        round_trip(&ApiMessage::ListEntitiesDoneResponse);
    }

    #[test]
    fn round_trips_state_and_command_messages() {
        round_trip(&ApiMessage::SwitchStateResponse { key: 5, state: true });
        round_trip(&ApiMessage::SwitchCommandRequest { key: 5, state: false });
        round_trip(&ApiMessage::NumberStateResponse {
            key: 7,
            state: 0.25,
            missing_state: false,
        });
        round_trip(&ApiMessage::MediaPlayerStateResponse {
            key: 42,
            state: 2,
            volume: 0.8,
            muted: false,
        });
        round_trip(&ApiMessage::MediaPlayerCommandRequest {
            key: 42,
            command: None,
            volume: Some(0.5),
            media_url: Some("http://10.0.0.2:8350/clips/abc.wav".to_string()),
            announcement: Some(true),
        });
        // Presence flags survive even for default values
        round_trip(&ApiMessage::MediaPlayerCommandRequest {
            key: 42,
            command: Some(0),
            volume: Some(0.0),
            media_url: None,
            announcement: Some(false),
        });
    }

    #[test]
    fn round_trips_voice_assistant_messages() {
        round_trip(&ApiMessage::SubscribeVoiceAssistantRequest {
            subscribe: true,
            flags: 0,
        });
        round_trip(&ApiMessage::VoiceAssistantRequest {
            start: true,
            conversation_id: "b2c9".to_string(),
            flags: 1,
            wake_word_phrase: "hey chirp".to_string(),
        });
        round_trip(&ApiMessage::VoiceAssistantResponse {
            port: 50_123,
            error: false,
        });
        round_trip(&ApiMessage::VoiceAssistantEventResponse {
            event_type: voice_event::TTS_END,
            data: vec![
                ("url".to_string(), "http://host/clip.wav".to_string()),
                ("stream_id".to_string(), "3".to_string()),
            ],
        });
        round_trip(&ApiMessage::VoiceAssistantAudio {
            data: vec![1, 2, 3, 4],
            end: true,
        });
        round_trip(&ApiMessage::VoiceAssistantConfigurationResponse {
            available_wake_words: vec!["okay_nabu".to_string(), "hey_jarvis".to_string()],
            active_wake_words: vec!["okay_nabu".to_string()],
            max_active_wake_words: 1,
        });
    }

    // -- totality over partial input ------------------------------------------

    #[test]
    fn decode_is_total_at_every_truncation() {
        let frame = encode_frame(&ApiMessage::DeviceInfoResponse {
            name: "sat".to_string(),
            mac_address: "00:11:22:33:44:55".to_string(),
            esphome_version: "2024.6.0".to_string(),
            model: "m5stack-atom-echo".to_string(),
            friendly_name: "Hall Satellite".to_string(),
            voice_assistant_feature_flags: 1,
        });

        for cut in 0..frame.len() {
            let result = decode_frame(&frame[..cut]).expect("truncation is never an error");
            assert!(result.is_none(), "cut at {cut} produced a frame early");
        }
        assert!(decode_frame(&frame).expect("valid").is_some());
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let mut stream = encode_frame(&ApiMessage::PingRequest);
        let second = encode_frame(&ApiMessage::PingResponse);
        stream.extend_from_slice(&second);

        let (first, n) = decode_frame(&stream).expect("valid").expect("complete");
        assert_eq!(first, Decoded::Message(ApiMessage::PingRequest));
        let (rest, m) = decode_frame(&stream[n..]).expect("valid").expect("complete");
        assert_eq!(rest, Decoded::Message(ApiMessage::PingResponse));
        assert_eq!(n + m, stream.len());
    }

    #[test]
    fn unknown_message_type_is_skipped_with_length() {
        // Type 9999 with a 3-byte payload
        let mut frame = vec![FRAME_PREAMBLE];
        encode_varint(&mut frame, 3);
        encode_varint(&mut frame, 9999);
        frame.extend_from_slice(&[1, 2, 3]);

        let (decoded, consumed) = decode_frame(&frame).expect("valid").expect("complete");
        assert_eq!(decoded, Decoded::Unknown { msg_type: 9999 });
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn malformed_payload_is_reported_not_fatal() {
        // HelloResponse whose payload is a truncated string field
        let mut frame = vec![FRAME_PREAMBLE];
        encode_varint(&mut frame, 2);
        encode_varint(&mut frame, msg_type::HELLO_RESPONSE);
        frame.extend_from_slice(&[0x1a, 0x05]); // field 3, len 5, no bytes

        let (decoded, consumed) = decode_frame(&frame).expect("framing is fine").expect("complete");
        assert!(matches!(decoded, Decoded::Malformed { msg_type: 2, .. }));
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn bad_preamble_is_fatal() {
        assert!(decode_frame(&[0x01, 0x00, 0x07]).is_err());
    }

    #[test]
    fn absurd_length_is_fatal() {
        let mut frame = vec![FRAME_PREAMBLE];
        encode_varint(&mut frame, (MAX_PAYLOAD_LEN as u64) + 1);
        encode_varint(&mut frame, msg_type::PING_REQUEST);
        assert!(decode_frame(&frame).is_err());
    }
}
