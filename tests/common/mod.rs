//! Shared test utilities
//!
//! In-process stand-ins for the bridge's two peers: a mock satellite
//! speaking the native API over TCP, and a mock speech service speaking
//! JSON over WebSocket. Both answer the handshake by themselves and hand
//! everything else to the test through channels.

#![allow(dead_code)]

use std::time::Duration;

use bytes::{Buf, BytesMut};
use chirp_bridge::config::{DeviceConfig, RealtimeConfig, VadConfig};
use chirp_bridge::realtime::{ToolDispatcher, ToolOutcome};
use chirp_bridge::satellite::codec::{self, ApiMessage, Decoded};
use chirp_bridge::{RetryPolicy, SessionConfig, TurnDetection};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Entity key the mock satellite advertises for its media player.
pub const MEDIA_PLAYER_KEY: u32 = 42;

/// Entity key the mock satellite advertises for its mute switch.
pub const MUTE_SWITCH_KEY: u32 = 7;

/// Generate mono pcm16 sine audio.
pub fn sine_pcm(sample_rate: u32, duration_ms: u32, frequency: f32) -> Vec<u8> {
    let num_samples = (sample_rate * duration_ms / 1000) as usize;
    let mut pcm = Vec::with_capacity(num_samples * 2);
    for i in 0..num_samples {
        let t = i as f32 / sample_rate as f32;
        let sample = 0.6 * (2.0 * std::f32::consts::PI * frequency * t).sin();
        pcm.extend_from_slice(&((sample * i16::MAX as f32) as i16).to_le_bytes());
    }
    pcm
}

/// Generate mono pcm16 silence.
pub fn silence_pcm(sample_rate: u32, duration_ms: u32) -> Vec<u8> {
    vec![0; (sample_rate * duration_ms / 1000) as usize * 2]
}

/// Device config pointed at a mock satellite, with fast reconnects.
pub fn test_device_config(port: u16) -> DeviceConfig {
    DeviceConfig {
        host: "127.0.0.1".to_string(),
        port,
        password: None,
        client_info: "chirp-bridge test".to_string(),
        ping_interval: Duration::from_secs(30),
        activity_timeout: Duration::from_secs(60),
        volume_tolerance: 0.005,
        retry: RetryPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
        },
    }
}

/// Realtime config pointed at a mock speech service.
pub fn test_realtime_config(endpoint: &str) -> RealtimeConfig {
    RealtimeConfig {
        api_key: String::new(),
        endpoint: endpoint.to_string(),
        session: SessionConfig {
            model: "gpt-realtime".to_string(),
            voice: "alloy".to_string(),
            instructions: "You are a test assistant.".to_string(),
            language: None,
            turn_detection: TurnDetection::ServerVad,
        },
        ping_interval: Duration::from_secs(30),
        vad: VadConfig::default(),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
        },
    }
}

/// Wait for the next event that satisfies `accept`, discarding the rest.
pub async fn wait_for<T: std::fmt::Debug>(
    events: &mut mpsc::Receiver<T>,
    what: &str,
    accept: impl Fn(&T) -> bool,
) -> T {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(event)) if accept(&event) => return event,
            Ok(Some(_)) => {}
            Ok(None) => panic!("event stream ended while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

/// Send one microphone datagram at the bridge's advertised UDP port.
pub async fn send_mic_udp(port: u16, pcm: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mic socket");
    socket
        .send_to(pcm, ("127.0.0.1", port))
        .await
        .expect("send mic datagram");
}

// -- mock satellite -----------------------------------------------------------

/// A native-API satellite on a local TCP port.
///
/// The handshake and discovery sequence is answered from a fixed script:
/// one media player (key [`MEDIA_PLAYER_KEY`]), one mute switch (key
/// [`MUTE_SWITCH_KEY`]), one wake word. Messages the script does not cover
/// are forwarded to the test; [`MockSatellite::inject`] sends device-side
/// frames at the bridge. When either end closes the connection the mock
/// goes back to accepting, so reconnects land on the same script.
pub struct MockSatellite {
    pub port: u16,
    pub from_bridge: mpsc::Receiver<ApiMessage>,
    inject: mpsc::Sender<ApiMessage>,
}

impl MockSatellite {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock satellite");
        let port = listener.local_addr().expect("local addr").port();
        let (forward_tx, from_bridge) = mpsc::channel(256);
        let (inject, inject_rx) = mpsc::channel(64);
        tokio::spawn(serve_satellite(listener, forward_tx, inject_rx));
        Self {
            port,
            from_bridge,
            inject,
        }
    }

    /// Send a frame at the bridge as if the device produced it.
    pub async fn inject(&self, message: ApiMessage) {
        self.inject.send(message).await.expect("mock satellite gone");
    }

    /// Wait for the next bridge frame that satisfies `accept`, discarding
    /// the rest.
    pub async fn expect(
        &mut self,
        what: &str,
        accept: impl Fn(&ApiMessage) -> bool,
    ) -> ApiMessage {
        loop {
            match timeout(Duration::from_secs(5), self.from_bridge.recv()).await {
                Ok(Some(message)) if accept(&message) => return message,
                Ok(Some(_)) => {}
                Ok(None) => panic!("mock satellite closed while waiting for {what}"),
                Err(_) => panic!("timed out waiting for {what}"),
            }
        }
    }
}

enum Scripted {
    Send(Vec<ApiMessage>),
    Forward,
    Bye,
}

fn scripted_reply(message: &ApiMessage) -> Scripted {
    match message {
        ApiMessage::HelloRequest { .. } => Scripted::Send(vec![ApiMessage::HelloResponse {
            api_version_major: 1,
            api_version_minor: 10,
            server_info: "esphome v2024.6.0".to_string(),
            name: "mock-satellite".to_string(),
        }]),
        ApiMessage::ConnectRequest { .. } => Scripted::Send(vec![ApiMessage::ConnectResponse {
            invalid_password: false,
        }]),
        ApiMessage::ListEntitiesRequest => Scripted::Send(vec![
            ApiMessage::ListEntitiesMediaPlayerResponse {
                object_id: "speaker".to_string(),
                key: MEDIA_PLAYER_KEY,
                name: "Speaker".to_string(),
                supports_pause: true,
            },
            ApiMessage::ListEntitiesSwitchResponse {
                object_id: "mute".to_string(),
                key: MUTE_SWITCH_KEY,
                name: "Mute".to_string(),
            },
            ApiMessage::ListEntitiesDoneResponse,
        ]),
        ApiMessage::SubscribeStatesRequest => {
            Scripted::Send(vec![ApiMessage::MediaPlayerStateResponse {
                key: MEDIA_PLAYER_KEY,
                state: 1,
                volume: 0.5,
                muted: false,
            }])
        }
        ApiMessage::DeviceInfoRequest => Scripted::Send(vec![ApiMessage::DeviceInfoResponse {
            name: "mock-satellite".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            esphome_version: "2024.6.0".to_string(),
            model: "esp32-s3-box-3".to_string(),
            friendly_name: "Mock Satellite".to_string(),
            voice_assistant_feature_flags: 3,
        }]),
        ApiMessage::VoiceAssistantConfigurationRequest => {
            Scripted::Send(vec![ApiMessage::VoiceAssistantConfigurationResponse {
                available_wake_words: vec!["okay_nabu".to_string()],
                active_wake_words: vec!["okay_nabu".to_string()],
                max_active_wake_words: 1,
            }])
        }
        ApiMessage::PingRequest => Scripted::Send(vec![ApiMessage::PingResponse]),
        ApiMessage::PingResponse => Scripted::Send(Vec::new()),
        // Bridge shutdown, or its answer to an injected disconnect
        ApiMessage::DisconnectRequest | ApiMessage::DisconnectResponse => Scripted::Bye,
        _ => Scripted::Forward,
    }
}

async fn serve_satellite(
    listener: TcpListener,
    forward: mpsc::Sender<ApiMessage>,
    mut inject: mpsc::Receiver<ApiMessage>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        if !satellite_connection(stream, &forward, &mut inject).await {
            return;
        }
    }
}

/// Serve one bridge connection. Returns `false` when the test side hung up.
async fn satellite_connection(
    mut stream: TcpStream,
    forward: &mpsc::Sender<ApiMessage>,
    inject: &mut mpsc::Receiver<ApiMessage>,
) -> bool {
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        tokio::select! {
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => return true,
                    Ok(_) => {}
                }
                loop {
                    match codec::decode_frame(&buf) {
                        Ok(Some((Decoded::Message(message), n))) => {
                            buf.advance(n);
                            match scripted_reply(&message) {
                                Scripted::Send(replies) => {
                                    for reply in replies {
                                        let frame = codec::encode_frame(&reply);
                                        if stream.write_all(&frame).await.is_err() {
                                            return true;
                                        }
                                    }
                                }
                                Scripted::Forward => {
                                    if forward.send(message).await.is_err() {
                                        return false;
                                    }
                                }
                                Scripted::Bye => {
                                    if matches!(message, ApiMessage::DisconnectRequest) {
                                        let frame =
                                            codec::encode_frame(&ApiMessage::DisconnectResponse);
                                        let _ = stream.write_all(&frame).await;
                                    }
                                    return true;
                                }
                            }
                        }
                        Ok(Some((_, n))) => buf.advance(n),
                        Ok(None) => break,
                        Err(_) => return true,
                    }
                }
            }
            message = inject.recv() => {
                let Some(message) = message else {
                    return false;
                };
                if stream.write_all(&codec::encode_frame(&message)).await.is_err() {
                    return true;
                }
            }
        }
    }
}

// -- mock speech service ------------------------------------------------------

/// A realtime speech endpoint on a local WebSocket port.
///
/// Client events arrive parsed on `from_client`; [`MockRealtime::inject`]
/// streams server events back. Pings are answered; nothing else is
/// scripted.
pub struct MockRealtime {
    pub port: u16,
    pub from_client: mpsc::Receiver<Value>,
    inject: mpsc::Sender<Value>,
}

impl MockRealtime {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock realtime");
        let port = listener.local_addr().expect("local addr").port();
        let (forward_tx, from_client) = mpsc::channel(256);
        let (inject, inject_rx) = mpsc::channel(64);
        tokio::spawn(serve_realtime(listener, forward_tx, inject_rx));
        Self {
            port,
            from_client,
            inject,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Send a server event at the agent.
    pub async fn inject(&self, event: Value) {
        self.inject.send(event).await.expect("mock realtime gone");
    }

    /// Wait for the next client event of the given `type`, discarding the
    /// rest.
    pub async fn expect(&mut self, event_type: &str) -> Value {
        loop {
            match timeout(Duration::from_secs(5), self.from_client.recv()).await {
                Ok(Some(event)) if event["type"] == event_type => return event,
                Ok(Some(_)) => {}
                Ok(None) => panic!("mock realtime closed while waiting for {event_type}"),
                Err(_) => panic!("timed out waiting for {event_type}"),
            }
        }
    }
}

async fn serve_realtime(
    listener: TcpListener,
    forward: mpsc::Sender<Value>,
    mut inject: mpsc::Receiver<Value>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            continue;
        };
        loop {
            tokio::select! {
                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(event) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            if forward.send(event).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                event = inject.recv() => {
                    let Some(event) = event else {
                        return;
                    };
                    if ws.send(Message::Text(event.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

// -- tools --------------------------------------------------------------------

/// Dispatcher that answers every call with its own arguments.
pub struct EchoTools;

#[async_trait::async_trait]
impl ToolDispatcher for EchoTools {
    fn schemas(&self) -> Vec<Value> {
        vec![json!({
            "type": "function",
            "name": "echo",
            "description": "Echo the arguments back",
            "parameters": {
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                }
            }
        })]
    }

    async fn dispatch(&self, name: &str, args: Value) -> ToolOutcome {
        ToolOutcome::Ok(json!({ "tool": name, "args": args }))
    }
}
