//! Native-API satellite client
//!
//! Owns the TCP control connection and the UDP microphone channel to one
//! voice satellite. The client runs as a single task: it dials, walks the
//! handshake/discovery sequence, then services inbound frames, microphone
//! datagrams, caller commands, and the liveness watchdog from one select
//! loop. Socket loss of any kind funnels into the same reconnect path with
//! capped exponential backoff; a deliberate shutdown is the only exit.

pub mod codec;
pub mod entities;
pub mod proto;

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until};

use crate::config::DeviceConfig;
use crate::reconnect::{ConnectionState, delay_for_attempt};
use crate::{Error, Result};

pub use codec::{ApiMessage, Decoded, voice_event};
pub use entities::{EntityHandle, EntityTable, LevelTracker};

/// Time allowed for the full handshake/discovery sequence.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Native-API protocol version spoken by the client.
const API_VERSION: (u32, u32) = (1, 10);

/// Everything learned about the device during discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub mac_address: String,
    pub esphome_version: String,
    pub model: String,
    pub friendly_name: String,
    pub voice_assistant_feature_flags: u32,
    pub available_wake_words: Vec<String>,
    pub active_wake_words: Vec<String>,
}

/// Events the client emits toward the session controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SatelliteEvent {
    /// Handshake and discovery finished
    Connected(DeviceInfo),
    /// Connection lost; the client is already reconnecting
    Disconnected { reason: String },
    /// The device started a voice run (wake word heard or button pressed)
    RunStarted { conversation_id: String },
    /// The device asked for the current run to stop
    RunStopped,
    /// One microphone audio chunk (16 kHz mono pcm16)
    MicAudio(Bytes),
    /// Speaker volume changed on the device side
    VolumeChanged(f32),
    /// Mute state changed on the device side
    MuteChanged(bool),
}

/// Turn lifecycle markers, sent start-before-end within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMarker {
    RunStart,
    RunEnd,
    SttStart,
    SttEnd { transcript: String },
    IntentStart,
    IntentEnd,
    TtsStart { text: String },
    TtsEnd { url: String },
    Error { code: String, message: String },
}

#[derive(Debug)]
pub(crate) enum Command {
    Marker(RunMarker),
    SetVolume(f32),
    SetMute(bool),
    PlayUrl(String),
    Shutdown,
}

/// Cheap cloneable handle to the client task.
#[derive(Clone)]
pub struct SatelliteHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    entities: watch::Receiver<EntityTable>,
}

impl SatelliteHandle {
    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch for connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Snapshot of the discovered entity table.
    #[must_use]
    pub fn entities(&self) -> EntityTable {
        self.entities.borrow().clone()
    }

    /// Send a turn lifecycle marker to the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] while the device link is down.
    pub async fn send_marker(&self, marker: RunMarker) -> Result<()> {
        self.command(Command::Marker(marker)).await
    }

    /// Set the speaker volume (0.0 to 1.0).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] while the device link is down.
    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        self.command(Command::SetVolume(volume.clamp(0.0, 1.0))).await
    }

    /// Set the microphone mute switch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] while the device link is down.
    pub async fn set_mute(&self, muted: bool) -> Result<()> {
        self.command(Command::SetMute(muted)).await
    }

    /// Ask the device to fetch and play an audio clip as an announcement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] while the device link is down.
    pub async fn play_url(&self, url: String) -> Result<()> {
        self.command(Command::PlayUrl(url)).await
    }

    /// Disconnect cleanly and stop the client task.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn command(&self, command: Command) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ChannelClosed("satellite commands"))
    }
}

/// Spawn the satellite client task.
///
/// Returns a command handle and the event stream. The task keeps the
/// connection alive until [`SatelliteHandle::shutdown`] is called or every
/// handle and the event receiver are dropped.
#[must_use]
pub fn spawn(config: DeviceConfig) -> (SatelliteHandle, mpsc::Receiver<SatelliteEvent>) {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
    let (entities_tx, entities_rx) = watch::channel(EntityTable::new());

    tokio::spawn(client_loop(
        config,
        command_rx,
        event_tx,
        state_tx,
        entities_tx,
    ));

    (
        SatelliteHandle {
            commands: command_tx,
            state: state_rx,
            entities: entities_rx,
        },
        event_rx,
    )
}

/// A handle that reports connected and exposes its command stream, without
/// a client task behind it.
#[cfg(test)]
pub(crate) fn test_handle() -> (SatelliteHandle, mpsc::Receiver<Command>) {
    let (commands, command_rx) = mpsc::channel(32);
    let (_state_tx, state) = watch::channel(ConnectionState::Connected);
    let (_entities_tx, entities) = watch::channel(EntityTable::new());
    (
        SatelliteHandle {
            commands,
            state,
            entities,
        },
        command_rx,
    )
}

enum ConnectionExit {
    Shutdown,
    Dropped { handshaken: bool, reason: String },
}

async fn client_loop(
    config: DeviceConfig,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SatelliteEvent>,
    state: watch::Sender<ConnectionState>,
    entities: watch::Sender<EntityTable>,
) {
    // Failures since the last successful handshake; drives the backoff.
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let delay = delay_for_attempt(&config.retry, attempt - 1);
            state.send_replace(ConnectionState::Reconnecting);
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "satellite reconnect backoff"
            );
            tokio::select! {
                () = sleep(delay) => {}
                cmd = commands.recv() => {
                    if matches!(cmd, None | Some(Command::Shutdown)) {
                        break;
                    }
                    tracing::debug!("dropping command received while disconnected");
                }
            }
        }

        state.send_replace(ConnectionState::Connecting);
        let exit = run_connection(&config, &mut commands, &events, &state, &entities).await;

        // Whatever was discovered died with the connection
        entities.send_replace(EntityTable::new());

        match exit {
            ConnectionExit::Shutdown => break,
            ConnectionExit::Dropped { handshaken, reason } => {
                state.send_replace(ConnectionState::Reconnecting);
                tracing::warn!(reason = %reason, "satellite connection lost");
                let _ = events
                    .send(SatelliteEvent::Disconnected { reason })
                    .await;
                attempt = if handshaken { 1 } else { attempt.saturating_add(1) };
            }
        }
    }

    state.send_replace(ConnectionState::Closed);
    tracing::info!("satellite client stopped");
}

#[allow(clippy::too_many_lines)]
async fn run_connection(
    config: &DeviceConfig,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<SatelliteEvent>,
    state: &watch::Sender<ConnectionState>,
    entities: &watch::Sender<EntityTable>,
) -> ConnectionExit {
    let dropped = |handshaken: bool, reason: String| ConnectionExit::Dropped { handshaken, reason };

    tracing::debug!(host = %config.host, port = config.port, "dialing satellite");
    let mut stream = match TcpStream::connect((config.host.as_str(), config.port)).await {
        Ok(stream) => stream,
        Err(e) => return dropped(false, format!("connect failed: {e}")),
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "could not set TCP_NODELAY");
    }

    // Stale commands queued across a reconnect would arrive out of turn
    loop {
        match commands.try_recv() {
            Ok(Command::Shutdown) => return ConnectionExit::Shutdown,
            Ok(_) => tracing::debug!("dropping command queued across reconnect"),
            Err(_) => break,
        }
    }

    let mut session = Session::new(config, events, state, entities);
    let mut mic: Option<UdpSocket> = None;
    let mut rx_buf = BytesMut::with_capacity(8192);
    let mut udp_buf = vec![0u8; 4096];
    let mut last_activity = Instant::now();
    let mut handshake_deadline = Some(Instant::now() + HANDSHAKE_TIMEOUT);

    let hello = ApiMessage::HelloRequest {
        client_info: config.client_info.clone(),
        api_version_major: API_VERSION.0,
        api_version_minor: API_VERSION.1,
    };
    if let Err(e) = send(&mut stream, &hello).await {
        return dropped(false, format!("hello failed: {e}"));
    }

    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            read = stream.read_buf(&mut rx_buf) => {
                match read {
                    Ok(0) => return dropped(session.handshaken, "closed by device".to_string()),
                    Ok(_) => {
                        last_activity = Instant::now();
                        match drain_frames(&mut stream, &mut mic, &mut session, &mut rx_buf).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Disconnect(reason)) => {
                                return dropped(session.handshaken, reason);
                            }
                            Err(e) => return dropped(session.handshaken, e.to_string()),
                        }
                        if session.handshaken {
                            handshake_deadline = None;
                        }
                    }
                    Err(e) => return dropped(session.handshaken, format!("read failed: {e}")),
                }
            }

            received = mic_recv(mic.as_ref(), &mut udp_buf) => {
                match received {
                    Ok(len) => {
                        let chunk = Bytes::copy_from_slice(&udp_buf[..len]);
                        if session.emit(SatelliteEvent::MicAudio(chunk)).await.is_err() {
                            return ConnectionExit::Shutdown;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "microphone socket error");
                        mic = None;
                    }
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => {
                        // Best effort goodbye; the device drops us either way
                        let _ = send(&mut stream, &ApiMessage::DisconnectRequest).await;
                        return ConnectionExit::Shutdown;
                    }
                    Some(command) => {
                        if let Err(e) = session.apply(&mut stream, &mut mic, command).await {
                            return dropped(session.handshaken, e.to_string());
                        }
                    }
                }
            }

            () = deadline_expired(handshake_deadline) => {
                return dropped(false, "handshake timed out".to_string());
            }

            _ = ping.tick() => {
                if last_activity.elapsed() > config.activity_timeout {
                    return dropped(
                        session.handshaken,
                        format!("no traffic for {}s", last_activity.elapsed().as_secs()),
                    );
                }
                if session.handshaken {
                    if let Err(e) = send(&mut stream, &ApiMessage::PingRequest).await {
                        return dropped(true, format!("ping failed: {e}"));
                    }
                }
            }
        }
    }
}

enum Flow {
    Continue,
    Disconnect(String),
}

/// Decode and dispatch every complete frame sitting in the receive buffer.
async fn drain_frames(
    stream: &mut TcpStream,
    mic: &mut Option<UdpSocket>,
    session: &mut Session<'_>,
    rx_buf: &mut BytesMut,
) -> Result<Flow> {
    while let Some((decoded, consumed)) = codec::decode_frame(rx_buf)? {
        rx_buf.advance(consumed);
        match decoded {
            Decoded::Message(message) => {
                tracing::trace!(message = message.name(), "satellite recv");
                match session.handle(stream, mic, message).await? {
                    Flow::Continue => {}
                    disconnect @ Flow::Disconnect(_) => return Ok(disconnect),
                }
            }
            Decoded::Unknown { msg_type } => {
                tracing::trace!(msg_type, "skipping unmodeled message");
            }
            Decoded::Malformed { msg_type, reason } => {
                tracing::warn!(msg_type, reason = %reason, "dropping malformed message");
            }
        }
    }
    Ok(Flow::Continue)
}

/// Per-connection satellite state.
struct Session<'a> {
    config: &'a DeviceConfig,
    events: &'a mpsc::Sender<SatelliteEvent>,
    state: &'a watch::Sender<ConnectionState>,
    entities: &'a watch::Sender<EntityTable>,
    table: EntityTable,
    levels: LevelTracker,
    info: DeviceInfo,
    handshaken: bool,
    stream_id: u32,
}

impl<'a> Session<'a> {
    fn new(
        config: &'a DeviceConfig,
        events: &'a mpsc::Sender<SatelliteEvent>,
        state: &'a watch::Sender<ConnectionState>,
        entities: &'a watch::Sender<EntityTable>,
    ) -> Self {
        Self {
            config,
            events,
            state,
            entities,
            table: EntityTable::new(),
            levels: LevelTracker::new(config.volume_tolerance),
            info: DeviceInfo::default(),
            handshaken: false,
            stream_id: 1,
        }
    }

    async fn emit(&self, event: SatelliteEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed("satellite events"))
    }

    /// React to one inbound message, advancing discovery or emitting events.
    #[allow(clippy::too_many_lines)]
    async fn handle(
        &mut self,
        stream: &mut TcpStream,
        mic: &mut Option<UdpSocket>,
        message: ApiMessage,
    ) -> Result<Flow> {
        match message {
            ApiMessage::HelloResponse {
                api_version_major,
                api_version_minor,
                server_info,
                ..
            } => {
                tracing::debug!(
                    version = format!("{api_version_major}.{api_version_minor}"),
                    server = %server_info,
                    "satellite hello",
                );
                let connect = ApiMessage::ConnectRequest {
                    password: self.config.password.clone().unwrap_or_default(),
                };
                send(stream, &connect).await?;
            }
            ApiMessage::ConnectResponse { invalid_password } => {
                if invalid_password {
                    return Ok(Flow::Disconnect("device rejected password".to_string()));
                }
                send(stream, &ApiMessage::ListEntitiesRequest).await?;
            }
            ApiMessage::ListEntitiesMediaPlayerResponse {
                object_id,
                key,
                name,
                ..
            } => {
                self.table.record_media_player(EntityHandle { key, object_id, name });
            }
            ApiMessage::ListEntitiesSwitchResponse { object_id, key, name } => {
                self.table.record_switch(EntityHandle { key, object_id, name });
            }
            ApiMessage::ListEntitiesNumberResponse {
                object_id, key, name, ..
            } => {
                self.table.record_number(EntityHandle { key, object_id, name });
            }
            ApiMessage::ListEntitiesDoneResponse => {
                self.table.mark_complete();
                self.entities.send_replace(self.table.clone());
                send(stream, &ApiMessage::SubscribeStatesRequest).await?;
                let subscribe = ApiMessage::SubscribeVoiceAssistantRequest {
                    subscribe: true,
                    flags: 0,
                };
                send(stream, &subscribe).await?;
                send(stream, &ApiMessage::DeviceInfoRequest).await?;
            }
            ApiMessage::DeviceInfoResponse {
                name,
                mac_address,
                esphome_version,
                model,
                friendly_name,
                voice_assistant_feature_flags,
            } => {
                self.info.name = name;
                self.info.mac_address = mac_address;
                self.info.esphome_version = esphome_version;
                self.info.model = model;
                self.info.friendly_name = friendly_name;
                self.info.voice_assistant_feature_flags = voice_assistant_feature_flags;
                send(stream, &ApiMessage::VoiceAssistantConfigurationRequest).await?;
            }
            ApiMessage::VoiceAssistantConfigurationResponse {
                available_wake_words,
                active_wake_words,
                ..
            } => {
                self.info.available_wake_words = available_wake_words;
                self.info.active_wake_words = active_wake_words;
                if !self.handshaken {
                    self.handshaken = true;
                    tracing::info!(
                        device = %self.info.name,
                        model = %self.info.model,
                        version = %self.info.esphome_version,
                        "satellite connected"
                    );
                    // Flip the public state before the event so a caller
                    // reacting to Connected can issue commands immediately
                    self.state.send_replace(ConnectionState::Connected);
                    self.emit(SatelliteEvent::Connected(self.info.clone())).await?;
                }
            }
            ApiMessage::VoiceAssistantRequest {
                start,
                conversation_id,
                ..
            } => {
                if start {
                    match open_mic(mic).await {
                        Ok(port) => {
                            send(stream, &ApiMessage::VoiceAssistantResponse { port: u32::from(port), error: false })
                                .await?;
                            tracing::debug!(port, "microphone channel open");
                            self.emit(SatelliteEvent::RunStarted { conversation_id }).await?;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "could not open microphone socket");
                            send(stream, &ApiMessage::VoiceAssistantResponse { port: 0, error: true })
                                .await?;
                        }
                    }
                } else {
                    *mic = None;
                    self.emit(SatelliteEvent::RunStopped).await?;
                }
            }
            ApiMessage::VoiceAssistantAudio { data, end } => {
                // Fallback microphone path over the control connection
                if !end && !data.is_empty() {
                    self.emit(SatelliteEvent::MicAudio(Bytes::from(data))).await?;
                }
            }
            ApiMessage::SwitchStateResponse { key, state } => {
                if self.table.mute_switch().is_some_and(|h| h.key == key) {
                    if let Some(muted) = self.levels.observe_mute(state) {
                        self.emit(SatelliteEvent::MuteChanged(muted)).await?;
                    }
                }
            }
            ApiMessage::MediaPlayerStateResponse { key, volume, muted, .. } => {
                if self.table.media_player().is_some_and(|h| h.key == key) {
                    if let Some(volume) = self.levels.observe_volume(volume) {
                        self.emit(SatelliteEvent::VolumeChanged(volume)).await?;
                    }
                    if let Some(muted) = self.levels.observe_mute(muted) {
                        self.emit(SatelliteEvent::MuteChanged(muted)).await?;
                    }
                }
            }
            ApiMessage::NumberStateResponse { key, state, .. } => {
                tracing::trace!(key, state, "number state update");
            }
            ApiMessage::PingRequest => {
                send(stream, &ApiMessage::PingResponse).await?;
            }
            ApiMessage::PingResponse => {}
            ApiMessage::DisconnectRequest => {
                let _ = send(stream, &ApiMessage::DisconnectResponse).await;
                return Ok(Flow::Disconnect("device requested disconnect".to_string()));
            }
            other => {
                tracing::trace!(message = other.name(), "ignoring message");
            }
        }
        Ok(Flow::Continue)
    }

    /// Apply one caller command to the connection.
    async fn apply(
        &mut self,
        stream: &mut TcpStream,
        mic: &mut Option<UdpSocket>,
        command: Command,
    ) -> Result<()> {
        match command {
            Command::Marker(marker) => {
                let closes_capture = matches!(marker, RunMarker::SttEnd { .. } | RunMarker::RunEnd);
                let ends_run = matches!(marker, RunMarker::RunEnd);
                let message = marker_message(self.stream_id, &marker);
                send(stream, &message).await?;
                if closes_capture && mic.is_some() {
                    tracing::debug!("microphone channel closed");
                    *mic = None;
                }
                if ends_run {
                    self.stream_id = self.stream_id.wrapping_add(1);
                }
            }
            Command::SetVolume(volume) => {
                if let Some(player) = self.table.media_player() {
                    let message = ApiMessage::MediaPlayerCommandRequest {
                        key: player.key,
                        command: None,
                        volume: Some(volume),
                        media_url: None,
                        announcement: None,
                    };
                    send(stream, &message).await?;
                } else {
                    tracing::warn!("no media player discovered, volume command ignored");
                }
            }
            Command::SetMute(muted) => {
                if let Some(switch) = self.table.mute_switch() {
                    let message = ApiMessage::SwitchCommandRequest {
                        key: switch.key,
                        state: muted,
                    };
                    send(stream, &message).await?;
                } else {
                    tracing::warn!("no mute switch discovered, mute command ignored");
                }
            }
            Command::PlayUrl(url) => {
                if let Some(player) = self.table.media_player() {
                    let message = ApiMessage::MediaPlayerCommandRequest {
                        key: player.key,
                        command: None,
                        volume: None,
                        media_url: Some(url),
                        announcement: Some(true),
                    };
                    send(stream, &message).await?;
                } else {
                    tracing::warn!("no media player discovered, playback command ignored");
                }
            }
            Command::Shutdown => {}
        }
        Ok(())
    }
}

/// Build the lifecycle-marker message for the current stream id.
fn marker_message(stream_id: u32, marker: &RunMarker) -> ApiMessage {
    let mut data = vec![("stream_id".to_string(), stream_id.to_string())];
    let event_type = match marker {
        RunMarker::RunStart => voice_event::RUN_START,
        RunMarker::RunEnd => voice_event::RUN_END,
        RunMarker::SttStart => voice_event::STT_START,
        RunMarker::SttEnd { transcript } => {
            data.push(("text".to_string(), transcript.clone()));
            voice_event::STT_END
        }
        RunMarker::IntentStart => voice_event::INTENT_START,
        RunMarker::IntentEnd => voice_event::INTENT_END,
        RunMarker::TtsStart { text } => {
            data.push(("text".to_string(), text.clone()));
            voice_event::TTS_START
        }
        RunMarker::TtsEnd { url } => {
            data.push(("url".to_string(), url.clone()));
            voice_event::TTS_END
        }
        RunMarker::Error { code, message } => {
            data.push(("code".to_string(), code.clone()));
            data.push(("message".to_string(), message.clone()));
            voice_event::ERROR
        }
    };
    ApiMessage::VoiceAssistantEventResponse { event_type, data }
}

async fn send(stream: &mut TcpStream, message: &ApiMessage) -> Result<()> {
    let frame = codec::encode_frame(message);
    tracing::trace!(message = message.name(), len = frame.len(), "satellite send");
    stream.write_all(&frame).await?;
    Ok(())
}

async fn open_mic(mic: &mut Option<UdpSocket>) -> Result<u16> {
    // Drop any stale socket before binding a fresh one
    *mic = None;
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let port = socket.local_addr()?.port();
    *mic = Some(socket);
    Ok(port)
}

async fn mic_recv(mic: Option<&UdpSocket>, buf: &mut [u8]) -> std::io::Result<usize> {
    match mic {
        Some(socket) => {
            let (len, _addr) = socket.recv_from(buf).await?;
            Ok(len)
        }
        None => std::future::pending().await,
    }
}

async fn deadline_expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker_data(message: &ApiMessage) -> (u32, Vec<(String, String)>) {
        match message {
            ApiMessage::VoiceAssistantEventResponse { event_type, data } => {
                (*event_type, data.clone())
            }
            other => panic!("expected event message, got {}", other.name()),
        }
    }

    #[test]
    fn markers_carry_the_stream_id() {
        let (event_type, data) = marker_data(&marker_message(7, &RunMarker::RunStart));
        assert_eq!(event_type, voice_event::RUN_START);
        assert_eq!(data, vec![("stream_id".to_string(), "7".to_string())]);
    }

    #[test]
    fn transcript_rides_the_stt_end_marker() {
        let marker = RunMarker::SttEnd {
            transcript: "turn off the lab lights".to_string(),
        };
        let (event_type, data) = marker_data(&marker_message(3, &marker));
        assert_eq!(event_type, voice_event::STT_END);
        assert!(data.contains(&("text".to_string(), "turn off the lab lights".to_string())));
    }

    #[test]
    fn playback_url_rides_the_tts_end_marker() {
        let marker = RunMarker::TtsEnd {
            url: "http://10.0.0.2:8350/clips/a1.wav".to_string(),
        };
        let (event_type, data) = marker_data(&marker_message(3, &marker));
        assert_eq!(event_type, voice_event::TTS_END);
        assert!(data.contains(&("url".to_string(), "http://10.0.0.2:8350/clips/a1.wav".to_string())));
    }

    #[test]
    fn error_marker_carries_code_and_message() {
        let marker = RunMarker::Error {
            code: "stt-failed".to_string(),
            message: "no transcript".to_string(),
        };
        let (event_type, data) = marker_data(&marker_message(1, &marker));
        assert_eq!(event_type, voice_event::ERROR);
        assert!(data.contains(&("code".to_string(), "stt-failed".to_string())));
        assert!(data.contains(&("message".to_string(), "no transcript".to_string())));
    }
}
