//! Realtime speech agent
//!
//! Maintains the WebSocket session to the cloud speech model. The agent
//! task mirrors the satellite client's shape: one task owning the socket,
//! commands in, typed events out, connection state published on a watch.
//! On open it sends the session configuration; afterwards it streams
//! microphone audio up as base64 append events and surfaces response audio,
//! transcripts, turn signals, and tool invocations as [`AgentEvent`]s.
//!
//! Tool calls execute on their own spawned task so a slow tool never stalls
//! the inbound event stream; the result re-enters through the command
//! channel, which keeps the socket single-writer and guarantees the result
//! is sent before the follow-up response request.

pub mod protocol;
pub mod toolcall;
pub mod vad;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::audio::bytes_to_samples;
use crate::config::RealtimeConfig;
use crate::reconnect::{ConnectionState, delay_for_attempt};
use crate::{Error, Result};

pub use protocol::ServerEvent;
pub use toolcall::{ToolCallRegistry, ToolDispatcher, ToolOutcome};
pub use vad::SilenceDetector;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pause between a deliberate close and the reopen during reconfiguration.
const RECONFIGURE_PAUSE: Duration = Duration::from_millis(250);

/// Conversation-scoped session parameters. Immutable for a connection's
/// lifetime; changing them goes through [`AgentHandle::reconfigure`], which
/// restarts the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    /// Input transcription language hint (BCP-47), if known
    pub language: Option<String>,
    pub turn_detection: TurnDetection,
}

/// Who decides when the user's turn is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnDetection {
    /// The server's VAD commits turns and creates responses
    #[default]
    ServerVad,
    /// No server VAD; the local detector signals silence and the caller
    /// commits the turn explicitly
    Disabled,
}

/// Where a silence signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceSource {
    ServerVad,
    LocalVad,
}

/// Events the agent emits toward the session controller.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Socket open and session configuration sent
    Connected,
    /// Connection lost; the agent is already reconnecting
    Disconnected { reason: String },
    /// The user started speaking (server VAD)
    SpeechStarted,
    /// The user stopped speaking
    Silence { source: SilenceSource },
    /// The input audio buffer was committed into the conversation
    Committed,
    /// Transcript of what the user said
    InputTranscript { transcript: String },
    /// A response began streaming
    ResponseStarted,
    /// One chunk of response audio (24 kHz mono pcm16)
    AudioDelta(Bytes),
    /// Response audio finished streaming
    AudioDone,
    /// A piece of the spoken-response transcript
    TranscriptDelta { delta: String },
    /// The spoken-response transcript is complete
    TranscriptDone { transcript: String },
    /// A tool invocation is executing
    ToolCall { name: String },
    /// The response finished; when `tool_continuation` is set a follow-up
    /// response will stream once the tool result lands
    ResponseDone { tool_continuation: bool },
    /// The server reported an error inside the session
    SessionError { code: String, message: String },
}

#[derive(Debug)]
pub(crate) enum Command {
    Audio(Bytes),
    CommitTurn,
    Reconfigure(Box<SessionConfig>),
    ToolResult { call_id: String, payload: Value },
    Close,
}

/// Cheap cloneable handle to the agent task.
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl AgentHandle {
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

    /// Stream one microphone chunk (24 kHz mono pcm16) into the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] while the session is down.
    pub async fn append_audio(&self, pcm: Bytes) -> Result<()> {
        self.command(Command::Audio(pcm)).await
    }

    /// Commit the user's turn and request a response. Needed only when
    /// server turn detection is [`TurnDetection::Disabled`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] while the session is down.
    pub async fn commit_turn(&self) -> Result<()> {
        self.command(Command::CommitTurn).await
    }

    /// Restart the session with new parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] while the session is down.
    pub async fn reconfigure(&self, session: SessionConfig) -> Result<()> {
        self.command(Command::Reconfigure(Box::new(session))).await
    }

    /// Close the session deliberately and stop the agent task.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    async fn command(&self, command: Command) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ChannelClosed("agent commands"))
    }
}

/// Spawn the speech-agent task.
///
/// The dispatcher supplies the tool schemas advertised to the model and
/// executes whatever the model invokes.
#[must_use]
pub fn spawn(
    config: RealtimeConfig,
    tools: Arc<dyn ToolDispatcher>,
) -> (AgentHandle, mpsc::Receiver<AgentEvent>) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

    tokio::spawn(client_loop(
        config,
        tools,
        command_tx.clone(),
        command_rx,
        event_tx,
        state_tx,
    ));

    (
        AgentHandle {
            commands: command_tx,
            state: state_rx,
        },
        event_rx,
    )
}

/// A handle that reports connected and exposes its command stream, without
/// an agent task behind it.
#[cfg(test)]
pub(crate) fn test_handle() -> (AgentHandle, mpsc::Receiver<Command>) {
    let (commands, command_rx) = mpsc::channel(64);
    let (_state_tx, state) = watch::channel(ConnectionState::Connected);
    (AgentHandle { commands, state }, command_rx)
}

enum ConnectionExit {
    Shutdown,
    Restart,
    Dropped { connected: bool, reason: String },
}

#[allow(clippy::too_many_lines)]
async fn client_loop(
    config: RealtimeConfig,
    tools: Arc<dyn ToolDispatcher>,
    command_tx: mpsc::Sender<Command>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<AgentEvent>,
    state: watch::Sender<ConnectionState>,
) {
    let mut session = config.session.clone();
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let delay = delay_for_attempt(&config.retry, attempt - 1);
            state.send_replace(ConnectionState::Reconnecting);
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "agent reconnect backoff"
            );
            tokio::select! {
                () = sleep(delay) => {}
                cmd = commands.recv() => {
                    if matches!(cmd, None | Some(Command::Close)) {
                        break;
                    }
                    tracing::debug!("dropping command received while disconnected");
                }
            }
        }

        state.send_replace(ConnectionState::Connecting);
        let exit = run_connection(
            &config,
            &mut session,
            &tools,
            &command_tx,
            &mut commands,
            &events,
            &state,
        )
        .await;

        match exit {
            ConnectionExit::Shutdown => break,
            ConnectionExit::Restart => {
                state.send_replace(ConnectionState::Reconnecting);
                let _ = events
                    .send(AgentEvent::Disconnected {
                        reason: "reconfiguring".to_string(),
                    })
                    .await;
                sleep(RECONFIGURE_PAUSE).await;
                attempt = 0;
            }
            ConnectionExit::Dropped { connected, reason } => {
                state.send_replace(ConnectionState::Reconnecting);
                tracing::warn!(reason = %reason, "agent connection lost");
                let _ = events.send(AgentEvent::Disconnected { reason }).await;
                attempt = if connected { 1 } else { attempt.saturating_add(1) };
            }
        }
    }

    state.send_replace(ConnectionState::Closed);
    tracing::info!("speech agent stopped");
}

#[allow(clippy::too_many_lines)]
async fn run_connection(
    config: &RealtimeConfig,
    session: &mut SessionConfig,
    tools: &Arc<dyn ToolDispatcher>,
    command_tx: &mpsc::Sender<Command>,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<AgentEvent>,
    state: &watch::Sender<ConnectionState>,
) -> ConnectionExit {
    let dropped = |connected: bool, reason: String| ConnectionExit::Dropped { connected, reason };

    let request = match build_request(config) {
        Ok(request) => request,
        Err(e) => return dropped(false, e.to_string()),
    };

    tracing::debug!(endpoint = %config.endpoint, "dialing speech agent");
    let (mut ws, _response) = match connect_async(request).await {
        Ok(ok) => ok,
        Err(e) => return dropped(false, format!("connect failed: {e}")),
    };

    // Tool results from a previous session would target stale call ids
    loop {
        match commands.try_recv() {
            Ok(Command::Close) => {
                let _ = ws.close(None).await;
                return ConnectionExit::Shutdown;
            }
            Ok(_) => tracing::debug!("dropping command queued across reconnect"),
            Err(_) => break,
        }
    }

    let update = protocol::session_update(session, &tools.schemas());
    if let Err(e) = send_json(&mut ws, &update).await {
        return dropped(false, format!("session configuration failed: {e}"));
    }
    tracing::info!(model = %session.model, voice = %session.voice, "agent session open");

    state.send_replace(ConnectionState::Connected);
    if events.send(AgentEvent::Connected).await.is_err() {
        return ConnectionExit::Shutdown;
    }

    let mut registry = ToolCallRegistry::new();
    let mut detector = config
        .vad
        .enabled
        .then(|| SilenceDetector::new(config.vad.threshold, config.vad.hang));
    let mut last_pong = Instant::now();
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            incoming = ws.next() => {
                match incoming {
                    None => return dropped(true, "closed by server".to_string()),
                    Some(Err(e)) => return dropped(true, format!("socket error: {e}")),
                    Some(Ok(Message::Text(text))) => {
                        if handle_text(&text, &mut registry, tools, command_tx, events)
                            .await
                            .is_err()
                        {
                            return ConnectionExit::Shutdown;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) => {
                        return dropped(true, "close frame from server".to_string());
                    }
                    Some(Ok(_)) => {}
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    None | Some(Command::Close) => {
                        let _ = ws.close(None).await;
                        return ConnectionExit::Shutdown;
                    }
                    Some(Command::Audio(pcm)) => {
                        if let Some(detector) = detector.as_mut() {
                            let samples = bytes_to_samples(&pcm);
                            if detector.push(&samples, std::time::Instant::now()) {
                                tracing::debug!("local silence detected");
                                let silence = AgentEvent::Silence { source: SilenceSource::LocalVad };
                                if events.send(silence).await.is_err() {
                                    return ConnectionExit::Shutdown;
                                }
                            }
                        }
                        if let Err(e) = send_json(&mut ws, &protocol::audio_append(&pcm)).await {
                            return dropped(true, format!("audio append failed: {e}"));
                        }
                    }
                    Some(Command::CommitTurn) => {
                        let result = async {
                            send_json(&mut ws, &protocol::audio_commit()).await?;
                            send_json(&mut ws, &protocol::response_create()).await
                        }
                        .await;
                        if let Err(e) = result {
                            return dropped(true, format!("turn commit failed: {e}"));
                        }
                    }
                    Some(Command::Reconfigure(new_session)) => {
                        tracing::info!(voice = %new_session.voice, "reconfiguring agent session");
                        *session = *new_session;
                        let _ = ws.close(None).await;
                        return ConnectionExit::Restart;
                    }
                    Some(Command::ToolResult { call_id, payload }) => {
                        // Result first, then the follow-up response request
                        let result = async {
                            send_json(&mut ws, &protocol::tool_result(&call_id, &payload)).await?;
                            send_json(&mut ws, &protocol::response_create()).await
                        }
                        .await;
                        if let Err(e) = result {
                            return dropped(true, format!("tool result send failed: {e}"));
                        }
                    }
                }
            }

            _ = ping.tick() => {
                if last_pong.elapsed() > config.ping_interval * 2 {
                    return dropped(true, "ping timeout".to_string());
                }
                if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                    return dropped(true, format!("ping failed: {e}"));
                }
            }
        }
    }
}

/// Dispatch one inbound text message. The only error is a closed event
/// channel; unreadable messages are logged and dropped.
async fn handle_text(
    text: &str,
    registry: &mut ToolCallRegistry,
    tools: &Arc<dyn ToolDispatcher>,
    command_tx: &mpsc::Sender<Command>,
    events: &mpsc::Sender<AgentEvent>,
) -> Result<()> {
    let event = match protocol::parse_event(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "dropping unreadable server message");
            return Ok(());
        }
    };

    let emit = |event: AgentEvent| async {
        events
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed("agent events"))
    };

    match event {
        ServerEvent::SessionReady => tracing::debug!("session acknowledged"),
        ServerEvent::SpeechStarted => emit(AgentEvent::SpeechStarted).await?,
        ServerEvent::SpeechStopped => {
            emit(AgentEvent::Silence { source: SilenceSource::ServerVad }).await?;
        }
        ServerEvent::Committed => emit(AgentEvent::Committed).await?,
        ServerEvent::InputTranscript { transcript } => {
            emit(AgentEvent::InputTranscript { transcript }).await?;
        }
        ServerEvent::ResponseCreated => emit(AgentEvent::ResponseStarted).await?,
        ServerEvent::ToolCallAdded { call_id, name } => {
            registry.note_added(&call_id, &name);
            try_execute(&call_id, registry, tools, command_tx, events).await?;
        }
        ServerEvent::ToolArgsDelta { call_id, delta } => {
            registry.note_args_delta(&call_id, &delta);
        }
        ServerEvent::ToolArgsDone { call_id, name, arguments } => {
            registry.note_args_done(&call_id, name.as_deref(), arguments.as_deref());
            try_execute(&call_id, registry, tools, command_tx, events).await?;
        }
        ServerEvent::AudioDelta(pcm) => emit(AgentEvent::AudioDelta(pcm)).await?,
        ServerEvent::AudioDone => emit(AgentEvent::AudioDone).await?,
        ServerEvent::TranscriptDelta { delta } => {
            emit(AgentEvent::TranscriptDelta { delta }).await?;
        }
        ServerEvent::TranscriptDone { transcript } => {
            emit(AgentEvent::TranscriptDone { transcript }).await?;
        }
        ServerEvent::ResponseDone { tool_continuation } => {
            emit(AgentEvent::ResponseDone { tool_continuation }).await?;
        }
        ServerEvent::ServerError { code, message } => {
            tracing::warn!(code = %code, message = %message, "session error from server");
            emit(AgentEvent::SessionError { code, message }).await?;
        }
        ServerEvent::Unhandled { kind } => tracing::trace!(kind = %kind, "unhandled server event"),
    }
    Ok(())
}

/// Run the call on its own task if it has a name and completed arguments.
async fn try_execute(
    call_id: &str,
    registry: &mut ToolCallRegistry,
    tools: &Arc<dyn ToolDispatcher>,
    command_tx: &mpsc::Sender<Command>,
    events: &mpsc::Sender<AgentEvent>,
) -> Result<()> {
    let Some((name, args)) = registry.take_ready(call_id) else {
        return Ok(());
    };
    tracing::info!(tool = %name, call_id, "executing tool call");
    events
        .send(AgentEvent::ToolCall { name: name.clone() })
        .await
        .map_err(|_| Error::ChannelClosed("agent events"))?;

    let tools = Arc::clone(tools);
    let command_tx = command_tx.clone();
    let call_id = call_id.to_string();
    tokio::spawn(async move {
        let outcome = tools.dispatch(&name, args).await;
        if let ToolOutcome::Err { code, message } = &outcome {
            tracing::warn!(tool = %name, code = %code, message = %message, "tool call failed");
        }
        let payload = outcome.into_payload();
        if command_tx
            .send(Command::ToolResult { call_id, payload })
            .await
            .is_err()
        {
            tracing::warn!(tool = %name, "agent task gone before tool result could be delivered");
        }
    });
    Ok(())
}

fn build_request(config: &RealtimeConfig) -> Result<Request> {
    let mut request = config
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Realtime(format!("bad endpoint {}: {e}", config.endpoint)))?;
    if !config.api_key.is_empty() {
        let bearer = format!("Bearer {}", config.api_key);
        let value = HeaderValue::from_str(&bearer)
            .map_err(|_| Error::Realtime("api key is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", value);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
    }
    Ok(request)
}

async fn send_json(ws: &mut WsStream, message: &Value) -> Result<()> {
    let text = message.to_string();
    tracing::trace!(len = text.len(), "agent send");
    ws.send(Message::Text(text)).await?;
    Ok(())
}
