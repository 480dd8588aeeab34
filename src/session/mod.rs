//! Conversation session controller
//!
//! The turn-taking state machine that wires the satellite client and the
//! speech agent together. It is the single consumer of both event streams
//! and the only piece that talks to the external collaborators (device
//! inventory via the agent's tool dispatcher, audio hosting).
//!
//! One turn: the device starts a run, mic audio is upsampled and streamed
//! to the agent until silence, the response streams back as audio deltas
//! that are downsampled and accumulated, and the finished clip is published
//! once and played on the device. Lifecycle markers bracket each phase so
//! the satellite can drive its LEDs and display.
//!
//! The controller never retries business logic; connection recovery belongs
//! to the two client tasks, and a dropped connection simply abandons the
//! turn in flight.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::audio::resample::{Interpolation, RateConverter};
use crate::audio::segment::FrameSegmenter;
use crate::audio::DEVICE_SAMPLE_RATE;
use crate::hosting::AudioHost;
use crate::realtime::{AgentEvent, AgentHandle, SilenceSource, TurnDetection};
use crate::satellite::{RunMarker, SatelliteEvent, SatelliteHandle};

/// Where the controller is within a turn.
///
/// Microphone audio is forwarded iff `Listening`; response audio is
/// accumulated from `Speaking` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    #[default]
    Idle,
    Listening,
    Committed,
    ToolExchange,
    Speaking,
}

/// State accumulated over one turn, reset on every run boundary.
#[derive(Debug, Default)]
struct Turn {
    conversation_id: String,
    /// `SttEnd` has been sent
    stt_done: bool,
    /// `IntentEnd` has been sent
    intent_ended: bool,
    /// `TtsStart` has been sent
    speaking: bool,
    input_transcript: String,
    response_transcript: String,
    /// Response audio at the device rate, grown frame by frame
    clip: Vec<u8>,
}

pub struct SessionController {
    satellite: SatelliteHandle,
    agent: AgentHandle,
    satellite_events: mpsc::Receiver<SatelliteEvent>,
    agent_events: mpsc::Receiver<AgentEvent>,
    host: Arc<dyn AudioHost>,
    state: ConversationState,
    turn: Turn,
    upsampler: RateConverter,
    downsampler: RateConverter,
    segmenter: FrameSegmenter,
    /// Local silence must commit the turn when server VAD is off
    commit_on_silence: bool,
}

impl SessionController {
    #[must_use]
    pub fn new(
        satellite: SatelliteHandle,
        satellite_events: mpsc::Receiver<SatelliteEvent>,
        agent: AgentHandle,
        agent_events: mpsc::Receiver<AgentEvent>,
        host: Arc<dyn AudioHost>,
        turn_detection: TurnDetection,
        frame_ms: u32,
    ) -> Self {
        Self {
            satellite,
            agent,
            satellite_events,
            agent_events,
            host,
            state: ConversationState::Idle,
            turn: Turn::default(),
            upsampler: RateConverter::upsampler(),
            downsampler: RateConverter::downsampler(Interpolation::CatmullRom),
            segmenter: FrameSegmenter::new(DEVICE_SAMPLE_RATE, frame_ms),
            commit_on_silence: matches!(turn_detection, TurnDetection::Disabled),
        }
    }

    /// Current conversation state.
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.state
    }

    /// Consume events until both clients have shut down.
    pub async fn run(mut self) {
        tracing::info!("session controller running");
        loop {
            tokio::select! {
                event = self.satellite_events.recv() => match event {
                    Some(event) => self.on_satellite(event).await,
                    None => break,
                },
                event = self.agent_events.recv() => match event {
                    Some(event) => self.on_agent(event).await,
                    None => break,
                },
            }
        }
        tracing::info!("session controller stopped");
    }

    async fn on_satellite(&mut self, event: SatelliteEvent) {
        match event {
            SatelliteEvent::Connected(info) => {
                tracing::info!(
                    device = %info.friendly_name,
                    version = %info.esphome_version,
                    "satellite ready"
                );
            }
            SatelliteEvent::Disconnected { reason } => {
                if self.state != ConversationState::Idle {
                    tracing::warn!(reason = %reason, "satellite dropped mid-turn, abandoning turn");
                    self.reset_turn();
                }
            }
            SatelliteEvent::RunStarted { conversation_id } => self.begin_turn(conversation_id).await,
            SatelliteEvent::RunStopped => {
                if self.state != ConversationState::Idle {
                    tracing::info!("device ended the run");
                    self.marker(RunMarker::RunEnd).await;
                    self.reset_turn();
                }
            }
            SatelliteEvent::MicAudio(pcm) => self.forward_mic(&pcm).await,
            SatelliteEvent::VolumeChanged(volume) => {
                tracing::debug!(volume, "device volume changed");
            }
            SatelliteEvent::MuteChanged(muted) => {
                tracing::debug!(muted, "device mute changed");
            }
        }
    }

    async fn on_agent(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Connected => tracing::info!("speech agent ready"),
            AgentEvent::Disconnected { reason } => {
                if self.state != ConversationState::Idle {
                    tracing::warn!(reason = %reason, "agent dropped mid-turn, releasing device");
                    self.marker(RunMarker::Error {
                        code: "agent_disconnected".to_string(),
                        message: reason,
                    })
                    .await;
                    self.marker(RunMarker::RunEnd).await;
                    self.reset_turn();
                }
            }
            AgentEvent::SpeechStarted => tracing::debug!("speech detected"),
            AgentEvent::Silence { source } => self.on_silence(source).await,
            AgentEvent::Committed => {
                // Server VAD can commit before we saw its silence signal
                if self.state == ConversationState::Listening {
                    self.stop_listening().await;
                }
            }
            AgentEvent::InputTranscript { transcript } => {
                if self.state != ConversationState::Idle {
                    tracing::info!(transcript = %transcript, "user said");
                    self.turn.input_transcript = transcript;
                    self.finish_stt().await;
                }
            }
            AgentEvent::ResponseStarted => {
                // The transcription may never arrive; close the STT phase
                // with whatever we have before response markers start
                if self.state != ConversationState::Idle {
                    self.finish_stt().await;
                }
            }
            AgentEvent::ToolCall { name } => {
                if self.state != ConversationState::Idle {
                    tracing::info!(tool = %name, "tool exchange");
                    self.state = ConversationState::ToolExchange;
                }
            }
            AgentEvent::AudioDelta(pcm) => self.on_audio_delta(&pcm).await,
            AgentEvent::AudioDone => {}
            AgentEvent::TranscriptDelta { delta } => {
                if self.state != ConversationState::Idle {
                    self.turn.response_transcript.push_str(&delta);
                }
            }
            AgentEvent::TranscriptDone { transcript } => {
                if self.state != ConversationState::Idle {
                    self.turn.response_transcript = transcript;
                }
            }
            AgentEvent::ResponseDone { tool_continuation } => {
                self.on_response_done(tool_continuation).await;
            }
            AgentEvent::SessionError { code, message } => {
                tracing::warn!(code = %code, message = %message, "session error");
                if self.state != ConversationState::Idle {
                    self.marker(RunMarker::Error { code, message }).await;
                    self.marker(RunMarker::RunEnd).await;
                    self.reset_turn();
                }
            }
        }
    }

    async fn begin_turn(&mut self, conversation_id: String) {
        if self.state != ConversationState::Idle {
            tracing::warn!("run started while a turn is active, resetting");
            self.reset_turn();
        }
        tracing::info!(conversation = %conversation_id, "turn started");
        self.turn = Turn {
            conversation_id,
            ..Turn::default()
        };
        self.state = ConversationState::Listening;
        self.marker(RunMarker::RunStart).await;
        self.marker(RunMarker::SttStart).await;
    }

    async fn forward_mic(&mut self, pcm: &[u8]) {
        if self.state != ConversationState::Listening {
            return;
        }
        let upsampled = self.upsampler.push(pcm);
        if upsampled.is_empty() {
            return;
        }
        if let Err(e) = self.agent.append_audio(Bytes::from(upsampled)).await {
            tracing::debug!(error = %e, "mic chunk dropped");
        }
    }

    async fn on_silence(&mut self, source: SilenceSource) {
        if self.state != ConversationState::Listening {
            return;
        }
        tracing::debug!(?source, "end of user speech");
        self.stop_listening().await;
        if source == SilenceSource::LocalVad && self.commit_on_silence {
            if let Err(e) = self.agent.commit_turn().await {
                tracing::warn!(error = %e, "turn commit failed");
            }
        }
    }

    async fn stop_listening(&mut self) {
        // The upsampler tail still belongs to this utterance
        let tail = self.upsampler.flush();
        if !tail.is_empty() {
            if let Err(e) = self.agent.append_audio(Bytes::from(tail)).await {
                tracing::debug!(error = %e, "mic tail dropped");
            }
        }
        self.state = ConversationState::Committed;
    }

    async fn finish_stt(&mut self) {
        if self.turn.stt_done || self.state == ConversationState::Idle {
            return;
        }
        self.turn.stt_done = true;
        let transcript = self.turn.input_transcript.clone();
        self.marker(RunMarker::SttEnd { transcript }).await;
        self.marker(RunMarker::IntentStart).await;
    }

    async fn ensure_intent_ended(&mut self) {
        if self.turn.intent_ended || self.state == ConversationState::Idle {
            return;
        }
        self.finish_stt().await;
        self.turn.intent_ended = true;
        self.marker(RunMarker::IntentEnd).await;
    }

    async fn on_audio_delta(&mut self, pcm: &[u8]) {
        if self.state == ConversationState::Idle {
            return;
        }
        self.ensure_intent_ended().await;
        if !self.turn.speaking {
            self.turn.speaking = true;
            let text = self.turn.response_transcript.clone();
            self.marker(RunMarker::TtsStart { text }).await;
        }
        self.state = ConversationState::Speaking;
        let pcm16k = self.downsampler.push(pcm);
        for frame in self.segmenter.feed(&pcm16k) {
            self.turn.clip.extend_from_slice(&frame.bytes);
        }
    }

    async fn on_response_done(&mut self, tool_continuation: bool) {
        if self.state == ConversationState::Idle {
            return;
        }
        if tool_continuation {
            tracing::debug!("response paused for tool results");
            self.state = ConversationState::ToolExchange;
            return;
        }
        self.ensure_intent_ended().await;

        let tail = self.downsampler.flush();
        for frame in self.segmenter.feed(&tail) {
            self.turn.clip.extend_from_slice(&frame.bytes);
        }
        if let Some(frame) = self.segmenter.flush() {
            self.turn.clip.extend_from_slice(&frame.bytes);
        }

        if self.turn.clip.is_empty() {
            tracing::info!("response had no audio");
        } else {
            match self.host.publish(&self.turn.clip, DEVICE_SAMPLE_RATE).await {
                Ok(clip) => {
                    self.marker(RunMarker::TtsEnd {
                        url: clip.url.clone(),
                    })
                    .await;
                    if let Err(e) = self.satellite.play_url(clip.url).await {
                        tracing::warn!(error = %e, "playback command failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "clip publish failed");
                    self.marker(RunMarker::Error {
                        code: "hosting".to_string(),
                        message: e.to_string(),
                    })
                    .await;
                }
            }
        }

        self.marker(RunMarker::RunEnd).await;
        tracing::info!(conversation = %self.turn.conversation_id, "turn complete");
        self.reset_turn();
    }

    fn reset_turn(&mut self) {
        self.state = ConversationState::Idle;
        self.turn = Turn::default();
        self.upsampler.reset();
        self.downsampler.reset();
        let _ = self.segmenter.flush();
    }

    async fn marker(&self, marker: RunMarker) {
        if let Err(e) = self.satellite.send_marker(marker).await {
            tracing::debug!(error = %e, "marker not delivered");
        }
    }
}
