//! Configuration management for the chirp bridge
//!
//! Precedence is env > `~/.config/omni/chirp/config.toml` > defaults.
//! The runtime structs here are fully resolved; the file overlay lives in
//! [`file`].

pub mod file;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::realtime::{SessionConfig, TurnDetection};
use crate::reconnect::RetryPolicy;
use crate::{Error, Result};

/// Default instructions sent with every session configuration.
const DEFAULT_INSTRUCTIONS: &str = "You are a voice assistant for a smart home, \
speaking through a small satellite device. Keep answers short and conversational. \
Use the inventory tools to look up zones and devices before controlling anything, \
and confirm what you changed.";

/// Complete bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Satellite device link
    pub device: DeviceConfig,

    /// Realtime speech session
    pub realtime: RealtimeConfig,

    /// Clip hosting for device playback
    pub hosting: HostingConfig,

    /// Device inventory backing the agent tools
    pub inventory: InventoryConfig,

    /// Audio pipeline tunables
    pub audio: AudioConfig,
}

/// Satellite device connection configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device hostname or IP
    pub host: String,

    /// Native API port
    pub port: u16,

    /// Native API password, if the device requires one
    pub password: Option<String>,

    /// Client identification sent during the handshake
    pub client_info: String,

    /// Keepalive ping interval
    pub ping_interval: Duration,

    /// Drop the connection after this long without any inbound frame
    pub activity_timeout: Duration,

    /// Minimum volume delta that counts as a change
    pub volume_tolerance: f32,

    /// Reconnect backoff policy
    pub retry: RetryPolicy,
}

/// Realtime speech session configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// API key; sent as a bearer token when non-empty
    pub api_key: String,

    /// Full WebSocket endpoint including the model query parameter
    pub endpoint: String,

    /// Conversation-scoped session parameters
    pub session: SessionConfig,

    /// Liveness ping interval
    pub ping_interval: Duration,

    /// Local silence detection on outgoing mic audio
    pub vad: VadConfig,

    /// Reconnect backoff policy
    pub retry: RetryPolicy,
}

/// Local silence detection configuration
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub enabled: bool,

    /// RMS threshold as a fraction of full scale
    pub threshold: f32,

    /// Silence must persist this long before the detector fires
    pub hang: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.015,
            hang: Duration::from_millis(1200),
        }
    }
}

/// Clip hosting configuration
#[derive(Debug, Clone)]
pub struct HostingConfig {
    /// Bind address for the clip server
    pub bind: String,

    /// Listen port
    pub port: u16,

    /// Host the device fetches clips from; autodetected from the route to
    /// the device when unset
    pub public_host: Option<String>,

    /// Number of recent clips to retain
    pub clip_cap: usize,
}

impl HostingConfig {
    /// Socket address to bind the clip server on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the bind address does not parse.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("bad hosting bind address: {e}")))
    }
}

/// Inventory configuration
#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Inventory TOML file; an empty inventory is used when unset or missing
    pub path: Option<PathBuf>,

    /// Guards applied to capability writes
    pub guards: crate::inventory::WriteGuards,
}

/// Audio pipeline configuration
#[derive(Debug, Clone, Copy)]
pub struct AudioConfig {
    /// Playback frame length in milliseconds
    pub frame_ms: u32,
}

fn retry_policy(fc: &file::RetryFileConfig) -> RetryPolicy {
    let defaults = RetryPolicy::default();
    RetryPolicy {
        base_delay: fc
            .base_delay_ms
            .map_or(defaults.base_delay, Duration::from_millis),
        max_delay: fc
            .max_delay_ms
            .map_or(defaults.max_delay, Duration::from_millis),
    }
}

impl BridgeConfig {
    /// Load configuration, with `device_host` (from the CLI) taking top
    /// precedence for the satellite address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no satellite host is configured
    /// anywhere.
    pub fn load(device_host: Option<String>) -> Result<Self> {
        let fc = file::load_config_file();

        let host = device_host
            .or_else(|| std::env::var("CHIRP_DEVICE_HOST").ok())
            .or(fc.device.host)
            .ok_or_else(|| {
                Error::Config(
                    "no satellite host configured (set --host, CHIRP_DEVICE_HOST, \
                     or device.host in config.toml)"
                        .to_string(),
                )
            })?;

        let device = DeviceConfig {
            host,
            port: std::env::var("CHIRP_DEVICE_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(fc.device.port)
                .unwrap_or(6053),
            password: std::env::var("CHIRP_DEVICE_PASSWORD")
                .ok()
                .or(fc.device.password),
            client_info: format!("chirp-bridge {}", env!("CARGO_PKG_VERSION")),
            ping_interval: Duration::from_millis(fc.device.ping_interval_ms.unwrap_or(20_000)),
            activity_timeout: Duration::from_millis(
                fc.device.activity_timeout_ms.unwrap_or(90_000),
            ),
            volume_tolerance: fc.device.volume_tolerance.unwrap_or(0.005),
            retry: retry_policy(&fc.device.retry),
        };

        let model = std::env::var("CHIRP_REALTIME_MODEL")
            .ok()
            .or(fc.realtime.model)
            .unwrap_or_else(|| "gpt-realtime".to_string());
        let endpoint = std::env::var("CHIRP_REALTIME_ENDPOINT")
            .ok()
            .or(fc.realtime.endpoint)
            .unwrap_or_else(|| format!("wss://api.openai.com/v1/realtime?model={model}"));
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .or(fc.realtime.api_key)
            .unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!("no API key configured, the realtime session will be unauthenticated");
        }

        let server_vad = fc.realtime.server_vad.unwrap_or(true);
        let vad_defaults = VadConfig::default();
        let vad = VadConfig {
            // Without server VAD someone has to end the turn locally
            enabled: fc.realtime.vad.enabled.unwrap_or(!server_vad),
            threshold: fc.realtime.vad.threshold.unwrap_or(vad_defaults.threshold),
            hang: fc
                .realtime
                .vad
                .hang_ms
                .map_or(vad_defaults.hang, Duration::from_millis),
        };

        let realtime = RealtimeConfig {
            api_key,
            endpoint,
            session: SessionConfig {
                model,
                voice: std::env::var("CHIRP_VOICE")
                    .ok()
                    .or(fc.realtime.voice)
                    .unwrap_or_else(|| "alloy".to_string()),
                instructions: fc
                    .realtime
                    .instructions
                    .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string()),
                language: fc.realtime.language,
                turn_detection: if server_vad {
                    TurnDetection::ServerVad
                } else {
                    TurnDetection::Disabled
                },
            },
            ping_interval: Duration::from_millis(fc.realtime.ping_interval_ms.unwrap_or(15_000)),
            vad,
            retry: retry_policy(&fc.realtime.retry),
        };

        let hosting = HostingConfig {
            bind: fc.hosting.bind.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: std::env::var("CHIRP_HOSTING_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(fc.hosting.port)
                .unwrap_or(8350),
            public_host: std::env::var("CHIRP_PUBLIC_HOST")
                .ok()
                .or(fc.hosting.public_host),
            clip_cap: fc.hosting.clip_cap.unwrap_or(32),
        };

        let inventory = InventoryConfig {
            path: std::env::var("CHIRP_INVENTORY")
                .ok()
                .or(fc.inventory.path)
                .map(PathBuf::from)
                .or_else(default_inventory_path),
            guards: crate::inventory::WriteGuards {
                max_targets: fc.inventory.max_write_targets.unwrap_or(10),
                dry_run: fc.inventory.dry_run.unwrap_or(false),
            },
        };

        let audio = AudioConfig {
            frame_ms: fc.audio.frame_ms.unwrap_or(20),
        };

        Ok(Self {
            device,
            realtime,
            hosting,
            inventory,
            audio,
        })
    }
}

/// `~/.config/omni/chirp/inventory.toml`, used when it exists.
fn default_inventory_path() -> Option<PathBuf> {
    let path = file::config_file_path()?.with_file_name("inventory.toml");
    path.exists().then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vad_defaults_are_the_shipped_tunables() {
        let vad = VadConfig::default();
        assert!(!vad.enabled);
        assert!((vad.threshold - 0.015).abs() < f32::EPSILON);
        assert_eq!(vad.hang, Duration::from_millis(1200));
    }

    #[test]
    fn bind_addr_parses() {
        let hosting = HostingConfig {
            bind: "0.0.0.0".to_string(),
            port: 8350,
            public_host: None,
            clip_cap: 32,
        };
        assert_eq!(hosting.bind_addr().unwrap().port(), 8350);

        let bad = HostingConfig {
            bind: "not-an-ip".to_string(),
            ..hosting
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn retry_overlay_keeps_unset_defaults() {
        let fc = file::RetryFileConfig {
            base_delay_ms: Some(250),
            max_delay_ms: None,
        };
        let policy = retry_policy(&fc);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);
    }
}
