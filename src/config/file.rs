//! TOML configuration file loading
//!
//! Supports `~/.config/omni/chirp/config.toml` as a persistent config source.
//! All fields are optional — the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ChirpConfigFile {
    /// Satellite device connection
    #[serde(default)]
    pub device: DeviceFileConfig,

    /// Realtime speech session
    #[serde(default)]
    pub realtime: RealtimeFileConfig,

    /// Clip hosting for device playback
    #[serde(default)]
    pub hosting: HostingFileConfig,

    /// Device inventory backing the agent tools
    #[serde(default)]
    pub inventory: InventoryFileConfig,

    /// Audio pipeline tunables
    #[serde(default)]
    pub audio: AudioFileConfig,
}

/// Satellite device configuration
#[derive(Debug, Default, Deserialize)]
pub struct DeviceFileConfig {
    /// Device hostname or IP
    pub host: Option<String>,

    /// Native API port (default 6053)
    pub port: Option<u16>,

    /// Native API password, if the device requires one
    pub password: Option<String>,

    /// Keepalive ping interval in milliseconds
    pub ping_interval_ms: Option<u64>,

    /// Drop the connection after this long without any inbound frame
    pub activity_timeout_ms: Option<u64>,

    /// Minimum volume delta that counts as a change
    pub volume_tolerance: Option<f32>,

    #[serde(default)]
    pub retry: RetryFileConfig,
}

/// Realtime session configuration
#[derive(Debug, Default, Deserialize)]
pub struct RealtimeFileConfig {
    /// API key (`OPENAI_API_KEY` takes precedence)
    pub api_key: Option<String>,

    /// Full WebSocket endpoint; overrides the model-derived default
    pub endpoint: Option<String>,

    /// Model identifier (e.g. "gpt-realtime")
    pub model: Option<String>,

    /// Response voice identifier (e.g. "alloy")
    pub voice: Option<String>,

    /// System instructions for the assistant
    pub instructions: Option<String>,

    /// Input transcription language hint (BCP-47, e.g. "en")
    pub language: Option<String>,

    /// Let the server's VAD commit turns (default true)
    pub server_vad: Option<bool>,

    /// Liveness ping interval in milliseconds
    pub ping_interval_ms: Option<u64>,

    #[serde(default)]
    pub vad: VadFileConfig,

    #[serde(default)]
    pub retry: RetryFileConfig,
}

/// Local silence detection
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    /// Run the local RMS silence detector on outgoing mic audio
    pub enabled: Option<bool>,

    /// RMS threshold as a fraction of full scale
    pub threshold: Option<f32>,

    /// Silence must persist this long before the detector fires
    pub hang_ms: Option<u64>,
}

/// Reconnect backoff
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    /// First retry delay in milliseconds
    pub base_delay_ms: Option<u64>,

    /// Delay cap in milliseconds
    pub max_delay_ms: Option<u64>,
}

/// Clip hosting configuration
#[derive(Debug, Default, Deserialize)]
pub struct HostingFileConfig {
    /// Bind address (default "0.0.0.0")
    pub bind: Option<String>,

    /// Listen port (default 8350)
    pub port: Option<u16>,

    /// Host the device fetches clips from; autodetected when unset
    pub public_host: Option<String>,

    /// Number of recent clips to retain
    pub clip_cap: Option<usize>,
}

/// Inventory configuration
#[derive(Debug, Default, Deserialize)]
pub struct InventoryFileConfig {
    /// Path to the inventory TOML file
    pub path: Option<String>,

    /// Most devices one capability write may touch
    pub max_write_targets: Option<usize>,

    /// Report writes without applying them
    pub dry_run: Option<bool>,
}

/// Audio pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Playback frame length in milliseconds
    pub frame_ms: Option<u32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ChirpConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ChirpConfigFile {
    let Some(path) = config_file_path() else {
        return ChirpConfigFile::default();
    };

    if !path.exists() {
        return ChirpConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ChirpConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ChirpConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/chirp/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("chirp")
            .join("config.toml")
    })
}
