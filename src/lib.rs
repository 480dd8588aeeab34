//! Chirp Bridge - voice satellite to realtime speech bridge
//!
//! This library connects an ESPHome voice satellite to a realtime speech
//! API and gives the model tools over a home device inventory:
//! - Satellite client speaking the ESPHome native API (plaintext framing)
//! - Realtime speech client (WebSocket, server or local turn detection)
//! - Sample-rate conversion between the device and agent clocks
//! - Clip hosting so the device can fetch responses over HTTP
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐  native API (TCP)   ┌──────────────────────┐
//! │ ESPHome satellite │◄───────────────────►│     chirp bridge     │
//! │   mic / speaker   │   PCM16 @ 16 kHz    │  session controller  │
//! └─────────┬─────────┘                     │  resample 16↔24 kHz  │
//!           │  HTTP clip fetch              │  clip hosting        │
//!           └────────────────────────────►  │  inventory tools     │
//!                                           └──────────┬───────────┘
//!                                                      │ WebSocket
//!                                                      │ PCM16 @ 24 kHz
//!                                           ┌──────────▼───────────┐
//!                                           │ realtime speech API  │
//!                                           └──────────────────────┘
//! ```

pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod hosting;
pub mod inventory;
pub mod realtime;
pub mod reconnect;
pub mod satellite;
pub mod session;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use hosting::{AudioClip, AudioHost, ClipHost};
pub use inventory::{
    Device, DeviceInventory, DeviceType, FileInventory, InventoryTools, QueryPage, WriteGuards,
    WriteReport, Zone,
};
pub use realtime::{AgentEvent, AgentHandle, SessionConfig, ToolDispatcher, TurnDetection};
pub use reconnect::{ConnectionState, RetryPolicy};
pub use satellite::{DeviceInfo, RunMarker, SatelliteEvent, SatelliteHandle};
pub use session::{ConversationState, SessionController};
