//! Bridge - the main chirp service
//!
//! Wires the satellite client, the speech agent, clip hosting, and the
//! session controller together and runs until interrupted.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::BridgeConfig;
use crate::hosting::{advertised_host, AudioHost, ClipHost};
use crate::inventory::{DeviceInventory, FileInventory, InventoryTools};
use crate::realtime::{self, ToolDispatcher};
use crate::satellite;
use crate::session::SessionController;
use crate::{Error, Result};

/// The chirp bridge - one satellite, one speech agent, one conversation
/// at a time.
pub struct Bridge {
    config: BridgeConfig,
}

impl Bridge {
    /// Create a new bridge instance
    #[must_use]
    pub const fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Run the bridge until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the inventory fails to load, the clip server
    /// cannot bind, or a background task panics.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            device = %self.config.device.host,
            port = self.config.device.port,
            "bridge running"
        );

        let inventory = self.load_inventory()?;
        let tools: Arc<dyn ToolDispatcher> =
            Arc::new(InventoryTools::new(inventory, self.config.inventory.guards));

        let bind = self.config.hosting.bind_addr()?;
        let public_base = self.public_base(bind.ip());
        tracing::info!(base = %public_base, "clips served from");

        let clip_host = ClipHost::new(bind, &public_base, self.config.hosting.clip_cap);
        let mut clip_server = clip_host.spawn();
        let host: Arc<dyn AudioHost> = Arc::new(clip_host);

        let (satellite, satellite_events) = satellite::spawn(self.config.device.clone());
        let (agent, agent_events) = realtime::spawn(self.config.realtime.clone(), tools);

        let controller = SessionController::new(
            satellite.clone(),
            satellite_events,
            agent.clone(),
            agent_events,
            host,
            self.config.realtime.session.turn_detection,
            self.config.audio.frame_ms,
        );
        let mut controller_task = tokio::spawn(controller.run());

        // Set up shutdown signal
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        tokio::select! {
            result = &mut controller_task => {
                // Both client tasks are gone; nothing left to bridge
                tracing::warn!("session controller exited");
                if let Err(e) = result {
                    tracing::error!(error = %e, "controller task panicked");
                }
            }
            result = &mut clip_server => {
                match result {
                    Ok(inner) => inner?,
                    Err(e) => return Err(Error::Hosting(format!("clip server task failed: {e}"))),
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("shutting down");
                satellite.shutdown().await;
                agent.close().await;
                let _ = controller_task.await;
            }
        }
        clip_server.abort();

        tracing::info!("bridge stopped");
        Ok(())
    }

    fn load_inventory(&self) -> Result<Arc<dyn DeviceInventory>> {
        match &self.config.inventory.path {
            Some(path) => {
                let inventory = FileInventory::load(path)?;
                tracing::info!(path = %path.display(), "device inventory loaded");
                Ok(Arc::new(inventory))
            }
            None => {
                tracing::info!("no device inventory configured, starting empty");
                Ok(Arc::new(FileInventory::empty()))
            }
        }
    }

    /// Base URL the satellite fetches clips from.
    ///
    /// An explicit `public_host` wins; otherwise the local address on the
    /// route to the device, falling back to the bind address.
    fn public_base(&self, bind_ip: IpAddr) -> String {
        let host = self.config.hosting.public_host.clone().unwrap_or_else(|| {
            let ip = advertised_host(&self.config.device.host, self.config.device.port)
                .unwrap_or(bind_ip);
            url_host(ip)
        });
        format!("http://{host}:{}", self.config.hosting.port)
    }
}

/// Format an IP for use inside a URL (IPv6 needs brackets).
fn url_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}
