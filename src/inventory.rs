//! Device inventory collaborator and its agent-facing tools
//!
//! The bridge treats home-automation control as an injected capability set:
//! anything implementing [`DeviceInventory`] can answer zone/device queries
//! and apply capability writes. [`InventoryTools`] adapts an inventory into
//! the tool dispatcher the speech agent advertises to the model, and
//! [`FileInventory`] is a TOML-backed implementation so the bridge runs
//! without a real automation backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::realtime::{ToolDispatcher, ToolOutcome};
use crate::{Error, Result};

/// Devices returned per query page.
const PAGE_SIZE: usize = 20;

/// Result of an inventory operation; errors carry a machine-readable code
/// the model can react to.
pub type InventoryResult<T> = std::result::Result<T, InventoryError>;

/// A named area grouping devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

/// A device category such as `light` or `thermostat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: String,
    pub name: String,
}

/// One controllable device and its current capability values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Zone id the device belongs to
    pub zone: String,
    /// Device type id
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, Value>,
}

/// One page of device query results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPage {
    pub devices: Vec<Device>,
    pub page: usize,
    pub total: usize,
    pub has_more: bool,
}

/// Safety limits applied to capability writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteGuards {
    /// Most devices a single write may touch
    pub max_targets: usize,
    /// Validate the write and report targets without applying anything
    pub dry_run: bool,
}

impl Default for WriteGuards {
    fn default() -> Self {
        Self {
            max_targets: 10,
            dry_run: false,
        }
    }
}

/// Outcome of a capability write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    /// Device ids the write touched (or would touch under `dry_run`)
    pub written: Vec<String>,
    pub capability: String,
    pub dry_run: bool,
}

/// Structured inventory failure fed back into the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryError {
    pub code: String,
    pub message: String,
}

impl InventoryError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The capability-invocation collaborator the bridge is composed against.
#[async_trait]
pub trait DeviceInventory: Send + Sync {
    async fn list_zones(&self) -> InventoryResult<Vec<Zone>>;

    async fn list_device_types(&self) -> InventoryResult<Vec<DeviceType>>;

    /// Query devices, optionally narrowed by zone and type. Filters accept
    /// either an id or a display name (case-insensitive). Pages are
    /// zero-indexed and [`PAGE_SIZE`] long.
    async fn query_devices(
        &self,
        zone: Option<&str>,
        device_type: Option<&str>,
        page: usize,
    ) -> InventoryResult<QueryPage>;

    /// Apply one capability value to a set of devices, subject to `guards`.
    /// Targets are validated before anything is written, so a bad id fails
    /// the whole call without partial effects.
    async fn write_capability(
        &self,
        device_ids: &[String],
        capability_id: &str,
        value: &Value,
        guards: WriteGuards,
    ) -> InventoryResult<WriteReport>;
}

// -- file-backed implementation ----------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct InventoryData {
    #[serde(default)]
    zones: Vec<Zone>,
    #[serde(default)]
    device_types: Vec<DeviceType>,
    #[serde(default)]
    devices: Vec<Device>,
}

/// TOML-backed inventory. Reads reflect the loaded file; writes mutate the
/// in-memory copy only and are lost on restart.
pub struct FileInventory {
    inner: Mutex<InventoryData>,
}

impl FileInventory {
    /// Load an inventory file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Inventory`] when the file cannot be read and
    /// [`Error::Toml`] when it does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Inventory(format!("read {}: {e}", path.display())))?;
        let inventory = Self::from_toml(&raw)?;
        if let Ok(data) = inventory.inner.lock() {
            tracing::info!(
                path = %path.display(),
                zones = data.zones.len(),
                devices = data.devices.len(),
                "inventory loaded"
            );
        }
        Ok(inventory)
    }

    /// Parse an inventory from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Toml`] when the text does not parse.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let data: InventoryData = toml::from_str(raw)?;
        Ok(Self {
            inner: Mutex::new(data),
        })
    }

    /// An inventory with no zones or devices, for running the bridge
    /// without an automation backend.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(InventoryData::default()),
        }
    }

    fn locked(&self) -> InventoryResult<std::sync::MutexGuard<'_, InventoryData>> {
        self.inner
            .lock()
            .map_err(|_| InventoryError::new("inventory_unavailable", "inventory state poisoned"))
    }
}

/// Resolve a zone/type filter that may be an id or a display name.
fn resolve_filter<'a>(
    filter: &str,
    candidates: impl Iterator<Item = (&'a str, &'a str)>,
) -> Option<String> {
    for (id, name) in candidates {
        if id == filter || name.eq_ignore_ascii_case(filter) {
            return Some(id.to_string());
        }
    }
    None
}

#[async_trait]
impl DeviceInventory for FileInventory {
    async fn list_zones(&self) -> InventoryResult<Vec<Zone>> {
        Ok(self.locked()?.zones.clone())
    }

    async fn list_device_types(&self) -> InventoryResult<Vec<DeviceType>> {
        Ok(self.locked()?.device_types.clone())
    }

    async fn query_devices(
        &self,
        zone: Option<&str>,
        device_type: Option<&str>,
        page: usize,
    ) -> InventoryResult<QueryPage> {
        let data = self.locked()?;

        let zone_id = match zone {
            None => None,
            Some(filter) => Some(
                resolve_filter(
                    filter,
                    data.zones.iter().map(|z| (z.id.as_str(), z.name.as_str())),
                )
                .ok_or_else(|| {
                    InventoryError::new("unknown_zone", format!("no zone matches {filter:?}"))
                })?,
            ),
        };
        let type_id = match device_type {
            None => None,
            Some(filter) => Some(
                resolve_filter(
                    filter,
                    data.device_types
                        .iter()
                        .map(|t| (t.id.as_str(), t.name.as_str())),
                )
                .ok_or_else(|| {
                    InventoryError::new(
                        "unknown_device_type",
                        format!("no device type matches {filter:?}"),
                    )
                })?,
            ),
        };

        let matching: Vec<&Device> = data
            .devices
            .iter()
            .filter(|d| zone_id.as_deref().is_none_or(|z| d.zone == z))
            .filter(|d| type_id.as_deref().is_none_or(|t| d.device_type == t))
            .collect();

        let total = matching.len();
        let start = page.saturating_mul(PAGE_SIZE).min(total);
        let end = start.saturating_add(PAGE_SIZE).min(total);
        let devices = matching[start..end].iter().map(|d| (*d).clone()).collect();

        Ok(QueryPage {
            devices,
            page,
            total,
            has_more: end < total,
        })
    }

    async fn write_capability(
        &self,
        device_ids: &[String],
        capability_id: &str,
        value: &Value,
        guards: WriteGuards,
    ) -> InventoryResult<WriteReport> {
        if device_ids.is_empty() {
            return Err(InventoryError::new("no_targets", "no device ids given"));
        }
        if device_ids.len() > guards.max_targets {
            return Err(InventoryError::new(
                "too_many_targets",
                format!(
                    "write targets {} devices, limit is {}",
                    device_ids.len(),
                    guards.max_targets
                ),
            ));
        }

        let mut data = self.locked()?;

        // Validate every target before touching any of them
        for id in device_ids {
            if !data.devices.iter().any(|d| &d.id == id) {
                return Err(InventoryError::new(
                    "unknown_device",
                    format!("no device with id {id:?}"),
                ));
            }
        }

        if !guards.dry_run {
            for device in data.devices.iter_mut().filter(|d| device_ids.contains(&d.id)) {
                device
                    .capabilities
                    .insert(capability_id.to_string(), value.clone());
            }
        }

        tracing::info!(
            capability = capability_id,
            targets = device_ids.len(),
            dry_run = guards.dry_run,
            "capability write"
        );
        Ok(WriteReport {
            written: device_ids.to_vec(),
            capability: capability_id.to_string(),
            dry_run: guards.dry_run,
        })
    }
}

// -- agent tool surface ------------------------------------------------------

/// Tool surface the speech agent advertises over a [`DeviceInventory`].
pub struct InventoryTools {
    inventory: Arc<dyn DeviceInventory>,
    guards: WriteGuards,
}

impl InventoryTools {
    #[must_use]
    pub fn new(inventory: Arc<dyn DeviceInventory>, guards: WriteGuards) -> Self {
        Self { inventory, guards }
    }

    async fn query(&self, args: Value) -> ToolOutcome {
        #[derive(Deserialize)]
        struct QueryArgs {
            #[serde(default)]
            zone: Option<String>,
            #[serde(default, rename = "type")]
            device_type: Option<String>,
            #[serde(default)]
            page: usize,
        }

        let args: QueryArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return bad_arguments("query_devices", &e),
        };
        outcome(
            self.inventory
                .query_devices(args.zone.as_deref(), args.device_type.as_deref(), args.page)
                .await,
        )
    }

    async fn write(&self, args: Value) -> ToolOutcome {
        #[derive(Deserialize)]
        struct WriteArgs {
            device_ids: Vec<String>,
            capability: String,
            value: Value,
            #[serde(default)]
            dry_run: bool,
        }

        let args: WriteArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => return bad_arguments("write_capability", &e),
        };
        let guards = WriteGuards {
            max_targets: self.guards.max_targets,
            // The configured dry-run wins; the model may also request one
            dry_run: self.guards.dry_run || args.dry_run,
        };
        outcome(
            self.inventory
                .write_capability(&args.device_ids, &args.capability, &args.value, guards)
                .await,
        )
    }
}

fn outcome<T: Serialize>(result: InventoryResult<T>) -> ToolOutcome {
    match result {
        Ok(data) => match serde_json::to_value(data) {
            Ok(value) => ToolOutcome::Ok(value),
            Err(e) => ToolOutcome::Err {
                code: "serialization".to_string(),
                message: e.to_string(),
            },
        },
        Err(e) => ToolOutcome::Err {
            code: e.code,
            message: e.message,
        },
    }
}

fn bad_arguments(tool: &str, e: &serde_json::Error) -> ToolOutcome {
    ToolOutcome::Err {
        code: "bad_arguments".to_string(),
        message: format!("{tool}: {e}"),
    }
}

#[async_trait]
impl ToolDispatcher for InventoryTools {
    fn schemas(&self) -> Vec<Value> {
        vec![
            json!({
                "type": "function",
                "name": "list_zones",
                "description": "List the zones (rooms/areas) known to the home. Use zone ids in other calls.",
                "parameters": { "type": "object", "properties": {} }
            }),
            json!({
                "type": "function",
                "name": "list_device_types",
                "description": "List the device categories known to the home, such as lights or thermostats.",
                "parameters": { "type": "object", "properties": {} }
            }),
            json!({
                "type": "function",
                "name": "query_devices",
                "description": "Find devices, optionally narrowed to a zone and/or device type. Results are paged.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "zone": {
                            "type": "string",
                            "description": "Zone id or name to filter by"
                        },
                        "type": {
                            "type": "string",
                            "description": "Device type id or name to filter by"
                        },
                        "page": {
                            "type": "integer",
                            "description": "Zero-indexed result page (default 0)"
                        }
                    }
                }
            }),
            json!({
                "type": "function",
                "name": "write_capability",
                "description": "Set one capability value on one or more devices, e.g. switch=on or level=40.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "device_ids": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Device ids from query_devices"
                        },
                        "capability": {
                            "type": "string",
                            "description": "Capability id to write, e.g. switch, level, thermostat_setpoint"
                        },
                        "value": {
                            "description": "New capability value; type depends on the capability"
                        },
                        "dry_run": {
                            "type": "boolean",
                            "description": "Validate and report targets without changing anything"
                        }
                    },
                    "required": ["device_ids", "capability", "value"]
                }
            }),
        ]
    }

    async fn dispatch(&self, name: &str, args: Value) -> ToolOutcome {
        match name {
            "list_zones" => outcome(self.inventory.list_zones().await),
            "list_device_types" => outcome(self.inventory.list_device_types().await),
            "query_devices" => self.query(args).await,
            "write_capability" => self.write(args).await,
            _ => ToolOutcome::Err {
                code: "unknown_tool".to_string(),
                message: format!("no tool named {name}"),
            },
        }
    }
}
