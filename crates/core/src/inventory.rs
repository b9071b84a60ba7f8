use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sysinfo::Disks;
use tracing::{debug, warn};

use crate::controller::parse_location;
use crate::error::InventoryError;
use crate::model::{ControllerRecord, DeviceRecord};

/// Source of block-device and storage-controller descriptors.
pub trait DeviceInventory: Send {
    fn list_storage_devices(&self) -> Result<Vec<DeviceRecord>, InventoryError>;

    fn list_storage_controllers(&self) -> Result<Vec<ControllerRecord>, InventoryError>;

    fn map_drive_to_device_path(&self, drive_letter: &str) -> Option<String> {
        let wanted = normalize_drive(drive_letter);
        match self.list_storage_devices() {
            Ok(devices) => devices
                .into_iter()
                .find(|device| {
                    device
                        .drive_letter
                        .as_deref()
                        .is_some_and(|letter| normalize_drive(letter).eq_ignore_ascii_case(&wanted))
                })
                .map(|device| device.device_path),
            Err(err) => {
                warn!("device path lookup for {drive_letter} failed: {err}");
                None
            }
        }
    }

    fn volume_capacity(&self, drive_letter: &str) -> u64;
}

pub fn default_inventory() -> Box<dyn DeviceInventory> {
    #[cfg(windows)]
    {
        Box::new(CimInventory::default())
    }
    #[cfg(not(windows))]
    {
        Box::new(SysinfoInventory)
    }
}

const DISK_QUERY: &str = "$ErrorActionPreference='Stop'; \
$rows = @(Get-CimInstance Win32_DiskDrive | ForEach-Object { $disk = $_; \
$letters = @(Get-CimAssociatedInstance -InputObject $disk -ResultClassName Win32_DiskPartition | \
ForEach-Object { Get-CimAssociatedInstance -InputObject $_ -ResultClassName Win32_LogicalDisk } | \
ForEach-Object { $_.DeviceID }); \
[pscustomobject]@{ DeviceID = $disk.DeviceID; Model = $disk.Model; Caption = $disk.Caption; \
Description = $disk.Description; PNPDeviceID = $disk.PNPDeviceID; MediaType = $disk.MediaType; \
Letters = $letters } }); \
ConvertTo-Json -InputObject $rows -Depth 3 -Compress";

const CONTROLLER_QUERY: &str = "$ErrorActionPreference='Stop'; \
ConvertTo-Json -InputObject @(Get-CimInstance Win32_SCSIController | Select-Object Name, PNPDeviceID) \
-Depth 2 -Compress";

/// Windows inventory backed by CIM (`Win32_DiskDrive`, `Win32_SCSIController`)
/// queried through PowerShell.
#[derive(Debug, Clone)]
pub struct CimInventory {
    pub shell: String,
}

impl Default for CimInventory {
    fn default() -> Self {
        Self {
            shell: "powershell".to_string(),
        }
    }
}

impl CimInventory {
    fn query(&self, script: &str) -> Result<String, InventoryError> {
        let command = format!("{} -Command <cim query>", self.shell);
        let output = Command::new(&self.shell)
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .output()
            .map_err(|source| InventoryError::Launch {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(InventoryError::QueryFailed {
                command,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl DeviceInventory for CimInventory {
    fn list_storage_devices(&self) -> Result<Vec<DeviceRecord>, InventoryError> {
        let payload = self.query(DISK_QUERY)?;
        parse_disk_rows(&payload)
    }

    fn list_storage_controllers(&self) -> Result<Vec<ControllerRecord>, InventoryError> {
        let payload = self.query(CONTROLLER_QUERY)?;
        parse_controller_rows(&payload)
    }

    fn volume_capacity(&self, drive_letter: &str) -> u64 {
        sysinfo_capacity(drive_letter)
    }
}

#[derive(Debug, Deserialize)]
struct CimDiskRow {
    #[serde(rename = "DeviceID", default)]
    device_id: Option<String>,
    #[serde(rename = "Model", default)]
    model: Option<String>,
    #[serde(rename = "Caption", default)]
    caption: Option<String>,
    #[serde(rename = "Description", default)]
    description: Option<String>,
    #[serde(rename = "PNPDeviceID", default)]
    pnp_device_id: Option<String>,
    #[serde(rename = "MediaType", default)]
    media_type: Option<String>,
    #[serde(rename = "Letters", default)]
    letters: Value,
}

#[derive(Debug, Deserialize)]
struct CimControllerRow {
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "PNPDeviceID", default)]
    pnp_device_id: Option<String>,
}

pub fn parse_disk_rows(payload: &str) -> Result<Vec<DeviceRecord>, InventoryError> {
    let rows: Vec<CimDiskRow> = parse_rows(payload)?;
    let mut devices = Vec::new();
    for row in rows {
        let pnp_device_id = row.pnp_device_id.unwrap_or_default();
        let base = DeviceRecord {
            device_path: row.device_id.unwrap_or_default(),
            model: row.model.unwrap_or_default(),
            caption: row.caption.unwrap_or_default(),
            description: row.description.unwrap_or_default(),
            location: parse_location(&pnp_device_id),
            pnp_device_id,
            removable: row
                .media_type
                .as_deref()
                .is_some_and(|media| media.contains("Removable Media")),
            drive_letter: None,
        };

        let letters = string_list(&row.letters);
        if letters.is_empty() {
            devices.push(base);
            continue;
        }
        for letter in letters {
            devices.push(DeviceRecord {
                drive_letter: Some(normalize_drive(&letter)),
                ..base.clone()
            });
        }
    }
    debug!("CIM inventory returned {} device record(s)", devices.len());
    Ok(devices)
}

pub fn parse_controller_rows(payload: &str) -> Result<Vec<ControllerRecord>, InventoryError> {
    let rows: Vec<CimControllerRow> = parse_rows(payload)?;
    Ok(rows
        .into_iter()
        .map(|row| ControllerRecord {
            name: row.name.unwrap_or_default(),
            instance_id: row.pnp_device_id.unwrap_or_default(),
        })
        .collect())
}

/// `ConvertTo-Json` emits a bare object for one row and `null`/nothing for none.
fn parse_rows<T: DeserializeOwned>(payload: &str) -> Result<Vec<T>, InventoryError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)?;
    let rows = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<_>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(rows)
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(item) => vec![item.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Cross-platform fallback: sysinfo reports mounted volumes but no controllers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoInventory;

impl DeviceInventory for SysinfoInventory {
    fn list_storage_devices(&self) -> Result<Vec<DeviceRecord>, InventoryError> {
        let disks = Disks::new_with_refreshed_list();
        Ok(disks
            .list()
            .iter()
            .map(|disk| {
                let name = disk.name().to_string_lossy().to_string();
                DeviceRecord {
                    device_path: name.clone(),
                    model: name.clone(),
                    caption: name,
                    description: disk.file_system().to_string_lossy().to_string(),
                    pnp_device_id: String::new(),
                    removable: disk.is_removable(),
                    drive_letter: Some(disk.mount_point().to_string_lossy().to_string()),
                    location: None,
                }
            })
            .collect())
    }

    fn list_storage_controllers(&self) -> Result<Vec<ControllerRecord>, InventoryError> {
        debug!("sysinfo inventory does not enumerate storage controllers");
        Ok(Vec::new())
    }

    fn volume_capacity(&self, drive_letter: &str) -> u64 {
        sysinfo_capacity(drive_letter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InventorySnapshot {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(default)]
    pub controllers: Vec<ControllerRecord>,
    /// Total bytes keyed by drive letter / mount point.
    #[serde(default)]
    pub capacities: HashMap<String, u64>,
}

/// Replays a captured inventory; also the in-memory inventory for tests.
#[derive(Debug, Clone, Default)]
pub struct SnapshotInventory {
    pub snapshot: InventorySnapshot,
}

impl SnapshotInventory {
    pub fn new(snapshot: InventorySnapshot) -> Self {
        Self { snapshot }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, InventoryError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| InventoryError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: InventorySnapshot = serde_json::from_str(&text)?;
        Ok(Self { snapshot })
    }
}

impl DeviceInventory for SnapshotInventory {
    fn list_storage_devices(&self) -> Result<Vec<DeviceRecord>, InventoryError> {
        Ok(self.snapshot.devices.clone())
    }

    fn list_storage_controllers(&self) -> Result<Vec<ControllerRecord>, InventoryError> {
        Ok(self.snapshot.controllers.clone())
    }

    fn volume_capacity(&self, drive_letter: &str) -> u64 {
        let wanted = normalize_drive(drive_letter);
        self.snapshot
            .capacities
            .iter()
            .find(|(letter, _)| normalize_drive(letter).eq_ignore_ascii_case(&wanted))
            .map(|(_, bytes)| *bytes)
            .unwrap_or_else(|| sysinfo_capacity(drive_letter))
    }
}

pub fn sysinfo_capacity(drive_letter: &str) -> u64 {
    let wanted = normalize_drive(drive_letter);
    let disks = Disks::new_with_refreshed_list();
    let capacity = disks
        .list()
        .iter()
        .find(|disk| {
            normalize_drive(&disk.mount_point().to_string_lossy()).eq_ignore_ascii_case(&wanted)
        })
        .map(|disk| disk.total_space())
        .unwrap_or(0);
    debug!("capacity of {drive_letter}: {capacity} bytes");
    capacity
}

/// `E:` and `e:/` both become `E:\`; other mount points lose trailing slashes.
pub fn normalize_drive(value: &str) -> String {
    let trimmed = value.trim();
    let bytes = trimmed.as_bytes();
    let bare_letter = match bytes {
        [letter, b':'] | [letter, b':', b'\\' | b'/'] => letter.is_ascii_alphabetic(),
        _ => false,
    };
    if bare_letter {
        return format!("{}:\\", trimmed[..1].to_ascii_uppercase());
    }
    if trimmed == "/" {
        return trimmed.to_string();
    }
    trimmed.trim_end_matches('/').to_string()
}
