use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classify::classify_with_trace;
use crate::config::CardPolicy;
use crate::engine::Engine;
use crate::error::InventoryError;
use crate::inventory::DeviceInventory;
use crate::model::{CardKind, ControllerInfo, DeviceRecord};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceVerdict {
    pub device: DeviceRecord,
    pub rule_id: String,
    #[serde(default)]
    pub card_kind: Option<CardKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub arch: String,
    pub current_dir: Option<String>,
    pub config_path: Option<String>,
    pub devices: Vec<DeviceVerdict>,
    pub controller: Option<ControllerInfo>,
    pub notes: Vec<String>,
}

/// Classifies every inventory record, keeping the rule that decided it.
pub fn classify_inventory(
    inventory: &dyn DeviceInventory,
    policy: &CardPolicy,
) -> Result<Vec<DeviceVerdict>, InventoryError> {
    Ok(inventory
        .list_storage_devices()?
        .into_iter()
        .map(|device| {
            let trace = classify_with_trace(&device, policy);
            DeviceVerdict {
                rule_id: trace.rule_id.to_string(),
                card_kind: trace.card.map(|card| card.kind),
                device,
            }
        })
        .collect())
}

pub fn collect_doctor_info(engine: &mut Engine, config_path: Option<&Path>) -> DoctorInfo {
    let current_dir = env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());
    let mut notes = Vec::new();

    let devices = match classify_inventory(engine.inventory(), &engine.config().card) {
        Ok(devices) => devices,
        Err(err) => {
            warn!("doctor could not enumerate devices: {err}");
            notes.push(format!("Device inventory failed: {err}"));
            Vec::new()
        }
    };
    let controller = engine.controller_info();

    if devices.is_empty() {
        notes.push("No storage devices reported by the inventory.".to_string());
    } else if devices.iter().all(|verdict| verdict.card_kind.is_none()) {
        notes.push(
            "No SD or SD Express card recognised; make sure the card is mounted with a drive letter."
                .to_string(),
        );
    }
    if controller.is_none() {
        notes.push("SD controller may be incompatible or already in NVMe mode.".to_string());
    }
    if let Some(pinned) = engine.config().card.pinned_model() {
        notes.push(format!(
            "SD Express detection is pinned to model \"{pinned}\"; keyword heuristics are off."
        ));
    }
    if !cfg!(windows) {
        notes.push(
            "Controller enumeration and the SD4.0 workaround are only available on Windows."
                .to_string(),
        );
    }

    DoctorInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        current_dir,
        config_path: config_path.map(|path| path.to_string_lossy().to_string()),
        devices,
        controller,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_inventory, collect_doctor_info};
    use crate::config::{CardPolicy, Config};
    use crate::engine::Engine;
    use crate::inventory::{InventorySnapshot, SnapshotInventory};
    use crate::model::{CardKind, DeviceRecord};

    fn snapshot() -> SnapshotInventory {
        SnapshotInventory::new(InventorySnapshot {
            devices: vec![
                DeviceRecord {
                    model: "SD/MMC Card".to_string(),
                    removable: true,
                    drive_letter: Some("E:".to_string()),
                    ..DeviceRecord::default()
                },
                DeviceRecord {
                    model: "Contoso NVMe SSD".to_string(),
                    drive_letter: Some("C:".to_string()),
                    ..DeviceRecord::default()
                },
            ],
            ..InventorySnapshot::default()
        })
    }

    #[test]
    fn verdicts_carry_rule_ids() {
        let verdicts = classify_inventory(&snapshot(), &CardPolicy::default()).expect("verdicts");
        assert_eq!(verdicts[0].card_kind, Some(CardKind::LegacySd));
        assert_eq!(verdicts[0].rule_id, "removable_sd_inclusion");
        assert_eq!(verdicts[1].card_kind, None);
        assert_eq!(verdicts[1].rule_id, "express_ssd_exclusion");
    }

    #[test]
    fn doctor_notes_missing_controller() {
        let mut engine = Engine::with_inventory(Config::default(), Box::new(snapshot()));
        let info = collect_doctor_info(&mut engine, None);
        assert_eq!(info.devices.len(), 2);
        assert!(info.controller.is_none());
        assert!(info
            .notes
            .iter()
            .any(|note| note.contains("already in NVMe mode")));
    }
}
