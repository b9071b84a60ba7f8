use tracing::{debug, error, info};

use crate::bench::ModeInferencer;
use crate::classify::classify;
use crate::config::CardPolicy;
use crate::inventory::{normalize_drive, DeviceInventory};
use crate::model::CardInfo;

/// Detection pass with an identity-keyed cache of the last measured card.
///
/// A quick check reuses the cached mode and capacity while the card's
/// `(device_path, drive_letter, name)` key is unchanged and the cache has not
/// been invalidated, so each identity change costs at most one benchmark.
#[derive(Debug, Clone)]
pub struct CardDetector {
    policy: CardPolicy,
    last: Option<CardInfo>,
    stale: bool,
}

impl CardDetector {
    pub fn new(policy: CardPolicy) -> Self {
        Self {
            policy,
            last: None,
            stale: false,
        }
    }

    pub fn policy(&self) -> &CardPolicy {
        &self.policy
    }

    pub fn last_card(&self) -> Option<&CardInfo> {
        self.last.as_ref()
    }

    /// Forces the next check to re-measure even if the identity is unchanged.
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    pub fn check_card(
        &mut self,
        inventory: &dyn DeviceInventory,
        inferencer: &ModeInferencer,
        quick: bool,
    ) -> Option<CardInfo> {
        let devices = match inventory.list_storage_devices() {
            Ok(devices) => devices,
            Err(err) => {
                error!("card detection failed: {err}");
                self.last = None;
                return None;
            }
        };

        let found = devices.iter().find_map(|device| {
            let letter = device.drive_letter.as_deref().filter(|letter| !letter.is_empty())?;
            let mut card = classify(device, &self.policy)?;
            card.drive_letter = normalize_drive(letter);
            Some(card)
        });

        let Some(mut card) = found else {
            if self.last.take().is_some() {
                info!("SD card removed");
            }
            return None;
        };

        card.capacity_bytes = inventory.volume_capacity(&card.drive_letter);
        let cached = self
            .last
            .as_ref()
            .filter(|last| quick && !self.stale && last.identity() == card.identity());
        match cached {
            Some(last) => {
                debug!(drive = %card.drive_letter, "reusing cached card measurement");
                card.mode = last.mode;
                if card.capacity_bytes == 0 {
                    card.capacity_bytes = last.capacity_bytes;
                }
            }
            None => {
                card.mode = inferencer.infer_mode(&card);
                info!(
                    name = %card.name,
                    drive = %card.drive_letter,
                    controller = card.controller.label(),
                    mode = card.mode.label(),
                    "card detected"
                );
            }
        }

        self.stale = false;
        self.last = Some(card.clone());
        Some(card)
    }

    /// Full classification and mode inference for one drive letter.
    pub fn analyze_drive(
        &mut self,
        inventory: &dyn DeviceInventory,
        inferencer: &ModeInferencer,
        drive_letter: &str,
    ) -> Option<CardInfo> {
        let wanted = normalize_drive(drive_letter);
        let Some(device_path) = inventory.map_drive_to_device_path(&wanted) else {
            debug!("no device path for drive {wanted}");
            return None;
        };
        let devices = match inventory.list_storage_devices() {
            Ok(devices) => devices,
            Err(err) => {
                error!("drive analysis failed for {wanted}: {err}");
                return None;
            }
        };

        let device = devices.iter().find(|device| {
            device.device_path == device_path
                && device
                    .drive_letter
                    .as_deref()
                    .is_some_and(|letter| normalize_drive(letter).eq_ignore_ascii_case(&wanted))
        })?;
        let mut card = classify(device, &self.policy)?;
        card.drive_letter = wanted;
        card.capacity_bytes = inventory.volume_capacity(&card.drive_letter);
        card.mode = inferencer.infer_mode(&card);
        info!(
            drive = %card.drive_letter,
            mode = card.mode.label(),
            "drive re-analysed"
        );

        self.stale = false;
        self.last = Some(card.clone());
        Some(card)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::CardDetector;
    use crate::bench::{BenchmarkPlan, ModeInferencer, ThroughputProbe};
    use crate::config::{CardPolicy, SpeedThresholds};
    use crate::error::BenchmarkError;
    use crate::inventory::{InventorySnapshot, SnapshotInventory};
    use crate::model::{CardKind, CardMode, DeviceRecord};

    struct CountingProbe {
        speed: f64,
        calls: Arc<AtomicUsize>,
    }

    impl ThroughputProbe for CountingProbe {
        fn measure(&self, _volume: &Path, _plan: &BenchmarkPlan) -> Result<f64, BenchmarkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.speed)
        }
    }

    fn sd_reader() -> DeviceRecord {
        DeviceRecord {
            device_path: r"\\.\PHYSICALDRIVE2".to_string(),
            model: "SD/MMC Card".to_string(),
            caption: "SD/MMC Card".to_string(),
            removable: true,
            drive_letter: Some("E:".to_string()),
            ..DeviceRecord::default()
        }
    }

    fn inventory(devices: Vec<DeviceRecord>) -> SnapshotInventory {
        SnapshotInventory::new(InventorySnapshot {
            devices,
            capacities: [("E:".to_string(), 32_000_000_000_u64)].into_iter().collect(),
            ..InventorySnapshot::default()
        })
    }

    fn inferencer(speed: f64) -> (ModeInferencer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = CountingProbe {
            speed,
            calls: Arc::clone(&calls),
        };
        (
            ModeInferencer::new(Box::new(probe), SpeedThresholds::default()),
            calls,
        )
    }

    #[test]
    fn quick_check_measures_once_per_identity() {
        let inventory = inventory(vec![sd_reader()]);
        let (inferencer, calls) = inferencer(45.0);
        let mut detector = CardDetector::new(CardPolicy::default());

        let first = detector
            .check_card(&inventory, &inferencer, true)
            .expect("card found");
        assert_eq!(first.kind, CardKind::LegacySd);
        assert_eq!(first.mode, CardMode::Sd3_0);
        assert_eq!(first.drive_letter, "E:\\");
        assert_eq!(first.capacity_bytes, 32_000_000_000);

        let second = detector
            .check_card(&inventory, &inferencer, true)
            .expect("card found");
        assert_eq!(second.mode, CardMode::Sd3_0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        detector.check_card(&inventory, &inferencer, false);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        detector.invalidate();
        detector.check_card(&inventory, &inferencer, true);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn identity_change_triggers_new_measurement() {
        let (inferencer, calls) = inferencer(150.0);
        let mut detector = CardDetector::new(CardPolicy::default());
        detector.check_card(&inventory(vec![sd_reader()]), &inferencer, true);

        let mut other = sd_reader();
        other.model = "SD Card 128GB".to_string();
        let card = detector
            .check_card(&inventory(vec![other]), &inferencer, true)
            .expect("card found");
        assert_eq!(card.mode, CardMode::Sd4_0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removal_clears_cache() {
        let (inferencer, _calls) = inferencer(45.0);
        let mut detector = CardDetector::new(CardPolicy::default());
        detector.check_card(&inventory(vec![sd_reader()]), &inferencer, true);
        assert!(detector.last_card().is_some());

        assert!(detector
            .check_card(&inventory(Vec::new()), &inferencer, true)
            .is_none());
        assert!(detector.last_card().is_none());
    }

    #[test]
    fn devices_without_drive_letter_are_skipped() {
        let mut unmounted = sd_reader();
        unmounted.drive_letter = None;
        let (inferencer, calls) = inferencer(45.0);
        let mut detector = CardDetector::new(CardPolicy::default());
        assert!(detector
            .check_card(&inventory(vec![unmounted]), &inferencer, true)
            .is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn analyze_drive_always_measures() {
        let inventory = inventory(vec![sd_reader()]);
        let (inferencer, calls) = inferencer(45.0);
        let mut detector = CardDetector::new(CardPolicy::default());
        let card = detector
            .analyze_drive(&inventory, &inferencer, "e:")
            .expect("drive analysed");
        assert_eq!(card.mode, CardMode::Sd3_0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(detector.analyze_drive(&inventory, &inferencer, "F:").is_none());
    }
}
