use tracing::{debug, info, warn};

use crate::config::CardPolicy;
use crate::model::{CardInfo, CardKind, ControllerInfo, ControllerRecord, PciLocation};

pub const EXPRESS_CAPABILITY: &str = "SD Express";

/// Supported generations of the host SD controller family, keyed by the
/// device-id fragment of its PNP instance id.
pub const CAPABILITY_TABLE: &[(&str, &[&str])] = &[
    ("DEV_9860", &["SD 7.0/8.0", "SD 4.0", "SD 3.0"]),
    ("DEV_9861", &["SD 7.0/8.0", "SD 3.0"]),
    ("DEV_9862", &["SD 7.0/8.0", "SD 4.0", "SD 3.0"]),
    ("DEV_9863", &["SD 4.0", "SD 3.0"]),
    ("DEV_8620", &["SD 3.0"]),
    ("DEV_8621", &["SD 3.0"]),
];

const NVME_NAME_MARKERS: &[&str] = &["NVM"];
const NVME_ID_MARKERS: &[&str] = &["NVME"];

/// Extracts `(bus, slot)` from an instance id such as
/// `PCI\VEN_1217&DEV_9860&SUBSYS_98601217&REV_00\3&11583659&0&E8`
/// (bus `3`, slot `E8`).
pub fn parse_location(instance_id: &str) -> Option<PciLocation> {
    let segment = instance_id.split('\\').nth(2)?;
    let parts: Vec<&str> = segment.split('&').collect();
    if parts.len() < 3 {
        return None;
    }
    let (bus, slot) = (parts[0].trim(), parts[parts.len() - 1].trim());
    if bus.is_empty() || slot.is_empty() {
        return None;
    }
    Some(PciLocation {
        bus: bus.to_string(),
        slot: slot.to_string(),
    })
}

pub fn supported_generations(instance_id: &str) -> Vec<String> {
    let upper = instance_id.to_uppercase();
    CAPABILITY_TABLE
        .iter()
        .find(|(device_id, _)| upper.contains(device_id))
        .map(|(_, generations)| generations.iter().map(|g| g.to_string()).collect())
        .unwrap_or_default()
}

/// The host controller as last seen while it was still natively enumerable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeController {
    pub name: String,
    pub instance_id: String,
    pub location: PciLocation,
}

/// Correlates the host controller across re-enumerations by PCI location.
///
/// Once an express card switches the controller into NVMe tunnel mode the
/// native identity disappears from the inventory; an NVMe function at the
/// remembered `(bus, slot)` is then reported as the same controller.
#[derive(Debug, Clone)]
pub struct ControllerReconciler {
    vendor_id: String,
    last_native: Option<NativeController>,
}

impl ControllerReconciler {
    pub fn new(vendor_id: impl Into<String>) -> Self {
        Self {
            vendor_id: vendor_id.into().to_uppercase(),
            last_native: None,
        }
    }

    pub fn from_policy(policy: &CardPolicy) -> Self {
        Self::new(policy.host_vendor_id.clone())
    }

    pub fn last_native(&self) -> Option<&NativeController> {
        self.last_native.as_ref()
    }

    pub fn controller_info(
        &mut self,
        controllers: &[ControllerRecord],
        card: Option<&CardInfo>,
    ) -> Option<ControllerInfo> {
        let mut native = None;
        let mut nvme = Vec::new();

        for controller in controllers {
            let Some(location) = parse_location(&controller.instance_id) else {
                continue;
            };
            let instance_upper = controller.instance_id.to_uppercase();
            debug!(
                instance = %controller.instance_id,
                bus = %location.bus,
                slot = %location.slot,
                "storage controller"
            );

            if instance_upper.contains(&self.vendor_id) {
                info!("found native SD host controller {}", controller.instance_id);
                native = Some((controller, location.clone()));
            }
            if contains_any(&controller.name.to_uppercase(), NVME_NAME_MARKERS)
                || contains_any(&instance_upper, NVME_ID_MARKERS)
            {
                debug!("found NVMe controller {}", controller.name);
                nvme.push((controller, location));
            }
        }

        if let Some((controller, location)) = native {
            self.last_native = Some(NativeController {
                name: controller.name.clone(),
                instance_id: controller.instance_id.clone(),
                location: location.clone(),
            });
            let supported_generations = supported_generations(&controller.instance_id);
            if supported_generations.is_empty() {
                warn!(
                    "host controller {} is not in the capability table",
                    controller.instance_id
                );
            }
            return Some(ControllerInfo {
                name: controller.name.clone(),
                supported_generations,
                instance_id: Some(controller.instance_id.clone()),
                location: Some(location),
                native: true,
            });
        }

        if nvme.is_empty() {
            warn!("no supported storage controller found");
            return None;
        }

        let (controller, location) = match &self.last_native {
            Some(last) => {
                let Some(found) = nvme.into_iter().find(|(_, location)| *location == last.location)
                else {
                    debug!("no NVMe controller at the last native controller location");
                    return None;
                };
                info!("NVMe controller sits at the last native controller location");
                found
            }
            None => {
                if !card.is_some_and(|card| card.kind == CardKind::ExpressNvme) {
                    info!("NVMe controller is a platform SSD controller");
                    return None;
                }
                info!("NVMe controller is hosting an SD Express card");
                nvme.pop()?
            }
        };

        Some(ControllerInfo {
            name: controller.name.clone(),
            supported_generations: vec![EXPRESS_CAPABILITY.to_string()],
            instance_id: Some(controller.instance_id.clone()),
            location: Some(location),
            native: false,
        })
    }
}

fn contains_any(value: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| value.contains(pattern))
}
