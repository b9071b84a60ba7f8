use std::process::Command;

use tracing::{debug, info};

use crate::config::Sd4Policy;
use crate::error::ResetError;
use crate::model::{CardInfo, CardKind, CardMode};

/// Device power-cycle and driver-configuration primitives used by the SD4.0
/// downgrade workaround.
pub trait ControllerResetProvider: Send {
    /// Returns the tool's exit code; non-zero means the device was not disabled.
    fn disable_device(&self, instance_id: &str) -> Result<i32, ResetError>;

    fn enable_device(&self, instance_id: &str) -> Result<i32, ResetError>;

    /// `Ok(None)` when the value does not exist yet.
    fn get_config_value(&self, path: &str, item: &str) -> Result<Option<u32>, ResetError>;

    fn set_config_bit(
        &self,
        path: &str,
        item: &str,
        bitmask: u32,
        value: bool,
    ) -> Result<(), ResetError>;
}

/// Windows provider: `pnputil` for the power cycle and `reg` against
/// `HKLM\<path>` for the driver control value.
#[derive(Debug, Clone)]
pub struct PnpUtilResetProvider {
    pub pnputil: String,
    pub reg: String,
}

impl Default for PnpUtilResetProvider {
    fn default() -> Self {
        Self {
            pnputil: "pnputil".to_string(),
            reg: "reg".to_string(),
        }
    }
}

impl PnpUtilResetProvider {
    fn run(&self, program: &str, args: &[&str]) -> Result<(i32, String), ResetError> {
        let command = format!("{program} {}", args.join(" "));
        debug!("running {command}");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ResetError::Launch {
                command: command.clone(),
                source,
            })?;
        let code = output.status.code().unwrap_or(-1);
        Ok((code, String::from_utf8_lossy(&output.stdout).to_string()))
    }
}

fn hklm(path: &str) -> String {
    format!(r"HKLM\{}", path.trim_start_matches('\\'))
}

impl ControllerResetProvider for PnpUtilResetProvider {
    fn disable_device(&self, instance_id: &str) -> Result<i32, ResetError> {
        let (code, _) = self.run(&self.pnputil, &["/disable-device", instance_id])?;
        Ok(code)
    }

    fn enable_device(&self, instance_id: &str) -> Result<i32, ResetError> {
        let (code, _) = self.run(&self.pnputil, &["/enable-device", instance_id])?;
        Ok(code)
    }

    fn get_config_value(&self, path: &str, item: &str) -> Result<Option<u32>, ResetError> {
        let key = hklm(path);
        let (code, stdout) = self.run(&self.reg, &["query", &key, "/v", item])?;
        if code != 0 {
            return Ok(None);
        }
        parse_reg_query_value(&stdout, item)
    }

    fn set_config_bit(
        &self,
        path: &str,
        item: &str,
        bitmask: u32,
        value: bool,
    ) -> Result<(), ResetError> {
        let current = self.get_config_value(path, item)?.unwrap_or(0);
        let updated = apply_bit(current, bitmask, value);
        let key = hklm(path);
        let data = updated.to_string();
        let args = ["add", key.as_str(), "/v", item, "/t", "REG_DWORD", "/d", data.as_str(), "/f"];
        let (code, _) = self.run(&self.reg, &args)?;
        if code != 0 {
            return Err(ResetError::NonZeroExit {
                command: format!("{} {}", self.reg, args.join(" ")),
                status: code,
            });
        }
        info!("{item} set to {updated:#x} (was {current:#x})");
        Ok(())
    }
}

pub fn apply_bit(current: u32, bitmask: u32, value: bool) -> u32 {
    if value {
        current | bitmask
    } else {
        current & !bitmask
    }
}

/// Parses a `reg query` line such as `    item    REG_DWORD    0x1`.
pub fn parse_reg_query_value(stdout: &str, item: &str) -> Result<Option<u32>, ResetError> {
    let Some(line) = stdout.lines().find(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case(item))
    }) else {
        return Ok(None);
    };
    let raw = line.split_whitespace().last().unwrap_or_default();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse::<u32>(),
    };
    parsed.map(Some).map_err(|_| ResetError::BadValue {
        item: item.to_string(),
        raw: raw.to_string(),
    })
}

/// Decides whether the SD4.0 directive conflicts with the measured mode.
/// Returns the control-bit value to write, or `None` when nothing is needed.
pub fn policy_conflict(policy: Sd4Policy, card: &CardInfo, bit_set: bool) -> Option<bool> {
    if card.kind != CardKind::LegacySd {
        return None;
    }
    match policy {
        Sd4Policy::NoOp => None,
        Sd4Policy::Disable => (card.mode == CardMode::Sd4_0).then_some(true),
        Sd4Policy::ForceEnable => (card.mode != CardMode::Sd4_0 && bit_set).then_some(false),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkaroundOutcome {
    /// Policy and card agree, or the card is not a legacy SD card.
    NotApplicable(String),
    /// Controller was power-cycled; carries the re-measured card.
    Applied(CardInfo),
    /// A step failed; the previously measured card stands.
    Failed(String),
}

impl WorkaroundOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, WorkaroundOutcome::Applied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_bit, parse_reg_query_value, policy_conflict};
    use crate::config::Sd4Policy;
    use crate::model::{CardInfo, CardKind, CardMode, ControllerKind};

    fn card(kind: CardKind, mode: CardMode) -> CardInfo {
        CardInfo {
            kind,
            controller: ControllerKind::SdHost,
            mode,
            device_path: String::new(),
            drive_letter: "E:\\".to_string(),
            capacity_bytes: 0,
            name: "SD/MMC Card".to_string(),
        }
    }

    #[test]
    fn parses_reg_query_output() {
        let stdout = "\r\nHKEY_LOCAL_MACHINE\\SYSTEM\\CurrentControlSet\\Services\\bhtsddr\\GG8\r\n    sd_card_mode_dis    REG_DWORD    0x5\r\n\r\n";
        assert_eq!(
            parse_reg_query_value(stdout, "sd_card_mode_dis").expect("parses"),
            Some(5)
        );
        assert_eq!(parse_reg_query_value(stdout, "other").expect("parses"), None);
        assert!(parse_reg_query_value("    item    REG_DWORD    0xZZ", "item").is_err());
    }

    #[test]
    fn toggles_only_the_masked_bit() {
        assert_eq!(apply_bit(0b100, 0x1, true), 0b101);
        assert_eq!(apply_bit(0b101, 0x1, false), 0b100);
        assert_eq!(apply_bit(0, 0x1, false), 0);
    }

    #[test]
    fn conflict_rules_follow_the_directive() {
        let sd4 = card(CardKind::LegacySd, CardMode::Sd4_0);
        let sd3 = card(CardKind::LegacySd, CardMode::Sd3_0);
        assert_eq!(policy_conflict(Sd4Policy::Disable, &sd4, false), Some(true));
        assert_eq!(policy_conflict(Sd4Policy::Disable, &sd3, true), None);
        assert_eq!(policy_conflict(Sd4Policy::ForceEnable, &sd3, true), Some(false));
        assert_eq!(policy_conflict(Sd4Policy::ForceEnable, &sd3, false), None);
        assert_eq!(policy_conflict(Sd4Policy::ForceEnable, &sd4, true), None);
        assert_eq!(policy_conflict(Sd4Policy::NoOp, &sd4, true), None);

        let express = card(CardKind::ExpressNvme, CardMode::Express7_0);
        assert_eq!(policy_conflict(Sd4Policy::Disable, &express, false), None);
    }
}
