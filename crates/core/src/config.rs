use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Run-wide configuration, built once at startup and handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub card: CardPolicy,
    pub test: TestConfig,
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CardPolicy {
    /// Exact model pin for SD Express detection; empty means heuristic.
    pub sd_express_model: String,
    pub sd4_disable: Sd4Policy,
    pub registry_path: String,
    pub registry_item: String,
    pub registry_bitmask: u32,
    pub host_vendor_id: String,
    pub speed_threshold: SpeedThresholds,
}

impl Default for CardPolicy {
    fn default() -> Self {
        Self {
            sd_express_model: String::new(),
            sd4_disable: Sd4Policy::NoOp,
            registry_path: r"SYSTEM\CurrentControlSet\Services\bhtsddr\GG8".to_string(),
            registry_item: "sd_card_mode_dis".to_string(),
            registry_bitmask: 0x1,
            host_vendor_id: "VEN_1217".to_string(),
            speed_threshold: SpeedThresholds::default(),
        }
    }
}

impl CardPolicy {
    pub fn pinned_model(&self) -> Option<&str> {
        let pinned = self.sd_express_model.trim();
        (!pinned.is_empty()).then_some(pinned)
    }
}

/// SD4.0 downgrade directive. On disk this is `true` (disable), `false`
/// (force-enable) or `null` (leave the controller alone).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum Sd4Policy {
    Disable,
    ForceEnable,
    #[default]
    NoOp,
}

impl From<Option<bool>> for Sd4Policy {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Sd4Policy::Disable,
            Some(false) => Sd4Policy::ForceEnable,
            None => Sd4Policy::NoOp,
        }
    }
}

impl From<Sd4Policy> for Option<bool> {
    fn from(value: Sd4Policy) -> Self {
        match value {
            Sd4Policy::Disable => Some(true),
            Sd4Policy::ForceEnable => Some(false),
            Sd4Policy::NoOp => None,
        }
    }
}

/// Minimum measured read speeds (MB/s) for each generation boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpeedThresholds {
    pub sd_express_8: f64,
    pub sd_4: f64,
    pub sd_3: f64,
}

impl Default for SpeedThresholds {
    fn default() -> Self {
        Self {
            sd_express_8: 800.0,
            sd_4: 120.0,
            sd_3: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    #[default]
    Quick,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestConfig {
    #[serde(rename = "type")]
    pub run_type: RunType,
    #[serde(rename = "loop")]
    pub looping: LoopConfig,
    pub performance: PerformanceConfig,
    pub stability: StabilityConfig,
    /// Per-round ceiling in seconds; 0 disables it.
    pub timeout: u64,
    /// How long `wait_for_card` polls before giving up, in seconds.
    pub card_wait_timeout: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            run_type: RunType::Quick,
            looping: LoopConfig::default(),
            performance: PerformanceConfig::default(),
            stability: StabilityConfig::default(),
            timeout: 600,
            card_wait_timeout: 300,
        }
    }
}

impl TestConfig {
    pub fn round_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn stability_iterations(&self) -> u32 {
        match self.run_type {
            RunType::Quick => self.stability.quick_iterations,
            RunType::Full => self.stability.full_iterations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub enabled: bool,
    pub count: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 1,
        }
    }
}

impl LoopConfig {
    pub fn rounds(&self) -> u32 {
        if self.enabled {
            self.count
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Megabytes written and read per iteration.
    pub total_size: u64,
    /// Megabytes per I/O request.
    pub block_size: u64,
    pub iterations: u32,
    /// Pause between the write and read phases, in milliseconds.
    pub settle_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            total_size: 128,
            block_size: 1,
            iterations: 3,
            settle_ms: 1000,
        }
    }
}

impl PerformanceConfig {
    pub fn total_bytes(&self) -> u64 {
        self.total_size * 1024 * 1024
    }

    pub fn block_bytes(&self) -> u64 {
        self.block_size * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StabilityConfig {
    pub quick_iterations: u32,
    pub full_iterations: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            quick_iterations: 10,
            full_iterations: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "config file {} not found, using default configuration",
                path.display()
            );
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(path, &text)?;
        config.validate()?;
        info!("loaded config file {}", path.display());
        Ok(config)
    }

    fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        if is_json(path) {
            serde_json::from_str(text).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })
        } else if text.trim().is_empty() {
            Ok(Self::default())
        } else {
            serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("test.loop.count", self.test.looping.count as u64, 1, 100)?;
        check_range(
            "test.performance.total_size",
            self.test.performance.total_size,
            1,
            1024,
        )?;
        check_range(
            "test.performance.block_size",
            self.test.performance.block_size,
            1,
            64,
        )?;
        check_range(
            "test.performance.iterations",
            self.test.performance.iterations as u64,
            1,
            10,
        )?;
        if self.test.performance.block_size > self.test.performance.total_size {
            return Err(ConfigError::Invalid {
                key: "test.performance.block_size",
                reason: "block size exceeds total size".to_string(),
            });
        }

        let thresholds = &self.card.speed_threshold;
        if thresholds.sd_3 <= 0.0 || thresholds.sd_4 < thresholds.sd_3 {
            return Err(ConfigError::Invalid {
                key: "card.speed_threshold",
                reason: format!(
                    "expected 0 < sd_3 <= sd_4, got sd_3={} sd_4={}",
                    thresholds.sd_3, thresholds.sd_4
                ),
            });
        }
        if thresholds.sd_express_8 <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "card.speed_threshold.sd_express_8",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Flat dotted-key lookup (`"test.loop.count"`) over the effective config.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut value = serde_json::to_value(self).ok()?;
        for part in key.split('.') {
            value = value.get_mut(part)?.take();
        }
        Some(value)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|source| ConfigError::Yaml {
            path: PathBuf::from(DEFAULT_CONFIG_FILE),
            source,
        })
    }

    pub fn write_default(path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let payload = Self::default().to_yaml()?;
        fs::write(path, payload).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn check_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            reason: format!("{value} is outside {min}..={max}"),
        })
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}
