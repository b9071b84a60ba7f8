#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use sd_express_tester_core::error::{BenchmarkError, ResetError};
use sd_express_tester_core::{
    BenchmarkPlan, BlockIo, BlockReader, BlockWriter, CardInfo, CardKind, CardMode, CardSource,
    CaseResult, Config, ControllerKind, ControllerRecord, ControllerResetProvider, DeviceRecord,
    InventorySnapshot, OpenFlags, PendingRead, RunObserver, SnapshotInventory, StdBlockIo,
    ThroughputProbe,
};

pub const HOST_ID: &str = r"PCI\VEN_1217&DEV_9860&SUBSYS_98601217&REV_00\3&11583659&0&E8";

/// Small sizes and no pauses so a full round runs in well under a second.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.test.performance.total_size = 1;
    config.test.performance.block_size = 1;
    config.test.performance.iterations = 1;
    config.test.performance.settle_ms = 0;
    config.test.stability.quick_iterations = 3;
    config
}

pub fn card_on(volume: &Path) -> CardInfo {
    CardInfo {
        kind: CardKind::LegacySd,
        controller: ControllerKind::SdHost,
        mode: CardMode::Sd3_0,
        device_path: r"\\.\PHYSICALDRIVE2".to_string(),
        drive_letter: volume.to_string_lossy().to_string(),
        capacity_bytes: 32 * 1024 * 1024 * 1024,
        name: "SD/MMC Card".to_string(),
    }
}

pub fn sd_reader() -> DeviceRecord {
    DeviceRecord {
        device_path: r"\\.\PHYSICALDRIVE2".to_string(),
        model: "SD/MMC Card".to_string(),
        caption: "SD/MMC Card".to_string(),
        description: "Disk drive".to_string(),
        pnp_device_id: r"SCSI\DISK&VEN_GENERIC&PROD_SD/MMC\5&2A4B1C&0&000000".to_string(),
        removable: true,
        drive_letter: Some("E:".to_string()),
        location: None,
    }
}

pub fn snapshot(devices: Vec<DeviceRecord>, controllers: Vec<ControllerRecord>) -> SnapshotInventory {
    SnapshotInventory::new(InventorySnapshot {
        devices,
        controllers,
        capacities: [("E:".to_string(), 64_000_000_000_u64)].into_iter().collect(),
    })
}

pub fn host_controller() -> ControllerRecord {
    ControllerRecord {
        name: "SD Host Controller".to_string(),
        instance_id: HOST_ID.to_string(),
    }
}

/// Always yields the same card.
pub struct FixedSource(pub Option<CardInfo>);

impl CardSource for FixedSource {
    fn current_card(&mut self) -> Option<CardInfo> {
        self.0.clone()
    }
}

/// Reports a fixed throughput.
pub struct FixedProbe(pub f64);

impl ThroughputProbe for FixedProbe {
    fn measure(&self, _volume: &Path, _plan: &BenchmarkPlan) -> Result<f64, BenchmarkError> {
        Ok(self.0)
    }
}

/// Reports queued throughputs in order, repeating the last one.
pub struct SequenceProbe {
    speeds: Mutex<VecDeque<f64>>,
}

impl SequenceProbe {
    pub fn new(speeds: &[f64]) -> Self {
        Self {
            speeds: Mutex::new(speeds.iter().copied().collect()),
        }
    }
}

impl ThroughputProbe for SequenceProbe {
    fn measure(&self, _volume: &Path, _plan: &BenchmarkPlan) -> Result<f64, BenchmarkError> {
        let mut speeds = self.speeds.lock().expect("probe lock");
        let speed = if speeds.len() > 1 {
            speeds.pop_front()
        } else {
            speeds.front().copied()
        };
        speed.ok_or(BenchmarkError::ZeroElapsed)
    }
}

/// Flips one byte of every synchronous read from files with a matching name.
pub struct CorruptingIo {
    pub target: &'static str,
}

impl BlockIo for CorruptingIo {
    fn create(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn BlockWriter>> {
        StdBlockIo.create(path, flags)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn BlockReader>> {
        let inner = StdBlockIo.open(path, flags)?;
        let corrupt = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == self.target);
        Ok(Box::new(CorruptingReader { inner, corrupt }))
    }
}

struct CorruptingReader {
    inner: Box<dyn BlockReader>,
    corrupt: bool,
}

impl BlockReader for CorruptingReader {
    fn read_block(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut bytes = self.inner.read_block(len)?;
        if self.corrupt {
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xFF;
            }
        }
        Ok(bytes)
    }

    fn read_at_async(&mut self, offset: u64, len: usize) -> io::Result<PendingRead<'_>> {
        self.inner.read_at_async(offset, len)
    }

    fn bypasses_cache(&self) -> bool {
        self.inner.bypasses_cache()
    }
}

/// Requests cancellation when a file with the given name is created.
pub struct CancellingIo {
    pub trigger: &'static str,
    pub flag: Arc<std::sync::atomic::AtomicBool>,
}

impl BlockIo for CancellingIo {
    fn create(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn BlockWriter>> {
        if path
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == self.trigger)
        {
            self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        StdBlockIo.create(path, flags)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn BlockReader>> {
        StdBlockIo.open(path, flags)
    }
}

/// Collects every callback in order.
#[derive(Default)]
pub struct RecordingObserver {
    pub progress: Vec<u8>,
    pub statuses: Vec<String>,
    pub results: Vec<(usize, CaseResult)>,
}

impl RunObserver for RecordingObserver {
    fn progress(&mut self, percent: u8) {
        self.progress.push(percent);
    }

    fn status(&mut self, message: &str) {
        self.statuses.push(message.to_string());
    }

    fn test_result(&mut self, round: usize, result: &CaseResult) {
        self.results.push((round, result.clone()));
    }
}

/// Records reset calls and keeps the control value in memory.
#[derive(Clone, Default)]
pub struct RecordingReset {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub value: Arc<Mutex<Option<u32>>>,
    pub disable_status: i32,
    pub enable_status: i32,
}

impl RecordingReset {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

impl ControllerResetProvider for RecordingReset {
    fn disable_device(&self, instance_id: &str) -> Result<i32, ResetError> {
        self.record(format!("disable {instance_id}"));
        Ok(self.disable_status)
    }

    fn enable_device(&self, instance_id: &str) -> Result<i32, ResetError> {
        self.record(format!("enable {instance_id}"));
        Ok(self.enable_status)
    }

    fn get_config_value(&self, _path: &str, item: &str) -> Result<Option<u32>, ResetError> {
        self.record(format!("get {item}"));
        Ok(*self.value.lock().expect("value lock"))
    }

    fn set_config_bit(
        &self,
        _path: &str,
        item: &str,
        bitmask: u32,
        value: bool,
    ) -> Result<(), ResetError> {
        self.record(format!("set {item} {value}"));
        let mut stored = self.value.lock().expect("value lock");
        let current = stored.unwrap_or(0);
        *stored = Some(if value { current | bitmask } else { current & !bitmask });
        Ok(())
    }
}
