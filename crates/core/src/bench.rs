use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::blockio::{BlockIo, OpenFlags, StdBlockIo};
use crate::config::SpeedThresholds;
use crate::error::BenchmarkError;
use crate::model::{CardInfo, CardKind, CardMode};

pub const SPEED_TEST_FILE: &str = "speed_test.bin";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    /// One blocking read call per block.
    Sync,
    /// One outstanding overlapped read at a time.
    Async,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkPlan {
    pub file_size: u64,
    pub block_size: u64,
    pub trials: u32,
    /// Quiesce pause between writing the scratch file and the first trial.
    pub settle: Duration,
    pub trial_gap: Duration,
    pub strategy: ReadStrategy,
}

impl BenchmarkPlan {
    pub fn legacy() -> Self {
        Self {
            file_size: 4 * MIB,
            block_size: MIB,
            trials: 2,
            settle: Duration::from_secs(1),
            trial_gap: Duration::from_millis(100),
            strategy: ReadStrategy::Sync,
        }
    }

    pub fn express() -> Self {
        Self {
            file_size: 16 * MIB,
            strategy: ReadStrategy::Async,
            ..Self::legacy()
        }
    }

    pub fn for_kind(kind: CardKind) -> Self {
        match kind {
            CardKind::LegacySd => Self::legacy(),
            CardKind::ExpressNvme => Self::express(),
        }
    }

    pub fn without_delays(mut self) -> Self {
        self.settle = Duration::ZERO;
        self.trial_gap = Duration::ZERO;
        self
    }

    fn blocks(&self) -> Result<u64, BenchmarkError> {
        if self.block_size == 0 || self.file_size < self.block_size || self.trials == 0 {
            return Err(BenchmarkError::EmptyPlan {
                file_size: self.file_size,
                block_size: self.block_size,
            });
        }
        Ok(self.file_size / self.block_size)
    }
}

/// Measures sequential read throughput on a mounted volume, in MB/s.
pub trait ThroughputProbe: Send {
    fn measure(&self, volume: &Path, plan: &BenchmarkPlan) -> Result<f64, BenchmarkError>;
}

/// Deletes the scratch file through its block I/O provider on every exit
/// path.
pub struct ScratchFile<'a> {
    path: PathBuf,
    io: &'a dyn BlockIo,
    removed: bool,
}

impl<'a> ScratchFile<'a> {
    pub fn new(path: PathBuf, io: &'a dyn BlockIo) -> Self {
        Self {
            path,
            io,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the file now and reports the error instead of logging it.
    pub fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        self.io.remove(&self.path)
    }
}

impl Drop for ScratchFile<'_> {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match self.io.remove(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove scratch file {}: {err}", self.path.display()),
        }
    }
}

/// Writes a random scratch file, then times reading it back through the
/// block I/O provider.
pub struct FileThroughputProbe {
    io: Arc<dyn BlockIo>,
}

impl Default for FileThroughputProbe {
    fn default() -> Self {
        Self::new(Arc::new(StdBlockIo))
    }
}

impl FileThroughputProbe {
    pub fn new(io: Arc<dyn BlockIo>) -> Self {
        Self { io }
    }

    fn write_scratch(&self, path: &Path, plan: &BenchmarkPlan, blocks: u64) -> Result<(), BenchmarkError> {
        let io_err = |source| BenchmarkError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut block = vec![0_u8; plan.block_size as usize];
        rand::thread_rng().fill_bytes(&mut block);

        let mut writer = self.io.create(path, OpenFlags::write_through()).map_err(io_err)?;
        for _ in 0..blocks {
            writer.write_block(&block).map_err(io_err)?;
        }
        writer.flush_durable().map_err(io_err)
    }

    fn timed_read(&self, path: &Path, plan: &BenchmarkPlan, blocks: u64) -> Result<f64, BenchmarkError> {
        let io_err = |source| BenchmarkError::Io {
            path: path.to_path_buf(),
            source,
        };
        let block_len = plan.block_size as usize;
        let flags = match plan.strategy {
            ReadStrategy::Sync => OpenFlags::sequential_read(),
            ReadStrategy::Async => OpenFlags::overlapped_read(),
        };
        let mut reader = self.io.open(path, flags).map_err(io_err)?;
        if !reader.bypasses_cache() {
            debug!("benchmark reads of {} may be served from the page cache", path.display());
        }

        let started = Instant::now();
        let mut total = 0_usize;
        for index in 0..blocks {
            let chunk = match plan.strategy {
                ReadStrategy::Sync => reader.read_block(block_len).map_err(io_err)?,
                ReadStrategy::Async => reader
                    .read_at_async(index * plan.block_size, block_len)
                    .and_then(|pending| pending.wait())
                    .map_err(io_err)?,
            };
            if chunk.len() != block_len {
                return Err(BenchmarkError::ShortRead {
                    expected: block_len,
                    actual: chunk.len(),
                });
            }
            total += chunk.len();
        }
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return Err(BenchmarkError::ZeroElapsed);
        }
        Ok(total as f64 / MIB as f64 / elapsed)
    }
}

impl ThroughputProbe for FileThroughputProbe {
    fn measure(&self, volume: &Path, plan: &BenchmarkPlan) -> Result<f64, BenchmarkError> {
        let blocks = plan.blocks()?;
        let scratch = ScratchFile::new(volume.join(SPEED_TEST_FILE), self.io.as_ref());
        self.write_scratch(scratch.path(), plan, blocks)?;
        thread::sleep(plan.settle);

        let mut best = 0.0_f64;
        for trial in 0..plan.trials {
            if trial > 0 {
                thread::sleep(plan.trial_gap);
            }
            let speed = self.timed_read(scratch.path(), plan, blocks)?;
            debug!(trial, speed, "benchmark trial finished");
            best = best.max(speed);
        }
        Ok(best)
    }
}

/// Maps a measured read speed to a generation. Monotonic in `speed` for any
/// fixed thresholds.
pub fn mode_for_speed(kind: CardKind, speed: f64, thresholds: &SpeedThresholds) -> CardMode {
    match kind {
        CardKind::LegacySd => {
            if speed >= thresholds.sd_4 {
                CardMode::Sd4_0
            } else if speed >= thresholds.sd_3 {
                CardMode::Sd3_0
            } else {
                CardMode::Sd2_0
            }
        }
        CardKind::ExpressNvme => {
            if speed >= thresholds.sd_express_8 {
                CardMode::Express8_0
            } else {
                CardMode::Express7_0
            }
        }
    }
}

pub struct ModeInferencer {
    probe: Box<dyn ThroughputProbe>,
    thresholds: SpeedThresholds,
    quiet: bool,
}

impl ModeInferencer {
    pub fn new(probe: Box<dyn ThroughputProbe>, thresholds: SpeedThresholds) -> Self {
        Self {
            probe,
            thresholds,
            quiet: false,
        }
    }

    /// Drops the settle and trial-gap pauses from every plan.
    pub fn without_delays(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn thresholds(&self) -> &SpeedThresholds {
        &self.thresholds
    }

    pub fn plan_for(&self, kind: CardKind) -> BenchmarkPlan {
        let plan = BenchmarkPlan::for_kind(kind);
        if self.quiet {
            plan.without_delays()
        } else {
            plan
        }
    }

    /// Never fails: a benchmark error degrades to `CardMode::Unknown`.
    pub fn infer_mode(&self, card: &CardInfo) -> CardMode {
        let plan = self.plan_for(card.kind);
        match self.probe.measure(Path::new(&card.drive_letter), &plan) {
            Ok(speed) => {
                let mode = mode_for_speed(card.kind, speed, &self.thresholds);
                info!(
                    drive = %card.drive_letter,
                    mode = mode.label(),
                    "measured card read speed {speed:.2} MB/s"
                );
                mode
            }
            Err(err) => {
                warn!(drive = %card.drive_letter, "speed benchmark failed: {err}");
                CardMode::Unknown
            }
        }
    }
}
