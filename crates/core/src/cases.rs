use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::{Rng, RngCore};
use tracing::{debug, error, info, warn};

use crate::bench::ScratchFile;
use crate::blockio::{BlockIo, OpenFlags};
use crate::config::TestConfig;
use crate::model::{CardInfo, CaseResult};
use crate::suite::{CancelToken, RunObserver, TestCase};

pub const CONTROLLER_DETECTION: &str = "Controller Detection";
pub const BASIC_READ_WRITE: &str = "Basic Read/Write";
pub const PERFORMANCE_TEST: &str = "Performance Test";
pub const STABILITY_TEST: &str = "Stability Test";

pub const INTERRUPTED_DETAIL: &str = "Test interrupted";
pub const DATA_VERIFICATION_FAILED: &str = "Data verification failed";

const BASIC_RW_SIZE: usize = 1024 * 1024;
const STABILITY_MIN_SIZE: usize = 512 * 1024;
const STABILITY_MAX_SIZE: usize = 2 * 1024 * 1024;

pub type CaseProcedure = fn(&mut CaseContext<'_>) -> Result<CaseResult>;

/// Everything a case may touch during one round.
pub struct CaseContext<'a> {
    pub name: &'static str,
    pub card: &'a CardInfo,
    pub scratch_dir: &'a Path,
    pub io: &'a dyn BlockIo,
    pub config: &'a TestConfig,
    pub cancel: &'a CancelToken,
    pub read_back_pause: Duration,
    pub observer: &'a mut dyn RunObserver,
}

impl CaseContext<'_> {
    fn scratch_file(&self, file_name: &str) -> PathBuf {
        self.scratch_dir.join(file_name)
    }
}

/// The fixed case sequence, in execution order.
pub fn default_cases() -> Vec<TestCase> {
    vec![
        TestCase::new(CONTROLLER_DETECTION, controller_detection),
        TestCase::new(BASIC_READ_WRITE, basic_read_write),
        TestCase::new(PERFORMANCE_TEST, performance),
        TestCase::new(STABILITY_TEST, stability),
    ]
}

pub fn controller_detection(ctx: &mut CaseContext<'_>) -> Result<CaseResult> {
    let card = ctx.card;
    info!("detected {} controller", card.controller.label());
    Ok(CaseResult::passed(
        ctx.name,
        format!(
            "{} controller working normally, mode: {}",
            card.controller.label(),
            card.mode.label()
        ),
    ))
}

pub fn basic_read_write(ctx: &mut CaseContext<'_>) -> Result<CaseResult> {
    let scratch = ScratchFile::new(ctx.scratch_file("basic_rw_test.bin"), ctx.io);
    let mut data = vec![0_u8; BASIC_RW_SIZE];
    rand::thread_rng().fill_bytes(&mut data);
    info!("starting basic read/write test, {} bytes", data.len());

    let read_back = match write_then_read(ctx.io, scratch.path(), &data, ctx.read_back_pause) {
        Ok(read_back) => read_back,
        Err(err) => {
            error!("file operation failed: {err}");
            return Ok(CaseResult::failed(
                ctx.name,
                format!("File operation failed: {err}"),
            ));
        }
    };

    if read_back == data {
        info!("basic read/write test passed");
        Ok(CaseResult::passed(
            ctx.name,
            "Read/write test successful, data verification passed",
        ))
    } else {
        error!("data verification failed");
        Ok(CaseResult::failed(
            ctx.name,
            format!(
                "{DATA_VERIFICATION_FAILED}: wrote {} bytes (blake3 {}), read back {} bytes (blake3 {})",
                data.len(),
                blake3::hash(&data).to_hex(),
                read_back.len(),
                blake3::hash(&read_back).to_hex()
            ),
        ))
    }
}

fn write_then_read(
    io: &dyn BlockIo,
    path: &Path,
    data: &[u8],
    pause: Duration,
) -> std::io::Result<Vec<u8>> {
    let mut writer = io.create(path, OpenFlags::write_through())?;
    writer.write_block(data)?;
    writer.flush_durable()?;
    drop(writer);

    thread::sleep(pause);

    let mut reader = io.open(path, OpenFlags::sequential_read())?;
    // One extra byte so a file that grew is caught as a mismatch.
    reader.read_block(data.len() + 1)
}

pub fn performance(ctx: &mut CaseContext<'_>) -> Result<CaseResult> {
    let settings = &ctx.config.performance;
    let total = settings.total_bytes();
    let block = settings.block_bytes();
    let iterations = settings.iterations.max(1);
    let settle = Duration::from_millis(settings.settle_ms);
    let scratch = ScratchFile::new(ctx.scratch_file("perf_test.bin"), ctx.io);
    info!("starting {}MB performance test", settings.total_size);

    let mut write_total = 0.0;
    let mut read_total = 0.0;
    for iteration in 1..=iterations {
        if ctx.cancel.is_cancelled() {
            info!("performance test stopped");
            return Ok(CaseResult::interrupted(ctx.name, INTERRUPTED_DETAIL));
        }

        let write_speed = timed_write(ctx.io, scratch.path(), total, block)
            .context("Performance test failed during write phase")?;
        thread::sleep(settle);
        let read_speed = timed_overlapped_read(ctx.io, scratch.path(), total, block)
            .context("Performance test failed during read phase")?;

        let message =
            format!("Test {iteration}: Read={read_speed:.2}MB/s, Write={write_speed:.2}MB/s");
        debug!("{message}");
        ctx.observer.status(&message);
        write_total += write_speed;
        read_total += read_speed;
    }

    let average_read = read_total / f64::from(iterations);
    let average_write = write_total / f64::from(iterations);
    info!(
        "performance test {}MB: Read={average_read:.2}MB/s, Write={average_write:.2}MB/s",
        settings.total_size
    );
    Ok(CaseResult::passed(
        ctx.name,
        format!(
            "{}MB test (Average {iterations} times): Read speed={average_read:.2}MB/s, Write speed={average_write:.2}MB/s",
            settings.total_size
        ),
    ))
}

fn megabytes_per_second(bytes: u64, started: Instant) -> f64 {
    let elapsed = started.elapsed().as_secs_f64().max(1e-9);
    bytes as f64 / (1024.0 * 1024.0) / elapsed
}

fn timed_write(io: &dyn BlockIo, path: &Path, total: u64, block: u64) -> Result<f64> {
    let mut buffer = vec![0_u8; block as usize];
    rand::thread_rng().fill_bytes(&mut buffer);
    let mut writer = io
        .create(path, OpenFlags::write_through())
        .with_context(|| format!("cannot create {}", path.display()))?;

    let started = Instant::now();
    let mut written = 0;
    while written < total {
        let len = block.min(total - written) as usize;
        writer.write_block(&buffer[..len])?;
        written += len as u64;
    }
    writer.flush_durable()?;
    Ok(megabytes_per_second(written, started))
}

fn timed_overlapped_read(io: &dyn BlockIo, path: &Path, total: u64, block: u64) -> Result<f64> {
    let mut reader = io
        .open(path, OpenFlags::overlapped_read())
        .with_context(|| format!("cannot open {}", path.display()))?;

    let started = Instant::now();
    let mut offset = 0;
    while offset < total {
        let len = block.min(total - offset) as usize;
        let chunk = reader.read_at_async(offset, len)?.wait()?;
        if chunk.len() != len {
            bail!("short read at offset {offset}: expected {len} bytes, got {}", chunk.len());
        }
        offset += len as u64;
    }
    Ok(megabytes_per_second(offset, started))
}

pub fn stability(ctx: &mut CaseContext<'_>) -> Result<CaseResult> {
    let iterations = ctx.config.stability_iterations();
    let mut rng = rand::thread_rng();
    let mut errors = 0_u32;
    info!("starting stability test, {iterations} iterations");

    for iteration in 0..iterations {
        if ctx.cancel.is_cancelled() {
            info!("stability test stopped at iteration {}", iteration + 1);
            return Ok(CaseResult::interrupted(ctx.name, INTERRUPTED_DETAIL));
        }

        let size = rng.gen_range(STABILITY_MIN_SIZE..=STABILITY_MAX_SIZE);
        let path = ctx.scratch_file(&format!("stability_test_{iteration}.bin"));
        debug!(
            "stability iteration {}/{iterations}, {:.1}KB",
            iteration + 1,
            size as f64 / 1024.0
        );
        match stability_cycle(ctx.io, &path, size) {
            Ok(true) => {}
            Ok(false) => {
                error!("data verification failed in iteration {}", iteration + 1);
                errors += 1;
            }
            Err(err) => {
                error!("stability iteration {} failed: {err}", iteration + 1);
                errors += 1;
            }
        }
    }

    if errors == 0 {
        info!("stability test passed");
        Ok(CaseResult::passed(
            ctx.name,
            format!("Completed {iterations} random read/write tests, no errors"),
        ))
    } else {
        warn!("stability test completed with {errors} errors");
        Ok(CaseResult::failed(
            ctx.name,
            format!("Test completed, but with {errors} errors"),
        ))
    }
}

/// write, flush, fsync, read back, compare, delete. `Ok(false)` on mismatch.
fn stability_cycle(io: &dyn BlockIo, path: &Path, size: usize) -> std::io::Result<bool> {
    let scratch = ScratchFile::new(path.to_path_buf(), io);
    let mut data = vec![0_u8; size];
    rand::thread_rng().fill_bytes(&mut data);

    let mut writer = io.create(scratch.path(), OpenFlags::default())?;
    writer.write_block(&data)?;
    writer.flush_durable()?;
    drop(writer);

    let mut reader = io.open(scratch.path(), OpenFlags::default())?;
    let read_back = reader.read_block(size + 1)?;
    drop(reader);

    scratch.remove()?;
    Ok(read_back == data)
}
