use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::blockio::{BlockIo, StdBlockIo};
use crate::cases::{default_cases, CaseContext, CaseProcedure};
use crate::config::TestConfig;
use crate::model::{CardInfo, CaseResult, CaseStatus, RoundSet, RunState, StopReason, TestRunResult};

pub const TEST_DIR_NAME: &str = "test_files";
pub const PRECONDITION_ENTRY: &str = "Error";
pub const NO_CARD_DETAIL: &str = "No SD card detected";

/// Shared stop request plus an optional per-round deadline. Both are polled,
/// never used to abort in-flight I/O.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            flag,
            deadline: None,
        }
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Same stop flag, with a deadline `timeout` from now.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    pub fn reason(&self) -> Option<StopReason> {
        if self.flag.load(Ordering::SeqCst) {
            Some(StopReason::Cancelled)
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(StopReason::TimedOut)
        } else {
            None
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }
}

/// Presentation callbacks, invoked synchronously on the worker as each event
/// happens.
pub trait RunObserver {
    fn progress(&mut self, _percent: u8) {}

    fn status(&mut self, _message: &str) {}

    fn test_result(&mut self, _round: usize, _result: &CaseResult) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Supplies the card under test at the start of each round.
pub trait CardSource {
    fn current_card(&mut self) -> Option<CardInfo>;
}

/// Scratch directory owned by one round; emptied and removed on drop.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(path: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        for entry in WalkDir::new(&self.path).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    error!("failed to list test directory {}: {err}", self.path.display());
                    continue;
                }
            };
            let removed = if entry.file_type().is_dir() {
                fs::remove_dir_all(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            if let Err(err) = removed {
                error!("failed to clean up {}: {err}", entry.path().display());
            }
        }
        if let Err(err) = fs::remove_dir(&self.path) {
            if self.path.exists() {
                error!("failed to remove test directory {}: {err}", self.path.display());
            }
        }
    }
}

/// One named case; `passed`/`details` hold the outcome of its latest run.
#[derive(Clone)]
pub struct TestCase {
    pub name: &'static str,
    pub procedure: CaseProcedure,
    pub passed: bool,
    pub details: String,
}

impl TestCase {
    pub fn new(name: &'static str, procedure: CaseProcedure) -> Self {
        Self {
            name,
            procedure,
            passed: false,
            details: String::new(),
        }
    }
}

pub struct TestSuite {
    cases: Vec<TestCase>,
    io: Arc<dyn BlockIo>,
    config: TestConfig,
    read_back_pause: Duration,
}

impl TestSuite {
    pub fn new(config: TestConfig) -> Self {
        Self::with_io(config, Arc::new(StdBlockIo))
    }

    pub fn with_io(config: TestConfig, io: Arc<dyn BlockIo>) -> Self {
        Self {
            cases: default_cases(),
            io,
            config,
            read_back_pause: Duration::from_millis(100),
        }
    }

    pub fn with_cases(mut self, cases: Vec<TestCase>) -> Self {
        self.cases = cases;
        self
    }

    /// Removes the fixed pauses between write and read-back phases.
    pub fn without_delays(mut self) -> Self {
        self.read_back_pause = Duration::ZERO;
        self.config.performance.settle_ms = 0;
        self
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn case_names(&self) -> Vec<&'static str> {
        self.cases.iter().map(|case| case.name).collect()
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Runs the fixed case sequence once against the card `source` yields.
    pub fn run_round(
        &mut self,
        round: usize,
        source: &mut dyn CardSource,
        cancel: &CancelToken,
        observer: &mut dyn RunObserver,
    ) -> TestRunResult {
        let mut result = TestRunResult {
            round,
            state: RunState::Running,
            stop_reason: None,
            cases: Vec::new(),
        };

        if let Some(reason) = cancel.reason() {
            info!("test round {round} not started: stop requested");
            result.state = RunState::Stopped;
            result.stop_reason = Some(reason);
            return result;
        }

        observer.status("Checking SD card...");
        let Some(card) = source.current_card() else {
            error!("No SD card detected, cannot execute tests");
            return precondition_failure(result, NO_CARD_DETAIL, observer);
        };
        info!(
            name = %card.name,
            drive = %card.drive_letter,
            mode = card.mode.label(),
            "test target"
        );

        let scratch = match ScratchDir::create(Path::new(&card.drive_letter).join(TEST_DIR_NAME)) {
            Ok(scratch) => scratch,
            Err(err) => {
                error!("failed to create test directory on {}: {err}", card.drive_letter);
                let detail = format!("Failed to create test directory: {err}");
                return precondition_failure(result, &detail, observer);
            }
        };

        let round_cancel = cancel.with_timeout(self.config.round_timeout());
        let total = self.cases.len();
        for (index, case) in self.cases.iter_mut().enumerate() {
            if let Some(reason) = round_cancel.reason() {
                info!("test round {round} stopped before {}: {reason:?}", case.name);
                result.stop_reason = Some(reason);
                break;
            }

            observer.status(&format!("Executing test: {}", case.name));
            info!("executing test case: {}", case.name);
            let outcome = {
                let mut ctx = CaseContext {
                    name: case.name,
                    card: &card,
                    scratch_dir: scratch.path(),
                    io: self.io.as_ref(),
                    config: &self.config,
                    cancel: &round_cancel,
                    read_back_pause: self.read_back_pause,
                    observer: &mut *observer,
                };
                (case.procedure)(&mut ctx)
            };
            let case_result = match outcome {
                Ok(case_result) => case_result,
                Err(err) => {
                    error!("test case {} execution error: {err:#}", case.name);
                    CaseResult::failed(case.name, format!("Test exception: {err:#}"))
                }
            };

            case.passed = case_result.is_passed();
            case.details = case_result.details.clone();
            observer.progress(((index + 1) * 100 / total) as u8);
            observer.test_result(round, &case_result);
            info!(
                "test case {} completed: {}",
                case.name,
                case_result.status_label()
            );

            let interrupted = case_result.status == CaseStatus::Interrupted;
            result.cases.push(case_result);
            if interrupted {
                result.stop_reason = round_cancel.reason().or(Some(StopReason::Cancelled));
                break;
            }
        }

        drop(scratch);
        result.state = if result.stop_reason.is_some() {
            RunState::Stopped
        } else {
            RunState::Completed
        };
        result
    }

    /// Looping driver: repeats the round `rounds` times, stopping early once a
    /// round ends `Stopped`.
    pub fn run_rounds(
        &mut self,
        rounds: u32,
        source: &mut dyn CardSource,
        cancel: &CancelToken,
        observer: &mut dyn RunObserver,
    ) -> RoundSet {
        let mut set = RoundSet::default();
        let rounds = rounds.max(1) as usize;
        for round in 1..=rounds {
            if rounds > 1 {
                observer.status(&format!("Test round {round}/{rounds}"));
            }
            let result = self.run_round(round, source, cancel, observer);
            let state = result.state;
            set.push(result);
            match state {
                RunState::Stopped => {
                    info!("test loop stopped after round {round}");
                    break;
                }
                RunState::Failed => warn!("test round {round} failed its precondition"),
                _ => {}
            }
        }
        set
    }
}

fn precondition_failure(
    mut result: TestRunResult,
    detail: &str,
    observer: &mut dyn RunObserver,
) -> TestRunResult {
    let entry = CaseResult::failed(PRECONDITION_ENTRY, detail);
    observer.test_result(result.round, &entry);
    result.cases.push(entry);
    result.state = RunState::Failed;
    result
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::{CancelToken, ScratchDir};
    use crate::model::StopReason;

    #[test]
    fn token_reports_cancel_before_timeout() {
        let token = CancelToken::new();
        assert_eq!(token.reason(), None);

        let expired = token.with_timeout(Some(Duration::ZERO));
        assert_eq!(expired.reason(), Some(StopReason::TimedOut));
        assert_eq!(token.with_timeout(None).reason(), None);

        token.cancel();
        assert_eq!(expired.reason(), Some(StopReason::Cancelled));
        assert!(token.is_cancelled());
    }

    #[test]
    fn scratch_dir_is_emptied_and_removed() {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("test_files");
        {
            let scratch = ScratchDir::create(path.clone()).expect("created");
            fs::write(scratch.path().join("a.bin"), b"a").expect("write a");
            fs::create_dir(scratch.path().join("nested")).expect("nested");
            fs::write(scratch.path().join("nested").join("b.bin"), b"b").expect("write b");
        }
        assert!(!path.exists());
    }
}
