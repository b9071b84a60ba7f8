use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use sd_express_tester_core::{
    build_diagnostics_bundle, build_run_report, collect_doctor_info, load_json_report,
    write_diagnostics_bundle, write_json_report, write_text_report, CancelToken, CardInfo,
    CardSource, CaseResult, Config, DiagnosticsBundle, DoctorInfo, Engine, RunObserver, RunReport,
    RunSummary, SnapshotInventory, TestSuite, WorkaroundOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

/// Where an engine gets its configuration and device inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineRequest {
    /// Inline configuration; wins over `config_path`.
    #[serde(default)]
    pub config: Option<Config>,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// JSON inventory snapshot used instead of the host inventory.
    #[serde(default)]
    pub inventory_path: Option<PathBuf>,
}

impl EngineRequest {
    fn resolve_config(&self) -> Result<Config> {
        if let Some(config) = &self.config {
            config.validate().context("invalid inline configuration")?;
            return Ok(config.clone());
        }
        match &self.config_path {
            Some(path) => Config::load_or_default(path)
                .with_context(|| format!("failed to load {}", path.display())),
            None => Ok(Config::default()),
        }
    }

    fn build_engine(&self) -> Result<Engine> {
        let config = self.resolve_config()?;
        match &self.inventory_path {
            Some(path) => {
                let snapshot = SnapshotInventory::load(path)
                    .with_context(|| format!("failed to load inventory {}", path.display()))?;
                Ok(Engine::with_inventory(config, Box::new(snapshot)))
            }
            None => Ok(Engine::with_defaults(config)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default, flatten)]
    pub engine: EngineRequest,
    /// JSON report written when the run finishes.
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub text_output: Option<PathBuf>,
    /// Poll for a card for `test.card_wait_timeout` seconds before the first round.
    #[serde(default)]
    pub wait_for_card: bool,
    #[serde(default)]
    pub apply_policy: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunSessionStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEventKind {
    Progress { percent: u8 },
    Status { message: String },
    CaseResult { round: usize, result: CaseResult },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSessionSnapshot {
    pub run_id: String,
    pub status: RunSessionStatus,
    pub report_path: Option<PathBuf>,
    pub card: Option<CardInfo>,
    pub summary: Option<RunSummary>,
    pub error: Option<String>,
    pub total_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRunResponse {
    pub run_id: String,
    pub status: RunSessionStatus,
}

#[derive(Debug, Clone)]
struct RunSession {
    status: RunSessionStatus,
    report_path: Option<PathBuf>,
    report: Option<RunReport>,
    error: Option<String>,
    events: Vec<RunEvent>,
    cancel_flag: Arc<AtomicBool>,
}

static SESSIONS: Lazy<Mutex<HashMap<String, RunSession>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Detection state shared between the worker thread and the round driver.
#[derive(Clone)]
struct SharedEngine(Arc<Mutex<Engine>>);

impl SharedEngine {
    fn lock(&self) -> Result<MutexGuard<'_, Engine>> {
        self.0
            .lock()
            .map_err(|_| anyhow!("engine lock poisoned"))
    }
}

impl CardSource for SharedEngine {
    fn current_card(&mut self) -> Option<CardInfo> {
        match self.lock() {
            Ok(mut engine) => engine.check_card(true),
            Err(err) => {
                error!("card detection unavailable: {err}");
                None
            }
        }
    }
}

/// Appends run callbacks to the session's event log.
struct SessionObserver {
    run_id: String,
}

impl SessionObserver {
    fn push(&self, kind: RunEventKind) {
        if let Ok(mut sessions) = lock_sessions() {
            if let Some(session) = sessions.get_mut(&self.run_id) {
                let seq = session.events.len() as u64 + 1;
                session.events.push(RunEvent { seq, kind });
            }
        }
    }
}

impl RunObserver for SessionObserver {
    fn progress(&mut self, percent: u8) {
        self.push(RunEventKind::Progress { percent });
    }

    fn status(&mut self, message: &str) {
        self.push(RunEventKind::Status {
            message: message.to_string(),
        });
    }

    fn test_result(&mut self, round: usize, result: &CaseResult) {
        self.push(RunEventKind::CaseResult {
            round,
            result: result.clone(),
        });
    }
}

/// Registers a session and starts the looping test driver on a worker thread.
pub fn start_run(request: RunRequest) -> Result<String> {
    let engine = SharedEngine(Arc::new(Mutex::new(request.engine.build_engine()?)));
    let run_id = request
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let cancel_flag = Arc::new(AtomicBool::new(false));

    {
        let mut sessions = lock_sessions()?;
        if sessions
            .get(&run_id)
            .is_some_and(|session| session.status == RunSessionStatus::Running)
        {
            return Err(anyhow!("run session already running: {run_id}"));
        }
        sessions.insert(
            run_id.clone(),
            RunSession {
                status: RunSessionStatus::Running,
                report_path: request.output.clone(),
                report: None,
                error: None,
                events: Vec::new(),
                cancel_flag: Arc::clone(&cancel_flag),
            },
        );
    }

    let thread_run_id = run_id.clone();
    thread::spawn(move || {
        let cancel = CancelToken::from_flag(Arc::clone(&cancel_flag));
        let mut observer = SessionObserver {
            run_id: thread_run_id.clone(),
        };
        let outcome = execute_run(&request, engine, &cancel, &mut observer);

        let Ok(mut sessions) = lock_sessions() else {
            return;
        };
        let Some(session) = sessions.get_mut(&thread_run_id) else {
            return;
        };
        match outcome {
            Ok(report) => {
                info!(
                    "run {thread_run_id} finished with verdict {:?}",
                    report.summary.verdict
                );
                session.report = Some(report);
                session.status = if cancel_flag.load(Ordering::Relaxed) {
                    RunSessionStatus::Cancelled
                } else {
                    RunSessionStatus::Completed
                };
                session.error = None;
            }
            Err(err) => {
                error!("run {thread_run_id} failed: {err:#}");
                session.status = RunSessionStatus::Failed;
                session.error = Some(format!("{err:#}"));
            }
        }
    });

    Ok(run_id)
}

fn execute_run(
    request: &RunRequest,
    mut engine: SharedEngine,
    cancel: &CancelToken,
    observer: &mut SessionObserver,
) -> Result<RunReport> {
    let config = engine.lock()?.config().clone();

    if request.wait_for_card {
        observer.status("Waiting for SD card...");
        let timeout = Duration::from_secs(config.test.card_wait_timeout);
        if engine.lock()?.wait_for_card(timeout, cancel).is_none() && !cancel.is_cancelled() {
            return Err(anyhow!(
                "no SD card detected within {}s",
                timeout.as_secs()
            ));
        }
    }

    if request.apply_policy {
        let message = match engine.lock()?.apply_generation_policy() {
            WorkaroundOutcome::NotApplicable(reason) => format!("SD4.0 policy: {reason}"),
            WorkaroundOutcome::Applied(card) => {
                format!("SD4.0 policy applied, card mode: {}", card.mode.label())
            }
            WorkaroundOutcome::Failed(reason) => format!("SD4.0 workaround failed: {reason}"),
        };
        observer.status(&message);
    }

    let controller = engine.lock()?.controller_info();
    let mut suite = TestSuite::new(config.test.clone());
    let rounds = suite.run_rounds(config.test.looping.rounds(), &mut engine, cancel, observer);
    let card = engine.lock()?.last_card().cloned();
    let report = build_run_report(&config, card, controller, &suite.case_names(), rounds);

    if let Some(path) = &request.output {
        write_json_report(&report, path)?;
    }
    if let Some(path) = &request.text_output {
        write_text_report(&report, path)?;
    }
    Ok(report)
}

pub fn poll_run_events(run_id: &str, from_seq: u64) -> Result<Vec<RunEvent>> {
    let sessions = lock_sessions()?;
    let session = sessions
        .get(run_id)
        .ok_or_else(|| anyhow!("run session not found: {run_id}"))?;

    Ok(session
        .events
        .iter()
        .filter(|event| event.seq > from_seq)
        .cloned()
        .collect())
}

/// Requests a stop; the worker finishes the current case and ends the round.
pub fn cancel_run(run_id: &str) -> Result<CancelRunResponse> {
    let mut sessions = lock_sessions()?;
    let session = sessions
        .get_mut(run_id)
        .ok_or_else(|| anyhow!("run session not found: {run_id}"))?;

    // The worker flips the status to Cancelled when it exits, so the id
    // stays reserved until then.
    session.cancel_flag.store(true, Ordering::Relaxed);

    Ok(CancelRunResponse {
        run_id: run_id.to_string(),
        status: session.status,
    })
}

pub fn get_run_session(run_id: &str) -> Result<RunSessionSnapshot> {
    let sessions = lock_sessions()?;
    let session = sessions
        .get(run_id)
        .ok_or_else(|| anyhow!("run session not found: {run_id}"))?;

    Ok(RunSessionSnapshot {
        run_id: run_id.to_string(),
        status: session.status,
        report_path: session.report_path.clone(),
        card: session.report.as_ref().and_then(|report| report.card.clone()),
        summary: session.report.as_ref().map(|report| report.summary.clone()),
        error: session.error.clone(),
        total_events: session.events.len() as u64,
    })
}

/// Report of a finished session, if the worker produced one.
pub fn get_run_report(run_id: &str) -> Result<Option<RunReport>> {
    let sessions = lock_sessions()?;
    let session = sessions
        .get(run_id)
        .ok_or_else(|| anyhow!("run session not found: {run_id}"))?;
    Ok(session.report.clone())
}

pub fn detect_card(request: &EngineRequest, full: bool) -> Result<Option<CardInfo>> {
    let mut engine = request.build_engine()?;
    Ok(engine.check_card(!full))
}

pub fn doctor(request: &EngineRequest) -> Result<DoctorInfo> {
    let mut engine = request.build_engine()?;
    Ok(collect_doctor_info(
        &mut engine,
        request.config_path.as_deref(),
    ))
}

pub fn load_report(path: impl AsRef<Path>) -> Result<RunReport> {
    load_json_report(path)
}

pub fn export_diagnostics_bundle(
    report: Option<&RunReport>,
    doctor: DoctorInfo,
    output: impl AsRef<Path>,
    source_report_path: Option<PathBuf>,
) -> Result<DiagnosticsBundle> {
    let bundle = build_diagnostics_bundle(report, source_report_path.as_deref(), doctor);
    write_diagnostics_bundle(&bundle, output)?;
    Ok(bundle)
}

fn lock_sessions() -> Result<MutexGuard<'static, HashMap<String, RunSession>>> {
    SESSIONS
        .lock()
        .map_err(|_| anyhow!("run session registry lock poisoned"))
}
