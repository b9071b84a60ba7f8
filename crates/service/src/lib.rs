pub mod service;

pub use service::{
    cancel_run, detect_card, doctor, export_diagnostics_bundle, get_run_report, get_run_session,
    load_report, poll_run_events, start_run, CancelRunResponse, EngineRequest, RunEvent,
    RunEventKind, RunRequest, RunSessionSnapshot, RunSessionStatus,
};
