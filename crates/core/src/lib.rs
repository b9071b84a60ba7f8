pub mod bench;
pub mod blockio;
pub mod cases;
pub mod classify;
pub mod config;
pub mod controller;
pub mod detect;
pub mod diagnostics;
pub mod doctor;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod model;
pub mod report;
pub mod reset;
pub mod suite;

pub use bench::{
    mode_for_speed, BenchmarkPlan, FileThroughputProbe, ModeInferencer, ReadStrategy,
    ThroughputProbe,
};
pub use blockio::{BlockIo, BlockReader, BlockWriter, OpenFlags, PendingRead, StdBlockIo};
pub use cases::{
    default_cases, BASIC_READ_WRITE, CONTROLLER_DETECTION, PERFORMANCE_TEST, STABILITY_TEST,
};
pub use classify::{classify, classify_with_trace, Classification};
pub use config::{CardPolicy, Config, RunType, Sd4Policy, SpeedThresholds, TestConfig};
pub use controller::{parse_location, ControllerReconciler};
pub use detect::CardDetector;
pub use diagnostics::{build_diagnostics_bundle, write_diagnostics_bundle, DiagnosticsBundle};
pub use doctor::{classify_inventory, collect_doctor_info, DeviceVerdict, DoctorInfo};
pub use engine::Engine;
pub use error::{BenchmarkError, ConfigError, InventoryError, ResetError};
pub use inventory::{
    default_inventory, CimInventory, DeviceInventory, InventorySnapshot, SnapshotInventory,
    SysinfoInventory,
};
pub use model::{
    CardInfo, CardKind, CardMode, CaseResult, CaseStatus, ControllerInfo, ControllerKind,
    ControllerRecord, DeviceRecord, PciLocation, RoundSet, RunState, RunSummary, RunVerdict,
    StopReason, TestRunResult, REPORT_VERSION,
};
pub use report::{
    build_run_report, load_json_report, render_text_report, write_json_report,
    write_text_report, RunReport,
};
pub use reset::{ControllerResetProvider, PnpUtilResetProvider, WorkaroundOutcome};
pub use suite::{
    CancelToken, CardSource, NoopObserver, RunObserver, TestCase, TestSuite, NO_CARD_DETAIL,
    PRECONDITION_ENTRY,
};
