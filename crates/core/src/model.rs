use serde::{Deserialize, Serialize};

pub const REPORT_VERSION: &str = "1.0.0";

/// One block-storage device as reported by the inventory adapter.
///
/// Absent descriptor fields are carried as empty strings so the classifier
/// never has to distinguish "missing" from "non-matching".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceRecord {
    #[serde(default)]
    pub device_path: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pnp_device_id: String,
    #[serde(default)]
    pub removable: bool,
    #[serde(default)]
    pub drive_letter: Option<String>,
    #[serde(default)]
    pub location: Option<PciLocation>,
}

/// A storage controller entry (SCSI/SD host/NVMe class) from the inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ControllerRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instance_id: String,
}

/// Physical bus/slot position of a PCI function, as encoded in the instance id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PciLocation {
    pub bus: String,
    pub slot: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    LegacySd,
    ExpressNvme,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    SdHost,
    Nvme,
}

impl ControllerKind {
    pub fn label(&self) -> &'static str {
        match self {
            ControllerKind::SdHost => "SD Host",
            ControllerKind::Nvme => "NVMe SD Express",
        }
    }
}

/// Negotiated protocol generation. Variants are declared in ascending
/// generation order so `Ord` follows throughput.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum CardMode {
    #[default]
    Unknown,
    Sd2_0,
    Sd3_0,
    Sd4_0,
    Express7_0,
    Express8_0,
}

impl CardMode {
    pub fn label(&self) -> &'static str {
        match self {
            CardMode::Unknown => "unknown",
            CardMode::Sd2_0 => "SD 2.0",
            CardMode::Sd3_0 => "SD 3.0 UHS-I",
            CardMode::Sd4_0 => "SD 4.0 UHS-II",
            CardMode::Express7_0 => "SD Express 7.0",
            CardMode::Express8_0 => "SD Express 8.0",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CardInfo {
    pub kind: CardKind,
    pub controller: ControllerKind,
    #[serde(default)]
    pub mode: CardMode,
    pub device_path: String,
    pub drive_letter: String,
    #[serde(default)]
    pub capacity_bytes: u64,
    pub name: String,
}

/// Compare key deciding whether a previous measurement may be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CardIdentity {
    pub device_path: String,
    pub drive_letter: String,
    pub name: String,
}

impl CardInfo {
    pub fn identity(&self) -> CardIdentity {
        CardIdentity {
            device_path: self.device_path.clone(),
            drive_letter: self.drive_letter.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerInfo {
    pub name: String,
    pub supported_generations: Vec<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub location: Option<PciLocation>,
    /// True when the host controller was enumerated directly rather than
    /// re-identified through an NVMe function at the same location.
    #[serde(default)]
    pub native: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseResult {
    pub name: String,
    pub status: CaseStatus,
    pub details: String,
}

impl CaseResult {
    pub fn passed(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CaseStatus::Passed,
            details: details.into(),
        }
    }

    pub fn failed(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CaseStatus::Failed,
            details: details.into(),
        }
    }

    pub fn interrupted(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CaseStatus::Interrupted,
            details: details.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }

    pub fn status_label(&self) -> &'static str {
        match self.status {
            CaseStatus::Passed => "Passed",
            CaseStatus::Failed => "Failed",
            CaseStatus::Interrupted => "Interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

/// Outcome of one round: the ordered per-case results plus the terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRunResult {
    pub round: usize,
    pub state: RunState,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    pub cases: Vec<CaseResult>,
}

impl TestRunResult {
    pub fn get(&self, name: &str) -> Option<&CaseResult> {
        self.cases.iter().find(|case| case.name == name)
    }

    /// A round counts toward the tally only when every case ran to a verdict.
    pub fn is_complete(&self, expected_cases: usize) -> bool {
        self.cases.len() == expected_cases
            && self
                .cases
                .iter()
                .all(|case| case.status != CaseStatus::Interrupted)
    }

    pub fn is_passed(&self, expected_cases: usize) -> bool {
        self.is_complete(expected_cases) && self.cases.iter().all(CaseResult::is_passed)
    }

    pub fn failed_cases(&self) -> usize {
        self.cases
            .iter()
            .filter(|case| case.status == CaseStatus::Failed)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RoundSet {
    pub rounds: Vec<TestRunResult>,
}

impl RoundSet {
    pub fn push(&mut self, round: TestRunResult) {
        self.rounds.push(round);
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn last(&self) -> Option<&TestRunResult> {
        self.rounds.last()
    }

    pub fn summary(&self, expected_cases: usize) -> RunSummary {
        let mut summary = RunSummary {
            total_rounds: self.rounds.len(),
            ..RunSummary::default()
        };
        let mut stopped = false;

        for round in &self.rounds {
            match round.state {
                RunState::Stopped => stopped = true,
                RunState::Failed => summary.precondition_failures += 1,
                _ => {}
            }
            if !round.is_complete(expected_cases) {
                summary.incomplete_rounds += 1;
                continue;
            }
            summary.counted_rounds += 1;
            if round.is_passed(expected_cases) {
                summary.passed_rounds += 1;
            } else {
                summary.failed_rounds += 1;
            }
        }

        summary.verdict = if summary.failed_rounds > 0 || summary.precondition_failures > 0 {
            RunVerdict::Failures
        } else if stopped {
            RunVerdict::Stopped
        } else if summary.counted_rounds == 0 {
            RunVerdict::NothingCompleted
        } else {
            RunVerdict::AllPassed
        };
        summary
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    AllPassed,
    Failures,
    Stopped,
    #[default]
    NothingCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunSummary {
    pub total_rounds: usize,
    pub counted_rounds: usize,
    pub passed_rounds: usize,
    pub failed_rounds: usize,
    pub incomplete_rounds: usize,
    #[serde(default)]
    pub precondition_failures: usize,
    pub verdict: RunVerdict,
}
