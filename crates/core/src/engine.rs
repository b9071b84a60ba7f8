use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::bench::{FileThroughputProbe, ModeInferencer};
use crate::config::{CardPolicy, Config, Sd4Policy};
use crate::controller::ControllerReconciler;
use crate::detect::CardDetector;
use crate::inventory::{default_inventory, DeviceInventory};
use crate::model::{CardInfo, CardKind, ControllerInfo, RoundSet};
use crate::reset::{policy_conflict, ControllerResetProvider, PnpUtilResetProvider, WorkaroundOutcome};
use crate::suite::{CancelToken, CardSource, RunObserver, TestSuite};

const REAPPEAR_ATTEMPTS: u32 = 10;

/// Detection, reconciliation and workaround state for one host, built once
/// from a `Config` and driven from a single thread at a time.
pub struct Engine {
    config: Config,
    inventory: Box<dyn DeviceInventory>,
    inferencer: ModeInferencer,
    detector: CardDetector,
    reconciler: ControllerReconciler,
    reset: Box<dyn ControllerResetProvider>,
    power_cycle_pause: Duration,
    poll_interval: Duration,
}

impl Engine {
    pub fn new(
        config: Config,
        inventory: Box<dyn DeviceInventory>,
        inferencer: ModeInferencer,
        reset: Box<dyn ControllerResetProvider>,
    ) -> Self {
        Self {
            detector: CardDetector::new(config.card.clone()),
            reconciler: ControllerReconciler::from_policy(&config.card),
            config,
            inventory,
            inferencer,
            reset,
            power_cycle_pause: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Platform inventory, file-based benchmarking and `pnputil` resets.
    pub fn with_defaults(config: Config) -> Self {
        Self::with_inventory(config, default_inventory())
    }

    pub fn with_inventory(config: Config, inventory: Box<dyn DeviceInventory>) -> Self {
        let inferencer = ModeInferencer::new(
            Box::new(FileThroughputProbe::default()),
            config.card.speed_threshold,
        );
        Self::new(
            config,
            inventory,
            inferencer,
            Box::new(PnpUtilResetProvider::default()),
        )
    }

    /// Zero power-cycle pause and a 1 ms polling cadence.
    pub fn without_delays(mut self) -> Self {
        self.power_cycle_pause = Duration::ZERO;
        self.poll_interval = Duration::from_millis(1);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn inventory(&self) -> &dyn DeviceInventory {
        self.inventory.as_ref()
    }

    pub fn last_card(&self) -> Option<&CardInfo> {
        self.detector.last_card()
    }

    pub fn check_card(&mut self, quick: bool) -> Option<CardInfo> {
        self.detector
            .check_card(self.inventory.as_ref(), &self.inferencer, quick)
    }

    pub fn analyze_drive(&mut self, drive_letter: &str) -> Option<CardInfo> {
        self.detector
            .analyze_drive(self.inventory.as_ref(), &self.inferencer, drive_letter)
    }

    pub fn controller_info(&mut self) -> Option<ControllerInfo> {
        let controllers = match self.inventory.list_storage_controllers() {
            Ok(controllers) => controllers,
            Err(err) => {
                error!("failed to enumerate storage controllers: {err}");
                return None;
            }
        };
        self.reconciler
            .controller_info(&controllers, self.detector.last_card())
    }

    /// Polls detection until a card appears, `timeout` passes or `cancel`
    /// fires.
    pub fn wait_for_card(&mut self, timeout: Duration, cancel: &CancelToken) -> Option<CardInfo> {
        let deadline = Instant::now() + timeout;
        info!("waiting up to {}s for a card", timeout.as_secs());
        loop {
            if cancel.is_cancelled() {
                info!("card wait cancelled");
                return None;
            }
            if let Some(card) = self.check_card(true) {
                return Some(card);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("no card detected within {}s", timeout.as_secs());
                return None;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Runs the configured number of rounds against the card this engine
    /// detects.
    pub fn run_tests(
        &mut self,
        suite: &mut TestSuite,
        cancel: &CancelToken,
        observer: &mut dyn RunObserver,
    ) -> RoundSet {
        let rounds = self.config.test.looping.rounds();
        suite.run_rounds(rounds, self, cancel, observer)
    }

    /// Enforces `card.sd4_disable` by toggling the driver control bit and
    /// power-cycling the native host controller. Any failed step leaves the
    /// previously measured card in place and, once the control bit has been
    /// written, puts the bit back to its previous state.
    pub fn apply_generation_policy(&mut self) -> WorkaroundOutcome {
        let policy = self.config.card.sd4_disable;
        if policy == Sd4Policy::NoOp {
            return WorkaroundOutcome::NotApplicable("SD4.0 policy is not set".to_string());
        }
        let card = match self.detector.last_card().cloned() {
            Some(card) => card,
            None => match self.check_card(true) {
                Some(card) => card,
                None => {
                    return WorkaroundOutcome::NotApplicable("No SD card detected".to_string())
                }
            },
        };
        if card.kind != CardKind::LegacySd {
            return WorkaroundOutcome::NotApplicable(format!(
                "{} cards are not affected by the SD4.0 policy",
                card.controller.label()
            ));
        }

        let card_policy = self.config.card.clone();
        let bit_set = match self
            .reset
            .get_config_value(&card_policy.registry_path, &card_policy.registry_item)
        {
            Ok(value) => value.unwrap_or(0) & card_policy.registry_bitmask != 0,
            Err(err) => return self.workaround_failed(format!("cannot read control value: {err}")),
        };
        let Some(desired) = policy_conflict(policy, &card, bit_set) else {
            return WorkaroundOutcome::NotApplicable(format!(
                "card mode {} already satisfies the SD4.0 policy",
                card.mode.label()
            ));
        };

        self.controller_info();
        let Some(instance_id) = self
            .reconciler
            .last_native()
            .map(|native| native.instance_id.clone())
        else {
            return self.workaround_failed("native SD host controller not found".to_string());
        };

        info!(
            "SD4.0 policy {:?} conflicts with mode {}; setting {} to {}",
            policy,
            card.mode.label(),
            card_policy.registry_item,
            desired
        );
        if let Err(err) = self.reset.set_config_bit(
            &card_policy.registry_path,
            &card_policy.registry_item,
            card_policy.registry_bitmask,
            desired,
        ) {
            return self.workaround_failed(format!("cannot write control value: {err}"));
        }

        match self.reset.disable_device(&instance_id) {
            Ok(0) => info!("disabled controller {instance_id}"),
            Ok(code) => {
                return self.roll_back(
                    &card_policy,
                    bit_set,
                    format!("disable-device exited with status {code}"),
                )
            }
            Err(err) => {
                return self.roll_back(&card_policy, bit_set, format!("disable-device failed: {err}"))
            }
        }
        thread::sleep(self.power_cycle_pause);
        match self.reset.enable_device(&instance_id) {
            Ok(0) => info!("enabled controller {instance_id}"),
            Ok(code) => {
                return self.roll_back(
                    &card_policy,
                    bit_set,
                    format!("enable-device exited with status {code}"),
                )
            }
            Err(err) => {
                return self.roll_back(&card_policy, bit_set, format!("enable-device failed: {err}"))
            }
        }

        self.detector.invalidate();
        for attempt in 1..=REAPPEAR_ATTEMPTS {
            if let Some(updated) = self.analyze_drive(&card.drive_letter) {
                info!(
                    "card re-negotiated from {} to {}",
                    card.mode.label(),
                    updated.mode.label()
                );
                return WorkaroundOutcome::Applied(updated);
            }
            if attempt < REAPPEAR_ATTEMPTS {
                thread::sleep(self.poll_interval);
            }
        }
        self.roll_back(
            &card_policy,
            bit_set,
            format!(
                "card did not reappear on {} after the power cycle",
                card.drive_letter
            ),
        )
    }

    /// Restores the control bit to `previous`, then reports the failure.
    fn roll_back(&self, policy: &CardPolicy, previous: bool, reason: String) -> WorkaroundOutcome {
        match self.reset.set_config_bit(
            &policy.registry_path,
            &policy.registry_item,
            policy.registry_bitmask,
            previous,
        ) {
            Ok(()) => {
                warn!("restored {} to {previous}", policy.registry_item);
                self.workaround_failed(reason)
            }
            Err(err) => self.workaround_failed(format!(
                "{reason}; restoring {} also failed: {err}",
                policy.registry_item
            )),
        }
    }

    fn workaround_failed(&self, reason: String) -> WorkaroundOutcome {
        error!("SD4.0 workaround failed: {reason}");
        WorkaroundOutcome::Failed(reason)
    }
}

impl CardSource for Engine {
    fn current_card(&mut self) -> Option<CardInfo> {
        self.check_card(true)
    }
}
