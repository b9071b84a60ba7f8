mod support;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use sd_express_tester_core::cases::{CaseContext, DATA_VERIFICATION_FAILED, INTERRUPTED_DETAIL};
use sd_express_tester_core::suite::{NO_CARD_DETAIL, PRECONDITION_ENTRY, TEST_DIR_NAME};
use sd_express_tester_core::{
    classify, CancelToken, CardKind, CardMode, CardPolicy, CaseResult, CaseStatus, Config,
    ControllerKind, Engine, ModeInferencer, NoopObserver, RunState, RunVerdict, StopReason,
    TestCase, TestSuite, BASIC_READ_WRITE, CONTROLLER_DETECTION, PERFORMANCE_TEST,
    STABILITY_TEST,
};

use support::{
    card_on, fast_config, sd_reader, snapshot, CancellingIo, CorruptingIo, FixedProbe,
    FixedSource, RecordingObserver, RecordingReset,
};

fn engine_with_speed(speed: f64) -> Engine {
    let config = Config::default();
    let inferencer = ModeInferencer::new(Box::new(FixedProbe(speed)), config.card.speed_threshold);
    Engine::new(
        config,
        Box::new(snapshot(vec![sd_reader()], Vec::new())),
        inferencer,
        Box::new(RecordingReset::default()),
    )
}

#[test]
fn sd_reader_at_45_mb_s_is_sd3() {
    let card = classify(&sd_reader(), &CardPolicy::default()).expect("classified");
    assert_eq!(card.kind, CardKind::LegacySd);
    assert_eq!(card.controller, ControllerKind::SdHost);

    let mut engine = engine_with_speed(45.0);
    let card = engine.check_card(false).expect("card detected");
    assert_eq!(card.mode, CardMode::Sd3_0);
    assert_eq!(card.capacity_bytes, 64_000_000_000);
}

#[test]
fn sd_reader_at_150_mb_s_is_sd4() {
    let mut engine = engine_with_speed(150.0);
    let card = engine.check_card(false).expect("card detected");
    assert_eq!(card.mode, CardMode::Sd4_0);
}

#[test]
fn nvme_ssd_is_never_a_card() {
    let mut ssd = sd_reader();
    ssd.model = "Contoso NVMe SSD".to_string();
    ssd.caption = ssd.model.clone();
    ssd.removable = false;
    assert!(classify(&ssd, &CardPolicy::default()).is_none());

    let config = Config::default();
    let mut engine = Engine::new(
        config.clone(),
        Box::new(snapshot(vec![ssd], Vec::new())),
        ModeInferencer::new(Box::new(FixedProbe(2000.0)), config.card.speed_threshold),
        Box::new(RecordingReset::default()),
    );
    assert!(engine.check_card(false).is_none());
}

#[test]
fn full_round_passes_on_a_healthy_volume() {
    let volume = tempfile::tempdir().expect("volume");
    let mut source = FixedSource(Some(card_on(volume.path())));
    let mut suite = TestSuite::new(fast_config().test).without_delays();
    let mut observer = RecordingObserver::default();

    let result = suite.run_round(1, &mut source, &CancelToken::new(), &mut observer);

    assert_eq!(result.state, RunState::Completed);
    let names: Vec<&str> = result.cases.iter().map(|case| case.name.as_str()).collect();
    assert_eq!(
        names,
        vec![CONTROLLER_DETECTION, BASIC_READ_WRITE, PERFORMANCE_TEST, STABILITY_TEST]
    );
    assert!(result.is_passed(4), "{:?}", result.cases);
    assert_eq!(observer.progress, vec![25, 50, 75, 100]);
    assert_eq!(observer.results.len(), 4);
    assert!(observer
        .statuses
        .contains(&"Executing test: Stability Test".to_string()));
    assert!(result
        .get(PERFORMANCE_TEST)
        .is_some_and(|case| case.details.starts_with("1MB test (Average 1 times): Read speed=")));
    assert!(result
        .get(STABILITY_TEST)
        .is_some_and(|case| case.details == "Completed 3 random read/write tests, no errors"));
    assert!(!volume.path().join(TEST_DIR_NAME).exists());
}

#[test]
fn corrupted_read_back_fails_only_basic_read_write() {
    let volume = tempfile::tempdir().expect("volume");
    let mut source = FixedSource(Some(card_on(volume.path())));
    let io = Arc::new(CorruptingIo {
        target: "basic_rw_test.bin",
    });
    let mut suite = TestSuite::with_io(fast_config().test, io).without_delays();

    let rounds = suite.run_rounds(1, &mut source, &CancelToken::new(), &mut NoopObserver);
    let round = rounds.last().expect("one round");
    let basic = round.get(BASIC_READ_WRITE).expect("basic case ran");

    assert_eq!(basic.status, CaseStatus::Failed);
    assert!(basic.details.starts_with(DATA_VERIFICATION_FAILED));
    assert!(basic.details.contains("blake3"));
    assert_eq!(round.failed_cases(), 1);

    let summary = rounds.summary(4);
    assert_eq!(summary.counted_rounds, 1);
    assert_eq!(summary.failed_rounds, 1);
    assert_eq!(summary.verdict, RunVerdict::Failures);
}

#[test]
fn cancel_before_round_runs_nothing() {
    let volume = tempfile::tempdir().expect("volume");
    let mut source = FixedSource(Some(card_on(volume.path())));
    let mut suite = TestSuite::new(fast_config().test).without_delays();
    let cancel = CancelToken::new();
    cancel.cancel();

    let rounds = suite.run_rounds(3, &mut source, &cancel, &mut NoopObserver);

    assert_eq!(rounds.len(), 1);
    let round = rounds.last().expect("one round");
    assert!(round.cases.is_empty());
    assert_eq!(round.state, RunState::Stopped);
    assert_eq!(round.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(rounds.summary(4).verdict, RunVerdict::Stopped);
    assert!(!volume.path().join(TEST_DIR_NAME).exists());
}

#[test]
fn cancel_during_stability_reports_interrupted() {
    let volume = tempfile::tempdir().expect("volume");
    let mut source = FixedSource(Some(card_on(volume.path())));
    let flag = Arc::new(AtomicBool::new(false));
    let io = Arc::new(CancellingIo {
        trigger: "stability_test_1.bin",
        flag: Arc::clone(&flag),
    });
    let mut config = fast_config();
    config.test.stability.quick_iterations = 50;
    let mut suite = TestSuite::with_io(config.test, io).without_delays();
    let cancel = CancelToken::from_flag(flag);

    let rounds = suite.run_rounds(2, &mut source, &cancel, &mut NoopObserver);

    assert_eq!(rounds.len(), 1, "loop stops after a stopped round");
    let round = rounds.last().expect("one round");
    assert_eq!(round.state, RunState::Stopped);
    assert_eq!(round.cases.len(), 4);
    let stability = round.get(STABILITY_TEST).expect("stability ran");
    assert_eq!(stability.status, CaseStatus::Interrupted);
    assert_eq!(stability.details, INTERRUPTED_DETAIL);

    let summary = rounds.summary(4);
    assert_eq!(summary.counted_rounds, 0);
    assert_eq!(summary.incomplete_rounds, 1);
    assert!(!volume.path().join(TEST_DIR_NAME).exists());
}

#[test]
fn cancel_between_cases_keeps_collected_results() {
    struct CancelAfterFirst(CancelToken);

    impl sd_express_tester_core::RunObserver for CancelAfterFirst {
        fn test_result(&mut self, _round: usize, _result: &CaseResult) {
            self.0.cancel();
        }
    }

    let volume = tempfile::tempdir().expect("volume");
    let mut source = FixedSource(Some(card_on(volume.path())));
    let mut suite = TestSuite::new(fast_config().test).without_delays();
    let cancel = CancelToken::new();
    let mut observer = CancelAfterFirst(cancel.clone());

    let result = suite.run_round(1, &mut source, &cancel, &mut observer);

    assert_eq!(result.state, RunState::Stopped);
    assert_eq!(result.cases.len(), 1);
    assert!(result.cases[0].is_passed());
    assert!(!result.is_complete(4));
}

#[test]
fn missing_card_short_circuits_with_single_failure() {
    let mut suite = TestSuite::new(fast_config().test).without_delays();
    let mut observer = RecordingObserver::default();

    let rounds = suite.run_rounds(3, &mut FixedSource(None), &CancelToken::new(), &mut observer);

    assert_eq!(rounds.len(), 3);
    for round in &rounds.rounds {
        assert_eq!(round.state, RunState::Failed);
        assert_eq!(round.cases.len(), 1);
        assert_eq!(round.cases[0].name, PRECONDITION_ENTRY);
        assert_eq!(round.cases[0].details, NO_CARD_DETAIL);
    }
    assert!(observer.progress.is_empty());

    let summary = rounds.summary(4);
    assert_eq!(summary.precondition_failures, 3);
    assert_eq!(summary.verdict, RunVerdict::Failures);
}

fn slow_case(ctx: &mut CaseContext<'_>) -> Result<CaseResult> {
    thread::sleep(Duration::from_millis(1100));
    Ok(CaseResult::passed(ctx.name, "slow"))
}

fn quick_case(ctx: &mut CaseContext<'_>) -> Result<CaseResult> {
    Ok(CaseResult::passed(ctx.name, "quick"))
}

#[test]
fn round_timeout_stops_remaining_cases() {
    let volume = tempfile::tempdir().expect("volume");
    let mut source = FixedSource(Some(card_on(volume.path())));
    let mut config = fast_config();
    config.test.timeout = 1;
    let mut suite = TestSuite::new(config.test)
        .with_cases(vec![
            TestCase::new("Slow", slow_case),
            TestCase::new("Quick", quick_case),
        ])
        .without_delays();

    let result = suite.run_round(1, &mut source, &CancelToken::new(), &mut NoopObserver);

    assert_eq!(result.state, RunState::Stopped);
    assert_eq!(result.stop_reason, Some(StopReason::TimedOut));
    assert_eq!(result.cases.len(), 1);
    assert!(suite.cases()[0].passed);
    assert_eq!(suite.cases()[0].details, "slow");
}

fn failing_case(_ctx: &mut CaseContext<'_>) -> Result<CaseResult> {
    anyhow::bail!("device vanished")
}

#[test]
fn case_errors_become_failures_and_the_round_continues() {
    let volume = tempfile::tempdir().expect("volume");
    let mut source = FixedSource(Some(card_on(volume.path())));
    let mut suite = TestSuite::new(fast_config().test).with_cases(vec![
        TestCase::new("Broken", failing_case),
        TestCase::new("Quick", quick_case),
    ]);

    let result = suite.run_round(1, &mut source, &CancelToken::new(), &mut NoopObserver);

    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.cases[0].status, CaseStatus::Failed);
    assert_eq!(result.cases[0].details, "Test exception: device vanished");
    assert!(result.cases[1].is_passed());
}

#[test]
fn engine_drives_looping_rounds() {
    let volume = tempfile::tempdir().expect("volume");
    let mut config = fast_config();
    config.test.looping.enabled = true;
    config.test.looping.count = 2;

    let mut device = sd_reader();
    let letter = volume.path().to_string_lossy().to_string();
    device.drive_letter = Some(letter);
    let inferencer = ModeInferencer::new(Box::new(FixedProbe(45.0)), config.card.speed_threshold);
    let mut engine = Engine::new(
        config.clone(),
        Box::new(snapshot(vec![device], Vec::new())),
        inferencer,
        Box::new(RecordingReset::default()),
    );
    let mut suite = TestSuite::new(config.test.clone()).without_delays();

    let rounds = engine.run_tests(&mut suite, &CancelToken::new(), &mut NoopObserver);

    assert_eq!(rounds.len(), 2);
    let summary = rounds.summary(suite.cases().len());
    assert_eq!(summary.passed_rounds, 2, "{:?}", rounds);
    assert_eq!(summary.verdict, RunVerdict::AllPassed);
    let detection = rounds.rounds[0].get(CONTROLLER_DETECTION).expect("ran");
    assert_eq!(
        detection.details,
        format!("SD Host controller working normally, mode: {}", CardMode::Sd3_0.label())
    );
}
