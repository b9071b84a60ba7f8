use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use sd_express_tester_core::config::DEFAULT_CONFIG_FILE;
use sd_express_tester_core::report::{human_bytes, verdict_label};
use sd_express_tester_core::{
    build_run_report, collect_doctor_info, write_json_report, write_text_report, CancelToken,
    CardInfo, CaseResult, Config, ControllerInfo, DeviceInventory, Engine, RunObserver,
    SnapshotInventory, TestSuite, WorkaroundOutcome,
};
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Debug, Parser)]
#[command(
    name = "sd-express-tester",
    version,
    about = "Detect SD / SD Express cards, reconcile their host controller and run diagnostic test rounds"
)]
struct Cli {
    /// Configuration file (YAML, or JSON with a .json extension).
    #[arg(long, global = true, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Read devices and controllers from a JSON snapshot instead of the host.
    #[arg(long, global = true, value_name = "FILE")]
    inventory: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify attached storage and infer the card's bus mode.
    Detect(DetectArgs),
    /// Show the reconciled host controller and its supported generations.
    Controller,
    /// Run the diagnostic test rounds and write a report.
    Run(RunArgs),
    /// Enforce the configured SD4.0 policy by power-cycling the host controller.
    ApplyPolicy,
    /// Print environment, inventory verdicts and controller info as JSON.
    Doctor,
    /// Write the default configuration file.
    InitConfig(InitConfigArgs),
}

#[derive(Debug, Args)]
struct DetectArgs {
    /// Re-measure the card even when the cached identity is unchanged.
    #[arg(long, default_value_t = false)]
    full: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Text report path; defaults to test_report_<timestamp>.txt.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
    /// Also write the report as JSON.
    #[arg(long, value_name = "FILE")]
    json: Option<PathBuf>,
    /// Apply the SD4.0 policy before the first round.
    #[arg(long, default_value_t = false)]
    apply_policy: bool,
}

#[derive(Debug, Args)]
struct InitConfigArgs {
    /// Overwrite an existing file.
    #[arg(long, default_value_t = false)]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_filter = init_tracing();
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    apply_log_level(log_filter.as_ref(), &config.logger.level);

    match cli.command {
        Commands::Detect(args) => {
            let mut engine = build_engine(config, cli.inventory.as_deref())?;
            run_detect_command(&mut engine, args)
        }
        Commands::Controller => {
            let mut engine = build_engine(config, cli.inventory.as_deref())?;
            run_controller_command(&mut engine);
            Ok(())
        }
        Commands::Run(args) => {
            let mut engine = build_engine(config, cli.inventory.as_deref())?;
            run_test_command(&mut engine, args)
        }
        Commands::ApplyPolicy => {
            let mut engine = build_engine(config, cli.inventory.as_deref())?;
            run_apply_policy_command(&mut engine)
        }
        Commands::Doctor => {
            let mut engine = build_engine(config, cli.inventory.as_deref())?;
            let info = collect_doctor_info(&mut engine, Some(&cli.config));
            let payload =
                serde_json::to_string_pretty(&info).context("failed to serialize doctor info")?;
            println!("{payload}");
            Ok(())
        }
        Commands::InitConfig(args) => run_init_config_command(&cli.config, args),
    }
}

fn build_engine(config: Config, inventory: Option<&Path>) -> Result<Engine> {
    match inventory {
        Some(path) => {
            let snapshot = SnapshotInventory::load(path)
                .with_context(|| format!("failed to load inventory {}", path.display()))?;
            let inventory: Box<dyn DeviceInventory> = Box::new(snapshot);
            Ok(Engine::with_inventory(config, inventory))
        }
        None => Ok(Engine::with_defaults(config)),
    }
}

fn run_detect_command(engine: &mut Engine, args: DetectArgs) -> Result<()> {
    match engine.check_card(!args.full) {
        Some(card) => print_card(&card),
        None => println!("No SD card detected."),
    }
    Ok(())
}

fn run_controller_command(engine: &mut Engine) {
    engine.check_card(true);
    match engine.controller_info() {
        Some(controller) => print_controller(&controller),
        None => println!("SD controller may be incompatible or already in NVMe mode."),
    }
}

fn run_test_command(engine: &mut Engine, args: RunArgs) -> Result<()> {
    let cancel = CancelToken::new();
    let wait = Duration::from_secs(engine.config().test.card_wait_timeout);
    let Some(card) = engine.wait_for_card(wait, &cancel) else {
        anyhow::bail!(
            "no SD card detected within {}s; insert a card and retry",
            wait.as_secs()
        );
    };
    print_card(&card);

    if args.apply_policy {
        report_workaround(engine.apply_generation_policy());
    }

    let controller = engine.controller_info();
    if let Some(controller) = &controller {
        print_controller(controller);
    }

    let mut suite = TestSuite::new(engine.config().test.clone());
    let mut observer = ConsoleObserver::default();
    let rounds = engine.run_tests(&mut suite, &cancel, &mut observer);

    let report = build_run_report(
        engine.config(),
        engine.last_card().cloned(),
        controller,
        &suite.case_names(),
        rounds,
    );

    let output = args.output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "test_report_{}.txt",
            Local::now().format("%Y%m%d_%H%M%S")
        ))
    });
    write_text_report(&report, &output)?;
    println!("Report written to {}", output.display());

    if let Some(json) = args.json {
        write_json_report(&report, &json)?;
        println!("JSON report written to {}", json.display());
    }

    let summary = &report.summary;
    println!(
        "Rounds: {} recorded, {} counted, {} passed, {} failed, {} incomplete. Verdict: {}",
        summary.total_rounds,
        summary.counted_rounds,
        summary.passed_rounds,
        summary.failed_rounds,
        summary.incomplete_rounds,
        verdict_label(summary.verdict)
    );

    Ok(())
}

fn run_apply_policy_command(engine: &mut Engine) -> Result<()> {
    if engine.check_card(true).is_none() {
        println!("No SD card detected.");
        return Ok(());
    }
    let outcome = engine.apply_generation_policy();
    let failed = matches!(outcome, WorkaroundOutcome::Failed(_));
    report_workaround(outcome);
    if failed {
        anyhow::bail!("SD4.0 workaround failed");
    }
    Ok(())
}

fn run_init_config_command(path: &Path, args: InitConfigArgs) -> Result<()> {
    if path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }
    Config::write_default(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Default configuration written to {}", path.display());
    Ok(())
}

fn report_workaround(outcome: WorkaroundOutcome) {
    match outcome {
        WorkaroundOutcome::NotApplicable(reason) => println!("SD4.0 policy: {reason}"),
        WorkaroundOutcome::Applied(card) => {
            println!("SD4.0 policy applied; card re-detected.");
            print_card(&card);
        }
        WorkaroundOutcome::Failed(reason) => println!("SD4.0 workaround failed: {reason}"),
    }
}

fn print_card(card: &CardInfo) {
    println!(
        "Card: {} [{}] {} capacity={} controller={} mode={}",
        card.name,
        card.drive_letter,
        card.device_path,
        human_bytes(card.capacity_bytes),
        card.controller.label(),
        card.mode.label()
    );
}

fn print_controller(controller: &ControllerInfo) {
    println!(
        "Controller: {} ({})",
        controller.name,
        if controller.native {
            "native"
        } else {
            "via NVMe function"
        }
    );
    if let Some(instance_id) = &controller.instance_id {
        println!("  instance: {instance_id}");
    }
    if controller.supported_generations.is_empty() {
        println!("  supported generations: unknown");
    } else {
        println!(
            "  supported generations: {}",
            controller.supported_generations.join(", ")
        );
    }
}

/// Prints run callbacks as they arrive.
#[derive(Default)]
struct ConsoleObserver {
    last_progress: Option<u8>,
}

impl RunObserver for ConsoleObserver {
    fn progress(&mut self, percent: u8) {
        if self.last_progress != Some(percent) {
            println!("[{percent:>3}%]");
            self.last_progress = Some(percent);
        }
    }

    fn status(&mut self, message: &str) {
        if message.starts_with("Test round") {
            self.last_progress = None;
        }
        println!("{message}");
    }

    fn test_result(&mut self, round: usize, result: &CaseResult) {
        println!(
            "  round {round} | {}: {} - {}",
            result.name,
            result.status_label(),
            result.details.replace('\n', " | ")
        );
    }
}

/// Installs the subscriber before the configuration is read so config
/// warnings are printed. Returns a handle for the configured level unless
/// `RUST_LOG` pins the filter.
fn init_tracing() -> Option<FilterHandle> {
    let from_env = EnvFilter::try_from_default_env().ok();
    let pinned = from_env.is_some();
    let (filter, handle) = reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .ok()?;
    (!pinned).then_some(handle)
}

fn apply_log_level(handle: Option<&FilterHandle>, level: &str) {
    let Some(handle) = handle else {
        return;
    };
    match EnvFilter::try_new(level) {
        Ok(filter) => {
            if let Err(err) = handle.reload(filter) {
                warn!("cannot apply log level {level}: {err}");
            }
        }
        Err(err) => warn!("invalid logger.level {level:?}, keeping info: {err}"),
    }
}
