use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use mobile_pilot::config::{self, Config};
use mobile_pilot::device::{AdbBridge, Bounds, DeviceBridge, DeviceRegistry, MockDevice, MockScreen, UiElement};
use mobile_pilot::journal::RunJournal;
use mobile_pilot::logging;
use mobile_pilot::perception::SnapshotBuilder;
use mobile_pilot::reasoning::{Planner, ReasoningProvider, VlmConfig, VlmProvider, check_health};
use mobile_pilot::validator::{ModelValidator, ResultValidator, ScreenDiffValidator};
use mobile_pilot::{LoopConfig, ProgressEvent, RecoveryController, TaskResult, TaskStatus};

/// Mobile Pilot - natural-language automation of mobile devices
#[derive(Parser, Debug)]
#[command(
    name = "mobile-pilot",
    about = "Drive an Android device from a natural-language instruction using a vision language model",
    after_help = "ENVIRONMENT VARIABLES:\n\
        MOBILE_PILOT_VLM_ENDPOINT     Chat completions endpoint URL\n\
        MOBILE_PILOT_VLM_MODEL        Model name\n\
        MOBILE_PILOT_VLM_API_KEY      Bearer token (falls back to OPENAI_API_KEY)\n\
        MOBILE_PILOT_DEVICE_SERIAL    Default device serial\n\
        MOBILE_PILOT_JOURNAL_DIR      Base directory for run journals\n\
        RUST_LOG                      Log filter (overrides -v)"
)]
struct Args {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ValidatorKind {
    /// Compare screens and look for expected text
    Diff,
    /// Ask the provider whether the goal holds
    Model,
}

#[derive(clap::Args, Debug)]
struct ProviderArgs {
    /// Chat completions endpoint URL
    #[arg(long, env = "MOBILE_PILOT_VLM_ENDPOINT")]
    endpoint: Option<String>,

    /// Model name
    #[arg(long, env = "MOBILE_PILOT_VLM_MODEL")]
    model: Option<String>,

    /// Bearer token for the endpoint
    #[arg(long, env = "MOBILE_PILOT_VLM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Second endpoint tried when the first fails
    #[arg(long, env = "MOBILE_PILOT_FALLBACK_ENDPOINT")]
    fallback_endpoint: Option<String>,

    /// Model for the fallback endpoint (defaults to --model)
    #[arg(long, env = "MOBILE_PILOT_FALLBACK_MODEL")]
    fallback_model: Option<String>,
}

#[derive(clap::Args, Debug)]
struct LoopArgs {
    /// Text that must appear on screen for the goal to count as met (repeatable)
    #[arg(long = "expect-text")]
    expect_text: Vec<String>,

    /// How each action's result is judged
    #[arg(long, value_enum, default_value = "diff")]
    validator: ValidatorKind,

    /// Consecutive failed iterations before giving up
    #[arg(long)]
    max_failures: Option<u32>,

    /// Hard cap on planning iterations
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Capture retries before giving up
    #[arg(long)]
    max_perceive_retries: Option<u32>,

    /// Transient planning retries before giving up
    #[arg(long)]
    max_plan_retries: Option<u32>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Journal directory (kept); default is an auto-named run directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep the auto-named journal directory after the run
    #[arg(long)]
    keep: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Carry out an instruction on an attached device
    Run {
        /// What to do, in plain language
        instruction: String,

        /// Device serial (default: MOBILE_PILOT_DEVICE_SERIAL or the first online device)
        #[arg(short, long)]
        serial: Option<String>,

        #[command(flatten)]
        provider: ProviderArgs,

        #[command(flatten)]
        limits: LoopArgs,
    },

    /// List attached devices
    Devices,

    /// Run an instruction against the built-in mock device (a small login flow)
    Demo {
        instruction: String,

        #[command(flatten)]
        provider: ProviderArgs,

        #[command(flatten)]
        limits: LoopArgs,
    },

    /// Capture one snapshot and print its elements
    Inspect {
        #[arg(short, long)]
        serial: Option<String>,

        /// Also write the screenshot to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    logging::init(args.verbose, args.log_json);
    let cfg = config::get();

    match args.command {
        Some(Commands::Run {
            instruction,
            serial,
            provider,
            limits,
        }) => {
            let serial = resolve_serial(cfg, serial).await?;
            let bridge: Arc<dyn DeviceBridge> = Arc::new(adb_bridge(cfg, &serial));
            let status = run(cfg, bridge, &instruction, &provider, &limits).await?;
            exit_for(status);
        }

        Some(Commands::Demo {
            instruction,
            provider,
            limits,
        }) => {
            let bridge: Arc<dyn DeviceBridge> = Arc::new(demo_device());
            let status = run(cfg, bridge, &instruction, &provider, &limits).await?;
            exit_for(status);
        }

        Some(Commands::Devices) => {
            let wait = Duration::from_secs(cfg.device.command_timeout);
            let devices = AdbBridge::list_devices(Path::new(&cfg.device.adb_path), wait).await?;
            if devices.is_empty() {
                println!("No devices attached");
            }
            for device in devices {
                println!("{}\t{}", device.serial, device.state);
            }
        }

        Some(Commands::Inspect {
            serial,
            output,
            json,
        }) => {
            let serial = resolve_serial(cfg, serial).await?;
            let bridge = adb_bridge(cfg, &serial);
            let snapshot = SnapshotBuilder::new(Duration::from_secs(cfg.device.command_timeout))
                .build(&bridge)
                .await?;

            if let Some(path) = &output {
                std::fs::write(path, snapshot.image())?;
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&*snapshot)?);
            } else {
                println!(
                    "{} {}x{}: {} element(s)",
                    serial,
                    snapshot.screen.width,
                    snapshot.screen.height,
                    snapshot.elements().len()
                );
                for element in snapshot.elements() {
                    let marker = if element.interactive { "*" } else { " " };
                    println!(
                        "{} [{}] {} {} \"{}\"",
                        marker, element.id, element.role, element.bounds, element.label
                    );
                }
                if let Some(path) = &output {
                    println!("\nScreenshot: {}", path.display());
                }
            }
        }

        None => {
            println!("Mobile Pilot - natural-language automation of mobile devices");
            println!();
            println!("Usage: mobile-pilot <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run      Carry out an instruction on an attached device");
            println!("  devices  List attached devices");
            println!("  demo     Run an instruction against the built-in mock device");
            println!("  inspect  Capture one snapshot and print its elements");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}

fn exit_for(status: TaskStatus) {
    let code = match status {
        TaskStatus::Succeeded => 0,
        TaskStatus::Aborted => 130,
        _ => 1,
    };
    if code != 0 {
        std::process::exit(code);
    }
}

fn adb_bridge(cfg: &Config, serial: &str) -> AdbBridge {
    AdbBridge::new(serial)
        .adb_path(&cfg.device.adb_path)
        .timeout(Duration::from_secs(cfg.device.command_timeout))
}

async fn resolve_serial(cfg: &Config, serial: Option<String>) -> Result<String, Box<dyn Error>> {
    if let Some(serial) = serial.or_else(|| cfg.device.serial.clone()) {
        return Ok(serial);
    }
    let wait = Duration::from_secs(cfg.device.command_timeout);
    let devices = AdbBridge::list_devices(Path::new(&cfg.device.adb_path), wait).await?;
    devices
        .into_iter()
        .find(|d| d.is_online())
        .map(|d| d.serial)
        .ok_or_else(|| "no online device found; pass --serial".into())
}

fn planner(cfg: &Config, args: &ProviderArgs) -> Result<(Planner, Arc<dyn ReasoningProvider>), Box<dyn Error>> {
    let mut primary = VlmConfig::default();
    if let Some(endpoint) = &args.endpoint {
        primary.endpoint = endpoint.clone();
    }
    if let Some(model) = &args.model {
        primary.model = model.clone();
    }
    if let Some(key) = &args.api_key {
        primary.api_key = Some(key.clone());
    }

    let provider: Arc<dyn ReasoningProvider> = Arc::new(VlmProvider::new(primary.clone())?);
    let mut planner = Planner::new(Arc::clone(&provider));

    let fallback_endpoint = args
        .fallback_endpoint
        .clone()
        .or_else(|| cfg.provider.fallback_endpoint.clone());
    if let Some(endpoint) = fallback_endpoint {
        let model = args
            .fallback_model
            .clone()
            .or_else(|| cfg.provider.fallback_model.clone())
            .unwrap_or_else(|| primary.model.clone());
        let fallback = VlmConfig {
            endpoint,
            model,
            ..primary
        };
        planner = planner.fallback(Arc::new(VlmProvider::new(fallback)?.named("fallback")));
    }
    Ok((planner, provider))
}

fn loop_config(cfg: &Config, args: &LoopArgs) -> LoopConfig {
    let mut config = LoopConfig::from_config(cfg);
    if let Some(n) = args.max_failures {
        config = config.max_consecutive_failures(n);
    }
    if let Some(n) = args.max_iterations {
        config = config.max_total_iterations(n);
    }
    if let Some(n) = args.max_perceive_retries {
        config = config.max_perceive_retries(n);
    }
    if let Some(n) = args.max_plan_retries {
        config = config.max_plan_retries(n);
    }
    config
}

async fn run(
    cfg: &Config,
    bridge: Arc<dyn DeviceBridge>,
    instruction: &str,
    provider: &ProviderArgs,
    args: &LoopArgs,
) -> Result<TaskStatus, Box<dyn Error>> {
    let (planner, primary) = planner(cfg, provider)?;
    let endpoint = provider
        .endpoint
        .clone()
        .unwrap_or_else(|| cfg.provider.endpoint.clone());
    if !check_health(&endpoint, Duration::from_secs(5)).await {
        eprintln!("Warning: no response from provider at {}", endpoint);
    }

    let validator: Arc<dyn ResultValidator> = match args.validator {
        ValidatorKind::Diff => Arc::new(ScreenDiffValidator::new().expect_all(args.expect_text.clone())),
        ValidatorKind::Model => Arc::new(ModelValidator::new(primary)),
    };

    let device = bridge.id().to_string();
    let journal = match &args.output {
        Some(dir) => RunJournal::in_dir(dir, &device)?,
        None => RunJournal::create(instruction, &device)?.keep(args.keep),
    };
    let journal = Arc::new(Mutex::new(journal));

    let registry = DeviceRegistry::new();
    let lease = registry.acquire(bridge, format!("cli-{}", std::process::id()))?;

    let quiet = args.json;
    let progress_journal = Arc::clone(&journal);
    let controller = RecoveryController::builder(lease, planner)
        .validator(validator)
        .config(loop_config(cfg, args))
        .on_progress(move |event| match event {
            ProgressEvent::Snapshot(snapshot) => {
                if let Err(e) = progress_journal.lock().record_snapshot(snapshot) {
                    tracing::warn!(error = %e, "failed to journal snapshot");
                }
            }
            ProgressEvent::Step(step) if !quiet => eprintln!("  {}", step.describe()),
            _ => {}
        })
        .build()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping after the current call...");
            on_signal.cancel();
        }
    });

    let result = controller.run_task(instruction, cancel).await;

    let journal = journal.lock();
    journal.record_result(&result)?;
    report(&result, args.json, journal.kept_dir())?;
    Ok(result.status)
}

fn report(result: &TaskResult, json: bool, journal: Option<&Path>) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!("{}: {}", result.status, result.summary);
    println!(
        "  {} step(s), {} iteration(s), {} ms",
        result.steps.len(),
        result.recovery.total_iterations,
        result.duration_ms
    );
    if let Some(kind) = result.last_error {
        println!("  Last error: {}", kind);
    }
    if let Some(dir) = journal {
        println!("\nJournal: {}", dir.display());
    }
    Ok(())
}

/// Login screen, then a home screen with a settings entry
fn demo_device() -> MockDevice {
    let login = MockScreen::new("login", 360, 640)
        .element(
            UiElement::new("title", Bounds::new(20, 40, 340, 80))
                .role("TextView")
                .label("Sign in")
                .interactive(false),
        )
        .element(
            UiElement::new("email", Bounds::new(20, 120, 340, 170))
                .role("EditText")
                .label("Email"),
        )
        .element(
            UiElement::new("sign_in", Bounds::new(20, 200, 340, 250))
                .role("Button")
                .label("Sign in"),
        );
    let home = MockScreen::new("home", 360, 640)
        .element(
            UiElement::new("welcome", Bounds::new(20, 40, 340, 80))
                .role("TextView")
                .label("Welcome")
                .interactive(false),
        )
        .element(
            UiElement::new("settings", Bounds::new(20, 120, 340, 170))
                .role("Button")
                .label("Settings"),
        );
    let settings = MockScreen::new("settings", 360, 640)
        .element(
            UiElement::new("header", Bounds::new(20, 40, 340, 80))
                .role("TextView")
                .label("Settings")
                .interactive(false),
        )
        .element(
            UiElement::new("wifi", Bounds::new(20, 120, 340, 170))
                .role("Switch")
                .label("Wi-Fi"),
        );

    MockDevice::named("demo-device", login)
        .screen(home)
        .screen(settings)
        .on_tap("login", "sign_in", "home")
        .on_tap("home", "settings", "settings")
}
