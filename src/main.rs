//! stagehand CLI - runs engine-hosted test suites from the outside.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stagehand::config::{self, Config, DEFAULT_CONFIG_FILE, DebuggerConfig};
use stagehand::engine::{self, InstallOutcome};
use stagehand::report::{ConsoleReporter, JUnitReporter, MultiReporter};
use stagehand::session::{Session, load_suites};

/// Exit code for configuration errors detected before anything runs.
const EXIT_CONFIG_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Out-of-process test harness for engine-hosted suites", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the engine and run test suites in it
    Run {
        /// JSON file with an array of suite descriptors
        #[arg(short, long)]
        suites: PathBuf,

        /// JUnit XML output path (overrides the configured one)
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Run the engine under this debugger command, e.g. "gdb --args"
        #[arg(long, conflicts_with = "debug_attach")]
        debug_launch: Option<String>,

        /// Attach this debugger command after launch; `{pid}` is substituted
        #[arg(long)]
        debug_attach: Option<String>,
    },

    /// Install the worker bootstrap into the engine project
    Install {
        /// Engine project directory (overrides the configured one)
        #[arg(short, long)]
        project: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let outcome = match cli.command {
        Commands::Run {
            suites,
            junit,
            debug_launch,
            debug_attach,
        } => run_tests(&cli.config, &suites, junit, debug_launch, debug_attach, cli.verbose).await,
        Commands::Install { project } => install(&cli.config, project),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    }
}

/// Loads the configuration; a missing default file means defaults.
fn load(config_path: &Path) -> Result<Config> {
    if !config_path.exists() && config_path == Path::new(DEFAULT_CONFIG_FILE) {
        info!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
        return Ok(Config::default());
    }
    config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

async fn run_tests(
    config_path: &Path,
    suites_path: &Path,
    junit_path: Option<PathBuf>,
    debug_launch: Option<String>,
    debug_attach: Option<String>,
    verbose: bool,
) -> Result<i32> {
    let mut config = load(config_path)?;

    if let Some(line) = debug_launch {
        let mut argv = shell_words::split(&line)
            .with_context(|| format!("Invalid debugger command: {}", line))?;
        if argv.is_empty() {
            bail!("Empty debugger command");
        }
        let program = argv.remove(0);
        config.engine.debugger = DebuggerConfig::Launch {
            program,
            args: argv,
        };
    } else if let Some(command) = debug_attach {
        config.engine.debugger = DebuggerConfig::Attach { command };
    }

    let suites = load_suites(suites_path)?;
    if suites.is_empty() {
        warn!("{} contains no suites", suites_path.display());
    }

    let mut reporter = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    let junit_path = junit_path.or_else(|| config.report.junit.then(|| config.report.junit_path()));
    if let Some(path) = junit_path {
        reporter = reporter.with_reporter(JUnitReporter::new(path));
    }

    let session = Session::new(config).with_reporter(reporter);
    let engine = session.prepare()?;
    if let InstallOutcome::Installed(path) = &engine.bootstrap {
        info!("Installed worker bootstrap at {}", path.display());
    }

    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the run");
            token.cancel();
        }
    });

    let result = session.run(engine, suites).await;
    Ok(result.exit_code())
}

fn install(config_path: &Path, project: Option<PathBuf>) -> Result<i32> {
    let config = load(config_path)?;
    let project_dir = project.unwrap_or_else(|| config.engine.expanded_project_dir());
    match engine::install_bootstrap(&project_dir, &config.harness.channel)? {
        InstallOutcome::Installed(path) => println!("Installed {}", path.display()),
        InstallOutcome::AlreadyPresent(path) => println!("Already present: {}", path.display()),
    }
    Ok(0)
}

fn validate_config(config_path: &Path) -> Result<i32> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Stage timeout: {}s", config.harness.stage_timeout_secs);
    println!("  Session timeout: {}s", config.harness.session_timeout_secs);
    println!("  Capture stdout: {}", config.harness.capture_stdout);
    println!("  Report orphans: {}", config.harness.report_orphans);
    println!("  Channel: {}", config.harness.channel);
    println!(
        "  Project: {}",
        config.engine.expanded_project_dir().display()
    );
    match engine::resolve_engine_binary(&config.engine.binary_env) {
        Ok(path) => println!("  Engine: {}", path.display()),
        Err(e) => println!("  Engine: {}", e),
    }
    let debugger = match &config.engine.debugger {
        DebuggerConfig::None => "none".to_string(),
        DebuggerConfig::Launch { program, .. } => format!("launch ({})", program),
        DebuggerConfig::Attach { command } => format!("attach ({})", command),
    };
    println!("  Debugger: {}", debugger);
    if config.report.junit {
        println!("  JUnit: {}", config.report.junit_path().display());
    }
    Ok(0)
}

fn init_config(config_path: &Path) -> Result<i32> {
    if config_path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            config_path.display()
        );
        return Ok(1);
    }

    std::fs::write(config_path, config::default_config_toml()?)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Created {}", config_path.display());
    println!();
    println!("Point the engine variable at your engine binary, then run:");
    println!("  stagehand run --suites suites.json");
    Ok(0)
}
