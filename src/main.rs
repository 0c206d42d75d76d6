//! tirun CLI - Test Intelligence run-tests step.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tirun::ci_env;
use tirun::config;
use tirun::orchestrator::{Orchestrator, combine_errors};
use tirun::process::{OutputCallback, OutputLine, ShellExecutor};
use tirun::runner::{RunnerContext, build_runner};
use tirun::service::TiClient;

#[derive(Parser)]
#[command(name = "tirun")]
#[command(about = "Run tests with test selection, splitting and call graph collection", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tirun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the step
    Run {
        /// Also write the test command's output to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Print the tests found in the workspace as JSON
    Detect,

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { log_file } => run_step(&cli.config, log_file.as_deref()).await,
        Commands::Detect => detect_tests(&cli.config).await,
        Commands::Validate => validate_config(&cli.config),
    }
}

async fn run_step(config_path: &Path, log_file: Option<&Path>) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());

    let env = ci_env::process_env();
    let log = match log_file {
        Some(path) => Some(Arc::new(Mutex::new(BufWriter::new(
            File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?,
        )))),
        None => None,
    };

    let executor = ShellExecutor::new().with_output(output_callback(log.clone()));
    let mut orchestrator =
        Orchestrator::new(config.clone(), env.clone()).with_executor(Arc::new(executor));
    match TiClient::from_config(&config.service, &env) {
        Ok(Some(client)) => {
            let client = Arc::new(client);
            orchestrator = orchestrator
                .with_selection_service(client.clone())
                .with_timing_service(client);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Could not create service client, running without it"),
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping tests");
            on_signal.cancel();
        }
    });

    let result = orchestrator.run(&cancel).await;

    let log_close = log.and_then(|writer| match writer.lock() {
        Ok(mut writer) => writer.flush().err(),
        Err(_) => Some(std::io::Error::other("log writer poisoned")),
    });
    let attempts = result.attempts;
    match combine_errors(result.error, log_close) {
        None => {
            let mut names: Vec<_> = result.outputs.iter().collect();
            names.sort();
            for (name, value) in names {
                println!("{}={}", name, value);
            }
            info!(attempts, "Step succeeded");
            Ok(())
        }
        Some(e) => {
            eprintln!("Step failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn output_callback(log: Option<Arc<Mutex<BufWriter<File>>>>) -> OutputCallback {
    Arc::new(move |line: &OutputLine| {
        let text = match line {
            OutputLine::Stdout(text) => {
                println!("{}", text);
                text
            }
            OutputLine::Stderr(text) => {
                eprintln!("{}", text);
                text
            }
        };
        if let Some(log) = &log
            && let Ok(mut writer) = log.lock()
        {
            let _ = writeln!(writer, "{}", text);
        }
    })
}

async fn detect_tests(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)?;
    let ctx = RunnerContext {
        test_globs: config.step.test_globs.clone(),
        ..RunnerContext::new(config.workspace())
    };
    let runner = build_runner(config.step.language, config.step.build_tool, ctx)?;
    let tests = runner
        .auto_detect_tests()
        .await
        .with_context(|| format!("{} test detection failed", runner.name()))?;

    println!("{}", serde_json::to_string_pretty(&tests)?);
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            let step = &config.step;
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Step: {}", step.id);
            println!("  Language: {}", step.language);
            println!("  Build tool: {}", step.build_tool);
            println!("  Timeout: {}s", step.effective_timeout_secs());
            println!("  Attempts: {}", step.effective_retries());
            println!("  Split strategy: {}", step.split_strategy);
            println!(
                "  Service: {}",
                config.service.endpoint.as_deref().unwrap_or("not configured")
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
