//! bench - manage and run The Bench's plugin bundles.
//!
//! Usage:
//!   bench list               Show installed bundles
//!   bench install FILE       Copy a bundle into the store and start it
//!   bench enable ID          Enable a bundle (takes effect on next run)
//!   bench disable ID         Disable a bundle (takes effect on next run)
//!   bench remove ID          Delete a bundle and its flag
//!   bench run                Start all enabled bundles until Ctrl-C
//!   bench --help             Show help

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use bench_core::AppConfig;
use bench_plugin::{BundleReport, BundleState, LifecycleManager, PluginConfig};

#[derive(Parser)]
#[command(
    name = "bench",
    version,
    about = "Plugin manager for The Bench",
    long_about = "bench installs, enables, removes and runs third-party plugin bundles.\n\n\
                  Bundles are single Lua (.lua, .plugin) or Rhai (.rhai) scripts kept in \
                  the plugin directory. Enabling or disabling a bundle takes effect the \
                  next time plugins are started."
)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the plugin directory
    #[arg(long, global = true)]
    plugin_dir: Option<PathBuf>,

    /// Override the settings file holding enabled flags
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Override the start timeout, in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Log plugin activity (same as RUST_LOG=info)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show installed bundles
    List,

    /// Copy a bundle into the store, enable it and start it
    Install {
        /// Bundle file
        file: PathBuf,
    },

    /// Enable a bundle
    Enable {
        /// Bundle id (file name)
        id: String,
    },

    /// Disable a bundle
    Disable {
        /// Bundle id (file name)
        id: String,
    },

    /// Delete a bundle and its flag
    Remove {
        /// Bundle id (file name)
        id: String,
    },

    /// Start all enabled bundles and keep them running until interrupted
    Run,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let manager = LifecycleManager::open(&PluginConfig::from_app_config(&config))
        .context("Failed to open plugin store")?;

    match cli.command {
        Command::List => {
            let bundles = manager.list_installed()?;
            match cli.format {
                OutputFormat::Text => {
                    if bundles.is_empty() {
                        println!("No bundles installed in {}", config.plugin_dir.display());
                    }
                    for bundle in &bundles {
                        let flag = if bundle.enabled { "enabled" } else { "disabled" };
                        println!("{:<32} {:<9} {}", bundle.id, flag, bundle.state);
                    }
                }
                OutputFormat::Json => print_json(&bundles)?,
            }
        }
        Command::Install { file } => {
            let outcome = manager
                .install(&file)
                .await
                .with_context(|| format!("Failed to install {}", file.display()))?;
            match cli.format {
                OutputFormat::Text => {
                    println!("Installed {} ({})", outcome.bundle.id, describe(&outcome.state));
                    if outcome.restart_required {
                        println!("Restart required for the new version to take effect.");
                    }
                }
                OutputFormat::Json => print_json(&outcome)?,
            }
            manager.shutdown().await;
        }
        Command::Enable { id } => toggle(&manager, &id, true, cli.format)?,
        Command::Disable { id } => toggle(&manager, &id, false, cli.format)?,
        Command::Remove { id } => {
            let outcome = manager.remove(&id)?;
            match cli.format {
                OutputFormat::Text => println!("Removed {}", outcome.id),
                OutputFormat::Json => print_json(&outcome)?,
            }
        }
        Command::Run => run(manager, cli.format).await?,
    }

    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Config file, then command-line overrides.
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if let Some(dir) = &cli.plugin_dir {
        config = config.with_plugin_dir(dir);
    }
    if let Some(settings) = &cli.settings {
        config = config.with_settings_path(settings);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.start_timeout_ms = timeout_ms;
    }
    config.validate()?;
    Ok(config)
}

fn toggle(manager: &LifecycleManager, id: &str, enabled: bool, format: OutputFormat) -> Result<()> {
    let outcome = manager.toggle(id, enabled)?;
    match format {
        OutputFormat::Text => {
            let verb = if enabled { "Enabled" } else { "Disabled" };
            println!("{verb} {id}; takes effect the next time plugins start.");
        }
        OutputFormat::Json => print_json(&outcome)?,
    }
    Ok(())
}

/// Start everything, wait for Ctrl-C, stop everything.
async fn run(manager: LifecycleManager, format: OutputFormat) -> Result<()> {
    let reports = manager.startup().await?;
    match format {
        OutputFormat::Text => print_reports(&reports),
        OutputFormat::Json => print_json(&reports)?,
    }

    if !reports.iter().any(|r| r.state.is_started()) {
        tracing::info!("No plugins running");
        return Ok(());
    }

    eprintln!("Plugins running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    eprintln!("Stopping plugins...");
    manager.shutdown().await;
    Ok(())
}

fn print_reports(reports: &[BundleReport]) {
    println!("{}", "─".repeat(60));
    for report in reports {
        println!("{:<32} {}", report.bundle_id, describe(&report.state));
        for instance in &report.instances {
            println!("    {:<28} {}", instance.name, instance.state);
        }
    }
    println!("{}", "─".repeat(60));

    let started = reports.iter().filter(|r| r.state.is_started()).count();
    println!(" {} of {} bundle(s) started", started, reports.len());
}

fn describe(state: &BundleState) -> String {
    match state.failure() {
        Some(failure) => format!("{state}: {failure}"),
        None => state.to_string(),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
