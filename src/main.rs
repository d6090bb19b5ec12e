use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::{LevelFilter, info};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

mod cli;
mod config;

use cli::Cli;
use cli::commands::{Commands, NetworkArgs, UpdateArgs};
use config::Config;
use georepl::domain::{LoopOptions, LoopParameters};
use georepl::indexer::Indexer;
use georepl::replication::{CheckResult, CommandImporter, HttpSource, Updater, check_for_updates, init_replication};
use georepl::store::{Connector, SqliteConnector};
use georepl::update::UpdateLoop;

/// Exit code after a second Ctrl-C (128 + SIGINT)
const INTERRUPT_EXIT_CODE: i32 = 130;

/// The first Ctrl-C lets the current iteration finish; any further one exits.
fn exits_on_interrupt(interrupts: u32) -> bool {
    interrupts > 1
}

fn setup_logging(cli: &Cli, config: &Config) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("georepl")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("georepl.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if cli.is_verbose() {
            LevelFilter::Debug
        } else {
            config
                .log_level
                .as_deref()
                .and_then(|l| l.parse().ok())
                .unwrap_or(LevelFilter::Info)
        };
        builder.filter_level(level);
    }
    builder.target(env_logger::Target::Pipe(target)).init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn socket_timeout(network: &NetworkArgs, config: &Config) -> Duration {
    Duration::from_secs(network.socket_timeout.unwrap_or(config.replication.socket_timeout_secs))
}

/// Loop parameters from the config file, with command line overrides.
fn loop_parameters(config: &Config, args: &UpdateArgs) -> LoopParameters {
    LoopParameters {
        dsn: config.database.path.clone(),
        import_tool: config.import.tool.clone(),
        import_cache_mb: args.import_cache.unwrap_or(config.import.cache_mb),
        import_style: config.import.style.clone(),
        flatnode_file: config.import.flatnode_file.clone(),
        threads: args.threads.unwrap_or(config.indexer.threads).max(1),
        base_url: config.replication.url.clone(),
        update_interval: Duration::from_secs(config.replication.update_interval_secs),
        max_diff_size_mb: config.replication.max_diff_size_mb,
        import_file: config.import_file(),
        indexed_only: !args.once,
        socket_timeout: socket_timeout(&args.network, config),
    }
}

fn loop_options(config: &Config, args: &UpdateArgs) -> LoopOptions {
    LoopOptions {
        once: args.once,
        do_index: !args.no_index,
        recheck_interval: Duration::from_secs(config.replication.recheck_interval_secs),
    }
}

fn connector(config: &Config) -> SqliteConnector {
    SqliteConnector::new(&config.database.path)
        .with_busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))
}

async fn handle_init_command(network: &NetworkArgs, config: &Config) -> Result<i32> {
    info!("Initialising replication from {}", config.replication.url);
    let store = connector(config).connect().context("Failed to open store")?;
    let source = HttpSource::new(&config.replication.url, socket_timeout(network, config))?;

    let seq = init_replication(&store, &source).await?;
    println!("{} updates will start at sequence {}", "Replication initialised:".green(), seq);
    Ok(0)
}

async fn handle_check_command(network: &NetworkArgs, config: &Config) -> Result<i32> {
    let store = connector(config).connect().context("Failed to open store")?;
    let source = HttpSource::new(&config.replication.url, socket_timeout(network, config))?;

    let result = check_for_updates(&store, &source).await?;
    match result {
        CheckResult::UpdatesAvailable { current, available } => {
            println!("{} sequence {} -> {}", "New data available:".green(), current, available);
        }
        CheckResult::UpToDate => println!("{}", "Database is up to date.".cyan()),
        CheckResult::ServerUnavailable => println!("{}", "Replication service unavailable.".red()),
        CheckResult::NotInitialised => println!("{}", "Replication not set up. Run 'georepl init'.".yellow()),
    }
    Ok(result.exit_code())
}

async fn handle_update_command(args: &UpdateArgs, config: &Config) -> Result<i32> {
    let params = loop_parameters(config, args);
    let options = loop_options(config, args);
    info!("Starting updates from {} (once: {})", params.base_url, options.once);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut interrupts = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            interrupts += 1;
            if exits_on_interrupt(interrupts) {
                log::warn!("Second interrupt received, exiting immediately");
                eprintln!("{}", "Interrupted.".red());
                std::process::exit(INTERRUPT_EXIT_CODE);
            }
            info!("Interrupt received, finishing current iteration");
            println!("{}", "Finishing current iteration. Press Ctrl-C again to exit now.".yellow());
            let _ = shutdown_tx.send(true);
        }
    });

    let store = connector(config);
    let source = HttpSource::new(&params.base_url, params.socket_timeout)?;
    let updater = Updater::new(source, CommandImporter::new());
    let indexer = Indexer::with_batch_size(store.clone(), params.threads, config.indexer.batch_size);

    let mut update = UpdateLoop::new(store, updater, indexer, params, options).with_shutdown(shutdown_rx);
    let outcome = update.run().await?;

    info!("Updates finished: {}", outcome);
    Ok(outcome.exit_code())
}

fn run_application(cli: &Cli, config: &Config) -> Result<i32> {
    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        match &cli.command {
            Commands::Init { network } => handle_init_command(network, config).await,
            Commands::Check { network } => handle_check_command(network, config).await,
            Commands::Update(args) => handle_update_command(args, config).await,
        }
    })
}

fn report_error(err: &eyre::Report) -> i32 {
    log::error!("{:#}", err);

    match err.downcast_ref::<georepl::Error>() {
        Some(e) if e.is_usage() => {
            eprintln!("{} {}", "Usage error:".red(), e);
        }
        Some(e) if e.is_retryable() => {
            eprintln!("{} {:#}", "Error:".red(), err);
            eprintln!("{}", "The replication service could not be reached. Try again later.".yellow());
        }
        _ => eprintln!("{} {:#}", "Error:".red(), err),
    }
    1
}

fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    let code = Config::load(cli.config.as_ref())
        .context("Failed to load configuration")
        .and_then(|config| {
            setup_logging(&cli, &config).context("Failed to setup logging")?;
            info!("Starting with config from: {:?}", cli.config);
            run_application(&cli, &config)
        })
        .unwrap_or_else(|e| report_error(&e));

    std::process::exit(code);
}
