//! pfw - packet forwarding and blocking rule engine
//!
//! Runs the REST control plane and keeps the gateway's nftables maps in step
//! with the stored rules.
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon (default command)
//! pfw serve --config /etc/pfw/config.json
//! pfw serve --dry-run                      # compile only, never call nft
//!
//! # Offline helpers
//! pfw show --state pfw.json                # compiled map summary
//! pfw show --state pfw.json --map pfw_block_tcp
//! pfw test-expr 'mode == "away" && hour >= 22' --var mode=away
//! pfw cron encode --days weekdays --start 08:00 --end 17:00
//! pfw cron decode '0 8-17 * * 1,2,3,4,5'
//! ```

use clap::{Parser, Subcommand};
use pfw::api::{self, AppState};
use pfw::audit::AuditLog;
use pfw::config::{ServiceConfig, load_state};
use pfw::core::compiler::Clock;
use pfw::core::engine::{Engine, compile_store};
use pfw::core::expr;
use pfw::core::identity::{Directory, FileDirectory, StaticDirectory};
use pfw::core::nft_json::{ApplyMode, NftApplier};
use pfw::core::schedule::{self, DaySet};
use pfw::core::store::RuleStore;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

shadow_rs::shadow!(build);

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "pfw")]
#[command(about = "Packet forwarding and blocking rule engine", long_about = None)]
#[command(version = build::CLAP_LONG_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the REST API and compiler service
    Serve {
        /// Service settings file (default: ~/.config/pfw/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the listen address
        #[arg(short, long)]
        listen: Option<String>,
        /// Compile but never apply to nftables
        #[arg(long)]
        dry_run: bool,
        /// Override the log level (error, warn, info, debug, trace)
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Compile a state file and print the resulting maps
    Show {
        /// Rule state file (default: from the service settings)
        #[arg(short, long)]
        state: Option<PathBuf>,
        /// Device directory JSON
        #[arg(short, long)]
        directory: Option<PathBuf>,
        /// Print one map in `nft -j list map` form
        #[arg(short, long)]
        map: Option<String>,
    },
    /// Evaluate a condition expression
    TestExpr {
        expr: String,
        /// Variable binding, repeatable
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
    },
    /// Convert between time windows and cron expressions
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },
}

#[derive(Subcommand)]
enum CronAction {
    /// Days and hours to a cron expression
    Encode {
        /// `weekdays`, `weekend`, `every day` or e.g. `mon,wed,fri`
        #[arg(long)]
        days: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// A cron expression back to days and hours
    Decode { expr: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve {
        config: None,
        listen: None,
        dry_run: false,
        log_level: None,
    });

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(command: Commands) -> CliResult {
    match command {
        Commands::Serve {
            config,
            listen,
            dry_run,
            log_level,
        } => serve(config, listen, dry_run, log_level).await,
        Commands::Show {
            state,
            directory,
            map,
        } => show(state, directory, map).await,
        Commands::TestExpr { expr, vars } => {
            let mut variables = BTreeMap::new();
            for binding in vars {
                let (name, value) = binding
                    .split_once('=')
                    .ok_or_else(|| format!("expected NAME=VALUE, got '{binding}'"))?;
                variables.insert(name.to_string(), value.to_string());
            }
            let report = expr::test(&expr, &variables);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                return Err("expression is not valid".into());
            }
            Ok(())
        }
        Commands::Cron { action } => {
            match action {
                CronAction::Encode { days, start, end } => {
                    let days: DaySet = days.parse()?;
                    println!("{}", schedule::encode(days, &start, &end)?);
                }
                CronAction::Decode { expr } => {
                    let (days, start, end) = schedule::decode(&expr)?;
                    println!("{days} {start}-{end}");
                }
            }
            Ok(())
        }
    }
}

fn init_logging(settings: &ServiceConfig) {
    let level = settings.log_level.parse::<tracing::Level>().unwrap_or_else(|_| {
        eprintln!("Unknown log level '{}', using info", settings.log_level);
        tracing::Level::INFO
    });
    let subscriber = tracing_subscriber::fmt().with_max_level(level);

    // Set up logging to file
    if let Some(path) = &settings.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                subscriber
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!("Cannot open log file {}: {e}", path.display()),
        }
    }
    subscriber.init();
}

fn directory_for(path: Option<PathBuf>) -> Arc<dyn Directory> {
    match path {
        Some(path) => Arc::new(FileDirectory::new(path)),
        None => {
            warn!("No device directory configured; device and group clients will not resolve");
            Arc::new(StaticDirectory::default())
        }
    }
}

async fn settings(path: Option<PathBuf>) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
    let path = path
        .or_else(ServiceConfig::default_path)
        .ok_or("cannot determine the config directory")?;
    Ok(ServiceConfig::load(&path).await?)
}

async fn serve(
    config: Option<PathBuf>,
    listen: Option<String>,
    dry_run: bool,
    log_level: Option<String>,
) -> CliResult {
    let mut settings = settings(config).await?;
    if let Some(level) = log_level {
        settings.log_level = level;
    }
    init_logging(&settings);
    info!(
        version = build::PKG_VERSION,
        commit = build::SHORT_COMMIT,
        "Starting pfw"
    );

    if let Some(listen) = listen {
        settings.listen = listen;
    }
    if dry_run {
        settings.apply = ApplyMode::DryRun;
    }
    if let Err(e) = pfw::utils::ensure_dirs() {
        warn!("Failed to create config/state directories: {e}");
    }

    let state = load_state(&settings.state_path).await?;
    let store = Arc::new(RuleStore::from_state(
        state,
        directory_for(settings.directory_path.clone()),
    ));
    let applier = NftApplier::new(settings.apply, &settings.nft_path);
    let engine = Engine::start(
        Arc::clone(&store),
        applier,
        settings.compile_mode,
        settings.debounce(),
    )
    .await;

    if settings.auth.is_empty() {
        warn!("No API credentials configured; mutating endpoints are unauthenticated");
    }
    let mut app = AppState::new(Arc::new(engine))
        .with_auth(settings.auth.clone())
        .with_state_path(settings.state_path.clone());
    if settings.audit_log {
        match AuditLog::in_state_dir() {
            Ok(audit) => {
                info!(path = %audit.path().display(), "Audit log enabled");
                app = app.with_audit(audit);
            }
            Err(e) => warn!("Audit log disabled: {e}"),
        }
    }

    let listener = tokio::net::TcpListener::bind(&settings.listen).await?;
    api::serve(listener, app, shutdown_signal()).await?;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

async fn show(state: Option<PathBuf>, directory: Option<PathBuf>, map: Option<String>) -> CliResult {
    let state_path = match state {
        Some(path) => path,
        None => settings(None).await?.state_path,
    };
    let state = load_state(&state_path).await?;
    let store = RuleStore::from_state(state, directory_for(directory));
    let compiled = compile_store(&store, Clock::now()).await;

    if let Some(name) = map {
        let map = compiled
            .maps
            .get(&name)
            .ok_or_else(|| format!("no map named '{name}'"))?;
        println!("{}", serde_json::to_string_pretty(&map.to_list_json())?);
        return Ok(());
    }

    println!("Checksum: {}", compiled.checksum);
    for map in compiled.maps.iter() {
        println!("  {:<36} {:>5} elements", map.name, map.elements.len());
    }
    if !compiled.warnings.is_empty() {
        println!("Warnings:");
        for w in &compiled.warnings {
            println!("  {}[{}] {}: {}", w.bucket, w.index, w.kind, w.message);
        }
    }
    Ok(())
}
