// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! logwarden: instrument-log routing and baseline renaming agent

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use logwarden::agent::{baseline_engine, Agent, AgentEvent, Outcome};
use logwarden::baseline::{extract_timestamp, marker_file_name, BaselineOutcome};
use logwarden::config::{AppConfig, WatchedFolder};
use logwarden::history::History;
use logwarden::lock::LockRetry;
use logwarden::router::{CopyOutcome, Router};
use logwarden::watcher::NotifySource;
use logwarden::{Result, WardenError};

/// logwarden CLI - instrument-log router and baseline renamer
#[derive(Parser, Debug)]
#[command(name = "logwarden")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Routes instrument logs and renames compare files from baselines", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch folders and process files as they settle
    Watch {
        /// Directories to watch (overrides config)
        #[arg(short, long)]
        dir: Vec<PathBuf>,

        /// Watch override directories recursively
        #[arg(short, long)]
        recursive: bool,

        /// Process files already present in watched folders on startup
        #[arg(long)]
        process_existing: bool,
    },

    /// Show (or perform) the routing of one file
    Route {
        /// File to route
        path: PathBuf,

        /// Copy the file instead of only printing the destination
        #[arg(long)]
        copy: bool,
    },

    /// Extract the timestamp from a baseline file
    Baseline {
        /// Baseline file
        path: PathBuf,

        /// Only print the marker name, don't write it
        #[arg(long)]
        dry_run: bool,
    },

    /// Run one compare-folder rename pass
    RenamePass {
        /// Show planned renames without performing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Rename journal and undo operations
    History {
        #[command(subcommand)]
        action: HistoryCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Initialize a new logwarden layout
    Init {
        /// Directory to initialize (default: current)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCommands {
    /// List recent renames
    List {
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        count: usize,
    },

    /// Undo recent renames
    Undo {
        /// Number of renames to undo
        #[arg(short, long, default_value = "1")]
        count: usize,

        /// Dry run (show what would be undone)
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear all history
    Clear {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Some(Commands::Watch { dir, recursive, process_existing }) => {
            run_watch(config, dir, recursive, process_existing).await
        }
        Some(Commands::Route { path, copy }) => run_route(&config, &path, copy),
        Some(Commands::Baseline { path, dry_run }) => run_baseline(&config, &path, dry_run),
        Some(Commands::RenamePass { dry_run }) => run_rename_pass(&config, dry_run),
        Some(Commands::History { action }) => run_history_command(&config, action),
        Some(Commands::Config { action }) => run_config_command(config, action, &cli.config),
        Some(Commands::Init { dir, force }) => run_init(dir, force),
        None => run_watch(config, vec![], false, false).await,
    }
}

/// Run the agent until Ctrl+C or SIGTERM
async fn run_watch(
    mut config: AppConfig,
    dir_overrides: Vec<PathBuf>,
    recursive: bool,
    process_existing: bool,
) -> Result<()> {
    if !dir_overrides.is_empty() {
        config.watch_folders = dir_overrides
            .into_iter()
            .map(|path| WatchedFolder { path, recursive })
            .collect();
    }

    info!("Watch folders: {:?}", config.watch_folders);
    if let Some(baseline) = config.baseline_folder() {
        info!("Baseline folder: {:?}", baseline);
    }

    let mut agent = Agent::new(config, Box::new(NotifySource::new()))?;
    let mut events = agent.subscribe();

    agent.start_watching()?;
    if process_existing {
        agent.process_existing()?;
    }

    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} agent events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    info!("Agent active. Press Ctrl+C to stop.");

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }

    agent.stop_watching();
    reporter.abort();
    info!("logwarden stopped.");
    Ok(())
}

/// Log sink for agent notifications
fn report(event: &AgentEvent) {
    match event {
        AgentEvent::Processed { source, destination, outcome } => match outcome {
            Outcome::Copied => info!("Routed {:?} -> {:?}", source, destination),
            Outcome::Deferred => warn!("Deferred {:?} (locked)", source),
            Outcome::Unrouted => info!("Left {:?} unrouted", source),
            Outcome::BaselineRecorded => info!("Baseline {:?} recorded as {:?}", source, destination),
            Outcome::BaselineRejected(reason) => error!("Baseline {:?} rejected: {}", source, reason),
            Outcome::Failed(reason) => error!("Processing {:?} failed: {}", source, reason),
        },
        AgentEvent::Renamed { from, to } => info!("Renamed {:?} -> {:?}", from, to),
    }
}

fn run_route(config: &AppConfig, path: &Path, copy: bool) -> Result<()> {
    let router = Router::from_config(&config.routing_rules)?;

    if !copy {
        match router.route(path) {
            Some(dest) => println!("{} -> {}", path.display(), dest.display()),
            None => println!("{}: no matching rule", path.display()),
        }
        return Ok(());
    }

    match router.copy_to_destination(path)? {
        CopyOutcome::Copied { destination, bytes } => {
            println!("Copied {} -> {} ({} bytes)", path.display(), destination.display(), bytes)
        }
        CopyOutcome::Deferred { .. } => println!("{} is locked, try again later", path.display()),
        CopyOutcome::Unrouted => println!("{}: no matching rule", path.display()),
    }
    Ok(())
}

fn run_baseline(config: &AppConfig, path: &Path, dry_run: bool) -> Result<()> {
    if dry_run {
        let text = std::fs::read(path)?;
        let timestamp = extract_timestamp(&String::from_utf8_lossy(&text))?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        println!("{}", marker_file_name(&timestamp, stem));
        return Ok(());
    }

    let engine = baseline_engine(config, LockRetry::DEFAULT)
        .ok_or_else(|| WardenError::Config("base_folder is not set".to_string()))?;
    match engine.process_baseline(path)? {
        BaselineOutcome::Recorded { marker, record } => {
            println!("Recorded {} ({} / {})", marker.display(), record.time_info, record.prefix)
        }
        BaselineOutcome::Rejected { reason } => println!("Rejected: {}", reason),
    }
    Ok(())
}

fn run_rename_pass(config: &AppConfig, dry_run: bool) -> Result<()> {
    let engine = baseline_engine(config, LockRetry::DEFAULT)
        .ok_or_else(|| WardenError::Config("base_folder is not set".to_string()))?;

    let jobs = if dry_run {
        engine.load_markers()?;
        engine.plan_renames()?
    } else {
        engine.rename_pass()?
    };

    let verb = if dry_run { "Would rename" } else { "Renamed" };
    for job in &jobs {
        println!("{}: {} -> {}", verb, job.source.display(), job.target.display());
    }
    println!("{} file(s)", jobs.len());
    Ok(())
}

fn run_history_command(config: &AppConfig, action: HistoryCommands) -> Result<()> {
    let history = History::new(config.history.path.clone());

    match action {
        HistoryCommands::List { count } => {
            let entries = history.recent(count)?;
            println!("Recent renames ({} entries):", entries.len());
            for entry in entries {
                let status = if entry.undone { "[UNDONE]" } else { "" };
                println!("  {} {} -> {} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.original_path.display(),
                    entry.new_path.display(),
                    status
                );
            }
        }
        HistoryCommands::Undo { count, dry_run } => {
            let undone = history.undo(count, dry_run)?;
            if undone.is_empty() {
                println!("No renames to undo");
            }
            let verb = if dry_run { "Would undo" } else { "Undone" };
            for entry in undone {
                println!("{}: {} -> {}", verb, entry.new_path.display(), entry.original_path.display());
            }
        }
        HistoryCommands::Clear { force } => {
            if !force {
                eprintln!("Use --force to confirm clearing history");
                return Ok(());
            }
            history.clear()?;
            println!("History cleared");
        }
    }

    Ok(())
}

fn run_config_command(config: AppConfig, action: ConfigCommands, config_path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Generate { output } => {
            AppConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            let router = Router::from_config(&config.routing_rules)?;
            println!("Configuration at {:?} is valid", config_path);
            println!("  Watch folders: {}", config.watch_folders.len());
            println!("  Routing rules: {}", router.len());
            match config.baseline_folder() {
                Some(folder) => println!("  Baseline folder: {}", folder.display()),
                None => println!("  Baseline folder: (none)"),
            }
            for folder in config.resolved_compare_folders() {
                let state = if folder.is_dir() { "" } else { " (missing)" };
                println!("  Compare folder: {}{}", folder.display(), state);
            }
        }
    }

    Ok(())
}

/// Create a starter configuration and folder layout
fn run_init(dir: Option<PathBuf>, force: bool) -> Result<()> {
    let target = dir.unwrap_or_else(|| PathBuf::from("."));
    let config_path = target.join("config.json");

    if config_path.exists() && !force {
        return Err(WardenError::Config(
            "config.json already exists. Use --force to overwrite".to_string()
        ));
    }

    let mut config = AppConfig::default();
    config.watch_folders = vec![WatchedFolder::new(target.join("watch"))];
    config.base_folder = Some(target.join("data"));
    for rule in &mut config.routing_rules {
        rule.destination = target.join("routed");
    }

    for folder in config.watch_folders.iter().map(|f| f.path.clone())
        .chain(config.baseline_folder())
        .chain(config.resolved_compare_folders())
    {
        std::fs::create_dir_all(&folder)?;
    }
    config.save(&config_path)?;

    println!("logwarden initialized in {:?}", target);
    println!("\nCreated:");
    println!("  - config.json");
    println!("  - watch/, data/Baseline/, data/Compare/");
    println!("\nNext: logwarden watch");

    Ok(())
}
