//! fleet-monitor: runs the coordination loop and publishes view-models.
//!
//! ## Subcommands
//!
//! - `run`: watch every source until killed, rewriting `view.json` on each
//!   publish (`--once` stops after a single cycle)
//! - `snapshot`: one pass, view-model JSON on stdout

mod logging;
mod publish;

use clap::{Parser, Subcommand};
use fleet_core::{load_config, Engine, FleetConfig, Result, StoragePaths};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fleet-monitor")]
#[command(about = "Live monitor for a fleet of agent sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination loop, publishing view.json on every change
    Run {
        /// Config file (default: <fleet root>/config.toml)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Run a single cycle, write view.json and exit
        #[arg(long)]
        once: bool,
    },

    /// Print one view-model as JSON
    Snapshot {
        /// Config file (default: <fleet root>/config.toml)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let paths = match StoragePaths::from_env() {
        Ok(paths) => paths,
        Err(err) => {
            eprintln!("fleet-monitor: {err}");
            std::process::exit(1);
        }
    };

    let logs_dir = match &cli.command {
        Commands::Run { .. } => Some(paths.logs_dir()),
        Commands::Snapshot { .. } => None,
    };
    let _logging_guard = logging::init(logs_dir.as_deref());

    let result = match cli.command {
        Commands::Run { config, once } => run(&paths, config.as_deref(), once),
        Commands::Snapshot { config } => snapshot(&paths, config.as_deref()),
    };
    if let Err(err) = result {
        error!(error = %err, "fleet-monitor failed");
        std::process::exit(1);
    }
}

fn load(paths: &StoragePaths, config: Option<&Path>) -> Result<FleetConfig> {
    let path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| paths.config_file());
    load_config(Some(&path))
}

fn run(paths: &StoragePaths, config: Option<&Path>, once: bool) -> Result<()> {
    let config = load(paths, config)?;
    let mut engine = Engine::from_paths(paths, config)?;
    let view_file = paths.view_file();

    if once {
        let view = engine.run_once();
        publish::write_view(&view_file, &view)?;
        info!(version = view.version, path = %view_file.display(), "Wrote view");
        return Ok(());
    }

    let publisher = engine.publisher();
    let updates = publisher.subscribe();
    let handle = engine.spawn();
    info!(
        db = %paths.db_file().display(),
        log_dir = %paths.log_dir().display(),
        view = %view_file.display(),
        "fleet-monitor started"
    );

    publish::follow(&publisher, updates, &view_file);
    handle.shutdown();
    Ok(())
}

fn snapshot(paths: &StoragePaths, config: Option<&Path>) -> Result<()> {
    let config = load(paths, config)?;
    let mut engine = Engine::from_paths(paths, config)?;
    let view = engine.run_once();
    println!("{}", publish::render(&view)?);
    Ok(())
}
