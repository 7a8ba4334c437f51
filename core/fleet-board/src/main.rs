//! fleet-board: command-line client for the project board.
//!
//! Output is one project per line as `key=value` pairs separated by two
//! spaces, so agents can grep it. `show` adds the remaining fields.

mod output;

use clap::{Parser, Subcommand};
use fleet_core::{BoardStore, ProjectPatch, Result, Stage, StoragePaths};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fleet-board")]
#[command(about = "Project board for the session fleet")]
#[command(version)]
struct Cli {
    /// Board file (default: <fleet root>/kanban.json)
    #[arg(long, global = true, value_name = "PATH")]
    board: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List projects, optionally only one stage
    List {
        #[arg(long)]
        stage: Option<String>,
    },

    /// Show every field of one project
    Show { id: String },

    /// Create a project
    Create {
        title: String,

        #[arg(long, default_value = "")]
        desc: String,

        #[arg(long, default_value = "pending")]
        stage: String,

        /// Repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Move a project to a stage
    Move { id: String, stage: String },

    /// Move a project to the next stage
    Advance { id: String },

    /// Move a project to the previous stage
    Retreat { id: String },

    /// Change fields of a project
    Update {
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        desc: Option<String>,

        #[arg(long)]
        stage: Option<String>,

        /// Replaces all tags; repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Delete a project
    Delete { id: String },

    LinkSession { id: String, session: String },

    UnlinkSession { id: String, session: String },

    LinkPr { id: String, number: u64 },

    UnlinkPr { id: String, number: u64 },

    /// List valid stages
    Stages,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn board_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(StoragePaths::from_env()?.board_file()),
    }
}

fn run(cli: Cli) -> Result<()> {
    let path = board_path(cli.board)?;
    tracing::debug!(board = %path.display(), "Opening board");
    let store = BoardStore::new(path);

    match cli.command {
        Commands::List { stage } => {
            let stage = stage.as_deref().map(str::parse::<Stage>).transpose()?;
            let projects = store.list(stage)?;
            if projects.is_empty() {
                println!("(no projects)");
            }
            for project in &projects {
                println!("{}", output::line(project));
            }
        }
        Commands::Show { id } => {
            println!("{}", output::detail(&store.get(&id)?));
        }
        Commands::Create {
            title,
            desc,
            stage,
            tags,
        } => {
            let project = store.create(&title, &desc, stage.parse()?, tags)?;
            tracing::info!(id = %project.id, stage = %project.stage, "Project created");
            println!("created {}", output::line(&project));
        }
        Commands::Move { id, stage } => {
            let project = store.move_to(&id, stage.parse()?)?;
            tracing::info!(id = %project.id, stage = %project.stage, "Project moved");
            println!("moved {}", output::line(&project));
        }
        Commands::Advance { id } => {
            println!("moved {}", output::line(&store.advance(&id)?));
        }
        Commands::Retreat { id } => {
            println!("moved {}", output::line(&store.retreat(&id)?));
        }
        Commands::Update {
            id,
            title,
            desc,
            stage,
            tags,
        } => {
            let patch = ProjectPatch {
                title,
                description: desc,
                stage: stage.as_deref().map(str::parse).transpose()?,
                tags: (!tags.is_empty()).then_some(tags),
            };
            if patch.is_empty() {
                tracing::debug!(%id, "Update without changes");
                println!("nothing to update");
                return Ok(());
            }
            println!("updated {}", output::line(&store.update(&id, patch)?));
        }
        Commands::Delete { id } => {
            let project = store.delete(&id)?;
            tracing::info!(id = %project.id, "Project deleted");
            println!("deleted {}", output::line(&project));
        }
        Commands::LinkSession { id, session } => {
            println!("linked {}", output::line(&store.link_session(&id, &session)?));
        }
        Commands::UnlinkSession { id, session } => {
            println!("unlinked {}", output::line(&store.unlink_session(&id, &session)?));
        }
        Commands::LinkPr { id, number } => {
            println!("linked {}", output::line(&store.link_review(&id, number)?));
        }
        Commands::UnlinkPr { id, number } => {
            println!("unlinked {}", output::line(&store.unlink_review(&id, number)?));
        }
        Commands::Stages => {
            for stage in Stage::ALL {
                println!("{}  {}", stage.as_str(), stage.label());
            }
        }
    }
    Ok(())
}
