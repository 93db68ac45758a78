use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use scout::factory::models::Source;

mod cmd;

#[derive(Parser)]
#[command(name = "scout")]
#[command(version, about = "Points a coding agent at tracker issues and follows each run to a pull request")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Database path. Overrides scout.toml and SCOUT_DB_PATH.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default .scout/scout.toml and create the database
    Init {
        /// Overwrite an existing scout.toml
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP API, the agent callback endpoint and background sync
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for a local dashboard)
        #[arg(long)]
        dev: bool,

        /// Don't start the background sync and PR detection tasks
        #[arg(long)]
        no_sync: bool,
    },
    /// Register and inspect tracked repos
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Fetch the next page of open issues for a repo
    Sync {
        repo_id: i64,

        /// Rewind the cursor to the first page before fetching
        #[arg(long)]
        reset: bool,
    },
    /// Match finished runs of a repo against its open pull requests
    CheckPrs { repo_id: i64 },
    /// Stop every pending run of an issue
    Cancel { issue_id: i64 },
    /// Show the resolved configuration
    Config,
}

#[derive(Subcommand, Clone)]
pub enum RepoCommands {
    /// Register a GitHub repo (owner/repo) or Linear team (team id)
    Add {
        #[arg(long, value_parser = parse_source)]
        source: Source,

        source_id: String,

        #[arg(long)]
        name: Option<String>,

        /// Local checkout used as the base for run workspaces
        #[arg(long)]
        local_path: Option<PathBuf>,

        #[arg(long)]
        default_branch: Option<String>,

        /// Let the agent open the pull request itself
        #[arg(long)]
        auto_pr: bool,
    },
    /// List registered repos
    List,
}

fn parse_source(s: &str) -> Result<Source, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    scout::logging::init(cli.verbose, cli.json_logs);
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, cli.db.as_deref(), *force)?,
        Commands::Serve { port, dev, no_sync } => {
            cmd::cmd_serve(&project_dir, cli.db.as_deref(), *port, *dev, *no_sync).await?
        }
        Commands::Repo { command } => {
            cmd::cmd_repo(&project_dir, cli.db.as_deref(), command.clone()).await?
        }
        Commands::Sync { repo_id, reset } => {
            cmd::cmd_sync(&project_dir, cli.db.as_deref(), *repo_id, *reset).await?
        }
        Commands::CheckPrs { repo_id } => {
            cmd::cmd_check_prs(&project_dir, cli.db.as_deref(), *repo_id).await?
        }
        Commands::Cancel { issue_id } => {
            cmd::cmd_cancel(&project_dir, cli.db.as_deref(), *issue_id).await?
        }
        Commands::Config => cmd::cmd_config(&project_dir, cli.db.as_deref())?,
    }

    Ok(())
}
