//! Repo registration commands: `scout repo`.

use std::path::Path;

use anyhow::Result;
use scout::factory::models::NewRepo;
use scout::factory::repos::register_repo;

use super::super::RepoCommands;
use super::{load_config, open_db};

pub async fn cmd_repo(project_dir: &Path, db: Option<&Path>, command: RepoCommands) -> Result<()> {
    let config = load_config(project_dir, db)?;
    let db = open_db(&config)?;

    match command {
        RepoCommands::Add {
            source,
            source_id,
            name,
            local_path,
            default_branch,
            auto_pr,
        } => {
            let local_path = local_path.map(|p| {
                let absolute = if p.is_relative() { project_dir.join(&p) } else { p };
                std::fs::canonicalize(&absolute).unwrap_or(absolute)
            });
            if let Some(path) = &local_path
                && !path.is_dir()
            {
                eprintln!(
                    "Warning: {} is not a directory; runs will fail until local_path is fixed",
                    path.display()
                );
            }
            let repo = register_repo(
                &db,
                NewRepo {
                    source,
                    source_id,
                    name: name.unwrap_or_default(),
                    local_path: local_path.map(|p| p.display().to_string()),
                    default_branch,
                    default_mode: None,
                    auto_create_pr: auto_pr,
                },
            )
            .await?;
            println!("Registered repo {} ({}:{})", repo.id, repo.source, repo.source_id);
        }
        RepoCommands::List => {
            let repos = db.call(|db| db.list_repos()).await?;
            if repos.is_empty() {
                println!("No repos registered. Add one with `scout repo add`.");
                return Ok(());
            }
            for repo in repos {
                println!(
                    "{:>4}  {:<7} {:<32} {}",
                    repo.id,
                    repo.source,
                    repo.source_id,
                    repo.local_path.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
