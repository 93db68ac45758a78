//! One-shot sync and PR detection: `scout sync`, `scout check-prs`.

use std::path::Path;

use anyhow::Result;
use scout::config::Secrets;
use scout::factory::server::build_services;

use super::{load_config, print_json};

pub async fn cmd_sync(project_dir: &Path, db: Option<&Path>, repo_id: i64, reset: bool) -> Result<()> {
    let config = load_config(project_dir, db)?;
    let services = build_services(&config, &Secrets::from_env())?;
    if reset {
        services.sync.reset(repo_id).await?;
    }
    let result = services.sync.sync_page(repo_id).await?;
    print_json(&result)
}

pub async fn cmd_check_prs(project_dir: &Path, db: Option<&Path>, repo_id: i64) -> Result<()> {
    let config = load_config(project_dir, db)?;
    let services = build_services(&config, &Secrets::from_env())?;
    let result = services.sync.detect_prs(repo_id).await?;
    print_json(&result)
}
