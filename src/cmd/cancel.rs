//! Run cancellation: `scout cancel`.

use std::path::Path;

use anyhow::Result;
use scout::config::Secrets;
use scout::factory::server::build_services;

use super::{load_config, print_json};

pub async fn cmd_cancel(project_dir: &Path, db: Option<&Path>, issue_id: i64) -> Result<()> {
    let config = load_config(project_dir, db)?;
    let services = build_services(&config, &Secrets::from_env())?;
    let outcome = services.state.canceller.cancel(issue_id).await?;
    print_json(&outcome)
}
