//! Project setup and configuration view: `scout init`, `scout config`.

use std::path::Path;

use anyhow::{Context, Result};
use scout::config::{DEFAULT_CONFIG_TOML, Secrets};

use super::{load_config, open_db};

pub fn cmd_init(project_dir: &Path, db: Option<&Path>, force: bool) -> Result<()> {
    let scout_dir = project_dir.join(".scout");
    std::fs::create_dir_all(&scout_dir)
        .with_context(|| format!("Failed to create {}", scout_dir.display()))?;

    let config_path = scout_dir.join("scout.toml");
    if config_path.exists() && !force {
        println!("Config already exists: {}", config_path.display());
    } else {
        std::fs::write(&config_path, DEFAULT_CONFIG_TOML)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote {}", config_path.display());
    }

    let config = load_config(project_dir, db)?;
    open_db(&config)?;
    println!("Database ready at {}", config.db_path.display());
    Ok(())
}

pub fn cmd_config(project_dir: &Path, db: Option<&Path>) -> Result<()> {
    let config = load_config(project_dir, db)?;
    let secrets = Secrets::from_env();
    let set = |present: bool| if present { "set" } else { "not set" };

    println!();
    println!("Scout Configuration");
    println!("===================");
    println!();
    println!("[server]");
    println!("  host = \"{}\"", config.host);
    println!("  port = {}", config.port);
    println!("  callback_base_url = \"{}\"", config.callback_base_url());
    println!();
    println!("  database = \"{}\"", config.db_path.display());
    println!("  worktrees = \"{}\"", config.worktree_root().display());
    println!("  runs = \"{}\"", config.runs_root().display());
    if let Some(dir) = &config.prompts_dir {
        println!("  prompts_dir = \"{}\"", dir.display());
    }
    println!();
    println!("[agent]");
    println!("  command = \"{}\"", config.agent_cmd);
    println!("  args = {:?}", config.agent_args);
    println!("  remote = \"{}\"", config.git_remote);
    println!();
    println!("[sync]");
    println!("  enabled = {}", config.sync.enabled);
    println!("  page_size = {}", config.sync.page_size);
    println!("  interval_secs = {}", config.sync.interval_secs);
    println!("  pr_check_interval_secs = {}", config.sync.pr_check_interval_secs);
    println!();
    println!("[secrets]");
    println!("  GITHUB_TOKEN   {}", set(secrets.github_token.is_some()));
    println!("  LINEAR_TOKEN   {}", set(secrets.linear_token.is_some()));
    println!("  OPENAI_KEY     {}", set(secrets.openai_key.is_some()));
    println!("  ANTHROPIC_KEY  {}", set(secrets.anthropic_key.is_some()));
    Ok(())
}
