//! CLI command implementations.
//!
//! | Module    | Commands handled          |
//! |-----------|---------------------------|
//! | `init`    | `Init`, `Config`          |
//! | `serve`   | `Serve`                   |
//! | `repo`    | `Repo add`, `Repo list`   |
//! | `sync`    | `Sync`, `CheckPrs`        |
//! | `cancel`  | `Cancel`                  |

pub mod cancel;
pub mod init;
pub mod repo;
pub mod serve;
pub mod sync;

pub use cancel::cmd_cancel;
pub use init::{cmd_config, cmd_init};
pub use repo::cmd_repo;
pub use serve::cmd_serve;
pub use sync::{cmd_check_prs, cmd_sync};

use std::path::Path;

use anyhow::{Context, Result};
use scout::config::ScoutConfig;
use scout::factory::db::{DbHandle, ScoutDb};

/// Resolve configuration for `project_dir`, with `--db` taking precedence.
pub fn load_config(project_dir: &Path, db: Option<&Path>) -> Result<ScoutConfig> {
    let mut config = ScoutConfig::load(project_dir)?;
    if let Some(db) = db {
        config.db_path = db.to_path_buf();
    }
    config.resolve_paths(project_dir);
    Ok(config)
}

pub fn open_db(config: &ScoutConfig) -> Result<DbHandle> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = ScoutDb::new(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    Ok(DbHandle::new(db))
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
