//! API server command: `scout serve`.

use std::path::Path;

use anyhow::Result;
use scout::config::Secrets;
use scout::factory::server::{ServerConfig, start_server};

use super::load_config;

pub async fn cmd_serve(
    project_dir: &Path,
    db: Option<&Path>,
    port: Option<u16>,
    dev: bool,
    no_sync: bool,
) -> Result<()> {
    let mut config = load_config(project_dir, db)?;
    if let Some(port) = port {
        config.port = port;
    }
    if no_sync {
        config.sync.enabled = false;
    }
    if dev {
        config.host = "0.0.0.0".to_string();
    }

    start_server(ServerConfig {
        scout: config,
        secrets: Secrets::from_env(),
        dev_mode: dev,
    })
    .await
}
