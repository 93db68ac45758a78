use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Written by `scout init`. Every key is optional.
pub const DEFAULT_CONFIG_TOML: &str = r#"# Scout configuration. Missing keys fall back to built-in defaults.

database = ".scout/scout.db"
# scratch_dir = "/var/tmp"
# callback_base_url = "http://127.0.0.1:3141"
# prompts_dir = ".scout/prompts"
http_timeout_secs = 30
cancel_grace_ms = 2000

[server]
host = "127.0.0.1"
port = 3141

[agent]
command = "scout-agent"
args = []
remote = "origin"

[sync]
enabled = true
page_size = 50
interval_secs = 300
pr_check_interval_secs = 60
"#;

/// Runtime configuration for the Scout service.
///
/// Resolution order: built-in defaults, then `.scout/scout.toml` in the
/// project directory, then `SCOUT_*` environment variables, then CLI flags
/// (applied by the command layer).
#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Parent of the worktree and per-run scratch roots.
    pub scratch_dir: PathBuf,
    pub agent_cmd: String,
    /// Arguments placed before the generated run arguments.
    pub agent_args: Vec<String>,
    pub git_remote: String,
    callback_base_url: Option<String>,
    pub prompts_dir: Option<PathBuf>,
    pub sync: SyncSettings,
    pub http_timeout_secs: u64,
    pub cancel_grace_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub enabled: bool,
    pub page_size: u32,
    pub interval_secs: u64,
    pub pr_check_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            page_size: 50,
            interval_secs: 300,
            pr_check_interval_secs: 60,
        }
    }
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            db_path: PathBuf::from(".scout/scout.db"),
            scratch_dir: std::env::temp_dir(),
            agent_cmd: "scout-agent".to_string(),
            agent_args: Vec::new(),
            git_remote: "origin".to_string(),
            callback_base_url: None,
            prompts_dir: None,
            sync: SyncSettings::default(),
            http_timeout_secs: 30,
            cancel_grace_ms: 2000,
        }
    }
}

/// Raw TOML structure for `.scout/scout.toml`
#[derive(Debug, Default, Deserialize)]
struct ScoutToml {
    database: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    callback_base_url: Option<String>,
    prompts_dir: Option<PathBuf>,
    http_timeout_secs: Option<u64>,
    cancel_grace_ms: Option<u64>,
    server: Option<ServerSection>,
    agent: Option<AgentSection>,
    sync: Option<SyncSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    command: Option<String>,
    args: Option<Vec<String>>,
    remote: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncSection {
    enabled: Option<bool>,
    page_size: Option<u32>,
    interval_secs: Option<u64>,
    pr_check_interval_secs: Option<u64>,
}

impl ScoutConfig {
    /// Load config from `.scout/scout.toml` under `project_dir` and apply
    /// environment overrides. A missing file yields defaults.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::from_file(&project_dir.join(".scout").join("scout.toml"))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml: ScoutToml = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(db) = toml.database {
            config.db_path = db;
        }
        if let Some(dir) = toml.scratch_dir {
            config.scratch_dir = dir;
        }
        config.callback_base_url = toml.callback_base_url;
        config.prompts_dir = toml.prompts_dir;
        if let Some(secs) = toml.http_timeout_secs {
            config.http_timeout_secs = secs;
        }
        if let Some(ms) = toml.cancel_grace_ms {
            config.cancel_grace_ms = ms;
        }
        if let Some(server) = toml.server {
            if let Some(host) = server.host {
                config.host = host;
            }
            if let Some(port) = server.port {
                config.port = port;
            }
        }
        if let Some(agent) = toml.agent {
            if let Some(command) = agent.command {
                config.agent_cmd = command;
            }
            if let Some(args) = agent.args {
                config.agent_args = args;
            }
            if let Some(remote) = agent.remote {
                config.git_remote = remote;
            }
        }
        if let Some(sync) = toml.sync {
            if let Some(enabled) = sync.enabled {
                config.sync.enabled = enabled;
            }
            if let Some(page_size) = sync.page_size {
                config.sync.page_size = page_size.clamp(1, 100);
            }
            if let Some(secs) = sync.interval_secs {
                config.sync.interval_secs = secs;
            }
            if let Some(secs) = sync.pr_check_interval_secs {
                config.sync.pr_check_interval_secs = secs;
            }
        }
        Ok(config)
    }

    /// Apply `SCOUT_*` overrides using the given lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("SCOUT_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(db) = lookup("SCOUT_DB_PATH") {
            self.db_path = PathBuf::from(db);
        }
        if let Some(cmd) = lookup("SCOUT_AGENT_CMD") {
            self.agent_cmd = cmd;
        }
        if let Some(url) = lookup("SCOUT_CALLBACK_URL") {
            self.callback_base_url = Some(url);
        }
        if let Some(dir) = lookup("SCOUT_SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(dir);
        }
    }

    /// Anchor relative database and prompt paths at `project_dir`.
    pub fn resolve_paths(&mut self, project_dir: &Path) {
        if self.db_path.is_relative() {
            self.db_path = project_dir.join(&self.db_path);
        }
        if let Some(dir) = &self.prompts_dir
            && dir.is_relative()
        {
            self.prompts_dir = Some(project_dir.join(dir));
        }
    }

    /// Base URL the agent uses to reach this service.
    pub fn callback_base_url(&self) -> String {
        match &self.callback_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    pub fn set_callback_base_url(&mut self, url: impl Into<String>) {
        self.callback_base_url = Some(url.into());
    }

    /// `<scratch>/scout-worktrees`: every workspace lives below this root.
    pub fn worktree_root(&self) -> PathBuf {
        self.scratch_dir.join("scout-worktrees")
    }

    /// `<scratch>/scout-runs`: prompt files and agent logs, one dir per run.
    pub fn runs_root(&self) -> PathBuf {
        self.scratch_dir.join("scout-runs")
    }
}

/// Credentials for trackers and model providers.
///
/// Read from the process environment after `.env` has been loaded; the
/// backing store is opaque to the rest of the service.
#[derive(Clone, Default)]
pub struct Secrets {
    pub github_token: Option<String>,
    pub linear_token: Option<String>,
    pub openai_key: Option<String>,
    pub anthropic_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("github_token", &self.github_token.is_some())
            .field("linear_token", &self.linear_token.is_some())
            .field("openai_key", &self.openai_key.is_some())
            .field("anthropic_key", &self.anthropic_key.is_some())
            .finish()
    }
}

impl Secrets {
    pub fn from_env() -> Self {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            github_token: read("GITHUB_TOKEN"),
            linear_token: read("LINEAR_TOKEN"),
            openai_key: read("OPENAI_KEY"),
            anthropic_key: read("ANTHROPIC_KEY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_file_missing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = ScoutConfig::from_file(&dir.path().join("nope.toml"))?;
        assert_eq!(config.port, 3141);
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.agent_cmd, "scout-agent");
        assert_eq!(config.callback_base_url(), "http://127.0.0.1:3141");
        Ok(())
    }

    #[test]
    fn test_parse_full_file() -> Result<()> {
        let config = ScoutConfig::from_toml_str(
            r#"
            database = "/var/lib/scout/scout.db"
            scratch_dir = "/scratch"
            callback_base_url = "https://scout.example.com/"
            cancel_grace_ms = 500

            [server]
            port = 8080

            [agent]
            command = "claude-runner"
            args = ["--headless"]
            remote = "upstream"

            [sync]
            page_size = 500
            interval_secs = 120
            "#,
        )?;
        assert_eq!(config.db_path, PathBuf::from("/var/lib/scout/scout.db"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.agent_cmd, "claude-runner");
        assert_eq!(config.agent_args, vec!["--headless".to_string()]);
        assert_eq!(config.git_remote, "upstream");
        assert_eq!(config.sync.page_size, 100, "page size is clamped");
        assert_eq!(config.sync.interval_secs, 120);
        assert_eq!(config.sync.pr_check_interval_secs, 60);
        assert_eq!(config.cancel_grace_ms, 500);
        assert_eq!(config.callback_base_url(), "https://scout.example.com");
        assert_eq!(config.worktree_root(), PathBuf::from("/scratch/scout-worktrees"));
        Ok(())
    }

    #[test]
    fn test_env_overrides_file() -> Result<()> {
        let mut config = ScoutConfig::from_toml_str("[server]\nport = 8080\n")?;
        let env: HashMap<&str, &str> = [
            ("SCOUT_PORT", "9000"),
            ("SCOUT_AGENT_CMD", "/opt/agent"),
            ("SCOUT_SCRATCH_DIR", "/tmp/elsewhere"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 9000);
        assert_eq!(config.agent_cmd, "/opt/agent");
        assert_eq!(config.runs_root(), PathBuf::from("/tmp/elsewhere/scout-runs"));
        Ok(())
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(ScoutConfig::from_toml_str("[server\nport = ").is_err());
    }

    #[test]
    fn test_secrets_ignore_blank_values() {
        let secrets = Secrets::from_lookup(|k| match k {
            "GITHUB_TOKEN" => Some("ghp_abc".to_string()),
            "OPENAI_KEY" => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(secrets.github_token.as_deref(), Some("ghp_abc"));
        assert!(secrets.openai_key.is_none());
        assert!(!format!("{:?}", secrets).contains("ghp_abc"));
    }

    #[test]
    fn test_default_template_matches_defaults() -> Result<()> {
        let parsed = ScoutConfig::from_toml_str(DEFAULT_CONFIG_TOML)?;
        let defaults = ScoutConfig::default();
        assert_eq!(parsed.db_path, defaults.db_path);
        assert_eq!(parsed.port, defaults.port);
        assert_eq!(parsed.agent_cmd, defaults.agent_cmd);
        assert_eq!(parsed.sync.page_size, defaults.sync.page_size);
        assert_eq!(parsed.cancel_grace_ms, defaults.cancel_grace_ms);
        Ok(())
    }

    #[test]
    fn test_resolve_paths_only_touches_relative() {
        let mut config = ScoutConfig::default();
        config.prompts_dir = Some(PathBuf::from("prompts"));
        config.resolve_paths(Path::new("/work/proj"));
        assert_eq!(config.db_path, PathBuf::from("/work/proj/.scout/scout.db"));
        assert_eq!(config.prompts_dir, Some(PathBuf::from("/work/proj/prompts")));

        config.db_path = PathBuf::from("/abs/scout.db");
        config.resolve_paths(Path::new("/elsewhere"));
        assert_eq!(config.db_path, PathBuf::from("/abs/scout.db"));
    }
}
