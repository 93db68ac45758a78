//! Detached agent processes and signal delivery.
//!
//! Each agent is started in its own process group with `SCOUT_RUN_ID=<id>`
//! in its environment. Descendants inherit the variable, so the whole tree
//! for a run can be found later by an exact environment match rather than by
//! pattern-matching command lines.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Environment variable carrying the run's callback id.
pub const RUN_TAG_VAR: &str = "SCOUT_RUN_ID";

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Receives the agent's stdout and stderr when set.
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// Abstraction over OS process management for testability.
/// Real implementation: `OsProcessSupervisor`. Test double:
/// `test_support::FakeSupervisor`.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start a process that outlives the call and is never awaited.
    async fn spawn_detached(&self, spec: &SpawnSpec) -> Result<u32>;

    /// Pids of live processes whose environment holds `SCOUT_RUN_ID=<tag>`.
    async fn list_tagged(&self, tag: &str) -> Result<Vec<u32>>;

    /// Deliver a signal. A process that is already gone is not an error.
    async fn signal(&self, pid: u32, kind: SignalKind) -> Result<()>;
}

pub struct OsProcessSupervisor;

#[async_trait]
impl ProcessSupervisor for OsProcessSupervisor {
    async fn spawn_detached(&self, spec: &SpawnSpec) -> Result<u32> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        match &spec.log_path {
            Some(path) => {
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open agent log {}", path.display()))?;
                let log_err = log.try_clone().context("Failed to clone agent log handle")?;
                cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.program))?;
        let pid = child
            .id()
            .context("Spawned process exited before its pid was read")?;
        // Dropping the handle detaches; tokio reaps the exit status.
        drop(child);
        debug!(pid, program = %spec.program, "spawned detached process");
        Ok(pid)
    }

    async fn list_tagged(&self, tag: &str) -> Result<Vec<u32>> {
        let needle = format!("{}={}", RUN_TAG_VAR, tag);
        tokio::task::spawn_blocking(move || scan_tagged(&needle))
            .await
            .context("Process scan task panicked")?
    }

    async fn signal(&self, pid: u32, kind: SignalKind) -> Result<()> {
        // 0 and negative values address process groups or every process.
        if pid == 0 || pid > i32::MAX as u32 {
            anyhow::bail!("Refusing to signal pid {}", pid);
        }
        let sig = match kind {
            SignalKind::Terminate => libc::SIGTERM,
            SignalKind::Kill => libc::SIGKILL,
        };
        let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err).with_context(|| format!("Failed to signal pid {}", pid))
    }
}

#[cfg(target_os = "linux")]
fn scan_tagged(needle: &str) -> Result<Vec<u32>> {
    let own_pid = std::process::id();
    let mut pids = Vec::new();
    for entry in std::fs::read_dir("/proc").context("Failed to read /proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        // Exited or foreign-owned processes are unreadable; skip them.
        let Ok(environ) = std::fs::read(entry.path().join("environ")) else {
            continue;
        };
        if environ_contains(&environ, needle) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

#[cfg(not(target_os = "linux"))]
fn scan_tagged(needle: &str) -> Result<Vec<u32>> {
    let output = std::process::Command::new("ps")
        .args(["-axeww", "-o", "pid=,command="])
        .output()
        .context("Failed to run ps")?;
    if !output.status.success() {
        anyhow::bail!("ps exited with {}", output.status);
    }
    let own_pid = std::process::id();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut pids = Vec::new();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let Some(pid) = parts.next().and_then(|p| p.parse::<u32>().ok()) else {
            continue;
        };
        if pid != own_pid && parts.any(|token| token == needle) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

/// Exact `KEY=value` match against a NUL-separated environment block.
fn environ_contains(environ: &[u8], needle: &str) -> bool {
    environ
        .split(|b| *b == 0)
        .any(|entry| entry == needle.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environ_match_is_exact() {
        let environ = b"PATH=/usr/bin\0SCOUT_RUN_ID=abc123\0HOME=/root\0";
        assert!(environ_contains(environ, "SCOUT_RUN_ID=abc123"));
        assert!(!environ_contains(environ, "SCOUT_RUN_ID=abc"));
        assert!(!environ_contains(environ, "SCOUT_RUN_ID=abc1234"));
        assert!(!environ_contains(b"X_SCOUT_RUN_ID=abc123\0", "SCOUT_RUN_ID=abc123"));
    }

    #[tokio::test]
    async fn test_refuses_group_addressing_pids() {
        let sup = OsProcessSupervisor;
        assert!(sup.signal(0, SignalKind::Kill).await.is_err());
        assert!(sup.signal(u32::MAX, SignalKind::Kill).await.is_err());
    }

    #[tokio::test]
    async fn test_signal_to_missing_process_is_ok() -> Result<()> {
        OsProcessSupervisor
            .signal(i32::MAX as u32, SignalKind::Terminate)
            .await
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_spawn_list_and_terminate_tagged_process() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let tag = format!("test-{}", uuid::Uuid::new_v4().simple());
        let sup = OsProcessSupervisor;
        let pid = sup
            .spawn_detached(&SpawnSpec {
                program: "sleep".into(),
                args: vec!["30".into()],
                env: vec![(RUN_TAG_VAR.to_string(), tag.clone())],
                cwd: tmp.path().to_path_buf(),
                log_path: Some(tmp.path().join("agent.log")),
            })
            .await?;

        assert_eq!(sup.list_tagged(&tag).await?, vec![pid]);
        assert!(sup.list_tagged("some-other-run").await?.is_empty());

        sup.signal(pid, SignalKind::Terminate).await?;
        let mut remaining = sup.list_tagged(&tag).await?;
        for _ in 0..50 {
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            remaining = sup.list_tagged(&tag).await?;
        }
        assert!(remaining.is_empty(), "terminated process still listed");
        Ok(())
    }
}
