//! Process supervision.
//!
//! [`ProcessSupervisor`] exposes one contract for managed applications. On
//! first use it probes for pm2; if pm2 answers, every operation is delegated to
//! [`ExternalSupervisor`], otherwise an in-memory [`FallbackSupervisor`] spawns
//! and tracks children itself. The choice is made once per supervisor.

mod control;
mod entry;
mod external;
mod fallback;
mod list_parser;
mod manager;
mod probe;
mod runner;
pub mod shell;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use control::{is_process_alive, terminate};
pub use entry::{entry_candidates, resolve_launch, LaunchPlan, LaunchPlanner, LaunchSource};
pub use external::ExternalSupervisor;
pub use fallback::FallbackSupervisor;
pub use list_parser::parse_process_list;
pub use manager::ProcessSupervisor;
pub use probe::{candidates_from_config, default_candidates, probe_manager, ManagerInvocation};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};

/// How long a pm2 process list stays fresh.
pub const DEFAULT_PROCESS_LIST_TTL: Duration = Duration::from_secs(10);

/// Default number of log lines requested from pm2.
pub const DEFAULT_LOG_LINES: usize = 100;

/// A managed application as supplied by the caller. Not persisted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    /// Unique name; also the pm2 process name.
    pub name: String,
    /// Working directory, relative paths resolve against the profile root.
    pub path: PathBuf,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub use_external_manager: bool,
}

fn default_true() -> bool {
    true
}

impl AppRecord {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            command: None,
            port: None,
            use_external_manager: true,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorMode {
    External,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStatus {
    Running,
    Stopped,
    Error,
}

impl FallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// A child started by the fallback supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackProcessEntry {
    pub pid: u32,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub status: FallbackStatus,
    pub command: String,
    pub path: PathBuf,
}

/// Status row reported by either backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub status: String,
    pub pm_id: Option<u64>,
    pub cpu: Option<f32>,
    pub memory: Option<u64>,
    pub uptime_ms: Option<i64>,
    pub restarts: Option<u64>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessMetrics {
    pub name: String,
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
    pub uptime_ms: Option<i64>,
    pub restarts: Option<u64>,
}

impl From<&ProcessInfo> for ProcessMetrics {
    fn from(info: &ProcessInfo) -> Self {
        Self {
            name: info.name.clone(),
            cpu_percent: info.cpu,
            memory_bytes: info.memory,
            uptime_ms: info.uptime_ms,
            restarts: info.restarts,
        }
    }
}

/// One supervision strategy. The facade picks exactly one implementation
/// per instance.
#[async_trait]
pub trait Supervisor: Send + Sync {
    fn mode(&self) -> SupervisorMode;

    async fn start(&self, app: &AppRecord, workdir: &Path, plan: &LaunchPlan) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Backends ask `planner` for a launch plan only if they must spawn anew.
    async fn restart(
        &self,
        app: &AppRecord,
        workdir: &Path,
        planner: &LaunchPlanner<'_>,
    ) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Never fails; an empty list is the degraded state.
    async fn list(&self) -> Vec<ProcessInfo>;

    async fn logs(&self, name: &str, lines: usize) -> Result<String>;
}
