use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "DEPLOY_ADAPTER_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "deploy-adapter.toml";

/// Locate the config file: explicit path, then `DEPLOY_ADAPTER_CONFIG`,
/// then `./deploy-adapter.toml`.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

/// Load the adapter config. A missing file yields the defaults; a file that
/// exists but does not parse is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let path = config_path(explicit);
    if !path.exists() {
        if explicit.is_some() {
            return Err(AppError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        log::debug!("No config file at {}, using defaults", path.display());
        return Ok(AppConfig::default());
    }
    let content = fs::read_to_string(&path).map_err(|e| AppError::config(e.to_string()))?;
    parse_config(&content).map_err(|e| e.context("path", path.display().to_string()))
}

pub fn parse_config(content: &str) -> Result<AppConfig> {
    toml::from_str(content).map_err(|e| AppError::config(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Name used for system-wide directories such as `/var/log/<app_name>`.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// The organization's public hostname. Matching it selects the
    /// custom-domain production profile.
    #[serde(default)]
    pub production_domain: Option<String>,
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default = "default_dev_origins")]
    pub dev_origins: Vec<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

fn default_app_name() -> String {
    "server-panel".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_dev_origins() -> Vec<String> {
    [
        "http://localhost:5173",
        "http://localhost:3000",
        "http://127.0.0.1:5173",
        "http://127.0.0.1:3000",
        "http://localhost:5000",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            production_domain: None,
            default_port: default_port(),
            sandbox: SandboxConfig::default(),
            dev_origins: default_dev_origins(),
            paths: PathsConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Signals identifying the hosted sandbox platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_markers")]
    pub env_markers: Vec<String>,
    #[serde(default = "default_sandbox_suffixes")]
    pub hostname_suffixes: Vec<String>,
}

fn default_sandbox_markers() -> Vec<String> {
    [
        "REPL_ID",
        "REPLIT_DB_URL",
        "REPL_SLUG",
        "REPLIT_CLUSTER",
        "REPLIT_ENVIRONMENT",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_sandbox_suffixes() -> Vec<String> {
    ["replit.dev", "repl.co", "replit.app"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            env_markers: default_sandbox_markers(),
            hostname_suffixes: default_sandbox_suffixes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Last-resort root for directories that cannot be created elsewhere.
    /// Defaults to the OS temp directory.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
    /// Well-known reverse-proxy config locations, probed before the
    /// profile's own nginx directory is created.
    #[serde(default)]
    pub nginx_candidates: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_list_ttl")]
    pub process_list_ttl_secs: u64,
    #[serde(default = "default_spawn_grace")]
    pub spawn_grace_ms: u64,
    /// Overrides the built-in list of pm2 invocation forms.
    /// Each entry is an argument vector, e.g. `["npx", "pm2"]`.
    #[serde(default)]
    pub manager_candidates: Option<Vec<Vec<String>>>,
}

fn default_list_ttl() -> u64 {
    10
}

fn default_spawn_grace() -> u64 {
    1500
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            process_list_ttl_secs: default_list_ttl(),
            spawn_grace_ms: default_spawn_grace(),
            manager_candidates: None,
        }
    }
}

impl SupervisorConfig {
    pub fn process_list_ttl(&self) -> Duration {
        Duration::from_secs(self.process_list_ttl_secs)
    }

    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.app_name, "server-panel");
        assert_eq!(config.default_port, 5000);
        assert_eq!(config.supervisor.process_list_ttl(), Duration::from_secs(10));
        assert!(config.sandbox.env_markers.iter().any(|m| m == "REPL_ID"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse_config(
            r#"
production_domain = "panel.example.org"

[supervisor]
spawn_grace_ms = 200
manager_candidates = [["npx", "pm2"]]
"#,
        )
        .unwrap();
        assert_eq!(config.production_domain.as_deref(), Some("panel.example.org"));
        assert_eq!(config.supervisor.spawn_grace(), Duration::from_millis(200));
        assert_eq!(config.supervisor.process_list_ttl_secs, 10);
        assert_eq!(
            config.supervisor.manager_candidates,
            Some(vec![vec!["npx".to_string(), "pm2".to_string()]])
        );
    }

    #[test]
    fn malformed_file_is_config_error() {
        let err = parse_config("default_port = \"abc\"").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.toml");
        fs::write(&path, "app_name = \"builder\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.app_name, "builder");
    }
}
