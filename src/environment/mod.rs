//! Deployment environment detection.
//!
//! The detector classifies the runtime context once at startup and produces an
//! immutable [`DeploymentProfile`]. Inputs are passed in explicitly through
//! [`DetectionInput`] so detection never reads global state on its own.

mod cors;
mod detect;
mod socket_url;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

pub use cors::{CorsConfig, OriginRule};
pub use detect::detect;
pub use socket_url::{
    fallback_socket_urls, resolve_socket_url, validate_socket_url, UrlRejection,
    LAST_RESORT_SOCKET_URL,
};

/// Path where the realtime channel is served.
pub const SOCKET_PATH: &str = "/ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileName {
    HostedSandbox,
    Production,
    Development,
}

impl ProfileName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostedSandbox => "hosted-sandbox",
            Self::Production => "production",
            Self::Development => "development",
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which detection rule produced the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionBranch {
    CustomDomain,
    HostedSandbox,
    GenericProduction,
    Development,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketScheme {
    Ws,
    Wss,
}

impl SocketScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebSocketConfig {
    pub port: u16,
    pub host: String,
    pub protocol: SocketScheme,
}

impl WebSocketConfig {
    /// Render `scheme://host[:port]/ws`, omitting the port when it is the
    /// scheme's default.
    pub fn url(&self) -> String {
        if self.port == self.protocol.default_port() {
            format!("{}://{}{}", self.protocol.as_str(), self.host, SOCKET_PATH)
        } else {
            format!(
                "{}://{}:{}{}",
                self.protocol.as_str(),
                self.host,
                self.port,
                SOCKET_PATH
            )
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseFlags {
    pub ssl: bool,
    pub connection_pooling: bool,
}

/// Named directories of a profile. Not verified to exist; see
/// [`crate::paths::PathResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfilePaths {
    pub root: PathBuf,
    pub logs: PathBuf,
    pub uploads: PathBuf,
    pub config: PathBuf,
    pub ssl: PathBuf,
    pub nginx: PathBuf,
    pub pm2: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentProfile {
    pub name: ProfileName,
    pub branch: DetectionBranch,
    pub is_hosted_sandbox: bool,
    pub host: String,
    pub port: u16,
    pub websocket: WebSocketConfig,
    pub cors: CorsConfig,
    pub database: DatabaseFlags,
    pub paths: ProfilePaths,
    /// Port used when building last-resort loopback URLs.
    #[serde(skip)]
    pub default_port: u16,
}

/// Snapshot of the ambient signals the detector looks at.
#[derive(Debug, Clone, Default)]
pub struct DetectionInput {
    pub vars: BTreeMap<String, String>,
    /// Hostname the panel is being reached through, when known
    /// (e.g. forwarded from the browser).
    pub hostname: Option<String>,
    pub cwd: PathBuf,
}

impl DetectionInput {
    /// Capture the current process environment and working directory.
    pub fn from_process(hostname: Option<String>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|e| {
            log::warn!("Cannot read current directory ({e}), using \".\"");
            PathBuf::from(".")
        });
        Self {
            vars: std::env::vars().collect(),
            hostname,
            cwd,
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I, cwd: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            hostname: None,
            cwd: cwd.into(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// A variable's value, treating empty strings as unset.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// One-time operator dump of the resolved profile.
pub fn log_profile(profile: &DeploymentProfile, input: &DetectionInput) {
    log::info!(
        "Deployment profile: {} (rule: {:?}, hosted sandbox: {})",
        profile.name,
        profile.branch,
        profile.is_hosted_sandbox
    );
    log::info!("  cwd: {}", input.cwd.display());
    log::info!("  listen: {}:{}", profile.host, profile.port);
    log::info!(
        "  database: ssl={} pooling={}",
        profile.database.ssl,
        profile.database.connection_pooling
    );
    let origins: Vec<String> = profile.cors.origin.iter().map(ToString::to_string).collect();
    log::info!(
        "  cors: [{}] credentials={}",
        origins.join(", "),
        profile.cors.credentials
    );
    let url = profile.websocket.url();
    match validate_socket_url(&url) {
        Ok(()) => log::info!("  websocket: {url} (valid)"),
        Err(reason) => log::warn!(
            "  websocket: {url} rejected ({reason}), clients will use {}",
            resolve_socket_url(profile)
        ),
    }
    log::info!("  root: {}", profile.paths.root.display());
}
