//! Profile detection rules, evaluated in priority order.

use std::path::{Path, PathBuf};

use super::cors::{CorsConfig, OriginRule};
use super::socket_url::{host_usable, repair_websocket};
use super::{
    DatabaseFlags, DeploymentProfile, DetectionBranch, DetectionInput, ProfileName,
    ProfilePaths, SocketScheme, WebSocketConfig,
};
use crate::config::AppConfig;

/// Explicit port override, consulted before the platform variable.
const PORT_OVERRIDE_VAR: &str = "SERVER_PORT";
/// Port injected by hosting platforms.
const PLATFORM_PORT_VAR: &str = "PORT";
const DOMAIN_VARS: [&str; 2] = ["DOMAIN", "CUSTOM_DOMAIN"];
const CORS_ORIGINS_VAR: &str = "CORS_ORIGINS";
/// Must be overridden through `CORS_ORIGINS` on a real deployment.
const PLACEHOLDER_ORIGIN: &str = "https://your-domain.com";
const ALL_INTERFACES: &str = "0.0.0.0";

/// Classify the runtime context. Always returns a profile; development is
/// the default when no positive signal is found.
pub fn detect(input: &DetectionInput, config: &AppConfig) -> DeploymentProfile {
    let port = resolve_port(input, config.default_port);
    let node_env_production = input
        .var("NODE_ENV")
        .is_some_and(|v| v.eq_ignore_ascii_case("production"));

    let mut profile = if let Some(domain) = matched_custom_domain(input, config) {
        custom_domain_profile(input, config, &domain, port)
    } else if is_hosted_sandbox(input, config) {
        sandbox_profile(input, config, port, node_env_production)
    } else if node_env_production {
        generic_production_profile(input, config, port)
    } else {
        development_profile(input, config, port)
    };
    repair_websocket(&mut profile);
    profile
}

/// `SERVER_PORT`, then `PORT`, then the configured default. Values that are
/// not a non-zero port number are skipped.
fn resolve_port(input: &DetectionInput, default_port: u16) -> u16 {
    for var in [PORT_OVERRIDE_VAR, PLATFORM_PORT_VAR] {
        let Some(raw) = input.var(var) else {
            continue;
        };
        match raw.parse::<u16>() {
            Ok(port) if port > 0 => return port,
            _ => log::warn!("Ignoring {var}={raw:?}: not a valid port"),
        }
    }
    default_port
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    let host = host.split(':').next().unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

fn normalize_domain(domain: Option<&str>) -> Option<String> {
    domain.map(normalize_host).filter(|d| !d.is_empty())
}

fn matched_custom_domain(input: &DetectionInput, config: &AppConfig) -> Option<String> {
    let domain = normalize_domain(config.production_domain.as_deref())?;

    let hostname_matches = input
        .hostname
        .as_deref()
        .is_some_and(|h| normalize_host(h) == domain);
    let marker_matches = DOMAIN_VARS
        .iter()
        .filter_map(|var| input.var(var))
        .any(|v| normalize_host(v) == domain);

    (hostname_matches || marker_matches).then_some(domain)
}

fn is_hosted_sandbox(input: &DetectionInput, config: &AppConfig) -> bool {
    if config
        .sandbox
        .env_markers
        .iter()
        .any(|marker| input.var(marker).is_some())
    {
        return true;
    }
    input.hostname.as_deref().is_some_and(|hostname| {
        let hostname = normalize_host(hostname);
        config.sandbox.hostname_suffixes.iter().any(|suffix| {
            let suffix = suffix.trim_start_matches("*.").trim_start_matches('.');
            hostname.ends_with(&format!(".{suffix}"))
        })
    })
}

fn domain_origins(domain: &str) -> [OriginRule; 2] {
    [
        OriginRule::exact(format!("https://{domain}")),
        OriginRule::exact(format!("https://www.{domain}")),
    ]
}

fn home_dir(input: &DetectionInput) -> Option<PathBuf> {
    input.var("HOME").map(PathBuf::from).or_else(dirs::home_dir)
}

fn pm2_home(input: &DetectionInput, base: &Path) -> PathBuf {
    if let Some(pm2_home) = input.var("PM2_HOME") {
        return PathBuf::from(pm2_home);
    }
    home_dir(input).unwrap_or_else(|| base.to_path_buf()).join(".pm2")
}

fn custom_domain_profile(
    input: &DetectionInput,
    config: &AppConfig,
    domain: &str,
    port: u16,
) -> DeploymentProfile {
    DeploymentProfile {
        name: ProfileName::Production,
        branch: DetectionBranch::CustomDomain,
        is_hosted_sandbox: false,
        host: ALL_INTERFACES.to_string(),
        port,
        websocket: WebSocketConfig {
            port: 443,
            host: domain.to_string(),
            protocol: SocketScheme::Wss,
        },
        cors: CorsConfig {
            origin: domain_origins(domain).to_vec(),
            credentials: true,
        },
        database: DatabaseFlags {
            ssl: true,
            connection_pooling: true,
        },
        paths: server_paths(input, config),
        default_port: config.default_port,
    }
}

fn sandbox_profile(
    input: &DetectionInput,
    config: &AppConfig,
    port: u16,
    node_env_production: bool,
) -> DeploymentProfile {
    let mut origin: Vec<OriginRule> = config
        .sandbox
        .hostname_suffixes
        .iter()
        .map(|suffix| OriginRule::wildcard(suffix))
        .collect();
    if let Some(domain) = normalize_domain(config.production_domain.as_deref()) {
        origin.extend(domain_origins(&domain));
    }
    if !node_env_production {
        origin.extend(config.dev_origins.iter().map(OriginRule::exact));
    }

    let public_host = input
        .hostname
        .as_deref()
        .and_then(|h| h.trim().split(':').next())
        .map(str::to_ascii_lowercase)
        .filter(|h| host_usable(h))
        .or_else(|| {
            input
                .var("REPLIT_DEV_DOMAIN")
                .filter(|h| host_usable(h))
                .map(str::to_string)
        })
        .unwrap_or_else(|| ALL_INTERFACES.to_string());

    let root = input.cwd.clone();
    DeploymentProfile {
        name: ProfileName::HostedSandbox,
        branch: DetectionBranch::HostedSandbox,
        is_hosted_sandbox: true,
        host: ALL_INTERFACES.to_string(),
        port,
        websocket: WebSocketConfig {
            port,
            host: public_host,
            protocol: SocketScheme::Wss,
        },
        cors: CorsConfig {
            origin,
            credentials: true,
        },
        database: DatabaseFlags {
            ssl: true,
            connection_pooling: true,
        },
        paths: ProfilePaths {
            logs: root.join("logs"),
            uploads: root.join("uploads"),
            config: root.join("config"),
            ssl: root.join("ssl"),
            nginx: root.join("nginx"),
            pm2: pm2_home(input, &root),
            root,
        },
        default_port: config.default_port,
    }
}

fn generic_production_profile(
    input: &DetectionInput,
    config: &AppConfig,
    port: u16,
) -> DeploymentProfile {
    let mut origin: Vec<OriginRule> = input
        .var(CORS_ORIGINS_VAR)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(OriginRule::exact)
                .collect()
        })
        .unwrap_or_default();
    if origin.is_empty() {
        log::warn!(
            "{CORS_ORIGINS_VAR} is not set; CORS allows only the placeholder {PLACEHOLDER_ORIGIN}"
        );
        origin.push(OriginRule::exact(PLACEHOLDER_ORIGIN));
    }

    DeploymentProfile {
        name: ProfileName::Production,
        branch: DetectionBranch::GenericProduction,
        is_hosted_sandbox: false,
        host: ALL_INTERFACES.to_string(),
        port,
        websocket: WebSocketConfig {
            port,
            host: ALL_INTERFACES.to_string(),
            protocol: SocketScheme::Ws,
        },
        cors: CorsConfig {
            origin,
            credentials: true,
        },
        database: DatabaseFlags {
            ssl: true,
            connection_pooling: true,
        },
        paths: server_paths(input, config),
        default_port: config.default_port,
    }
}

fn development_profile(
    input: &DetectionInput,
    config: &AppConfig,
    port: u16,
) -> DeploymentProfile {
    DeploymentProfile {
        name: ProfileName::Development,
        branch: DetectionBranch::Development,
        is_hosted_sandbox: false,
        host: "localhost".to_string(),
        port,
        websocket: WebSocketConfig {
            port,
            host: "localhost".to_string(),
            protocol: SocketScheme::Ws,
        },
        cors: CorsConfig {
            origin: config.dev_origins.iter().map(OriginRule::exact).collect(),
            credentials: true,
        },
        database: DatabaseFlags {
            ssl: false,
            connection_pooling: false,
        },
        paths: ProfilePaths {
            root: input.cwd.clone(),
            logs: PathBuf::from("logs"),
            uploads: PathBuf::from("uploads"),
            config: PathBuf::from("config"),
            ssl: PathBuf::from("ssl"),
            nginx: PathBuf::from("nginx"),
            pm2: pm2_home(input, &input.cwd),
        },
        default_port: config.default_port,
    }
}

/// System-wide locations for a self-administered server.
fn server_paths(input: &DetectionInput, config: &AppConfig) -> ProfilePaths {
    let root = input
        .var("APP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| input.cwd.clone());
    ProfilePaths {
        logs: PathBuf::from("/var/log").join(&config.app_name),
        uploads: root.join("uploads"),
        config: root.join("config"),
        ssl: PathBuf::from("/etc/ssl").join(&config.app_name),
        nginx: PathBuf::from("/etc/nginx"),
        pm2: pm2_home(input, &root),
        root,
    }
}
