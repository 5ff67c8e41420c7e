//! Filesystem locations for the detected profile.
//!
//! Directories are created on demand. Failures downgrade through a fallback
//! cascade (caller fallback, then the temp root) and are only logged, so a
//! missing logs or uploads directory never aborts startup.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::config::AppConfig;
use crate::environment::{DeploymentProfile, ProfilePaths};

/// Well-known reverse-proxy config directories, probed in order.
const DEFAULT_NGINX_CANDIDATES: [&str; 3] =
    ["/etc/nginx", "/usr/local/etc/nginx", "/usr/local/nginx/conf"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKey {
    Root,
    Logs,
    Uploads,
    Config,
    Ssl,
    Nginx,
    Pm2,
}

impl PathKey {
    pub const ALL: [Self; 7] = [
        Self::Root,
        Self::Logs,
        Self::Uploads,
        Self::Config,
        Self::Ssl,
        Self::Nginx,
        Self::Pm2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Logs => "logs",
            Self::Uploads => "uploads",
            Self::Config => "config",
            Self::Ssl => "ssl",
            Self::Nginx => "nginx",
            Self::Pm2 => "pm2",
        }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tier of the cascade a directory ended up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    Primary,
    Fallback,
    Temp,
    /// Every tier failed; the returned path may not exist.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub path: PathBuf,
    pub tier: ResolutionTier,
}

/// Decides whether a directory can be written to.
pub type WritableCheck = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

pub struct PathResolver {
    paths: ProfilePaths,
    temp_root: PathBuf,
    nginx_candidates: Vec<PathBuf>,
    writable: WritableCheck,
}

impl PathResolver {
    pub fn new(profile: &DeploymentProfile, config: &AppConfig) -> Self {
        let nginx_candidates = config
            .paths
            .nginx_candidates
            .clone()
            .unwrap_or_else(|| DEFAULT_NGINX_CANDIDATES.iter().map(PathBuf::from).collect());
        Self {
            paths: profile.paths.clone(),
            temp_root: config
                .paths
                .temp_root
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            nginx_candidates,
            writable: Arc::new(is_writable),
        }
    }

    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    pub fn with_nginx_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
        self.nginx_candidates = candidates;
        self
    }

    /// Replace the `access(2)` writability check, e.g. to simulate a
    /// read-only mount.
    pub fn with_writable_check(mut self, check: WritableCheck) -> Self {
        self.writable = check;
        self
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// The profile's unverified path for a key.
    pub fn configured_path(&self, key: PathKey) -> &Path {
        match key {
            PathKey::Root => &self.paths.root,
            PathKey::Logs => &self.paths.logs,
            PathKey::Uploads => &self.paths.uploads,
            PathKey::Config => &self.paths.config,
            PathKey::Ssl => &self.paths.ssl,
            PathKey::Nginx => &self.paths.nginx,
            PathKey::Pm2 => &self.paths.pm2,
        }
    }

    /// Resolve a relative path against the profile root.
    pub fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths.root.join(path)
        }
    }

    /// Absolute working directory for an application path. Does not create it.
    pub fn resolve_working_dir(&self, path: &Path) -> PathBuf {
        self.absolutize(path)
    }

    /// Resolve a named directory, creating it if needed. Never fails.
    pub fn resolve(&self, key: PathKey, fallback: Option<&Path>) -> PathBuf {
        self.resolve_detailed(key, fallback).path
    }

    pub fn resolve_detailed(&self, key: PathKey, fallback: Option<&Path>) -> Resolution {
        if key == PathKey::Nginx {
            return self.resolve_nginx(fallback);
        }
        let path = self.configured_path(key).to_path_buf();
        self.ensure_dir(&path, fallback)
    }

    /// The first existing well-known reverse-proxy directory. Only when none
    /// exists is the profile's own nginx directory created.
    pub fn resolve_nginx(&self, fallback: Option<&Path>) -> Resolution {
        let configured = self.absolutize(&self.paths.nginx);
        let candidates = std::iter::once(configured.clone()).chain(
            self.nginx_candidates
                .iter()
                .map(|candidate| self.absolutize(candidate)),
        );
        for candidate in candidates {
            if candidate.is_dir() {
                log::debug!("Using reverse-proxy config directory {}", candidate.display());
                return Resolution {
                    path: candidate,
                    tier: ResolutionTier::Primary,
                };
            }
        }
        log::info!(
            "No system reverse-proxy config directory found, creating {}",
            configured.display()
        );
        self.ensure_dir(&configured, fallback)
    }

    /// Run the creation cascade for an arbitrary directory.
    pub fn ensure_dir(&self, path: &Path, fallback: Option<&Path>) -> Resolution {
        let primary = self.absolutize(path);
        let err = match self.prepare_dir(&primary) {
            Ok(()) => {
                return Resolution {
                    path: primary,
                    tier: ResolutionTier::Primary,
                }
            }
            Err(e) => e,
        };
        log::warn!("Cannot create {}: {}", primary.display(), err);

        if let Some(fallback) = fallback {
            let fallback = self.absolutize(fallback);
            match self.prepare_dir(&fallback) {
                Ok(()) => {
                    log::warn!(
                        "Using fallback directory {} instead of {}",
                        fallback.display(),
                        primary.display()
                    );
                    return Resolution {
                        path: fallback,
                        tier: ResolutionTier::Fallback,
                    };
                }
                Err(e) => log::warn!("Cannot create fallback {}: {}", fallback.display(), e),
            }
        }

        let segment = primary
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("deploy-adapter"));
        let temp = self.temp_root.join(segment);
        match self.prepare_dir(&temp) {
            Ok(()) => {
                log::warn!(
                    "Using temporary directory {} instead of {}",
                    temp.display(),
                    primary.display()
                );
                Resolution {
                    path: temp,
                    tier: ResolutionTier::Temp,
                }
            }
            Err(e) => {
                log::error!(
                    "Cannot create temporary directory {} ({}); continuing with {}",
                    temp.display(),
                    e,
                    primary.display()
                );
                Resolution {
                    path: primary,
                    tier: ResolutionTier::Unresolved,
                }
            }
        }
    }

    pub fn resolve_all(&self) -> BTreeMap<PathKey, Resolution> {
        PathKey::ALL
            .into_iter()
            .map(|key| (key, self.resolve_detailed(key, None)))
            .collect()
    }

    /// Report the state of every named path without changing anything.
    pub fn diagnose(&self) -> Vec<PathReport> {
        PathKey::ALL
            .into_iter()
            .map(|key| {
                let path = self.absolutize(self.configured_path(key));
                let exists = path.exists();
                PathReport {
                    key,
                    exists,
                    readable: exists && is_readable(&path),
                    writable: exists && (self.writable)(&path),
                    path,
                }
            })
            .collect()
    }

    /// Create the directory and make sure it is writable, repairing
    /// permissions once. A directory that stays unwritable fails the tier.
    fn prepare_dir(&self, path: &Path) -> io::Result<()> {
        create_dir(path)?;
        if !path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "path exists but is not a directory",
            ));
        }
        if (self.writable)(path) {
            return Ok(());
        }
        match repair_permissions(path) {
            Ok(()) if (self.writable)(path) => {
                log::info!("Repaired permissions on {}", path.display());
                Ok(())
            }
            Ok(()) => {
                log::warn!(
                    "{} is still not writable after chmod 0755",
                    path.display()
                );
                Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "directory is not writable",
                ))
            }
            Err(e) => {
                log::warn!(
                    "{} is not writable and permissions could not be repaired: {}",
                    path.display(),
                    e
                );
                Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("directory is not writable: {e}"),
                ))
            }
        }
    }
}

fn create_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt as _;
        builder.mode(0o755);
    }
    builder.create(path)
}

#[cfg(unix)]
fn is_writable(path: &Path) -> bool {
    use nix::unistd::{access, AccessFlags};
    access(path, AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn is_writable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_readable(path: &Path) -> bool {
    use nix::unistd::{access, AccessFlags};
    access(path, AccessFlags::R_OK).is_ok()
}

#[cfg(not(unix))]
fn is_readable(path: &Path) -> bool {
    fs::read_dir(path).is_ok()
}

/// POSIX only; there is no portable equivalent.
#[cfg(unix)]
fn repair_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn repair_permissions(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "permission repair requires a POSIX permission model",
    ))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathReport {
    pub key: PathKey,
    pub path: PathBuf,
    pub exists: bool,
    pub readable: bool,
    pub writable: bool,
}

pub fn render_report(reports: &[PathReport]) -> String {
    let flag = |b: bool| if b { "yes" } else { "no" };
    let mut out = format!("{:<8} {:<6} {:<5} {:<5} {}\n", "KEY", "EXISTS", "READ", "WRITE", "PATH");
    for r in reports {
        out.push_str(&format!(
            "{:<8} {:<6} {:<5} {:<5} {}\n",
            r.key.as_str(),
            flag(r.exists),
            flag(r.readable),
            flag(r.writable),
            r.path.display()
        ));
    }
    out
}

pub fn log_report(reports: &[PathReport]) {
    for line in render_report(reports).lines() {
        log::info!("{line}");
    }
}
