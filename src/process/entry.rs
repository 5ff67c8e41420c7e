//! Launch planning: turn an [`AppRecord`] into an argument vector.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::runner::{CommandRunner, CommandSpec};
use super::shell::render_command_line;
use super::AppRecord;
use crate::error::{AppError, Result};

const MANIFEST_FILE: &str = "package.json";
const ENTRY_STEMS: [&str; 4] = ["index", "server", "app", "main"];
/// Typed sources are preferred over plain scripts with the same stem.
const ENTRY_EXTENSIONS: [&str; 2] = ["ts", "js"];
const ENTRY_DIRS: [&str; 2] = ["", "src"];
const TRANSPILED_EXTENSIONS: [&str; 4] = ["ts", "mts", "cts", "tsx"];

const TRANSPILER: &str = "tsx";
const TRANSPILER_HINT: &str = "npm install -g tsx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchSource {
    /// The caller supplied a command line.
    Command,
    /// `scripts.start` in the manifest.
    StartScript,
    /// `main` in the manifest.
    ManifestMain,
    /// Found by scanning conventional file names.
    Convention,
}

/// What to execute for an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// The script being run, when the plan runs a detected entry point.
    /// It is always the last element of `args`.
    pub entry: Option<PathBuf>,
    pub source: LaunchSource,
}

impl LaunchPlan {
    fn shell(command: &str) -> Self {
        #[cfg(windows)]
        let (program, flag) = ("cmd", "/C");
        #[cfg(not(windows))]
        let (program, flag) = ("sh", "-c");
        Self {
            program: program.to_string(),
            args: vec![flag.to_string(), command.to_string()],
            entry: None,
            source: LaunchSource::Command,
        }
    }

    fn entry(runtime: Runtime, entry: PathBuf, source: LaunchSource) -> Self {
        let mut args = runtime.args;
        args.push(entry.display().to_string());
        Self {
            program: runtime.program,
            args,
            entry: Some(entry),
            source,
        }
    }

    /// Arguments passed to the interpreter before the entry script.
    pub fn interpreter_args(&self) -> &[String] {
        match self.entry {
            Some(_) => &self.args[..self.args.len().saturating_sub(1)],
            None => &[],
        }
    }

    pub fn command_line(&self) -> String {
        render_command_line(&self.program, &self.args)
    }
}

/// An interpreter invocation, e.g. `node` or `npx --no-install tsx`.
struct Runtime {
    program: String,
    args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    main: Option<String>,
}

/// Every file name the convention scan looks at, in priority order.
pub fn entry_candidates() -> Vec<String> {
    let mut candidates = Vec::new();
    for dir in ENTRY_DIRS {
        for stem in ENTRY_STEMS {
            for ext in ENTRY_EXTENSIONS {
                if dir.is_empty() {
                    candidates.push(format!("{stem}.{ext}"));
                } else {
                    candidates.push(format!("{dir}/{stem}.{ext}"));
                }
            }
        }
    }
    candidates
}

fn needs_transpiler(entry: &Path) -> bool {
    entry
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| TRANSPILED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Decide how to launch `app` from `workdir`.
///
/// Order: explicit command, manifest `scripts.start`, manifest `main`, then
/// the conventional file names from [`entry_candidates`].
pub async fn resolve_launch(
    app: &AppRecord,
    workdir: &Path,
    runner: &dyn CommandRunner,
) -> Result<LaunchPlan> {
    if let Some(command) = app.command.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        return Ok(LaunchPlan::shell(command));
    }

    if !workdir.is_dir() {
        return Err(AppError::io("Working directory is not accessible")
            .context("app", app.name.clone())
            .context("path", workdir.display().to_string()));
    }

    let manifest = read_manifest(workdir);
    if let Some(manifest) = &manifest {
        if manifest.scripts.contains_key("start") {
            log::info!("[{}] Using start script from {}", app.name, MANIFEST_FILE);
            return Ok(LaunchPlan {
                program: "npm".to_string(),
                args: vec!["start".to_string()],
                entry: None,
                source: LaunchSource::StartScript,
            });
        }
    }

    let declared = manifest
        .and_then(|m| m.main)
        .map(|main| workdir.join(main))
        .filter(|path| {
            let found = path.is_file();
            if !found {
                log::warn!("Manifest main {} does not exist, scanning instead", path.display());
            }
            found
        });

    let (entry, source) = match declared {
        Some(path) => (path, LaunchSource::ManifestMain),
        None => {
            let candidates = entry_candidates();
            match candidates
                .iter()
                .map(|c| workdir.join(c))
                .find(|p| p.is_file())
            {
                Some(path) => (path, LaunchSource::Convention),
                None => {
                    return Err(AppError::no_entry_point(
                        &app.name,
                        &workdir.display().to_string(),
                        &candidates,
                        &list_dir(workdir),
                    ))
                }
            }
        }
    };

    log::info!("[{}] Detected entry point {}", app.name, entry.display());
    let runtime = if needs_transpiler(&entry) {
        locate_transpiler(runner, workdir).await.ok_or_else(|| {
            AppError::runtime_bridge_missing(
                &app.name,
                &entry.display().to_string(),
                TRANSPILER,
                TRANSPILER_HINT,
            )
        })?
    } else {
        Runtime {
            program: "node".to_string(),
            args: Vec::new(),
        }
    };
    Ok(LaunchPlan::entry(runtime, entry, source))
}

/// Resolves a launch plan only when a backend actually needs one.
#[derive(Clone, Copy)]
pub struct LaunchPlanner<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> LaunchPlanner<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    pub async fn plan(&self, app: &AppRecord, workdir: &Path) -> Result<LaunchPlan> {
        let plan = resolve_launch(app, workdir, self.runner).await?;
        log::debug!(
            "[{}] Launch plan ({:?}): {}",
            app.name,
            plan.source,
            plan.command_line()
        );
        Ok(plan)
    }
}

fn read_manifest(workdir: &Path) -> Option<PackageManifest> {
    let path = workdir.join(MANIFEST_FILE);
    let content = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            log::warn!("Ignoring unparseable {}: {}", path.display(), e);
            None
        }
    }
}

fn list_dir(dir: &Path) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    if e.file_type().is_ok_and(|t| t.is_dir()) {
                        format!("{name}/")
                    } else {
                        name
                    }
                })
                .collect();
            names.sort();
            names
        }
        Err(e) => vec![format!("(unreadable: {e})")],
    }
}

/// Find a runner able to execute TypeScript directly.
async fn locate_transpiler(runner: &dyn CommandRunner, workdir: &Path) -> Option<Runtime> {
    let forms: [(&str, &[&str]); 2] = [(TRANSPILER, &[]), ("npx", &["--no-install", TRANSPILER])];
    for (program, prefix) in forms {
        let args: Vec<String> = prefix
            .iter()
            .copied()
            .chain(["--version"])
            .map(String::from)
            .collect();
        let spec = CommandSpec::new(program, args).cwd(workdir);
        match runner.run(&spec).await {
            Ok(out) if out.success => {
                return Some(Runtime {
                    program: program.to_string(),
                    args: prefix.iter().map(|s| s.to_string()).collect(),
                })
            }
            Ok(out) => log::debug!("{} unavailable: {}", spec.command_line(), out.detail()),
            Err(e) => log::debug!("{} unavailable: {}", spec.command_line(), e),
        }
    }
    None
}
