//! Locating the external process manager.

use serde::Serialize;

use super::runner::{CommandRunner, CommandSpec};
use crate::config::SupervisorConfig;

/// How pm2 is invoked: the program plus any arguments that precede pm2's own
/// (e.g. `npx pm2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerInvocation {
    pub program: String,
    pub prefix: Vec<String>,
}

impl ManagerInvocation {
    pub fn new<I, S>(program: impl Into<String>, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            prefix: prefix.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a pm2 command with the given arguments.
    pub fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = self
            .prefix
            .iter()
            .cloned()
            .chain(args.into_iter().map(Into::into))
            .collect();
        CommandSpec::new(self.program.clone(), args)
    }

    /// Parse a config entry such as `["npx", "pm2"]`.
    fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, prefix) = argv.split_first()?;
        Some(Self::new(program.clone(), prefix.iter().cloned()))
    }
}

/// Built-in candidates, in probe order.
pub fn default_candidates() -> Vec<ManagerInvocation> {
    let mut candidates = vec![
        ManagerInvocation::new("pm2", Vec::<String>::new()),
        ManagerInvocation::new("/usr/local/bin/pm2", Vec::<String>::new()),
        ManagerInvocation::new("/usr/bin/pm2", Vec::<String>::new()),
    ];
    if let Some(home) = dirs::home_dir() {
        for dir in [".npm-global/bin", ".local/bin"] {
            candidates.push(ManagerInvocation::new(
                home.join(dir).join("pm2").display().to_string(),
                Vec::<String>::new(),
            ));
        }
    }
    candidates.push(ManagerInvocation::new("npx", ["pm2"]));
    candidates
}

pub fn candidates_from_config(config: &SupervisorConfig) -> Vec<ManagerInvocation> {
    match &config.manager_candidates {
        Some(argvs) => argvs
            .iter()
            .filter_map(|argv| ManagerInvocation::from_argv(argv))
            .collect(),
        None => default_candidates(),
    }
}

/// Return the first candidate that answers a version query.
pub async fn probe_manager(
    runner: &dyn CommandRunner,
    candidates: &[ManagerInvocation],
) -> Option<ManagerInvocation> {
    for candidate in candidates {
        let spec = candidate.command(["--version"]);
        match runner.run(&spec).await {
            Ok(out) if out.success => {
                log::info!(
                    "Found process manager: {} (version {})",
                    spec.command_line(),
                    out.stdout.trim()
                );
                return Some(candidate.clone());
            }
            Ok(out) => log::debug!("{} failed: {}", spec.command_line(), out.detail()),
            Err(e) => log::debug!("{} failed: {}", spec.command_line(), e),
        }
    }
    None
}
