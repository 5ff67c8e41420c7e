//! Supervision delegated to pm2.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::entry::{LaunchPlan, LaunchPlanner};
use super::list_parser::parse_process_list;
use super::probe::ManagerInvocation;
use super::runner::{CommandOutput, CommandRunner, CommandSpec};
use super::{AppRecord, ProcessInfo, Supervisor, SupervisorMode};
use crate::error::{AppError, Result};

struct ProcessListCache {
    data: Vec<ProcessInfo>,
    fetched_at: Instant,
}

pub struct ExternalSupervisor {
    runner: Arc<dyn CommandRunner>,
    invocation: ManagerInvocation,
    cache: Mutex<Option<ProcessListCache>>,
    cache_ttl: Duration,
}

impl ExternalSupervisor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        invocation: ManagerInvocation,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            runner,
            invocation,
            cache: Mutex::new(None),
            cache_ttl,
        }
    }

    pub fn invocation(&self) -> &ManagerInvocation {
        &self.invocation
    }

    async fn run_raw(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.runner
            .run(spec)
            .await
            .map_err(|e| e.context("command", spec.command_line()))
    }

    /// Run a pm2 command, turning a non-zero exit into an error.
    async fn exec(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let out = self.run_raw(&spec).await?;
        if out.success {
            Ok(out)
        } else {
            Err(AppError::manager_command(&spec.command_line(), out.detail()))
        }
    }

    async fn exec_for(&self, app: &str, spec: CommandSpec) -> Result<CommandOutput> {
        self.exec(spec).await.map_err(|e| e.context("app", app))
    }

    async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Restore the process list pm2 saved before its last shutdown.
    pub async fn resurrect(&self) {
        match self.exec(self.invocation.command(["resurrect"])).await {
            Ok(_) => log::info!("pm2 resurrect completed"),
            Err(e) => log::warn!("pm2 resurrect failed (continuing): {e}"),
        }
    }

    /// Persist the current process list so `resurrect` can restore it.
    pub async fn save(&self) {
        if let Err(e) = self.exec(self.invocation.command(["save"])).await {
            log::warn!("pm2 save failed (continuing): {e}");
        }
    }

    fn start_command(&self, app: &AppRecord, workdir: &Path, plan: &LaunchPlan) -> CommandSpec {
        let cwd = workdir.display().to_string();
        let mut args = vec![
            "start".to_string(),
            plan.entry.as_ref().map_or_else(
                || plan.program.clone(),
                |entry| entry.display().to_string(),
            ),
            "--name".to_string(),
            app.name.clone(),
            "--cwd".to_string(),
            cwd,
            "--interpreter".to_string(),
        ];
        if plan.entry.is_some() {
            args.push(plan.program.clone());
            let interpreter_args = plan.interpreter_args();
            if !interpreter_args.is_empty() {
                args.push("--interpreter-args".to_string());
                args.push(interpreter_args.join(" "));
            }
        } else {
            args.push("none".to_string());
            if !plan.args.is_empty() {
                args.push("--".to_string());
                args.extend(plan.args.iter().cloned());
            }
        }

        let mut spec = self.invocation.command(args).cwd(workdir);
        if let Some(port) = app.port {
            spec = spec.env("PORT", port.to_string());
        }
        spec
    }

    /// Query pm2's process list, retrying once with `--silent` when the
    /// output cannot be parsed. Degrades to an empty list.
    async fn query_list(&self) -> Vec<ProcessInfo> {
        let forms: [&[&str]; 2] = [&["jlist"], &["jlist", "--silent"]];
        for form in forms {
            let spec = self.invocation.command(form.iter().copied());
            let out = match self.run_raw(&spec).await {
                Ok(out) if out.success => out,
                Ok(out) => {
                    log::warn!("{} failed: {}", spec.command_line(), out.detail());
                    continue;
                }
                Err(e) => {
                    log::warn!("{e}");
                    continue;
                }
            };
            match parse_process_list(&out.stdout) {
                Ok(list) => return list,
                Err(e) => log::warn!("Unparseable output from {}: {}", spec.command_line(), e),
            }
        }
        log::warn!("pm2 process list unavailable, reporting no processes");
        Vec::new()
    }
}

#[async_trait]
impl Supervisor for ExternalSupervisor {
    fn mode(&self) -> SupervisorMode {
        SupervisorMode::External
    }

    async fn start(&self, app: &AppRecord, workdir: &Path, plan: &LaunchPlan) -> Result<()> {
        let spec = self.start_command(app, workdir, plan);
        log::info!("[{}] Starting under pm2: {}", app.name, spec.command_line());
        let result = self
            .exec_for(&app.name, spec)
            .await
            .map(drop)
            .map_err(|e| e.context("path", workdir.display().to_string()));
        self.invalidate_cache().await;
        result?;
        self.save().await;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let result = self
            .exec_for(name, self.invocation.command(["stop", name]))
            .await
            .map(drop);
        self.invalidate_cache().await;
        result
    }

    async fn restart(
        &self,
        app: &AppRecord,
        workdir: &Path,
        planner: &LaunchPlanner<'_>,
    ) -> Result<()> {
        let in_place = self
            .exec_for(&app.name, self.invocation.command(["restart", app.name.as_str()]))
            .await;
        self.invalidate_cache().await;
        let Err(e) = in_place else {
            return Ok(());
        };

        log::warn!(
            "[{}] In-place restart failed ({}), recreating the process",
            app.name,
            e
        );
        // Plan before deleting so an unlaunchable app keeps its pm2 entry.
        let plan = planner.plan(app, workdir).await?;
        if let Err(e) = self.delete(&app.name).await {
            log::debug!("[{}] Delete before recreate failed: {}", app.name, e);
        }
        self.start(app, workdir, &plan).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let result = self
            .exec_for(name, self.invocation.command(["delete", name]))
            .await
            .map(drop);
        self.invalidate_cache().await;
        result?;
        self.save().await;
        Ok(())
    }

    async fn list(&self) -> Vec<ProcessInfo> {
        // Held across the query so concurrent callers share one refresh.
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return cached.data.clone();
            }
        }
        let data = self.query_list().await;
        *cache = Some(ProcessListCache {
            data: data.clone(),
            fetched_at: Instant::now(),
        });
        drop(cache);
        data
    }

    async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        let lines = lines.to_string();
        let out = self
            .exec_for(
                name,
                self.invocation
                    .command(["logs", name, "--lines", lines.as_str(), "--nostream"]),
            )
            .await?;
        Ok(out.stdout)
    }
}
