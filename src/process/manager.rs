//! Application supervision facade.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};

use super::entry::LaunchPlanner;
use super::external::ExternalSupervisor;
use super::fallback::FallbackSupervisor;
use super::probe::{candidates_from_config, probe_manager, ManagerInvocation};
use super::runner::CommandRunner;
use super::{AppRecord, ProcessInfo, ProcessMetrics, Supervisor, SupervisorMode};
use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::paths::PathResolver;
use crate::validation::validate_app_name;

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Held for the duration of one operation on an app. Dropping the last
/// holder removes the name from the lock map.
struct AppGuard<'a> {
    locks: &'a LockMap,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AppGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters hold their own clone, so a count of one means nobody is queued.
        if locks.get(&self.name).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.name);
        }
    }
}

/// Single entry point for starting and inspecting managed applications.
///
/// The backend is chosen by the first operation and kept for the lifetime of
/// the supervisor. Operations on the same app name never overlap.
pub struct ProcessSupervisor {
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<PathResolver>,
    candidates: Vec<ManagerInvocation>,
    list_ttl: Duration,
    spawn_grace: Duration,
    backend: OnceCell<Box<dyn Supervisor>>,
    locks: LockMap,
}

impl ProcessSupervisor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<PathResolver>,
        config: &SupervisorConfig,
    ) -> Self {
        Self {
            runner,
            resolver,
            candidates: candidates_from_config(config),
            list_ttl: config.process_list_ttl(),
            spawn_grace: config.spawn_grace(),
            backend: OnceCell::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<ManagerInvocation>) -> Self {
        self.candidates = candidates;
        self
    }

    async fn backend(&self) -> &dyn Supervisor {
        self.backend
            .get_or_init(|| async {
                match probe_manager(self.runner.as_ref(), &self.candidates).await {
                    Some(invocation) => {
                        let external = ExternalSupervisor::new(
                            Arc::clone(&self.runner),
                            invocation,
                            self.list_ttl,
                        );
                        external.resurrect().await;
                        Box::new(external) as Box<dyn Supervisor>
                    }
                    None => {
                        log::warn!(
                            "No process manager found, supervising applications in-process. \
                             Install pm2 (npm install -g pm2) for restarts across reboots and captured logs."
                        );
                        Box::new(FallbackSupervisor::new(self.spawn_grace))
                    }
                }
            })
            .await
            .as_ref()
    }

    async fn lock_app(&self, name: &str) -> AppGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        AppGuard {
            locks: &self.locks,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn workdir(&self, app: &AppRecord) -> PathBuf {
        if !app.use_external_manager {
            log::debug!("[{}] Prefers in-process supervision", app.name);
        }
        self.resolver.resolve_working_dir(&app.path)
    }

    fn planner(&self) -> LaunchPlanner<'_> {
        LaunchPlanner::new(self.runner.as_ref())
    }

    /// Which backend is in use. Probes on first call.
    pub async fn mode(&self) -> SupervisorMode {
        self.backend().await.mode()
    }

    pub async fn start(&self, app: &AppRecord) -> Result<()> {
        validate_app_name(&app.name)?;
        let _guard = self.lock_app(&app.name).await;
        let workdir = self.workdir(app);
        let plan = self.planner().plan(app, &workdir).await?;
        self.backend().await.start(app, &workdir, &plan).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        validate_app_name(name)?;
        let _guard = self.lock_app(name).await;
        self.backend().await.stop(name).await
    }

    /// pm2 restarts in place without a launch plan. A plan is only resolved
    /// when the process has to be spawned anew, and always before anything
    /// is stopped.
    pub async fn restart(&self, app: &AppRecord) -> Result<()> {
        validate_app_name(&app.name)?;
        let _guard = self.lock_app(&app.name).await;
        let workdir = self.workdir(app);
        self.backend()
            .await
            .restart(app, &workdir, &self.planner())
            .await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        validate_app_name(name)?;
        let _guard = self.lock_app(name).await;
        self.backend().await.delete(name).await
    }

    pub async fn list(&self) -> Vec<ProcessInfo> {
        self.backend().await.list().await
    }

    pub async fn status(&self, name: &str) -> Option<ProcessInfo> {
        self.list().await.into_iter().find(|p| p.name == name)
    }

    pub async fn metrics(&self, name: &str) -> Option<ProcessMetrics> {
        self.status(name).await.as_ref().map(ProcessMetrics::from)
    }

    pub async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        validate_app_name(name)?;
        self.backend().await.logs(name, lines).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::environment::{detect, DetectionInput};
    use crate::error::{AppError, ErrorKind};
    use crate::process::runner::CommandSpec;
    use crate::process::testing::{failed, ok, MockRunner};

    const LIST: &str = r#"[{"name":"api","pid":321,"pm_id":0,"monit":{"memory":2048,"cpu":3.5},"pm2_env":{"status":"online","restart_time":1}}]"#;

    fn resolver(root: &std::path::Path) -> Arc<PathResolver> {
        let config = AppConfig::default();
        let input = DetectionInput::from_pairs(Vec::<(String, String)>::new(), root);
        Arc::new(PathResolver::new(&detect(&input, &config), &config))
    }

    fn supervisor(runner: &Arc<MockRunner>, root: &std::path::Path) -> ProcessSupervisor {
        let runner: Arc<dyn CommandRunner> = Arc::clone(runner) as Arc<dyn CommandRunner>;
        ProcessSupervisor::new(runner, resolver(root), &SupervisorConfig::default()).with_candidates(
            vec![
                ManagerInvocation::new("pm2", Vec::<String>::new()),
                ManagerInvocation::new("npx", ["pm2"]),
            ],
        )
    }

    fn is_probe(spec: &CommandSpec) -> bool {
        spec.ends_with(&["--version"])
    }

    #[tokio::test]
    async fn probe_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(|_| Ok(failed("not found"))));
        let pm = supervisor(&runner, dir.path());
        assert_eq!(pm.mode().await, SupervisorMode::Fallback);
        assert_eq!(pm.mode().await, SupervisorMode::Fallback);
        assert!(pm.list().await.is_empty());
        assert_eq!(runner.count(is_probe), 2);
    }

    #[tokio::test]
    async fn external_mode_resurrects_and_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(|spec| match spec.args.first().map(String::as_str) {
            Some("jlist") => Ok(ok(LIST)),
            _ => Ok(ok("5.3.0")),
        }));
        let pm = supervisor(&runner, dir.path());
        assert_eq!(pm.mode().await, SupervisorMode::External);
        assert_eq!(runner.calls()[1].args, vec!["resurrect"]);

        let status = pm.status("api").await.unwrap();
        assert_eq!(status.pid, Some(321));
        let metrics = pm.metrics("api").await.unwrap();
        assert_eq!(metrics.memory_bytes, Some(2048));
        assert_eq!(metrics.restarts, Some(1));
        assert!(pm.metrics("missing").await.is_none());
        // second lookup served from the list cache
        assert_eq!(runner.count(|s| s.args.first().map(String::as_str) == Some("jlist")), 1);
    }

    #[tokio::test]
    async fn invalid_names_are_refused_before_probing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(|_| Ok(ok(""))));
        let pm = supervisor(&runner, dir.path());
        let err = pm.stop("../etc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_entry_surfaces_before_backend_call() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        let runner = Arc::new(MockRunner::new(|_| Err(AppError::process("No such file"))));
        let pm = supervisor(&runner, dir.path());
        let err = pm.start(&AppRecord::new("api", "empty")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoEntryPointFound);
        assert!(pm.list().await.is_empty());
    }

    #[tokio::test]
    async fn external_restart_in_place_skips_entry_detection() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(|_| Ok(ok("5.3.0"))));
        let pm = supervisor(&runner, dir.path());
        // the directory does not exist, so no launch plan could be built
        pm.restart(&AppRecord::new("api", "gone")).await.unwrap();
        let calls = runner.calls();
        let verbs: Vec<&str> = calls.iter().map(|c| c.args[0].as_str()).collect();
        assert_eq!(verbs, vec!["--version", "resurrect", "restart"]);
    }

    #[tokio::test]
    async fn lock_entries_are_released_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(|_| Ok(ok("5.3.0"))));
        let pm = supervisor(&runner, dir.path());
        for i in 0..5 {
            pm.stop(&format!("app-{i}")).await.unwrap();
        }
        pm.delete("app-0").await.unwrap();
        assert!(pm.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn queued_operation_keeps_the_lock_entry() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new(|_| Ok(ok(""))));
        let pm = supervisor(&runner, dir.path());
        let first = pm.lock_app("api").await;
        let waiter = Arc::clone(pm.locks.lock().unwrap().get("api").unwrap());
        drop(first);
        // a clone outside the map counts as a holder
        assert!(pm.locks.lock().unwrap().contains_key("api"));
        drop(waiter);
        drop(pm.lock_app("api").await);
        assert!(pm.locks.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fallback_round_trip_never_calls_the_manager() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("api")).unwrap();
        let runner = Arc::new(MockRunner::new(|_| Ok(failed("command not found"))));
        let pm = supervisor(&runner, dir.path());
        let app = AppRecord::new("api", "api").with_command("sleep 30").with_port(5055);

        pm.start(&app).await.unwrap();
        assert_eq!(pm.mode().await, SupervisorMode::Fallback);
        let status = pm.status("api").await.unwrap();
        assert_eq!(status.status, "running");
        assert_eq!(status.cwd, Some(dir.path().join("api")));
        assert!(pm.logs("api", 20).await.unwrap().contains("Status: running"));

        pm.stop("api").await.unwrap();
        assert_eq!(pm.status("api").await.unwrap().status, "stopped");
        pm.delete("api").await.unwrap();
        assert!(pm.status("api").await.is_none());

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(is_probe));
    }
}
