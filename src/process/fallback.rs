//! In-process supervision used when pm2 is unavailable.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::{Child, Command};

use super::control::{is_process_alive, terminate};
use super::entry::{LaunchPlan, LaunchPlanner};
use super::{
    AppRecord, FallbackProcessEntry, FallbackStatus, ProcessInfo, Supervisor, SupervisorMode,
};
use crate::error::{AppError, Result};

/// How long `restart` waits for the previous child to go away.
const RESTART_EXIT_WAIT: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const LOGS_UNAVAILABLE_NOTE: &str =
    "Detailed logs are unavailable in fallback mode. Install pm2 (npm install -g pm2) to capture application output.";

type ProcessMap = Arc<RwLock<HashMap<String, FallbackProcessEntry>>>;

pub struct FallbackSupervisor {
    processes: ProcessMap,
    spawn_grace: Duration,
    system: Mutex<System>,
}

impl FallbackSupervisor {
    pub fn new(spawn_grace: Duration) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            spawn_grace,
            system: Mutex::new(System::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, FallbackProcessEntry>> {
        self.processes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, FallbackProcessEntry>> {
        self.processes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracked entry for `name`, if any.
    pub fn entry(&self, name: &str) -> Option<FallbackProcessEntry> {
        self.read().get(name).cloned()
    }

    fn running_pid(&self, name: &str) -> Option<u32> {
        self.read()
            .get(name)
            .filter(|e| e.status == FallbackStatus::Running && is_process_alive(e.pid))
            .map(|e| e.pid)
    }

    fn build_command(app: &AppRecord, workdir: &Path, plan: &LaunchPlan) -> Command {
        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(port) = app.port {
            cmd.env("PORT", port.to_string());
        }

        // Own process group so the whole tree can be signalled together.
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS);
        }

        cmd
    }

    /// Await the child in the background and record how it ended.
    fn spawn_reaper(&self, name: String, pid: u32, mut child: Child) {
        let processes = Arc::clone(&self.processes);
        tokio::spawn(async move {
            let status = child.wait().await;
            {
                let mut processes = processes.write().unwrap_or_else(PoisonError::into_inner);
                let Some(entry) = processes.get_mut(&name) else {
                    return;
                };
                // A newer child or an explicit stop owns the entry now.
                if entry.pid != pid || entry.status != FallbackStatus::Running {
                    return;
                }
                entry.status = match &status {
                    Ok(s) if s.success() => FallbackStatus::Stopped,
                    _ => FallbackStatus::Error,
                };
            }
            match status {
                Ok(s) => log::warn!("[{}] Process {} exited ({})", name, pid, s),
                Err(e) => log::warn!("[{}] Lost track of process {}: {}", name, pid, e),
            }
        });
    }

    fn signal_stop(name: &str, entry: &mut FallbackProcessEntry) -> Result<()> {
        if entry.status == FallbackStatus::Running && is_process_alive(entry.pid) {
            terminate(entry.pid).map_err(|e| e.context("app", name))?;
            log::info!("[{}] Sent SIGTERM to PID {}", name, entry.pid);
        }
        entry.status = FallbackStatus::Stopped;
        Ok(())
    }

    async fn wait_for_exit(pid: u32, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while is_process_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    fn usage(&self, pids: &[u32]) -> HashMap<u32, (f32, u64)> {
        if pids.is_empty() {
            return HashMap::new();
        }
        let targets: Vec<Pid> = pids.iter().copied().map(Pid::from_u32).collect();
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&targets),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        pids.iter()
            .filter_map(|pid| {
                system
                    .process(Pid::from_u32(*pid))
                    .map(|p| (*pid, (p.cpu_usage(), p.memory())))
            })
            .collect()
    }
}

fn to_info(entry: &FallbackProcessEntry, usage: Option<&(f32, u64)>) -> ProcessInfo {
    let running = entry.status == FallbackStatus::Running;
    ProcessInfo {
        name: entry.name.clone(),
        pid: running.then_some(entry.pid),
        status: entry.status.as_str().to_string(),
        pm_id: None,
        cpu: usage.map(|u| u.0),
        memory: usage.map(|u| u.1),
        uptime_ms: running.then(|| (Utc::now() - entry.start_time).num_milliseconds().max(0)),
        restarts: None,
        cwd: Some(entry.path.clone()),
    }
}

#[async_trait]
impl Supervisor for FallbackSupervisor {
    fn mode(&self) -> SupervisorMode {
        SupervisorMode::Fallback
    }

    async fn start(&self, app: &AppRecord, workdir: &Path, plan: &LaunchPlan) -> Result<()> {
        if !workdir.is_dir() {
            return Err(AppError::io("Working directory does not exist")
                .context("app", app.name.as_str())
                .context("path", workdir.display().to_string()));
        }
        if let Some(pid) = self.running_pid(&app.name) {
            return Err(AppError::already_running(&app.name, pid));
        }

        let command_line = plan.command_line();
        log::info!("[{}] Spawning without a process manager: {}", app.name, command_line);

        let spawn_failed = |detail: String| {
            AppError::spawn_failed(&app.name, &command_line, detail)
                .context("path", workdir.display().to_string())
        };

        let mut child = Self::build_command(app, workdir, plan)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_failed("Process exited before its PID was read".to_string()))?;

        match tokio::time::timeout(self.spawn_grace, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(spawn_failed(format!("Exited during startup ({status})")));
            }
            Ok(Err(e)) => return Err(spawn_failed(e.to_string())),
            Err(_) => {}
        }

        self.write().insert(
            app.name.clone(),
            FallbackProcessEntry {
                pid,
                name: app.name.clone(),
                start_time: Utc::now(),
                status: FallbackStatus::Running,
                command: command_line,
                path: workdir.to_path_buf(),
            },
        );
        self.spawn_reaper(app.name.clone(), pid, child);
        log::info!("[{}] Running with PID {}", app.name, pid);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut processes = self.write();
        let entry = processes
            .get_mut(name)
            .ok_or_else(|| AppError::app_not_found(name))?;
        Self::signal_stop(name, entry)
    }

    /// The plan is resolved first, so a broken app directory leaves the
    /// running child alone.
    async fn restart(
        &self,
        app: &AppRecord,
        workdir: &Path,
        planner: &LaunchPlanner<'_>,
    ) -> Result<()> {
        let plan = planner.plan(app, workdir).await?;
        if let Some(pid) = self.running_pid(&app.name) {
            self.stop(&app.name).await?;
            Self::wait_for_exit(pid, RESTART_EXIT_WAIT).await;
        }
        self.start(app, workdir, &plan).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut processes = self.write();
        let entry = processes
            .get_mut(name)
            .ok_or_else(|| AppError::app_not_found(name))?;
        Self::signal_stop(name, entry)?;
        processes.remove(name);
        drop(processes);
        log::info!("[{}] Removed from fallback tracking", name);
        Ok(())
    }

    async fn list(&self) -> Vec<ProcessInfo> {
        let mut entries: Vec<FallbackProcessEntry> = self.read().values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let live: Vec<u32> = entries
            .iter()
            .filter(|e| e.status == FallbackStatus::Running)
            .map(|e| e.pid)
            .collect();
        let usage = self.usage(&live);

        entries
            .iter()
            .map(|e| to_info(e, usage.get(&e.pid).filter(|_| e.status == FallbackStatus::Running)))
            .collect()
    }

    async fn logs(&self, name: &str, _lines: usize) -> Result<String> {
        let entry = self.entry(name).ok_or_else(|| AppError::app_not_found(name))?;
        Ok(format!(
            "Process: {}\nPID: {}\nStatus: {}\nStarted: {}\nCommand: {}\nPath: {}\n\n{}\n",
            entry.name,
            entry.pid,
            entry.status.as_str(),
            entry.start_time.to_rfc3339(),
            entry.command,
            entry.path.display(),
            LOGS_UNAVAILABLE_NOTE,
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::process::entry::LaunchSource;
    use crate::process::testing::{ok, MockRunner};

    fn sh(script: &str) -> LaunchPlan {
        LaunchPlan {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            entry: None,
            source: LaunchSource::Command,
        }
    }

    fn supervisor() -> FallbackSupervisor {
        FallbackSupervisor::new(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn start_stop_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pm = supervisor();
        let app = AppRecord::new("sleeper", dir.path());

        pm.start(&app, dir.path(), &sh("sleep 30")).await.unwrap();
        let entry = pm.entry("sleeper").unwrap();
        assert_eq!(entry.status, FallbackStatus::Running);
        assert!(is_process_alive(entry.pid));
        assert_eq!(entry.command, "sh -c 'sleep 30'");

        let list = pm.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, "running");
        assert_eq!(list[0].pid, Some(entry.pid));

        let err = pm.start(&app, dir.path(), &sh("sleep 30")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

        pm.stop("sleeper").await.unwrap();
        assert_eq!(pm.entry("sleeper").unwrap().status, FallbackStatus::Stopped);
        FallbackSupervisor::wait_for_exit(entry.pid, Duration::from_secs(5)).await;
        assert!(!is_process_alive(entry.pid));
        // the reaper must not overwrite an explicit stop
        assert_eq!(pm.list().await[0].status, "stopped");

        pm.delete("sleeper").await.unwrap();
        assert!(pm.list().await.is_empty());
    }

    #[tokio::test]
    async fn immediate_exit_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pm = supervisor();
        let err = pm
            .start(&AppRecord::new("crasher", dir.path()), dir.path(), &sh("exit 3"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);
        assert!(err.get("detail").unwrap().contains('3'));
        assert!(pm.entry("crasher").is_none());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let plan = LaunchPlan {
            program: "definitely-not-a-real-binary-4821".into(),
            args: Vec::new(),
            entry: None,
            source: LaunchSource::Command,
        };
        let err = supervisor()
            .start(&AppRecord::new("ghost", dir.path()), dir.path(), &plan)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);
    }

    #[tokio::test]
    async fn missing_workdir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = supervisor()
            .start(&AppRecord::new("api", &missing), &missing, &sh("sleep 30"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn crash_after_grace_is_recorded_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let pm = FallbackSupervisor::new(Duration::from_millis(100));
        pm.start(&AppRecord::new("flaky", dir.path()), dir.path(), &sh("sleep 0.4; exit 1"))
            .await
            .unwrap();
        let pid = pm.entry("flaky").unwrap().pid;
        FallbackSupervisor::wait_for_exit(pid, Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pm.entry("flaky").unwrap().status, FallbackStatus::Error);
    }

    #[tokio::test]
    async fn restart_replaces_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MockRunner::new(|_| Ok(ok("")));
        let pm = supervisor();
        let app = AppRecord::new("sleeper", dir.path()).with_command("sleep 30");
        pm.start(&app, dir.path(), &sh("sleep 30")).await.unwrap();
        let first = pm.entry("sleeper").unwrap().pid;

        pm.restart(&app, dir.path(), &LaunchPlanner::new(&runner))
            .await
            .unwrap();
        let second = pm.entry("sleeper").unwrap();
        assert_ne!(first, second.pid);
        assert_eq!(second.status, FallbackStatus::Running);
        assert!(!is_process_alive(first));

        pm.delete("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn unplannable_restart_keeps_the_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MockRunner::new(|_| Ok(ok("")));
        let pm = supervisor();
        pm.start(&AppRecord::new("sleeper", dir.path()), dir.path(), &sh("sleep 30"))
            .await
            .unwrap();
        let pid = pm.entry("sleeper").unwrap().pid;

        // no command and nothing to detect in the empty directory
        let err = pm
            .restart(
                &AppRecord::new("sleeper", dir.path()),
                dir.path(),
                &LaunchPlanner::new(&runner),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoEntryPointFound);
        let entry = pm.entry("sleeper").unwrap();
        assert_eq!(entry.pid, pid);
        assert_eq!(entry.status, FallbackStatus::Running);
        assert!(is_process_alive(pid));

        pm.delete("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_app_is_not_found() {
        let pm = supervisor();
        assert_eq!(pm.stop("nope").await.unwrap_err().kind(), ErrorKind::AppNotFound);
        assert_eq!(pm.delete("nope").await.unwrap_err().kind(), ErrorKind::AppNotFound);
        assert_eq!(pm.logs("nope", 10).await.unwrap_err().kind(), ErrorKind::AppNotFound);
    }

    #[tokio::test]
    async fn logs_are_a_summary() {
        let dir = tempfile::tempdir().unwrap();
        let pm = supervisor();
        pm.start(&AppRecord::new("sleeper", dir.path()), dir.path(), &sh("sleep 30"))
            .await
            .unwrap();
        let pid = pm.entry("sleeper").unwrap().pid;
        let logs = pm.logs("sleeper", 10).await.unwrap();
        assert!(logs.contains(&format!("PID: {pid}")));
        assert!(logs.contains("Status: running"));
        assert!(logs.contains("npm install -g pm2"));
        pm.delete("sleeper").await.unwrap();
    }
}
