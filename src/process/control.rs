//! Signal-level process control.

use crate::error::{AppError, Result};

/// Check if a process is alive by PID.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Check if a process is alive by PID.
#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    let mut sys = sysinfo::System::new();
    let pid = sysinfo::Pid::from_u32(pid);
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

/// Send SIGTERM to the process group led by `pid`, or to the process alone
/// if its group cannot be determined.
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => killpg(pgid, Signal::SIGTERM).map_err(|e| {
            AppError::process(format!(
                "Failed to send SIGTERM to process group {}: {}",
                pgid.as_raw(),
                e
            ))
        }),
        _ => kill(target, Signal::SIGTERM).map_err(|e| {
            AppError::process(format!("Failed to send SIGTERM to PID {}: {}", pid, e))
        }),
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<()> {
    let mut sys = sysinfo::System::new();
    let target = sysinfo::Pid::from_u32(pid);
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[target]), true);
    match sys.process(target) {
        Some(process) if process.kill() => Ok(()),
        Some(_) => Err(AppError::process(format!("Failed to terminate PID {pid}"))),
        None => Ok(()),
    }
}
