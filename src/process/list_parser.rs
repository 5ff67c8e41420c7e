//! Parser for pm2's `jlist` output.
//!
//! Grammar: zero or more banner lines (update notices, `[PM2] ...` daemon
//! messages), then a JSON array, then optional trailing noise. The array
//! starts on the first line whose leading `[` is followed by `{`, `]` or
//! nothing; it ends wherever the JSON value ends.

use std::path::PathBuf;

use serde::Deserialize;

use super::ProcessInfo;
use crate::error::{AppError, Result};

#[derive(Debug, Deserialize)]
struct RawProcess {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    pm_id: Option<u64>,
    #[serde(default)]
    monit: Option<RawMonit>,
    #[serde(default)]
    pm2_env: Option<RawEnv>,
}

#[derive(Debug, Deserialize)]
struct RawMonit {
    #[serde(default)]
    memory: Option<u64>,
    #[serde(default)]
    cpu: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RawEnv {
    #[serde(default)]
    status: Option<String>,
    /// Start timestamp in epoch milliseconds.
    #[serde(default)]
    pm_uptime: Option<i64>,
    #[serde(default)]
    restart_time: Option<u64>,
    #[serde(default)]
    pm_cwd: Option<PathBuf>,
}

/// Whether a line opens a JSON array rather than a `[PM2]`-style banner.
fn opens_array(line: &str) -> bool {
    let Some(rest) = line.trim_start().strip_prefix('[') else {
        return false;
    };
    match rest.trim_start().chars().next() {
        None => true,
        Some(c) => c == '{' || c == ']',
    }
}

/// Strip banner lines and return the text from the array's opening `[`.
pub(crate) fn array_start(raw: &str) -> Option<&str> {
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        if opens_array(line) {
            let body = &raw[offset..];
            return body.find('[').map(|start| &body[start..]);
        }
        offset += line.len();
    }
    None
}

pub fn parse_process_list(raw: &str) -> Result<Vec<ProcessInfo>> {
    let body = array_start(raw)
        .ok_or_else(|| AppError::manager_output("No JSON array in process list output"))?;
    // Stream so that anything printed after the array is never parsed.
    let entries = serde_json::Deserializer::from_str(body)
        .into_iter::<Vec<RawProcess>>()
        .next()
        .ok_or_else(|| AppError::manager_output("Empty process list output"))??;
    let now = chrono::Utc::now().timestamp_millis();
    Ok(entries.into_iter().map(|raw| into_info(raw, now)).collect())
}

fn into_info(raw: RawProcess, now_ms: i64) -> ProcessInfo {
    let env = raw.pm2_env;
    let status = env
        .as_ref()
        .and_then(|e| e.status.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let uptime_ms = if status == "online" {
        env.as_ref()
            .and_then(|e| e.pm_uptime)
            .map(|started| (now_ms - started).max(0))
    } else {
        None
    };
    ProcessInfo {
        name: raw.name.unwrap_or_default(),
        // pm2 reports pid 0 for stopped processes
        pid: raw.pid.filter(|pid| *pid > 0),
        pm_id: raw.pm_id,
        cpu: raw.monit.as_ref().and_then(|m| m.cpu),
        memory: raw.monit.as_ref().and_then(|m| m.memory),
        uptime_ms,
        restarts: env.as_ref().and_then(|e| e.restart_time),
        cwd: env.and_then(|e| e.pm_cwd),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = r#"[{"name":"api","pid":4242,"pm_id":0,"monit":{"memory":52428800,"cpu":1.5},"pm2_env":{"status":"online","pm_uptime":1700000000000,"restart_time":2,"pm_cwd":"/srv/api"}},{"name":"worker","pid":0,"pm_id":1,"monit":{"memory":0,"cpu":0},"pm2_env":{"status":"stopped","restart_time":0}}]"#;

    #[test]
    fn parses_clean_array() {
        let list = parse_process_list(LIST).unwrap();
        assert_eq!(list.len(), 2);
        let api = &list[0];
        assert_eq!(api.name, "api");
        assert_eq!(api.pid, Some(4242));
        assert_eq!(api.status, "online");
        assert_eq!(api.memory, Some(52428800));
        assert_eq!(api.restarts, Some(2));
        assert_eq!(api.cwd, Some(PathBuf::from("/srv/api")));
        assert!(api.uptime_ms.unwrap() > 0);

        let worker = &list[1];
        assert_eq!(worker.pid, None);
        assert_eq!(worker.status, "stopped");
        assert_eq!(worker.uptime_ms, None);
    }

    #[test]
    fn skips_banner_lines() {
        let raw = format!(
            ">>>> In-memory PM2 is out-of-date, do:\n>>>> $ pm2 update\n[PM2] Spawning PM2 daemon with pm2_home=/root/.pm2\n[PM2] PM2 Successfully daemonized\n{LIST}\n"
        );
        let list = parse_process_list(&raw).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].name, "worker");
    }

    #[test]
    fn empty_array_is_empty_list() {
        assert!(parse_process_list("[PM2] Reading list\n[]\n").unwrap().is_empty());
        assert!(parse_process_list("[ ]").unwrap().is_empty());
    }

    #[test]
    fn trailing_noise_after_array_is_ignored() {
        let raw = format!("{LIST}\n");
        assert_eq!(array_start(&raw), Some(raw.as_str()));
        assert_eq!(parse_process_list(&raw).unwrap().len(), 2);
    }

    #[test]
    fn trailing_banner_after_array_is_ignored() {
        let raw = format!(
            "[PM2] Spawning PM2 daemon\n{LIST}\n[PM2] Use `pm2 show <id|name>` for details [ok]\n"
        );
        let list = parse_process_list(&raw).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "api");
    }

    #[test]
    fn output_without_array_is_an_error() {
        let err = parse_process_list("[PM2][ERROR] Daemon not launched").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ManagerOutput);
        assert!(parse_process_list("").is_err());
    }

    #[test]
    fn truncated_json_is_an_error() {
        let err = parse_process_list("[{\"name\":\"api\",").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ManagerOutput);
    }
}
