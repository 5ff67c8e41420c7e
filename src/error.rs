//! Application error types.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Adapter error carrying a kind and a small key/value context payload.
#[derive(Debug)]
pub struct AppError {
    payload: BTreeMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Generic process error
    Process,
    /// Application is not tracked by the supervisor
    AppNotFound,
    /// Application is already running
    AlreadyRunning,
    /// No entry point could be detected for the application
    NoEntryPointFound,
    /// A runtime bridge (e.g. a TypeScript runner) is not installed
    RuntimeBridgeMissing,
    /// Child process failed to spawn or exited immediately
    SpawnFailed,
    /// External process manager returned a failure
    ManagerCommand,
    /// External process manager printed output we could not parse
    ManagerOutput,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::Config => 2001,
            Self::Io => 2002,
            Self::Process => 3001,
            Self::AppNotFound => 3002,
            Self::AlreadyRunning => 3003,
            Self::NoEntryPointFound => 3004,
            Self::RuntimeBridgeMissing => 3005,
            Self::SpawnFailed => 3006,
            Self::ManagerCommand => 4001,
            Self::ManagerOutput => 4002,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: BTreeMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    fn from_pairs<const N: usize>(kind: ErrorKind, pairs: [(&str, String); N]) -> Self {
        let payload = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self::new(kind, payload)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn app_not_found(name: &str) -> Self {
        Self::from_pairs(ErrorKind::AppNotFound, [("app", name.to_string())])
    }

    pub fn already_running(name: &str, pid: u32) -> Self {
        Self::from_pairs(
            ErrorKind::AlreadyRunning,
            [("app", name.to_string()), ("pid", pid.to_string())],
        )
    }

    pub fn no_entry_point(name: &str, path: &str, candidates: &[String], contents: &[String]) -> Self {
        let contents = if contents.is_empty() {
            "(empty)".to_string()
        } else {
            contents.join(" ")
        };
        Self::from_pairs(
            ErrorKind::NoEntryPointFound,
            [
                ("app", name.to_string()),
                ("path", path.to_string()),
                ("scanned", candidates.join(" ")),
                ("contents", contents),
            ],
        )
    }

    pub fn runtime_bridge_missing(name: &str, entry: &str, tool: &str, hint: &str) -> Self {
        Self::from_pairs(
            ErrorKind::RuntimeBridgeMissing,
            [
                ("app", name.to_string()),
                ("entry", entry.to_string()),
                ("tool", tool.to_string()),
                ("hint", hint.to_string()),
            ],
        )
    }

    pub fn spawn_failed(name: &str, command: &str, detail: impl Into<String>) -> Self {
        Self::from_pairs(
            ErrorKind::SpawnFailed,
            [
                ("app", name.to_string()),
                ("command", command.to_string()),
                ("detail", detail.into()),
            ],
        )
    }

    pub fn manager_command(command: &str, detail: impl Into<String>) -> Self {
        Self::from_pairs(
            ErrorKind::ManagerCommand,
            [("command", command.to_string()), ("detail", detail.into())],
        )
    }

    pub fn manager_output(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ManagerOutput, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    /// Attach an extra key to the payload (e.g. which app an I/O error belongs to).
    pub fn context(mut self, key: &str, value: impl Into<String>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::manager_output(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
