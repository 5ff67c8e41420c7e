//! Test doubles for the command seam.

use std::sync::Mutex;

use async_trait::async_trait;

use super::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::Result;

type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;

/// Records every command and answers through a closure.
pub(crate) struct MockRunner {
    calls: Mutex<Vec<CommandSpec>>,
    responder: Responder,
}

impl MockRunner {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&CommandSpec) -> bool,
    {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).count()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        (self.responder)(spec)
    }
}

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        success: true,
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        success: false,
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}
