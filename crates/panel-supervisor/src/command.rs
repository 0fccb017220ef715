use std::{path::PathBuf, time::Duration};

use crate::error::ProcessError;
use crate::output::OutputStream;
use crate::runner::{self, SpawnSpec, TermSignal};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// A short-lived command whose output is streamed to a single caller, such
/// as `factorio --version`. Never touches the managed server slot.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    spec: SpawnSpec,
    timeout: Duration,
}

impl CommandInvocation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            spec: SpawnSpec::new(program, args),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// The command is killed if it is still running after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Start the command. The returned stream ends when the command's
    /// output closes.
    pub fn run(self) -> Result<OutputStream, ProcessError> {
        let (handle, output) = runner::spawn(&self.spec)?;
        let timeout = self.timeout;
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, handle.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(
                process_id = %handle.id(),
                timeout_ms = timeout.as_millis() as u64,
                "command timed out; killing"
            );
            if let Err(err) = handle.terminate(TermSignal::Kill) {
                tracing::warn!(%err, "failed to kill timed out command");
            }
        });
        Ok(output)
    }
}
