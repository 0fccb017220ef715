use std::{path::PathBuf, process::Stdio, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use panel_process::{ExitInfo, ProcessId};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::watch,
};

use crate::error::ProcessError;
use crate::output::{OutputHub, OutputStream};

const READ_CHUNK_BYTES: usize = 8 * 1024;

// Helpers that inherited the pipes can keep them open after the main process
// is gone; give them this long before the output is closed anyway.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermSignal {
    Terminate,
    Kill,
}

impl TermSignal {
    #[cfg(unix)]
    fn as_raw(self) -> i32 {
        match self {
            TermSignal::Terminate => libc::SIGTERM,
            TermSignal::Kill => libc::SIGKILL,
        }
    }

    #[cfg(not(unix))]
    fn as_raw(self) -> i32 {
        match self {
            TermSignal::Terminate => 15,
            TermSignal::Kill => 9,
        }
    }
}

/// A live (or recently exited) child process.
///
/// Cheap to clone; every clone observes the same exit event and output hub.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    id: ProcessId,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    output: OutputHub,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Attach a new consumer. Earlier output is not replayed.
    pub fn subscribe(&self) -> OutputStream {
        self.output.subscribe()
    }

    /// Write a panel-authored line into the output, seen by attached sinks.
    pub(crate) fn notice(&self, message: &str) {
        self.output.notice(message);
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_info().is_none()
    }

    /// Resolves once, when the supervisor task has reaped the child.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or_default(),
            // Supervisor task is gone without reporting; treat as exited.
            Err(_) => ExitInfo::default(),
        }
    }

    /// Signal the child's whole process group. A no-op once the exit has
    /// been observed, so a recycled pid is never hit.
    pub fn terminate(&self, signal: TermSignal) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            // The child called setsid(), so its pgid equals its pid.
            let rc = unsafe { libc::kill(-(pid as i32), signal.as_raw()) };
            if rc == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ESRCH) {
                    return Ok(());
                }
                return Err(ProcessError::Signal {
                    pid,
                    signal: signal.as_raw(),
                    source: err,
                });
            }
        }

        #[cfg(not(unix))]
        tracing::warn!(pid, signal = signal.as_raw(), "signals are not supported on this platform");

        tracing::debug!(pid, signal = signal.as_raw(), process_id = %self.id, "signal sent");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the panel dies (crash/kill), the server should not outlive it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}

async fn pump<R>(reader: Option<R>, hub: &OutputHub)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => hub.publish(Bytes::copy_from_slice(&buf[..n])),
            Err(err) => {
                tracing::debug!(%err, "output read failed");
                break;
            }
        }
    }
}

/// Spawn `spec` with stdout and stderr merged into one output stream.
///
/// The returned stream is attached before any output is read, so it sees
/// everything the process writes. Must be called inside a tokio runtime.
pub fn spawn(spec: &SpawnSpec) -> Result<(ProcessHandle, OutputStream), ProcessError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // New session: stop/kill reaches helpers the server starts.
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let program = spec.program.display().to_string();
    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let id = ProcessId::new();
    let pid = child.id();
    let started_at = Utc::now();
    tracing::info!(process_id = %id, ?pid, %program, args = ?spec.args, "process spawned");

    let output = OutputHub::new();
    let first = output.subscribe();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let pump_hub = output.clone();
    let mut pumps = tokio::spawn(async move {
        tokio::join!(pump(stdout, &pump_hub), pump(stderr, &pump_hub));
        pump_hub.close();
    });

    let (exit_tx, exit_rx) = watch::channel(None);
    let wait_hub = output.clone();
    let wait_id = id.clone();
    tokio::spawn(async move {
        let info = match child.wait().await {
            Ok(status) => exit_info(status),
            Err(err) => {
                tracing::warn!(process_id = %wait_id, %err, "wait on child failed");
                ExitInfo::default()
            }
        };

        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut pumps)
            .await
            .is_err()
        {
            tracing::debug!(process_id = %wait_id, "output still open after exit; closing");
            pumps.abort();
            wait_hub.close();
        }

        tracing::info!(process_id = %wait_id, exit = %info, "process exited");
        let _ = exit_tx.send(Some(info));
    });

    Ok((
        ProcessHandle {
            id,
            pid,
            started_at,
            output,
            exit: exit_rx,
        },
        first,
    ))
}
