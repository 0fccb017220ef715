use std::{sync::Arc, time::Duration};

use panel_process::{ServerState, ServerStatus};
use tokio::sync::Mutex;

use crate::error::ProcessError;
use crate::output::OutputStream;
use crate::runner::{self, ProcessHandle, SpawnSpec, TermSignal};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopPolicy {
    /// How long a stopping server gets after SIGTERM before SIGKILL.
    /// `None` never escalates.
    pub grace: Option<Duration>,
    /// Upper bound on how long a stop request forwards output.
    pub forward_max: Option<Duration>,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            grace: Some(Duration::from_secs(30)),
            forward_max: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug)]
struct ManagedProcess {
    handle: ProcessHandle,
    port: u16,
    stopping: bool,
}

impl ManagedProcess {
    fn status(&self) -> ServerStatus {
        ServerStatus {
            id: self.handle.id().clone(),
            pid: self.handle.pid(),
            started_at: self.handle.started_at(),
            port: self.port,
            state: if self.stopping {
                ServerState::Stopping
            } else {
                ServerState::Running
            },
        }
    }
}

pub enum StartOutcome {
    Started {
        status: ServerStatus,
        output: OutputStream,
    },
    AlreadyRunning(ServerStatus),
}

pub enum StopOutcome {
    Stopping {
        status: ServerStatus,
        output: OutputStream,
    },
    NotRunning,
}

/// The single managed server.
///
/// Start, stop and exit handling all go through one mutex, so a slot holds at
/// most one process and concurrent starts cannot both install one.
#[derive(Clone, Debug, Default)]
pub struct ManagedServerSlot {
    inner: Arc<Mutex<Option<ManagedProcess>>>,
    policy: StopPolicy,
}

impl ManagedServerSlot {
    pub fn new(policy: StopPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            policy,
        }
    }

    pub async fn status(&self) -> Option<ServerStatus> {
        self.inner.lock().await.as_ref().map(ManagedProcess::status)
    }

    pub async fn start(&self, spec: &SpawnSpec, port: u16) -> Result<StartOutcome, ProcessError> {
        let mut slot = self.inner.lock().await;
        if let Some(current) = slot.as_ref() {
            tracing::info!(process_id = %current.handle.id(), "start rejected: server already running");
            return Ok(StartOutcome::AlreadyRunning(current.status()));
        }

        // Spawn while holding the lock; on failure the slot stays empty.
        let (handle, output) = runner::spawn(spec)?;
        let process = ManagedProcess {
            handle: handle.clone(),
            port,
            stopping: false,
        };
        let status = process.status();
        *slot = Some(process);
        drop(slot);

        tracing::info!(process_id = %status.id, pid = ?status.pid, port, "managed server started");
        self.watch_exit(handle);

        Ok(StartOutcome::Started { status, output })
    }

    pub async fn stop(&self) -> Result<StopOutcome, ProcessError> {
        let mut slot = self.inner.lock().await;
        let Some(process) = slot.as_mut() else {
            tracing::info!("stop rejected: server not running");
            return Ok(StopOutcome::NotRunning);
        };

        // Attach before signalling so the caller sees the shutdown output.
        let mut output = process.handle.subscribe();
        if let Some(max) = self.policy.forward_max {
            output = output.with_deadline(max);
        }

        process.handle.terminate(TermSignal::Terminate)?;
        tracing::info!(process_id = %process.handle.id(), "stop: sent SIGTERM");

        if !process.stopping {
            process.stopping = true;
            if let Some(grace) = self.policy.grace {
                escalate_after(process.handle.clone(), grace);
            }
        }

        Ok(StopOutcome::Stopping {
            status: process.status(),
            output,
        })
    }

    /// Stop the server (if any) and wait for it to exit, used when the panel
    /// itself shuts down.
    pub async fn shutdown(&self, wait: Duration) {
        let handle = {
            let mut slot = self.inner.lock().await;
            let Some(process) = slot.as_mut() else {
                return;
            };
            process.stopping = true;
            process.handle.clone()
        };

        if let Err(err) = handle.terminate(TermSignal::Terminate) {
            tracing::warn!(%err, "shutdown: SIGTERM failed");
        }
        if tokio::time::timeout(wait, handle.wait()).await.is_err() {
            tracing::warn!(process_id = %handle.id(), "shutdown: server still running; sending SIGKILL");
            handle.notice("shutdown: server still running; sending SIGKILL");
            if let Err(err) = handle.terminate(TermSignal::Kill) {
                tracing::warn!(%err, "shutdown: SIGKILL failed");
            }
        }
    }

    fn watch_exit(&self, handle: ProcessHandle) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let info = handle.wait().await;
            let mut slot = inner.lock().await;
            if slot.as_ref().is_some_and(|p| p.handle.id() == handle.id()) {
                *slot = None;
                tracing::info!(process_id = %handle.id(), exit = %info, "managed server exited; slot cleared");
            }
        });
    }
}

fn escalate_after(handle: ProcessHandle, grace: Duration) {
    tokio::spawn(async move {
        if tokio::time::timeout(grace, handle.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(
            process_id = %handle.id(),
            grace_ms = grace.as_millis() as u64,
            "server ignored SIGTERM; sending SIGKILL"
        );
        // Published before the kill: the output closes once the group is gone.
        handle.notice(&format!(
            "stop: no exit {}s after SIGTERM; sending SIGKILL",
            grace.as_secs_f32()
        ));
        if let Err(err) = handle.terminate(TermSignal::Kill) {
            tracing::warn!(%err, "stop: SIGKILL failed");
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::output::collect_string;
    use futures_util::StreamExt;

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    // Prints `ready` only once the TERM trap is installed.
    const IGNORES_TERM: &str = "trap '' TERM; echo ready; while true; do sleep 0.1; done";

    async fn wait_for_line(mut output: OutputStream, line: &str) {
        let mut seen = String::new();
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(chunk) = output.next().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.lines().any(|l| l == line) {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(found, Ok(true)), "never saw {line:?}");
    }

    async fn wait_until_empty(slot: &ManagedServerSlot, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if slot.status().await.is_none() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_install_exactly_one_process() {
        let slot = ManagedServerSlot::new(StopPolicy::default());
        let spec = sh("sleep 30");

        let attempts = (0..8).map(|_| {
            let slot = slot.clone();
            let spec = spec.clone();
            tokio::spawn(async move { slot.start(&spec, 34197).await })
        });
        let results = futures_util::future::join_all(attempts).await;

        let mut started = 0;
        let mut rejected = 0;
        for r in results {
            match r.unwrap().unwrap() {
                StartOutcome::Started { .. } => started += 1,
                StartOutcome::AlreadyRunning(_) => rejected += 1,
            }
        }
        assert_eq!(started, 1);
        assert_eq!(rejected, 7);

        assert!(matches!(slot.stop().await.unwrap(), StopOutcome::Stopping { .. }));
        assert!(wait_until_empty(&slot, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn stop_on_empty_slot_is_informational() {
        let slot = ManagedServerSlot::default();
        assert!(matches!(slot.stop().await.unwrap(), StopOutcome::NotRunning));
        assert!(slot.status().await.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_slot_empty() {
        let slot = ManagedServerSlot::default();
        let spec = SpawnSpec::new("/nonexistent/factorio", vec![]);
        assert!(slot.start(&spec, 34197).await.is_err());
        assert!(slot.status().await.is_none());
    }

    #[tokio::test]
    async fn crash_exit_clears_slot() {
        let slot = ManagedServerSlot::default();
        let outcome = slot.start(&sh("sleep 0.2; exit 7"), 34197).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert!(wait_until_empty(&slot, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn stop_forwards_shutdown_output_then_clears() {
        let slot = ManagedServerSlot::default();
        let script = "trap 'echo saving; exit 0' TERM; echo up; while true; do sleep 0.1; done";
        let StartOutcome::Started { status, output } = slot.start(&sh(script), 12345).await.unwrap()
        else {
            panic!("expected start");
        };
        assert_eq!(status.port, 12345);
        assert_eq!(status.state, ServerState::Running);
        wait_for_line(output, "up").await;

        let StopOutcome::Stopping { status, output } = slot.stop().await.unwrap() else {
            panic!("expected stopping");
        };
        assert_eq!(status.state, ServerState::Stopping);

        let text = collect_string(output).await;
        assert!(text.contains("saving"), "stop output was {text:?}");
        assert!(wait_until_empty(&slot, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_sigkill() {
        let slot = ManagedServerSlot::new(StopPolicy {
            grace: Some(Duration::from_millis(300)),
            forward_max: Some(Duration::from_secs(5)),
        });
        let StartOutcome::Started { output, .. } = slot.start(&sh(IGNORES_TERM), 34197).await.unwrap()
        else {
            panic!("expected start");
        };
        wait_for_line(output, "ready").await;

        let StopOutcome::Stopping { output, .. } = slot.stop().await.unwrap() else {
            panic!("expected stopping");
        };
        assert!(slot.status().await.is_some());

        let text = collect_string(output).await;
        assert!(text.contains("[factorio-panel] stop:"), "stop output was {text:?}");
        assert!(text.contains("sending SIGKILL"), "stop output was {text:?}");
        assert!(wait_until_empty(&slot, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn second_stop_while_stopping_reattaches() {
        let slot = ManagedServerSlot::new(StopPolicy {
            grace: None,
            forward_max: Some(Duration::from_millis(300)),
        });
        let StartOutcome::Started { output, .. } = slot.start(&sh(IGNORES_TERM), 34197).await.unwrap()
        else {
            panic!("expected start");
        };
        wait_for_line(output, "ready").await;

        assert!(matches!(slot.stop().await.unwrap(), StopOutcome::Stopping { .. }));
        // No escalation configured: the process lingers and stays in the slot.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let StopOutcome::Stopping { status, output } = slot.stop().await.unwrap() else {
            panic!("expected stopping");
        };
        assert_eq!(status.state, ServerState::Stopping);
        assert_eq!(collect_string(output).await, "");

        slot.shutdown(Duration::from_millis(100)).await;
        assert!(wait_until_empty(&slot, Duration::from_secs(10)).await);
    }
}
