//! Registry of live agent processes and group cleanup on host shutdown.
//!
//! Every agent is spawned as a process-group leader and registered here with a
//! label. The [`Registration`] guard removes the entry when the owner has reaped
//! the child, so "still registered" doubles as the liveness signal during
//! [`ProcessRegistry::shutdown`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared pid -> label table. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<u32, String>>>,
}

/// Removes its pid from the registry on drop.
#[derive(Debug)]
pub struct Registration {
    registry: ProcessRegistry,
    pid: u32,
}

impl Registration {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.pid);
    }
}

/// Which pids needed which signal during shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sent SIGTERM.
    pub terminated: Vec<u32>,
    /// Still alive after the grace period and sent SIGKILL.
    pub killed: Vec<u32>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "dropping the registration unregisters the process"]
    pub fn register(&self, pid: u32, label: impl Into<String>) -> Registration {
        let label = label.into();
        debug!(pid, %label, "process registered");
        self.lock().insert(pid, label);
        Registration {
            registry: self.clone(),
            pid,
        }
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.lock().contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered processes, sorted by pid.
    pub fn entries(&self) -> Vec<(u32, String)> {
        let mut entries: Vec<_> = self
            .lock()
            .iter()
            .map(|(pid, label)| (*pid, label.clone()))
            .collect();
        entries.sort_unstable_by_key(|(pid, _)| *pid);
        entries
    }

    /// SIGTERM every registered group, wait up to `grace`, SIGKILL survivors.
    ///
    /// Signal delivery failures are logged and otherwise ignored.
    #[instrument(skip(self), fields(grace_ms = grace.as_millis() as u64))]
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let targets = self.entries();
        if targets.is_empty() {
            return report;
        }
        info!(count = targets.len(), "terminating registered processes");
        for (pid, label) in &targets {
            debug!(pid, %label, "sending SIGTERM");
            signal_group(*pid, Signal::SIGTERM);
            report.terminated.push(*pid);
        }

        let deadline = Instant::now() + grace;
        loop {
            let alive: Vec<u32> = report
                .terminated
                .iter()
                .copied()
                .filter(|pid| self.is_alive(*pid))
                .collect();
            if alive.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                for pid in alive {
                    warn!(pid, "process survived grace period, sending SIGKILL");
                    signal_group(pid, Signal::SIGKILL);
                    report.killed.push(pid);
                }
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
        report
    }

    fn is_alive(&self, pid: u32) -> bool {
        if !self.contains(pid) {
            return false;
        }
        !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
    }

    fn unregister(&self, pid: u32) {
        if self.lock().remove(&pid).is_some() {
            debug!(pid, "process unregistered");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// SIGKILL the process group led by `pid`. Best-effort.
pub fn kill_process_group(pid: u32) {
    signal_group(pid, Signal::SIGKILL);
}

fn signal_group(pid: u32, signal: Signal) {
    let target = Pid::from_raw(pid as i32);
    match killpg(target, signal) {
        Ok(()) => {}
        Err(Errno::ESRCH) => debug!(pid, ?signal, "process group already gone"),
        Err(err) => {
            warn!(pid, ?signal, %err, "killpg failed, signalling pid");
            if let Err(err) = kill(target, signal) {
                warn!(pid, ?signal, %err, "signal delivery failed");
            }
        }
    }
}

/// Spawn a task that waits for SIGINT or SIGTERM, calls `on_signal`, then
/// shuts down every registered process.
pub fn install_shutdown_handler<F>(
    registry: ProcessRegistry,
    grace: Duration,
    on_signal: F,
) -> Result<JoinHandle<ShutdownReport>>
where
    F: FnOnce() + Send + 'static,
{
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received, shutting down"),
            _ = sigterm.recv() => warn!("SIGTERM received, shutting down"),
        }
        on_signal();
        let report = registry.shutdown(grace).await;
        info!(
            terminated = report.terminated.len(),
            killed = report.killed.len(),
            "shutdown complete"
        );
        report
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::process::Command;

    fn spawn_group(script: &str) -> tokio::process::Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .expect("spawn")
    }

    /// Register `child` and unregister once it has been reaped.
    fn supervise(registry: &ProcessRegistry, mut child: tokio::process::Child) -> (u32, JoinHandle<()>) {
        let pid = child.id().expect("pid");
        let registration = registry.register(pid, "test");
        let handle = tokio::spawn(async move {
            let _ = child.wait().await;
            drop(registration);
        });
        (pid, handle)
    }

    #[test]
    fn registration_guard_unregisters_on_drop() {
        let registry = ProcessRegistry::new();
        let guard = registry.register(4242, "agent");
        assert!(registry.contains(4242));
        assert_eq!(registry.entries(), vec![(4242, "agent".to_string())]);
        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_with_nothing_registered_is_noop() {
        let report = ProcessRegistry::new().shutdown(Duration::from_millis(10)).await;
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test]
    async fn cooperative_process_is_terminated_not_killed() {
        let registry = ProcessRegistry::new();
        let (pid, handle) = supervise(&registry, spawn_group("sleep 30"));

        let report = registry.shutdown(Duration::from_secs(5)).await;

        assert_eq!(report.terminated, vec![pid]);
        assert!(report.killed.is_empty());
        handle.await.expect("join");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn process_ignoring_sigterm_is_killed_after_grace() {
        let registry = ProcessRegistry::new();
        let (pid, handle) = supervise(&registry, spawn_group("trap '' TERM; sleep 30"));
        // Give the shell time to install its trap.
        sleep(Duration::from_millis(200)).await;

        let report = registry.shutdown(Duration::from_millis(300)).await;

        assert_eq!(report.terminated, vec![pid]);
        assert_eq!(report.killed, vec![pid]);
        handle.await.expect("join");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn sigterm_runs_callback_then_reaps_children() {
        let registry = ProcessRegistry::new();
        let (pid, child) = supervise(&registry, spawn_group("sleep 30"));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handler = install_shutdown_handler(registry.clone(), Duration::from_secs(2), move || {
            let _ = tx.send(());
        })
        .expect("install handler");

        nix::sys::signal::raise(Signal::SIGTERM).expect("raise SIGTERM");

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("callback ran in time")
            .expect("callback sender");
        let report = handler.await.expect("join handler");
        assert_eq!(report.terminated, vec![pid]);
        assert!(report.killed.is_empty());
        child.await.expect("join child");
        assert!(registry.is_empty());
    }
}
