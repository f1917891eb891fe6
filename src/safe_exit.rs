//! Two-layer safe-exit mechanism (§5).
//!
//! *Process layer*: [`SubprocessRegistry`] tracks live child process groups
//! so a signal handler can translate SIGINT/SIGTERM/SIGHUP into graceful
//! termination followed by a kill after a grace window.
//!
//! *Strategy layer*: [`CleanupStack`] is an ordered stack of
//! [`CleanupHandler`]s run in reverse-registration order on interrupt,
//! matching the `cleanup_on_exit` stack described in §9 Design Notes so
//! that a linear-reading state machine can still be unwound from outside
//! its happy path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::constants::TASK_KILL_GRACE;

/// A cleanup handler run, in reverse-registration order, when the process
/// is signalled to stop. An error from one handler must not prevent the
/// next handler from running.
#[async_trait]
pub trait CleanupHandler: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Perform cleanup. Errors are logged but never propagated past the
    /// stack runner.
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// Bound on how long this handler is allowed to run before it is
    /// abandoned (not killed — async tasks are cooperatively cancelled at
    /// the await points of whatever they're doing).
    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Ordered stack of cleanup handlers, run back-to-front on interrupt.
#[derive(Default, Clone)]
pub struct CleanupStack {
    handlers: Arc<Mutex<Vec<Arc<dyn CleanupHandler>>>>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn CleanupHandler>) {
        debug!(handler = handler.name(), "registering cleanup handler");
        self.handlers.lock().unwrap().push(handler);
    }

    /// Remove the most recently registered handler with this name, if
    /// present. Used by the orchestrator to deregister `DataSafetyHandler`
    /// on successful completion (§4.2: "deregistered on DONE").
    pub fn deregister(&self, name: &str) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(pos) = handlers.iter().rposition(|h| h.name() == name) {
            handlers.remove(pos);
        }
    }

    /// Run every registered handler in reverse-registration order.
    pub async fn run_all(&self) {
        let handlers: Vec<_> = self.handlers.lock().unwrap().iter().rev().cloned().collect();
        for handler in handlers {
            let name = handler.name().to_string();
            info!(handler = %name, "running cleanup handler");
            let result = tokio::time::timeout(handler.timeout(), handler.cleanup()).await;
            match result {
                Ok(Ok(())) => debug!(handler = %name, "cleanup handler completed"),
                Ok(Err(e)) => error!(handler = %name, error = %e, "cleanup handler failed"),
                Err(_) => warn!(handler = %name, "cleanup handler timed out"),
            }
        }
    }
}

/// Tracks live subprocess groups so the signal handler can terminate them
/// gracefully before kill. Keyed by an opaque task id chosen by the
/// caller (e.g. the volume or database name a task is working on).
#[derive(Default, Clone)]
pub struct SubprocessRegistry {
    groups: Arc<Mutex<HashMap<String, u32>>>,
}

impl SubprocessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, task_id: impl Into<String>, pgid: u32) {
        self.groups.lock().unwrap().insert(task_id.into(), pgid);
    }

    pub fn untrack(&self, task_id: &str) {
        self.groups.lock().unwrap().remove(task_id);
    }

    /// Look up the tracked process group for a task id, used by the
    /// worker pool to escalate signals on a per-task timeout.
    pub fn pgid_of(&self, task_id: &str) -> Option<u32> {
        self.groups.lock().unwrap().get(task_id).copied()
    }

    /// Send SIGTERM to every tracked group, wait `grace`, then SIGKILL any
    /// still alive. Mirrors the per-task timeout escalation in §5 but
    /// applied process-wide on signal delivery.
    pub async fn terminate_all(&self, grace: Duration) {
        let pgids: Vec<u32> = self.groups.lock().unwrap().values().copied().collect();
        for pgid in &pgids {
            send_signal_to_group(*pgid, libc::SIGTERM);
        }
        tokio::time::sleep(grace).await;
        for pgid in &pgids {
            send_signal_to_group(*pgid, libc::SIGKILL);
        }
    }
}

/// Send `sig` to the process group `pgid` via `kill(-pgid, sig)`. Errors
/// (e.g. the group already exited) are intentionally ignored: this is
/// best-effort cleanup, not a correctness-critical path.
fn send_signal_to_group(pgid: u32, sig: i32) {
    unsafe {
        let _ = libc::kill(-(pgid as i32), sig);
    }
}

/// Public re-export of the signal-delivery primitive for callers outside
/// this module (the worker pool's per-task timeout escalation) that need
/// the exact same `kill(-pgid, sig)` semantics.
pub fn send_signal_to_group_pub(pgid: u32, sig: i32) {
    send_signal_to_group(pgid, sig)
}

/// Installs SIGINT/SIGTERM/SIGHUP handlers and exposes a
/// [`watch::Receiver<bool>`] that flips to `true` the moment any stop
/// signal arrives, so the orchestrator's state machine can poll it at
/// phase boundaries (cooperative cancellation, per §5).
pub struct SignalListener {
    pub stop_rx: watch::Receiver<bool>,
}

impl SignalListener {
    pub fn install(registry: SubprocessRegistry, cleanup: CleanupStack) -> Self {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .expect("failed to install SIGHUP handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sighup.recv() => {
                    info!("received SIGHUP (reload is not implemented; treating as stop)");
                }
            }

            let _ = tx.send(true);
            registry.terminate_all(TASK_KILL_GRACE).await;
            cleanup.run_all().await;
        });
        SignalListener { stop_rx: rx }
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        name: String,
        counter: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CleanupHandler for CountingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn cleanup(&self) -> anyhow::Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn handlers_run_in_reverse_registration_order() {
        let stack = CleanupStack::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        stack.register(Arc::new(CountingHandler {
            name: "first".into(),
            counter: counter.clone(),
            order: order.clone(),
        }));
        stack.register(Arc::new(CountingHandler {
            name: "second".into(),
            counter: counter.clone(),
            order: order.clone(),
        }));

        stack.run_all().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(*order.lock().unwrap(), vec!["second".to_string(), "first".to_string()]);
    }

    #[tokio::test]
    async fn deregister_removes_named_handler() {
        let stack = CleanupStack::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        stack.register(Arc::new(CountingHandler {
            name: "data_safety".into(),
            counter: counter.clone(),
            order: order.clone(),
        }));
        stack.deregister("data_safety");
        stack.run_all().await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
