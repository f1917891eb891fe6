//! Bounded worker pool for per-unit artifact tasks (§5), a
//! `tokio::sync::Semaphore`-gated task spawner standing in for the
//! original's `ThreadPoolExecutor`, since the rest of the crate is async.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::constants::TASK_KILL_GRACE;
use crate::safe_exit::SubprocessRegistry;

/// Outcome of one artifact task.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(String),
    TimedOut,
}

/// A bounded pool of async tasks, each individually timed out. `task_id`
/// identifies a task for [`SubprocessRegistry`] tracking; the caller is
/// responsible for calling `registry.track`/`untrack` around the actual
/// subprocess spawn inside its future — this pool only owns the
/// concurrency limit and the timeout-triggered termination signal.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    registry: SubprocessRegistry,
}

impl WorkerPool {
    pub fn new(max_workers: usize, registry: SubprocessRegistry) -> Self {
        WorkerPool {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            registry,
        }
    }

    /// Run `fut` under a pool permit, racing it against `task_timeout` (0
    /// means no deadline). On timeout, send SIGTERM then, after the grace
    /// window, SIGKILL to the task's tracked process group, matching the
    /// per-task timeout escalation in §5.
    pub async fn run<T, F>(&self, task_id: impl Into<String>, task_timeout: Duration, fut: F) -> TaskOutcome<T>
    where
        F: Future<Output = Result<T, String>>,
    {
        let task_id = task_id.into();
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return TaskOutcome::Failed("worker pool semaphore closed".to_string()),
        };

        if task_timeout.is_zero() {
            return match fut.await {
                Ok(v) => TaskOutcome::Completed(v),
                Err(e) => TaskOutcome::Failed(e),
            };
        }

        match tokio::time::timeout(task_timeout, fut).await {
            Ok(Ok(v)) => TaskOutcome::Completed(v),
            Ok(Err(e)) => TaskOutcome::Failed(e),
            Err(_) => {
                warn!(task_id = %task_id, timeout = ?task_timeout, "task timed out, terminating process group");
                self.terminate_task(&task_id).await;
                TaskOutcome::TimedOut
            }
        }
    }

    async fn terminate_task(&self, task_id: &str) {
        if let Some(pgid) = self.registry_pgid(task_id) {
            crate::safe_exit::send_signal_to_group_pub(pgid, libc::SIGTERM);
            tokio::time::sleep(TASK_KILL_GRACE).await;
            crate::safe_exit::send_signal_to_group_pub(pgid, libc::SIGKILL);
        }
        self.registry.untrack(task_id);
    }

    fn registry_pgid(&self, task_id: &str) -> Option<u32> {
        self.registry.pgid_of(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_tasks_up_to_the_worker_limit() {
        let pool = WorkerPool::new(2, SubprocessRegistry::new());
        let outcome = pool.run::<i32, _>("t1", Duration::ZERO, async { Ok(42) }).await;
        assert!(matches!(outcome, TaskOutcome::Completed(42)));
    }

    #[tokio::test]
    async fn times_out_a_slow_task() {
        let pool = WorkerPool::new(1, SubprocessRegistry::new());
        let outcome = pool
            .run::<(), _>("slow", Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(outcome, TaskOutcome::TimedOut));
    }

    #[tokio::test]
    async fn propagates_task_failure() {
        let pool = WorkerPool::new(1, SubprocessRegistry::new());
        let outcome = pool.run::<(), _>("fail", Duration::ZERO, async { Err("boom".to_string()) }).await;
        assert!(matches!(outcome, TaskOutcome::Failed(msg) if msg == "boom"));
    }
}
