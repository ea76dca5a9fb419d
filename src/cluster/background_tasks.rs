//! Periodic engine tickers.
//!
//! The engine actor owns all protocol state, so background tasks never touch
//! it directly: each ticker only sends a tick command into the actor's queue.
//! The registry names the tickers, cancels them together on shutdown and
//! reports which ones are still alive.
//!
//! | Ticker | Period | Jittered |
//! |--------|--------|----------|
//! | `heartbeat` | heartbeat interval | yes (+/-15%) |
//! | `failure_check` | heartbeat interval | no |
//! | `checkpoint` | checkpoint interval | no |

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::retry::with_jitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// Finished on its own (the engine queue closed) or panicked.
    Finished,
}

struct TaskInfo {
    handle: JoinHandle<()>,
    spawned_at: tokio::time::Instant,
}

/// Named background tasks sharing one cancellation token.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<&'static str, TaskInfo>,
    cancel: CancellationToken,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Tasks are cancelled when `cancel` (or a parent of it) is cancelled.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            tasks: HashMap::new(),
            cancel,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a named task. A task already registered under `name` is aborted.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            tracing::warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }
        if let Some(old) = self.tasks.remove(name) {
            old.handle.abort();
            tracing::debug!(task = name, "Aborted previous task instance");
        }

        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => tracing::debug!(task = name, "Task completed"),
                _ = cancel.cancelled() => tracing::debug!(task = name, "Task cancelled"),
            }
        });
        tracing::debug!(task = name, "Spawned background task");
        self.tasks.insert(
            name,
            TaskInfo {
                handle,
                spawned_at: tokio::time::Instant::now(),
            },
        );
    }

    /// Run `tick` every `period`. The task ends when `tick` returns false.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        self.spawn(name, async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick of an interval fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if !tick().await {
                    break;
                }
            }
        });
    }

    /// Like [`spawn_periodic`](Self::spawn_periodic) but every period is
    /// jittered by +/-15%.
    pub fn spawn_jittered<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        self.spawn(name, async move {
            loop {
                tokio::time::sleep(with_jitter(period)).await;
                if !tick().await {
                    break;
                }
            }
        });
    }

    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        let mut statuses: Vec<_> = self
            .tasks
            .iter()
            .map(|(name, info)| {
                let status = if info.handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect();
        statuses.sort_by_key(|(name, _)| *name);
        statuses
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|info| !info.handle.is_finished())
            .count()
    }

    pub fn task_uptime(&self, name: &str) -> Option<Duration> {
        self.tasks.get(name).map(|info| info.spawned_at.elapsed())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every task and wait up to `timeout` for them to exit.
    pub async fn shutdown_all(&mut self, timeout: Duration) {
        self.cancel.cancel();
        tracing::debug!(task_count = self.tasks.len(), "Stopping background tasks");

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, info) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, info.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    tracing::warn!(task = name, error = %e, "Task panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => tracing::warn!(task = name, "Task did not stop in time"),
            }
        }
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
        for (_, info) in self.tasks.drain() {
            info.handle.abort();
        }
    }
}
