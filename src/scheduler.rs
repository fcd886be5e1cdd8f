//! Named timers.
//!
//! Every delayed or periodic piece of work in the crate (debounce windows,
//! batch timers, rate-limit ticks, health checks, cache sweeps, background
//! refreshers) is registered here under a name. Re-scheduling a name replaces
//! the previous timer, `cancel` removes one, `shutdown` removes all of them.
//!
//! Timers are built on `tokio::time`, so tests drive them with a paused
//! runtime clock (`#[tokio::test(start_paused = true)]`).

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

struct ScheduledTask {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskScheduler {
    tasks: Arc<DashMap<String, ScheduledTask>>,
    next_id: AtomicU64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` once after `delay`, replacing any timer with the same name.
    ///
    /// Once the delay elapses the timer is released before `task` starts, so a
    /// later `cancel` or re-schedule of the same name does not interrupt it.
    pub fn schedule_once<F>(&self, name: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let key = name.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.remove_if(&key, |_, t| t.id == id);
            trace!(timer = %key, "timer fired");
            task.await;
        });

        if let Some(previous) = self.tasks.insert(name, ScheduledTask { id, handle }) {
            previous.handle.abort();
        }
    }

    /// Runs `tick` every `period`, first run one period from now.
    pub fn schedule_interval<F, Fut>(&self, name: impl Into<String>, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                trace!(timer = %label, "interval tick");
                tick().await;
            }
        });

        debug!(timer = %name, period_ms = period.as_millis() as u64, "interval registered");
        if let Some(previous) = self.tasks.insert(name, ScheduledTask { id, handle }) {
            previous.handle.abort();
        }
    }

    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some((_, task)) => {
                let was_pending = !task.handle.is_finished();
                task.handle.abort();
                was_pending
            }
            None => false,
        }
    }

    /// Cancels every timer whose name starts with `prefix`.
    pub fn cancel_prefix(&self, prefix: &str) -> usize {
        let names: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        names.iter().filter(|name| self.cancel(name)).count()
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().handle.is_finished())
            .count()
    }

    pub fn shutdown(&self) {
        let count = self.tasks.len();
        self.tasks.retain(|_, task| {
            task.handle.abort();
            false
        });
        debug!(count, "scheduler shut down");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().handle.abort();
        }
    }
}
