//! Bounded Worker Pool
//!
//! Runs bootstrap work on spawned tasks, at most `max_workers` at a time. When every
//! worker is busy the task is handed back so the caller can run it itself.

use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tracing::Instrument;

/// What happened to a task offered to the pool.
pub enum Submitted<F> {
    Spawned,
    /// Every worker is busy. The caller should run the task.
    Saturated(F),
    /// The pool has been shut down. The task was dropped.
    Rejected,
}

pub struct WorkerPool {
    name: String,
    permits: Arc<Semaphore>,
    max_workers: AtomicUsize,
    tasks: Mutex<JoinSet<()>>,
    runtime: Handle,
}

impl WorkerPool {
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, max_workers: usize) -> Result<Self> {
        let max_workers = max_workers.max(1);
        Ok(Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers: AtomicUsize::new(max_workers),
            tasks: Mutex::new(JoinSet::new()),
            runtime: Handle::try_current()?,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.max_workers()
            .saturating_sub(self.permits.available_permits())
    }

    /// Adjusts the worker limit. Lowering it takes effect as running workers finish.
    pub fn set_max_workers(&self, max_workers: usize) {
        let max_workers = max_workers.max(1);
        let previous = self.max_workers.swap(max_workers, Ordering::SeqCst);

        if max_workers > previous {
            self.permits.add_permits(max_workers - previous);
        } else if max_workers < previous {
            let surplus = u32::try_from(previous - max_workers).unwrap_or(u32::MAX);
            let permits = self.permits.clone();
            self.runtime.spawn(async move {
                if let Ok(permits) = permits.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }

        tracing::info!(
            "{} pool limit changed from {} to {} workers",
            self.name,
            previous,
            max_workers
        );
    }

    pub fn try_spawn<F>(&self, label: String, task: F) -> Submitted<F>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Submitted::Saturated(task),
            Err(TryAcquireError::Closed) => {
                tracing::warn!("{} pool is shut down, dropping {}", self.name, label);
                return Submitted::Rejected;
            }
        };

        let span = tracing::debug_span!("worker", pool = %self.name, task = %label);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(
            async move {
                let _permit = permit;
                task.await;
            }
            .instrument(span),
            &self.runtime,
        );
        Submitted::Spawned
    }

    /// Stops accepting work and waits up to `timeout` for running workers. Workers still
    /// running afterwards are left to finish on their own. Returns `true` if all finished.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.permits.close();

        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::warn!("{} worker ended abnormally: {}", self.name, e);
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(
                "{} workers still running after {:?}, proceeding with shutdown",
                tasks.len(),
                timeout
            );
            tasks.detach_all();
        }
        drained
    }
}
