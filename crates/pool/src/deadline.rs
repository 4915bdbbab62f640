//! Deadline wrapping and cancellable background sweeps.

use std::{future::Future, time::Duration};

use {
    tokio::{task::JoinHandle, time},
    tracing::debug,
};

use crate::error::{PoolError, Result};

/// Run `op` against a deadline, failing with a labeled
/// [`PoolError::Timeout`] if it does not settle in time.
///
/// `tokio::time::timeout` drops its sleep on either outcome, so a completed
/// operation never leaves a pending timer behind. An expired operation is
/// abandoned, not cancelled: pool entries it touched are re-validated on
/// next use instead of trusted.
pub async fn deadline<T>(
    op: impl Future<Output = Result<T>>,
    budget: Duration,
    label: &str,
) -> Result<T> {
    match time::timeout(budget, op).await {
        Ok(result) => result,
        Err(_) => Err(PoolError::timeout(label, budget.as_millis() as u64)),
    }
}

/// A periodic background task owned by the pool.
///
/// The task is aborted by [`Sweeper::stop`] and again on drop, so an idle
/// sweep can never hold the process open past shutdown.
pub(crate) struct Sweeper {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub(crate) fn spawn<F, Fut>(name: &'static str, every: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(every);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // An interval's first tick fires immediately; skip it so a fresh
            // pool does not sweep before anything can be idle.
            interval.tick().await;
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        debug!(sweep = name, interval_ms = every.as_millis() as u64, "sweep started");
        Self { name, handle }
    }

    pub(crate) fn stop(&self) {
        self.handle.abort();
        debug!(sweep = self.name, "sweep stopped");
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
