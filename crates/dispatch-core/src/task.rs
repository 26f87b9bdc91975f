//! Start/stop handles for background loops.
//!
//! Every long-running loop (outbox drain, sweeper, broker consumers) is owned
//! by a [`WorkerHandle`]. Stopping signals the loop through a oneshot and joins
//! it, so the current tick or message finishes before `stop` returns. Dropping
//! the handle also signals the loop to stop, without waiting.

use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Receives the stop signal inside a worker loop.
pub type ShutdownSignal = oneshot::Receiver<()>;

/// Handle to a spawned worker loop.
pub struct WorkerHandle {
    name: String,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `run` with a shutdown signal it must observe.
    pub fn spawn<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(shutdown_rx));
        Self {
            name: name.into(),
            shutdown_tx,
            task,
        }
    }

    /// Spawn a loop that calls `tick` every `period`, starting immediately.
    ///
    /// Ticks never overlap: a slow tick delays the next one instead of
    /// bursting to catch up.
    pub fn periodic<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let loop_name = name.clone();
        Self::spawn(name, move |mut shutdown_rx| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        debug!(worker = %loop_name, "Periodic worker stopping");
                        break;
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(self) {
        let Self {
            name,
            shutdown_tx,
            task,
        } = self;

        let _ = shutdown_tx.send(());
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!(worker = %name, error = %e, "Worker task panicked");
            }
        }
        debug!(worker = %name, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = WorkerHandle::periodic("ticker", Duration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // First tick fires immediately, then every 5s.
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(handle.is_running());

        handle.stop().await;
        let after_stop = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn spawn_observes_shutdown_signal() {
        let handle = WorkerHandle::spawn("waiter", |shutdown_rx| async move {
            let _ = shutdown_rx.await;
        });
        assert_eq!(handle.name(), "waiter");
        assert!(handle.is_running());

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("worker should stop promptly");
    }

    #[tokio::test]
    async fn dropping_handle_stops_loop() {
        let (done_tx, done_rx) = oneshot::channel();
        let handle = WorkerHandle::spawn("dropped", |shutdown_rx| async move {
            let _ = shutdown_rx.await;
            let _ = done_tx.send(());
        });
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("loop should exit after drop")
            .unwrap();
    }
}
