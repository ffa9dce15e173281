//! Tick loop for a single component.

use std::sync::Arc;

use em_core::{Periodic, StatusSnapshot};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};

struct Running {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the tick loop of one component. A slow cycle delays the next tick
/// rather than overlapping it.
pub struct ComponentHandle {
    component: Arc<dyn Periodic>,
    running: Mutex<Option<Running>>,
}

impl ComponentHandle {
    pub fn new(component: Arc<dyn Periodic>) -> Self {
        Self {
            component,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.component.name()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.component.status()
    }

    /// Spawn the loop on the current tokio runtime under a child of `parent`.
    pub fn start(&self, parent: &CancellationToken) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(RuntimeError::AlreadyRunning(self.name()));
        }
        let token = parent.child_token();
        let task = tokio::spawn(tick_loop(self.component.clone(), token.clone()));
        *running = Some(Running { token, task });
        tracing::info!(component = self.name(), "started");
        Ok(())
    }

    /// Cancel the loop and wait for the in-flight cycle to finish.
    pub async fn stop(&self) -> Result<()> {
        let Some(Running { token, task }) = self.running.lock().take() else {
            return Err(RuntimeError::NotRunning(self.name()));
        };
        token.cancel();
        task.await.map_err(|e| RuntimeError::TaskFailed {
            component: self.name(),
            message: e.to_string(),
        })?;
        tracing::info!(component = self.name(), "stopped");
        Ok(())
    }
}

async fn tick_loop(component: Arc<dyn Periodic>, token: CancellationToken) {
    let name = component.name();
    let mut ticker = tokio::time::interval(component.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = component.run_cycle() {
                    tracing::warn!(component = name, "cycle failed: {e}");
                }
            }
        }
    }
    tracing::debug!(component = name, "tick loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use em_core::EngineError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct Counter {
        cycles: AtomicU64,
        fail: bool,
    }

    impl Counter {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                cycles: AtomicU64::new(0),
                fail,
            })
        }

        fn cycles(&self) -> u64 {
            self.cycles.load(Ordering::SeqCst)
        }
    }

    impl Periodic for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        fn run_cycle(&self) -> em_core::Result<()> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::FieldUnavailable("offline".into()));
            }
            Ok(())
        }

        fn status(&self) -> StatusSnapshot {
            StatusSnapshot::new(self.name()).count("cycles", self.cycles())
        }
    }

    #[tokio::test]
    async fn test_runs_until_stopped() {
        let counter = Counter::new(false);
        let handle = ComponentHandle::new(counter.clone());
        let root = CancellationToken::new();
        handle.start(&root).unwrap();
        assert!(handle.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await.unwrap();
        assert!(!handle.is_running());

        let after_stop = counter.cycles();
        assert!(after_stop >= 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.cycles(), after_stop);
        assert_eq!(handle.status().counts["cycles"], after_stop);
    }

    #[tokio::test]
    async fn test_double_start_and_idle_stop() {
        let handle = ComponentHandle::new(Counter::new(false));
        assert!(matches!(handle.stop().await, Err(RuntimeError::NotRunning("counter"))));
        let root = CancellationToken::new();
        handle.start(&root).unwrap();
        assert!(matches!(handle.start(&root), Err(RuntimeError::AlreadyRunning("counter"))));
        handle.stop().await.unwrap();
        // restartable after a clean stop
        handle.start(&root).unwrap();
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_cycles_keep_ticking() {
        let counter = Counter::new(true);
        let handle = ComponentHandle::new(counter.clone());
        handle.start(&CancellationToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await.unwrap();
        assert!(counter.cycles() >= 2);
    }

    #[tokio::test]
    async fn test_parent_cancellation_ends_loop() {
        let counter = Counter::new(false);
        let handle = ComponentHandle::new(counter.clone());
        let root = CancellationToken::new();
        handle.start(&root).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        root.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frozen = counter.cycles();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.cycles(), frozen);
        // the handle still owns the finished task until stopped
        handle.stop().await.unwrap();
    }
}
