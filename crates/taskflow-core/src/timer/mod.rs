//! A store-backed timer wheel: deadlines for external callbacks, join max
//! wait, webhook retries, and batch boundaries are armed here and fired by
//! a periodic tick rather than a per-timer tokio task, so a restart just
//! resumes ticking against whatever is still due in the store.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing::{debug, error, warn};
use uuid::Uuid;

use taskflow_shared::errors::EngineResult;

use crate::store::{StoreGateway, TimerEntry};

/// Receives timers as they come due. Implemented by the dispatcher, which
/// routes each kind to the batch coordinator or the relevant strategy.
#[async_trait]
pub trait TimerSink: Send + Sync {
    async fn on_timer_fired(&self, timer: TimerEntry) -> EngineResult<()>;
}

pub struct TimerWheel<S: StoreGateway> {
    store: Arc<S>,
    sink: OnceCell<Arc<dyn TimerSink>>,
}

impl<S: StoreGateway> TimerWheel<S> {
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            sink: OnceCell::new(),
        }
    }

    /// Wires the sink after construction, breaking the `Dispatcher` <->
    /// `TimerWheel` cycle: the dispatcher needs a `TimerWheel` to arm
    /// timers, and the wheel needs the dispatcher (as a `TimerSink`) to
    /// fire them.
    pub fn set_sink(&self, sink: Arc<dyn TimerSink>) {
        let _ = self.sink.set(sink);
    }

    pub async fn arm(&self, timer: TimerEntry) -> EngineResult<()> {
        self.store.arm_timer(timer).await
    }

    pub async fn cancel(&self, timer_id: Uuid) -> EngineResult<()> {
        self.store.cancel_timer(timer_id).await
    }

    /// Fires every timer due as of now. Safe to call concurrently or
    /// redundantly: `take_due_timers` removes what it returns, so no timer
    /// fires twice.
    pub async fn tick(&self) -> EngineResult<()> {
        let Some(sink) = self.sink.get() else {
            warn!("timer wheel ticked before a sink was wired; skipping");
            return Ok(());
        };
        let due = self.store.take_due_timers(Utc::now()).await?;
        for timer in due {
            debug!(timer_id = %timer.id, kind = ?timer.kind, subject_id = %timer.subject_id, "timer fired");
            if let Err(err) = sink.on_timer_fired(timer.clone()).await {
                error!(timer_id = %timer.id, error = %err, "timer handler failed");
            }
        }
        Ok(())
    }

    /// Spawns a background task that ticks at `granularity` until the
    /// returned handle is dropped or aborted.
    pub fn spawn_loop(self: Arc<Self>, granularity: StdDuration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(granularity);
            loop {
                interval.tick().await;
                if let Err(err) = self.tick().await {
                    error!(error = %err, "timer wheel tick failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::TimerKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TimerSink for CountingSink {
        async fn on_timer_fired(&self, _timer: TimerEntry) -> EngineResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_fires_only_due_timers() {
        let store = Arc::new(InMemoryStore::new());
        let wheel = TimerWheel::new(store.clone());
        let count = Arc::new(AtomicUsize::new(0));
        wheel.set_sink(Arc::new(CountingSink { count: count.clone() }));

        wheel
            .arm(TimerEntry {
                id: Uuid::now_v7(),
                fire_at: Utc::now() - chrono::Duration::seconds(5),
                kind: TimerKind::WebhookRetry,
                subject_id: Uuid::now_v7(),
            })
            .await
            .unwrap();
        wheel
            .arm(TimerEntry {
                id: Uuid::now_v7(),
                fire_at: Utc::now() + chrono::Duration::hours(1),
                kind: TimerKind::WebhookRetry,
                subject_id: Uuid::now_v7(),
            })
            .await
            .unwrap();

        wheel.tick().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        wheel.tick().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1, "due timer already consumed");
    }
}
