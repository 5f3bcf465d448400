use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// A periodic background task. The first tick fires immediately; a tick that
/// overruns its period delays the next one instead of bunching them up.
pub(crate) struct Ticker {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Run `tick` every `period` until stopped or until `tick` resolves to
    /// `false`.
    pub(crate) fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            debug!(ticker = name, period_ms = period.as_millis() as u64, "Ticker started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = signal.notified() => break,
                    _ = interval.tick() => {
                        if !tick().await {
                            break;
                        }
                    }
                }
            }
            debug!(ticker = name, "Ticker stopped");
        });
        Self {
            name,
            shutdown,
            handle,
        }
    }

    /// Stop the ticker. An in-flight tick runs to completion first.
    pub(crate) async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            warn!(ticker = self.name, error = %e, "Ticker task ended abnormally");
        }
    }
}
