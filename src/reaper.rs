use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::storage::Store;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, info_span, warn};

/// Periodically returns jobs abandoned by dead workers to the queue.
pub(crate) struct Reaper<S, D, C> {
    pub(crate) engine: Engine<S, D, C>,
    pub(crate) interval: Duration,
    pub(crate) stale_job_timeout: Duration,
}

impl<S: Store, D: Dispatcher, C: Clock> Reaper<S, D, C> {
    pub(crate) fn start(self) -> AbortHandle {
        let span = info_span!("reaper");
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(error) = self.engine.requeue_stale_jobs(self.stale_job_timeout).await {
                        warn!("Failed to requeue stale jobs: {error}");
                    }
                }
            }
            .instrument(span),
        );
        task.abort_handle()
    }
}
