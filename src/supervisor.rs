use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::ingester::Ingester;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Running,
    Draining,
    Stopped,
}

/// Boots components, owns the shutdown signal, and runs the ingest and
/// dispatch loops on independent cadences. Health checking is delegated to
/// the dispatcher's own single-flight ticker.
pub struct Supervisor {
    cancel: CancellationToken,
    drain_window: Duration,
}

impl Supervisor {
    pub fn new(drain_window: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            drain_window,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the dispatch loop until cancellation. `run_continuous` only
    /// returns once cancelled, so `Draining` starts the moment the signal
    /// fires and covers exactly the time it takes the last in-flight batch
    /// to wind down — each of its broker calls is itself racing `cancel`
    /// (see `BrokerClient::place_regular`/`place_amo`), bounding that wind
    /// down well inside `drain_window` in the common case. `drain_window`
    /// is a backstop, not the thing doing the draining.
    pub async fn run_dispatcher(&self, dispatcher: Arc<Dispatcher>, check_interval: Duration, health_interval: Duration) {
        let mut state = LoopState::Init;
        info!(?state, "dispatcher loop initializing");
        state = LoopState::Running;
        info!(?state, "dispatcher loop starting");

        let cancel = self.cancel.clone();
        let run = tokio::spawn(async move {
            dispatcher.run_continuous(check_interval, health_interval, cancel).await;
        });

        self.cancel.cancelled().await;
        state = LoopState::Draining;
        info!(?state, drain_window_secs = self.drain_window.as_secs(), "shutdown signal received, draining in-flight dispatches");

        if tokio::time::timeout(self.drain_window, run).await.is_err() {
            warn!(drain_window_secs = self.drain_window.as_secs(), "drain window elapsed before the dispatch loop task finished");
        }

        state = LoopState::Stopped;
        info!(?state, "dispatcher loop stopped");
    }

    /// Runs the ingest loop at `interval` until cancellation.
    pub async fn run_ingester(&self, ingester: Arc<Ingester>, interval: Duration) {
        let mut state = LoopState::Running;
        info!(?state, "ingester loop starting");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    ingester.run_once().await;
                }
                _ = self.cancel.cancelled() => {
                    state = LoopState::Stopped;
                    info!(?state, "ingester loop received cancellation, exiting");
                    break;
                }
            }
        }
    }

    /// Triggers graceful shutdown: stop accepting new work, let in-flight
    /// dispatches finish within the drain window, then exit.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.cancel.cancel();
    }
}
