use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::broker::BrokerClient;
use crate::error::{BrokerErrorKind, DispatchError, DispatchErrorKind, StoreError};
use crate::order::{DispatchProfile, ExecutionOutcome, Order};
use crate::store::OrderStore;

/// Worker pool that drains due orders with bounded concurrency, honoring
/// at-most-once semantics: every order is locked, attempted exactly once,
/// and removed from the store regardless of outcome.
pub struct Dispatcher {
    store: Arc<dyn OrderStore>,
    broker: Arc<dyn BrokerClient>,
    rate_gate: Arc<crate::rate_gate::RateGate>,
    worker_pool_size: usize,
    lock_ttl: StdDuration,
    grace: ChronoDuration,
    health_in_flight: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OrderStore>,
        broker: Arc<dyn BrokerClient>,
        rate_gate: Arc<crate::rate_gate::RateGate>,
        worker_pool_size: usize,
        lock_ttl: StdDuration,
    ) -> Self {
        Self::with_grace(store, broker, rate_gate, worker_pool_size, lock_ttl, ChronoDuration::seconds(10))
    }

    pub fn with_grace(
        store: Arc<dyn OrderStore>,
        broker: Arc<dyn BrokerClient>,
        rate_gate: Arc<crate::rate_gate::RateGate>,
        worker_pool_size: usize,
        lock_ttl: StdDuration,
        grace: ChronoDuration,
    ) -> Self {
        Self {
            store,
            broker,
            rate_gate,
            worker_pool_size,
            lock_ttl,
            grace,
            health_in_flight: AtomicBool::new(false),
        }
    }

    /// Drains every order due as of `now` through a fixed-size worker pool.
    /// Returns once the list is fully drained; completion order across
    /// workers is not guaranteed.
    #[instrument(skip(self, cancel))]
    pub async fn run_once(&self, now: chrono::DateTime<Utc>, cancel: &CancellationToken) -> Vec<ExecutionOutcome> {
        let due = match self.store.due(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to query due orders, skipping this cycle");
                return Vec::new();
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.worker_pool_size));
        let mut tasks = JoinSet::new();

        for order in due {
            let semaphore = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let broker = Arc::clone(&self.broker);
            let rate_gate = Arc::clone(&self.rate_gate);
            let lock_ttl = self.lock_ttl;
            let grace = self.grace;
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                dispatch_one(store, broker, rate_gate, order, lock_ttl, grace, &cancel).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Ok(Some(outcome)) = result {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Tight loop calling `run_once` at `check_interval`, plus a low-frequency
    /// single-flight `health()` check on `check_interval * 0 + health_interval`.
    /// Exits when `cancel` fires.
    pub async fn run_continuous(
        self: Arc<Self>,
        check_interval: StdDuration,
        health_interval: StdDuration,
        cancel: CancellationToken,
    ) {
        let mut check_ticker = tokio::time::interval(check_interval);
        let mut health_ticker = tokio::time::interval(health_interval);

        loop {
            tokio::select! {
                _ = check_ticker.tick() => {
                    let outcomes = self.run_once(Utc::now(), &cancel).await;
                    for outcome in &outcomes {
                        record_outcome_metrics(outcome);
                    }
                }
                _ = health_ticker.tick() => {
                    self.run_health_check().await;
                }
                _ = cancel.cancelled() => {
                    info!("dispatcher loop received cancellation, exiting");
                    break;
                }
            }
        }
    }

    async fn run_health_check(&self) {
        if self
            .health_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if let Err(e) = self.store.health().await {
            warn!(error = %e, "order store health check failed");
        }
        if let Err(e) = self.broker.health().await {
            warn!(error = %e, "broker health check failed");
        }
        self.health_in_flight.store(false, Ordering::SeqCst);
    }
}

#[instrument(skip(store, broker, rate_gate, grace, cancel), fields(order_id = %order.id, symbol = %order.symbol))]
async fn dispatch_one(
    store: Arc<dyn OrderStore>,
    broker: Arc<dyn BrokerClient>,
    rate_gate: Arc<crate::rate_gate::RateGate>,
    order: Order,
    lock_ttl: StdDuration,
    grace: ChronoDuration,
    cancel: &CancellationToken,
) -> Option<ExecutionOutcome> {
    let t_start = Utc::now();
    let scheduler_delay = (t_start - order.scheduled_instant).num_milliseconds().max(0);

    let locked = match store.try_lock(&order.id, lock_ttl).await {
        Ok(locked) => locked,
        Err(e) => {
            warn!(error = %e, "lock acquisition failed, skipping this cycle");
            return None;
        }
    };
    if !locked {
        info!("order already locked by another dispatcher, skipping");
        return None;
    }

    let outcome = dispatch_locked(&store, &broker, &rate_gate, &order, grace, t_start, scheduler_delay, cancel).await;

    if let Err(e) = store.unlock(&order.id).await {
        warn!(error = %e, "best-effort unlock failed");
    }

    outcome
}

async fn dispatch_locked(
    store: &Arc<dyn OrderStore>,
    broker: &Arc<dyn BrokerClient>,
    rate_gate: &Arc<crate::rate_gate::RateGate>,
    order: &Order,
    grace: ChronoDuration,
    t_start: chrono::DateTime<Utc>,
    scheduler_delay: i64,
    cancel: &CancellationToken,
) -> Option<ExecutionOutcome> {
    if t_start > order.scheduled_instant + grace {
        let err = DispatchError::new(DispatchErrorKind::Expired, "order exceeded grace window before dispatch attempt");
        warn!(detail = %err.detail, "order expired before dispatch, removing without attempting placement");
        if let Err(e) = remove_terminal(store, &order.id).await {
            warn!(error = %e, "failed to remove expired order");
        }
        return Some(ExecutionOutcome {
            id: order.id.clone(),
            success: false,
            broker_reference: None,
            executed_instant: t_start,
            error_kind: Some(err.kind),
            error_detail: Some(err.detail),
            profile: DispatchProfile {
                scheduler_delay_ms: scheduler_delay,
                broker_call_latency_ms: 0,
                total_latency_ms: (t_start - t_start).num_milliseconds(),
            },
        });
    }

    if !rate_gate.acquire(cancel).await {
        let err = DispatchError::new(DispatchErrorKind::Cancelled, "cancelled while waiting on rate gate");
        info!(detail = %err.detail, "dispatch cancelled while waiting on rate gate, leaving order in store");
        return None;
    }

    let t_after_gate = Utc::now();
    let result = if order.is_amo {
        broker.place_amo(order, cancel).await
    } else {
        broker.place_regular(order, cancel).await
    };

    if cancel.is_cancelled() {
        let err = DispatchError::new(DispatchErrorKind::Cancelled, "shutdown signal received during broker call");
        info!(detail = %err.detail, "dispatch cancelled during broker call, leaving order in store for next run");
        return None;
    }

    // Terminal after any attempt: remove unconditionally, per the at-most-once
    // contract. There is no dispatcher-level retry of the same order.
    if let Err(e) = remove_terminal(store, &order.id).await {
        warn!(error = %e, "failed to remove order after terminal dispatch attempt");
    }

    let now = Utc::now();
    let profile = DispatchProfile {
        scheduler_delay_ms: scheduler_delay,
        broker_call_latency_ms: (now - t_after_gate).num_milliseconds(),
        total_latency_ms: (now - t_start).num_milliseconds(),
    };

    Some(match result {
        Ok(broker_reference) => ExecutionOutcome {
            id: order.id.clone(),
            success: true,
            broker_reference: Some(broker_reference),
            executed_instant: now,
            error_kind: None,
            error_detail: None,
            profile,
        },
        Err(broker_error) => {
            if broker_error.kind == BrokerErrorKind::Auth {
                error!(
                    order_id = %order.id, symbol = %order.symbol, side = ?order.side, quantity = order.quantity,
                    detail = %broker_error.detail, "broker rejected order on an auth failure"
                );
            } else {
                warn!(
                    order_id = %order.id, symbol = %order.symbol, side = ?order.side, quantity = order.quantity,
                    detail = %broker_error.detail, "broker rejected order dispatch"
                );
            }
            ExecutionOutcome {
                id: order.id.clone(),
                success: false,
                broker_reference: None,
                executed_instant: now,
                error_kind: Some(DispatchErrorKind::from(broker_error.kind)),
                error_detail: Some(broker_error.detail),
                profile,
            }
        }
    })
}

async fn remove_terminal(store: &Arc<dyn OrderStore>, id: &str) -> Result<(), StoreError> {
    store.remove(id).await
}

fn record_outcome_metrics(outcome: &ExecutionOutcome) {
    counter!("dispatcher.orders.attempted", 1);
    if outcome.success {
        counter!("dispatcher.orders.succeeded", 1);
    } else {
        counter!("dispatcher.orders.failed", 1);
    }
    histogram!("dispatcher.broker_call_latency_ms", outcome.profile.broker_call_latency_ms as f64);
    histogram!("dispatcher.total_latency_ms", outcome.profile.total_latency_ms as f64);
}
