//! Worker Pool
//!
//! N dispatch workers (default: CPU count) each looping
//! dequeue-highest -> provider send -> ack / delayed retry / DLQ:
//! - retry delay `d = min(max_delay, initial * multiplier^(attempt-1))`,
//!   plus up to 20% additive jitter when enabled
//! - shutdown is cooperative: workers finish the in-flight message, stop
//!   dequeuing, and release their slot; `stop(timeout)` forces after the
//!   deadline

use metrics::{counter, histogram};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use nx_common::{QueueMessage, Shutdown};
use nx_config::{QueueOptions, RetryOptions};
use nx_provider::ProviderRegistry;
use nx_queue::{DeadLetterStore, PriorityQueue};

use crate::store::{NotificationStore, TargetStatus};

/// Aggregate worker pool counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub delivered: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
}

pub struct WorkerPool {
    queue: Arc<PriorityQueue>,
    dlq: Arc<DeadLetterStore>,
    providers: Arc<ProviderRegistry>,
    store: Arc<NotificationStore>,
    retry: RetryOptions,
    queue_options: QueueOptions,
    shutdown: Arc<Shutdown>,
    workers: usize,
    active: Arc<AtomicU32>,
    stats: Arc<WorkerStats>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<PriorityQueue>,
        dlq: Arc<DeadLetterStore>,
        providers: Arc<ProviderRegistry>,
        store: Arc<NotificationStore>,
        retry: RetryOptions,
        queue_options: QueueOptions,
        workers: usize,
    ) -> Self {
        Self {
            queue,
            dlq,
            providers,
            store,
            retry,
            queue_options,
            shutdown: Arc::new(Shutdown::new()),
            workers,
            active: Arc::new(AtomicU32::new(0)),
            stats: Arc::new(WorkerStats::default()),
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    pub fn active_workers(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    /// Spawn the worker tasks.
    pub fn start(&self) {
        info!(workers = self.workers, "Starting dispatch worker pool");
        let mut handles = self.handles.lock();
        for worker_id in 0..self.workers {
            let queue = self.queue.clone();
            let dlq = self.dlq.clone();
            let providers = self.providers.clone();
            let store = self.store.clone();
            let retry = self.retry.clone();
            let poll_interval = self.queue_options.poll_interval_ms;
            let shutdown = self.shutdown.clone();
            let active = self.active.clone();
            let stats = self.stats.clone();

            handles.push(tokio::spawn(async move {
                run_worker(
                    worker_id, queue, dlq, providers, store, retry, poll_interval, shutdown,
                    active, stats,
                )
                .await;
            }));
        }
    }

    /// Cooperative stop: workers exit after their in-flight message. Returns
    /// true when all exited within the timeout; aborts the stragglers
    /// otherwise.
    pub async fn stop(&self, timeout: Duration) -> bool {
        info!("Stopping worker pool");
        self.shutdown.trigger();

        let mut handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        let drained =
            tokio::time::timeout(timeout, futures::future::join_all(handles.iter_mut())).await;

        match drained {
            Ok(_) => {
                info!("All workers exited cleanly");
                true
            }
            Err(_) => {
                warn!("Worker pool stop timed out, forcing exit");
                for handle in &handles {
                    handle.abort();
                }
                false
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_id: usize,
    queue: Arc<PriorityQueue>,
    dlq: Arc<DeadLetterStore>,
    providers: Arc<ProviderRegistry>,
    store: Arc<NotificationStore>,
    retry: RetryOptions,
    poll_interval_ms: u64,
    shutdown: Arc<Shutdown>,
    active: Arc<AtomicU32>,
    stats: Arc<WorkerStats>,
) {
    debug!(worker_id, "Dispatch worker started");

    while !shutdown.is_triggered() {
        let Some(message) = queue.dequeue_or_wait(&shutdown, poll_interval_ms).await else {
            break;
        };

        active.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        process_message(&queue, &dlq, &providers, &store, &retry, &stats, message).await;
        histogram!("nx_dispatch_duration_seconds").record(start.elapsed().as_secs_f64());
        active.fetch_sub(1, Ordering::SeqCst);
    }

    debug!(worker_id, "Dispatch worker exited");
}

async fn process_message(
    queue: &PriorityQueue,
    dlq: &DeadLetterStore,
    providers: &ProviderRegistry,
    store: &NotificationStore,
    retry: &RetryOptions,
    stats: &WorkerStats,
    message: QueueMessage,
) {
    let notification_id = message.event.id.clone();
    let tenant_id = message.tenant_id.clone();

    let Some(provider) = providers.first_for(message.channel) else {
        // provider disappeared between enqueue and dispatch
        error!(
            tenant_id = %tenant_id,
            notification_id = %notification_id,
            channel = %message.channel,
            "No provider for channel at dispatch time"
        );
        store.mark_target(
            &tenant_id,
            &notification_id,
            &message.recipient.id,
            message.channel,
            TargetStatus::NoProvider,
            Some("no provider for channel".into()),
        );
        let _ = queue.dead_letter(&message.id, "no provider for channel", dlq);
        stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
        return;
    };

    let result = provider.send(&message.event, &message.recipient).await;
    counter!(
        "nx_dispatch_total",
        "channel" => message.channel.to_string(),
        "success" => result.success.to_string()
    )
    .increment(1);

    if result.success {
        debug!(
            tenant_id = %tenant_id,
            notification_id = %notification_id,
            channel = %message.channel,
            attempt = message.attempt,
            "Delivery succeeded"
        );
        store.record_attempt(
            &tenant_id,
            &notification_id,
            &message.recipient.id,
            message.channel,
            message.attempt,
            &result,
            true,
        );
        if let Err(e) = queue.ack(&message.id) {
            error!(error = %e, message_id = %message.id, "Ack failed");
        }
        stats.delivered.fetch_add(1, Ordering::SeqCst);
        return;
    }

    let retryable = result.retryable && message.attempt < retry.max_attempts;
    if retryable {
        let delay = backoff_delay(retry, message.attempt);
        warn!(
            tenant_id = %tenant_id,
            notification_id = %notification_id,
            channel = %message.channel,
            attempt = message.attempt,
            delay_ms = delay.as_millis() as u64,
            error = ?result.error_message,
            "Delivery failed, scheduling retry"
        );
        store.record_attempt(
            &tenant_id,
            &notification_id,
            &message.recipient.id,
            message.channel,
            message.attempt,
            &result,
            false,
        );
        let scheduled_for = chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        if let Err(e) = queue.requeue_with_delay(&message.id, scheduled_for) {
            error!(error = %e, message_id = %message.id, "Requeue failed, dead-lettering");
            let _ = queue.dead_letter(&message.id, "requeue failed", dlq);
        } else {
            stats.retried.fetch_add(1, Ordering::SeqCst);
        }
        return;
    }

    let reason = result
        .error_message
        .clone()
        .unwrap_or_else(|| "delivery failed".to_string());
    warn!(
        tenant_id = %tenant_id,
        notification_id = %notification_id,
        channel = %message.channel,
        attempt = message.attempt,
        retryable = result.retryable,
        error = %reason,
        "Delivery failed terminally, dead-lettering"
    );
    store.record_attempt(
        &tenant_id,
        &notification_id,
        &message.recipient.id,
        message.channel,
        message.attempt,
        &result,
        true,
    );
    let _ = queue.dead_letter(&message.id, &reason, dlq);
    stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
}

/// `min(max_delay, initial * multiplier^(attempt-1))` with up to 20%
/// additive jitter. The k-th attempt therefore never fires earlier than the
/// undithered schedule.
pub fn backoff_delay(retry: &RetryOptions, failed_attempt: u32) -> Duration {
    let exponent = failed_attempt.saturating_sub(1) as i32;
    let base = retry.initial_delay_ms as f64 * retry.multiplier.powi(exponent);
    let capped = base.min(retry.max_delay_ms as f64);
    let jittered = if retry.jitter {
        use rand::Rng;
        let factor: f64 = rand::rng().random_range(0.0..0.2);
        capped * (1.0 + factor)
    } else {
        capped
    };
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_options() -> RetryOptions {
        RetryOptions {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: false,
        }
    }

    #[test]
    fn backoff_is_exponential() {
        let retry = retry_options();
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(4_000));
    }

    #[test]
    fn backoff_is_capped() {
        let mut retry = retry_options();
        retry.max_delay_ms = 3_000;
        assert_eq!(backoff_delay(&retry, 10), Duration::from_millis(3_000));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let mut retry = retry_options();
        retry.jitter = true;
        for _ in 0..100 {
            let delay = backoff_delay(&retry, 2);
            assert!(delay >= Duration::from_millis(2_000));
            assert!(delay <= Duration::from_millis(2_400));
        }
    }
}
