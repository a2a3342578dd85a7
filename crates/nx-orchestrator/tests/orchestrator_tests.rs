//! Orchestrator + Worker Pool Integration Tests
//!
//! End-to-end behaviour against a mock provider:
//! - happy-path email delivery with template rendering
//! - retry with backoff then DLQ
//! - priority preemption
//! - rule suppression
//! - rate limiting
//! - acknowledgement cancelling escalations

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use nx_common::{
    Channel, DeliveryResult, NotificationEvent, NotificationRecipient, NotificationStatus,
    Priority,
};
use nx_config::{QueueOptions, RateLimitOptions, RetryOptions};
use nx_limiter::RateLimiter;
use nx_orchestrator::{NotificationStore, Orchestrator, SendStatus, WorkerPool};
use nx_provider::{
    NotificationProvider, ProviderHealth, ProviderRegistry, ValidationResult,
};
use nx_queue::{DeadLetterStore, PriorityQueue};
use nx_rules::{Rule, RuleAction, RuleEngine};
use nx_template::TemplateService;

/// Mock provider that records sends and can fail a configured number of
/// times before succeeding.
struct MockProvider {
    channel: Channel,
    call_count: AtomicU32,
    fail_first: u32,
    retryable_failures: bool,
    delivered_bodies: Mutex<Vec<String>>,
    delivered_order: Mutex<Vec<String>>,
}

impl MockProvider {
    fn reliable(channel: Channel) -> Self {
        Self {
            channel,
            call_count: AtomicU32::new(0),
            fail_first: 0,
            retryable_failures: true,
            delivered_bodies: Mutex::new(Vec::new()),
            delivered_order: Mutex::new(Vec::new()),
        }
    }

    fn failing(channel: Channel, fail_first: u32) -> Self {
        Self {
            channel,
            call_count: AtomicU32::new(0),
            fail_first,
            retryable_failures: true,
            delivered_bodies: Mutex::new(Vec::new()),
            delivered_order: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    fn validate(&self, _: &NotificationEvent, recipient: &NotificationRecipient) -> ValidationResult {
        if recipient.supports(self.channel) {
            ValidationResult::ok()
        } else {
            ValidationResult::fail("not addressable")
        }
    }

    async fn send(&self, event: &NotificationEvent, _: &NotificationRecipient) -> DeliveryResult {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            if self.retryable_failures {
                DeliveryResult::transient("HTTP_503", "mock transient failure")
            } else {
                DeliveryResult::permanent("HTTP_400", "mock permanent failure")
            }
        } else {
            self.delivered_bodies
                .lock()
                .push(event.content.clone().unwrap_or_default());
            self.delivered_order.lock().push(event.id.clone());
            DeliveryResult::delivered(format!("mock-{}", call))
        }
    }

    async fn health(&self) -> ProviderHealth {
        ProviderHealth {
            name: "mock".into(),
            healthy: true,
            message: None,
        }
    }
}

struct Harness {
    queue: Arc<PriorityQueue>,
    dlq: Arc<DeadLetterStore>,
    store: Arc<NotificationStore>,
    rules: Arc<RuleEngine>,
    orchestrator: Arc<Orchestrator>,
    pool: WorkerPool,
    provider: Arc<MockProvider>,
}

fn harness_with(provider: MockProvider, retry: RetryOptions, limits: RateLimitOptions) -> Harness {
    let queue = Arc::new(PriorityQueue::new(100_000));
    let dlq = Arc::new(DeadLetterStore::new(1_000));
    let limiter = Arc::new(RateLimiter::new(limits));
    let rules = Arc::new(RuleEngine::new());
    let templates = Arc::new(TemplateService::new());
    let registry = Arc::new(ProviderRegistry::new());
    let store = Arc::new(NotificationStore::new());

    let provider = Arc::new(provider);
    registry.register(provider.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        queue.clone(),
        dlq.clone(),
        limiter,
        rules.clone(),
        templates,
        registry.clone(),
        store.clone(),
    ));

    let pool = WorkerPool::new(
        queue.clone(),
        dlq.clone(),
        registry,
        store.clone(),
        retry,
        QueueOptions {
            poll_interval_ms: 10,
            ..Default::default()
        },
        2,
    );

    Harness {
        queue,
        dlq,
        store,
        rules,
        orchestrator,
        pool,
        provider,
    }
}

fn open_limits() -> RateLimitOptions {
    RateLimitOptions {
        tenant_per_minute: 0,
        tenant_per_hour: 0,
        tenant_per_day: 0,
        recipient_per_minute: 0,
        recipient_per_hour: 0,
        recipient_per_day: 0,
        dead_letter_on_reject: false,
    }
}

fn fast_retry(max_attempts: u32) -> RetryOptions {
    RetryOptions {
        max_attempts,
        initial_delay_ms: 20,
        multiplier: 2.0,
        max_delay_ms: 200,
        jitter: false,
    }
}

fn email_event(id: &str, priority: Priority) -> NotificationEvent {
    NotificationEvent {
        id: id.into(),
        tenant_id: "t".into(),
        event_type: "welcome".into(),
        priority,
        subject: Some("Hi".into()),
        content: Some("Hello {{name}}".into()),
        title: None,
        icon_url: None,
        action_url: None,
        recipients: vec![NotificationRecipient {
            id: "r1".into(),
            email: Some("a@x".into()),
            metadata: HashMap::from([("name".to_string(), serde_json::json!("A"))]),
            ..Default::default()
        }],
        preferred_channels: vec![Channel::Email],
        scheduled_for: None,
        correlation_id: None,
        source: "test".into(),
        metadata: HashMap::new(),
        created_at: Utc::now(),
        template_id: None,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn happy_path_email_delivers_rendered_body() {
    let h = harness_with(MockProvider::reliable(Channel::Email), fast_retry(3), open_limits());
    h.pool.start();

    let outcome = h
        .orchestrator
        .send(email_event("n1", Priority::Normal))
        .unwrap();
    assert_eq!(outcome.status, SendStatus::Enqueued);
    assert_eq!(outcome.per_target_results.len(), 1);
    assert!(outcome.per_target_results[0].enqueued);

    assert!(
        wait_until(
            || h.store.get("t", "n1").map(|r| r.status == NotificationStatus::Delivered).unwrap_or(false),
            Duration::from_secs(5)
        )
        .await
    );

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.provider.delivered_bodies.lock().as_slice(), &["Hello A".to_string()]);
    assert!(h.dlq.is_empty());
    assert!(h.queue.is_empty());

    h.pool.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn transient_failures_retry_then_dead_letter() {
    // provider fails every attempt; MaxAttempts=3
    let h = harness_with(MockProvider::failing(Channel::Email, u32::MAX), fast_retry(3), open_limits());
    h.pool.start();

    h.orchestrator
        .send(email_event("n1", Priority::Normal))
        .unwrap();

    assert!(
        wait_until(|| h.dlq.len() == 1, Duration::from_secs(10)).await,
        "expected a DLQ entry"
    );

    // exactly MaxAttempts provider calls
    assert_eq!(h.provider.calls(), 3);

    let entries = h.dlq.entries();
    assert_eq!(entries[0].message.event.id, "n1");
    assert_eq!(entries[0].attempts, 3);

    let record = h.store.get("t", "n1").unwrap();
    assert_eq!(record.status, NotificationStatus::DeadLettered);
    assert_eq!(record.targets[0].history.len(), 3);

    h.pool.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn retry_succeeds_after_transient_failures() {
    let h = harness_with(MockProvider::failing(Channel::Email, 2), fast_retry(3), open_limits());
    h.pool.start();

    h.orchestrator
        .send(email_event("n1", Priority::Normal))
        .unwrap();

    assert!(
        wait_until(
            || h.store.get("t", "n1").map(|r| r.status == NotificationStatus::Delivered).unwrap_or(false),
            Duration::from_secs(10)
        )
        .await
    );
    assert_eq!(h.provider.calls(), 3);
    assert!(h.dlq.is_empty());

    h.pool.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn critical_preempts_queued_low_priority() {
    let h = harness_with(MockProvider::reliable(Channel::Email), fast_retry(3), open_limits());

    // enqueue 1000 Low then 1 Critical, before any worker runs
    for i in 0..1000 {
        h.orchestrator
            .send(email_event(&format!("low-{}", i), Priority::Low))
            .unwrap();
    }
    h.orchestrator
        .send(email_event("critical", Priority::Critical))
        .unwrap();

    h.pool.start();

    assert!(
        wait_until(|| h.provider.delivered_order.lock().len() >= 2, Duration::from_secs(5)).await
    );
    // two workers race for the first dequeue; the critical message must be
    // among the first picks despite arriving last
    let head: Vec<String> = h.provider.delivered_order.lock()[..2].to_vec();
    assert!(head.contains(&"critical".to_string()), "head was {:?}", head);

    h.pool.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn suppression_rule_short_circuits() {
    let h = harness_with(MockProvider::reliable(Channel::Email), fast_retry(3), open_limits());
    h.rules
        .upsert(Rule {
            tenant_id: "t".into(),
            id: "mute-noise".into(),
            priority: 10,
            predicate: "eventType == \"noise\"".into(),
            actions: vec![RuleAction::Suppress],
        })
        .unwrap();
    h.pool.start();

    let mut event = email_event("n1", Priority::Normal);
    event.event_type = "noise".into();
    let outcome = h.orchestrator.send(event).unwrap();

    assert_eq!(outcome.status, SendStatus::Suppressed);
    assert!(outcome.per_target_results.is_empty());
    assert_eq!(h.queue.len(None), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.provider.calls(), 0);
    assert_eq!(
        h.store.get("t", "n1").unwrap().status,
        NotificationStatus::Suppressed
    );

    h.pool.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn rate_limited_events_are_not_enqueued() {
    let limits = RateLimitOptions {
        tenant_per_minute: 2,
        ..open_limits()
    };
    let h = harness_with(MockProvider::reliable(Channel::Email), fast_retry(3), limits);

    assert_eq!(
        h.orchestrator.send(email_event("n1", Priority::Normal)).unwrap().status,
        SendStatus::Enqueued
    );
    assert_eq!(
        h.orchestrator.send(email_event("n2", Priority::Normal)).unwrap().status,
        SendStatus::Enqueued
    );
    let rejected = h.orchestrator.send(email_event("n3", Priority::Normal)).unwrap();
    assert_eq!(rejected.status, SendStatus::RateLimited);
    assert_eq!(h.queue.len(None), 2);
    assert_eq!(
        h.store.get("t", "n3").unwrap().status,
        NotificationStatus::RateLimited
    );
}

#[tokio::test]
async fn duplicate_ingest_is_idempotent() {
    let h = harness_with(MockProvider::reliable(Channel::Email), fast_retry(3), open_limits());

    h.orchestrator.send(email_event("n1", Priority::Normal)).unwrap();
    let again = h.orchestrator.send(email_event("n1", Priority::Normal)).unwrap();
    assert_eq!(again.status, SendStatus::Duplicate);
    assert_eq!(h.queue.len(None), 1);
}

#[tokio::test]
async fn acknowledgement_cancels_escalations() {
    let h = harness_with(MockProvider::reliable(Channel::Email), fast_retry(3), open_limits());
    h.rules
        .upsert(Rule {
            tenant_id: "t".into(),
            id: "escalate-incidents".into(),
            priority: 5,
            predicate: "eventType == \"welcome\"".into(),
            actions: vec![RuleAction::Escalate {
                after_seconds: 3600,
                to_recipients: vec![NotificationRecipient {
                    id: "oncall".into(),
                    email: Some("oncall@x".into()),
                    ..Default::default()
                }],
            }],
        })
        .unwrap();

    h.orchestrator.send(email_event("n1", Priority::Normal)).unwrap();
    assert_eq!(h.orchestrator.escalations().len(), 1);

    h.orchestrator.ack("t", "n1", "alice").unwrap();
    assert_eq!(h.orchestrator.escalations().len(), 0);
    assert_eq!(
        h.store.get("t", "n1").unwrap().status,
        NotificationStatus::Acknowledged
    );

    // ack is idempotent
    h.orchestrator.ack("t", "n1", "bob").unwrap();
    assert_eq!(
        h.store.get("t", "n1").unwrap().acknowledged_by.as_deref(),
        Some("alice")
    );
}

#[tokio::test]
async fn scheduler_tick_flushes_aggregates_through_send() {
    let h = harness_with(MockProvider::reliable(Channel::Email), fast_retry(3), open_limits());
    h.rules
        .upsert(Rule {
            tenant_id: "t".into(),
            id: "digest".into(),
            priority: 1,
            predicate: "eventType == \"digest\"".into(),
            actions: vec![RuleAction::Aggregate {
                key: "digest-window".into(),
                window_seconds: 0,
            }],
        })
        .unwrap();

    let mut event = email_event("n1", Priority::Normal);
    event.event_type = "digest".into();
    let outcome = h.orchestrator.send(event).unwrap();
    assert_eq!(outcome.status, SendStatus::Deferred);
    assert_eq!(h.queue.len(None), 0);

    // window_seconds = 0: the bucket is already closed
    tokio::time::sleep(Duration::from_millis(20)).await;
    let dispatched = h.orchestrator.run_scheduler_tick();
    assert_eq!(dispatched, 1);
    assert_eq!(h.queue.len(None), 1);
}
