//! Notification Orchestrator
//!
//! Ingest pipeline (rules, rate limiting, template rendering, target
//! fan-out), delivery worker pool with retry/backoff/DLQ policy, escalation
//! scheduling, and the notification record store.

pub mod escalation;
pub mod orchestrator;
pub mod store;
pub mod worker;

pub use escalation::EscalationSchedule;
pub use orchestrator::{Orchestrator, SendOutcome, SendStatus, TargetResult};
pub use store::{
    DeliveryAttempt, NotificationRecord, NotificationStore, TargetRecord, TargetStatus,
};
pub use worker::{backoff_delay, WorkerPool, WorkerStats};
