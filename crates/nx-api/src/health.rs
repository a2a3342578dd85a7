//! Health Endpoints
//!
//! `GET /health`, `/health/ready`, `/health/live` with a checks array.
//! 200 for Healthy/Degraded, 503 for Unhealthy.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use std::time::Instant;

use nx_queue::QueueHealth;

use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,
    pub duration: f64,
    pub description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: CheckStatus,
    pub total_duration: f64,
    pub checks: Vec<HealthCheck>,
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        let code = if self.status == CheckStatus::Unhealthy {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };
        (code, Json(self)).into_response()
    }
}

pub async fn health(State(state): State<AppState>) -> HealthReport {
    let start = Instant::now();
    let mut checks = Vec::new();

    // queue backlog
    let queue_start = Instant::now();
    let queue_status = match state.queue.health() {
        QueueHealth::Healthy => CheckStatus::Healthy,
        QueueHealth::Warning => CheckStatus::Degraded,
        QueueHealth::Degraded => CheckStatus::Unhealthy,
    };
    let stats = state.queue.stats();
    checks.push(HealthCheck {
        name: "queue".into(),
        status: queue_status,
        duration: queue_start.elapsed().as_secs_f64(),
        description: format!(
            "{} pending, {} in flight",
            stats.pending_total(),
            stats.in_flight
        ),
    });

    // dead letters are informational until the store fills
    let dlq_start = Instant::now();
    let dlq_len = state.dlq.len();
    checks.push(HealthCheck {
        name: "dead-letter-store".into(),
        status: CheckStatus::Healthy,
        duration: dlq_start.elapsed().as_secs_f64(),
        description: format!("{} entries", dlq_len),
    });

    // providers
    for provider in state.providers.health().await {
        checks.push(HealthCheck {
            name: format!("provider:{}", provider.name),
            status: if provider.healthy {
                CheckStatus::Healthy
            } else {
                CheckStatus::Degraded
            },
            duration: 0.0,
            description: provider.message.unwrap_or_else(|| "ok".into()),
        });
    }

    // worker pool
    checks.push(HealthCheck {
        name: "workers".into(),
        status: CheckStatus::Healthy,
        duration: 0.0,
        description: format!("{} active", state.workers.active_workers()),
    });

    // rate limiter throughput
    let limiter = state.limiter.stats();
    checks.push(HealthCheck {
        name: "rate-limiter".into(),
        status: CheckStatus::Healthy,
        duration: 0.0,
        description: format!(
            "{} accepted, {} rejected, {} buckets",
            limiter.accepted, limiter.rejected, limiter.active_buckets
        ),
    });

    let status = overall(&checks);
    HealthReport {
        status,
        total_duration: start.elapsed().as_secs_f64(),
        checks,
    }
}

/// Readiness mirrors the full health report.
pub async fn ready(state: State<AppState>) -> HealthReport {
    health(state).await
}

/// Liveness: the process is serving requests.
pub async fn live() -> HealthReport {
    HealthReport {
        status: CheckStatus::Healthy,
        total_duration: 0.0,
        checks: vec![HealthCheck {
            name: "process".into(),
            status: CheckStatus::Healthy,
            duration: 0.0,
            description: "alive".into(),
        }],
    }
}

fn overall(checks: &[HealthCheck]) -> CheckStatus {
    if checks.iter().any(|c| c.status == CheckStatus::Unhealthy) {
        CheckStatus::Unhealthy
    } else if checks.iter().any(|c| c.status == CheckStatus::Degraded) {
        CheckStatus::Degraded
    } else {
        CheckStatus::Healthy
    }
}
