//! Audit Log
//!
//! In-memory ring of audit records: authentication outcomes, key and role
//! changes, workflow CRUD, and every run transition (bridged from the run
//! event bus). Capped; oldest entries are evicted first.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use nx_workflow::{RunEventBus, RunEventKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub tenant_id: String,
    pub actor: String,
    pub action: String,
    pub entity_id: String,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

pub struct AuditLog {
    records: Mutex<VecDeque<AuditRecord>>,
    max_records: usize,
}

impl AuditLog {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            max_records,
        }
    }

    pub fn record(
        &self,
        tenant_id: &str,
        actor: &str,
        action: &str,
        entity_id: &str,
        detail: Option<serde_json::Value>,
    ) {
        let mut records = self.records.lock();
        if records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back(AuditRecord {
            at: Utc::now(),
            tenant_id: tenant_id.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            entity_id: entity_id.to_string(),
            detail,
        });
    }

    /// Records for one tenant, newest first.
    pub fn list(&self, tenant_id: &str, limit: usize) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .filter(|r| r.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Bridge run transitions from the event bus into the audit log. Runs until
/// the bus closes.
pub fn spawn_run_audit_bridge(audit: Arc<AuditLog>, bus: Arc<RunEventBus>) {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let audited = matches!(
                        event.kind,
                        RunEventKind::RunCreated
                            | RunEventKind::RunStarted
                            | RunEventKind::RunCompleted
                            | RunEventKind::RunFailed
                            | RunEventKind::RunCancelled
                    );
                    if audited {
                        audit.record(
                            &event.tenant_id,
                            "engine",
                            &format!("run.{:?}", event.kind),
                            &event.run_id,
                            Some(event.data.clone()),
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Audit bridge lagged behind run events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
