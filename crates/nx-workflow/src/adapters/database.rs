//! Database Query Adapter
//!
//! Config: `{ query, params? }`. The query is template-substituted, then
//! handed to the injected `QueryExecutor`: the SQL engine itself is a
//! persistence-layer collaborator behind this seam. Output:
//! `{ rows, rowCount }`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::adapter::{AdapterContext, ConnectorAdapter, ExecutionResult};
use crate::adapters::config_str;

/// The persistence seam the adapter talks to.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn query(&self, tenant_id: &str, sql: &str) -> Result<Vec<Value>, String>;
}

/// Default executor for deployments without a SQL collaborator: rejects
/// every query so misconfiguration is visible instead of silent.
pub struct NullQueryExecutor;

#[async_trait]
impl QueryExecutor for NullQueryExecutor {
    async fn query(&self, _tenant_id: &str, _sql: &str) -> Result<Vec<Value>, String> {
        Err("no database configured".to_string())
    }
}

pub struct DatabaseQueryAdapter {
    executor: Arc<dyn QueryExecutor>,
}

impl DatabaseQueryAdapter {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ConnectorAdapter for DatabaseQueryAdapter {
    fn connector_type(&self) -> &str {
        "db.query"
    }

    async fn execute(&self, context: AdapterContext) -> ExecutionResult {
        let start = Instant::now();

        let Some(sql) = config_str(&context.node_config, "query", &context.inputs) else {
            return ExecutionResult::fail(
                "db.query: 'query' is required",
                start.elapsed().as_millis() as u64,
            );
        };

        let result = tokio::select! {
            r = self.executor.query(&context.tenant_id, &sql) => r,
            _ = context.cancellation.wait() => {
                return ExecutionResult::cancelled(start.elapsed().as_millis() as u64);
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(rows) => {
                let row_count = rows.len();
                ExecutionResult::ok(json!({ "rows": rows, "rowCount": row_count }), duration_ms)
            }
            Err(e) => ExecutionResult::fail(format!("db.query: {}", e), duration_ms),
        }
    }
}
