//! Shared API State
//!
//! The singleton service graph handed to every handler. Built once by the
//! composition root; everything is `Arc`-shared, nothing is constructed per
//! request.

use std::sync::Arc;

use nx_config::AppConfig;
use nx_limiter::RateLimiter;
use nx_orchestrator::{Orchestrator, WorkerPool};
use nx_provider::ProviderRegistry;
use nx_queue::{DeadLetterStore, PriorityQueue};
use nx_registry::ConnectorRegistry;
use nx_rules::RuleEngine;
use nx_template::TemplateService;
use nx_workflow::{CredentialStore, RunEventBus, WorkflowEngine};

use crate::audit::AuditLog;
use crate::auth::ApiKeyStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub queue: Arc<PriorityQueue>,
    pub dlq: Arc<DeadLetterStore>,
    pub limiter: Arc<RateLimiter>,
    pub rules: Arc<RuleEngine>,
    pub templates: Arc<TemplateService>,
    pub providers: Arc<ProviderRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub workers: Arc<WorkerPool>,
    pub connectors: Arc<ConnectorRegistry>,
    pub credentials: Arc<CredentialStore>,
    pub engine: Arc<WorkflowEngine>,
    pub bus: Arc<RunEventBus>,
    pub api_keys: Arc<ApiKeyStore>,
    pub audit: Arc<AuditLog>,
}
