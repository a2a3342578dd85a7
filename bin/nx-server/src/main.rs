//! NotifyX Server
//!
//! Composition root: builds the singleton service graph (queue, limiter,
//! rules, templates, providers, orchestrator, worker pool, connector
//! registry, credential store, workflow engine, event bus), wires the REST
//! API, and handles graceful shutdown.
//!
//! Configuration comes from a TOML file plus `NOTIFYX__*` / `JWT__*`
//! environment overrides; see nx-config.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};

use nx_api::{create_router, spawn_run_audit_bridge, ApiKeyStore, AppState, AuditLog};
use nx_common::Principal;
use nx_config::AppConfig;
use nx_limiter::RateLimiter;
use nx_orchestrator::{NotificationStore, Orchestrator, WorkerPool};
use nx_provider::{
    EmailProvider, ProviderRegistry, PushProvider, SlackProvider, SmsProvider, WebhookProvider,
};
use nx_queue::{DeadLetterStore, PriorityQueue};
use nx_registry::{
    AuthSpec, Compatibility, ConflictRules, ConnectorDependencies, ConnectorManifest,
    ConnectorRegistry, ConnectorType, InputSpec, PortType,
};
use nx_rules::RuleEngine;
use nx_template::TemplateService;
use nx_workflow::adapters::{
    DatabaseQueryAdapter, DeliveryStatusTriggerAdapter, HttpRequestAdapter, IfConditionAdapter,
    ManualTriggerAdapter, NotifySendAdapter, NullQueryExecutor, SetDataAdapter, SlackAdapter,
};
use nx_workflow::{AdapterRegistry, CredentialStore, RunEventBus, WorkflowEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // .env for local development
    let _ = dotenvy::dotenv();

    nx_common::logging::init_logging("nx-server");
    info!("Starting NotifyX server");

    // 1. Configuration
    let config = AppConfig::load()?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("configuration: {}", e))?;
    let config = Arc::new(config);

    // 2. Notification core
    let queue = Arc::new(PriorityQueue::new(config.queue.max_depth));
    let dlq = Arc::new(DeadLetterStore::new(config.queue.dlq_max_entries));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let rules = Arc::new(RuleEngine::new());
    let templates = Arc::new(TemplateService::new());
    let store = Arc::new(NotificationStore::new());

    let providers = Arc::new(ProviderRegistry::new());
    register_providers(&providers, &config);

    let orchestrator = Arc::new(Orchestrator::new(
        queue.clone(),
        dlq.clone(),
        limiter.clone(),
        rules.clone(),
        templates.clone(),
        providers.clone(),
        store.clone(),
    ));

    // 3. Worker pool
    let workers = Arc::new(WorkerPool::new(
        queue.clone(),
        dlq.clone(),
        providers.clone(),
        store.clone(),
        config.retry.clone(),
        config.queue.clone(),
        config.worker.effective_workers(),
    ));
    workers.start();

    // 4. Scheduler: escalations and aggregate flushes
    let scheduler = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let dispatched = orchestrator.run_scheduler_tick();
                if dispatched > 0 {
                    info!(dispatched, "Scheduler tick dispatched follow-up events");
                }
            }
        })
    };

    // 5. Workflow core
    let connectors = Arc::new(ConnectorRegistry::new());
    seed_builtin_connectors(&connectors);

    let encryption_key = std::env::var("NOTIFYX__SECRETS__ENCRYPTIONKEY").unwrap_or_else(|_| {
        if config.dev_mode {
            warn!("No encryption key configured, generating an ephemeral dev key");
            CredentialStore::generate_key()
        } else {
            String::new()
        }
    });
    let credentials = Arc::new(
        CredentialStore::new(&encryption_key)
            .map_err(|e| anyhow::anyhow!("credential store: {}", e))?,
    );

    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(Arc::new(ManualTriggerAdapter));
    adapters.register(Arc::new(DeliveryStatusTriggerAdapter));
    adapters.register(Arc::new(HttpRequestAdapter::new()));
    adapters.register(Arc::new(DatabaseQueryAdapter::new(Arc::new(NullQueryExecutor))));
    adapters.register(Arc::new(SlackAdapter::new()));
    adapters.register(Arc::new(SetDataAdapter));
    adapters.register(Arc::new(IfConditionAdapter));
    adapters.register(Arc::new(NotifySendAdapter::new(orchestrator.clone())));

    let bus = Arc::new(RunEventBus::new(config.engine.event_buffer));
    let engine = WorkflowEngine::new(
        Arc::new(nx_workflow::InMemoryWorkflowRepository::new()),
        Arc::new(nx_workflow::InMemoryRunRepository::new()),
        adapters,
        credentials.clone(),
        bus.clone(),
        config.engine.clone(),
    );

    // 6. API state
    let audit = Arc::new(AuditLog::new(10_000));
    spawn_run_audit_bridge(audit.clone(), bus.clone());

    let api_keys = Arc::new(ApiKeyStore::new());
    if let Ok(admin_key) = std::env::var("NOTIFYX__ADMIN_APIKEY") {
        let mut admin = Principal::new(config.default_tenant_id.clone(), "admin");
        admin.roles.insert("system-admin".into());
        admin.permissions.insert("audit:read".into());
        admin.permissions.insert("connectors:manage".into());
        api_keys.register(&admin_key, admin);
        info!("Admin API key registered from environment");
    }

    let state = AppState {
        config: config.clone(),
        queue: queue.clone(),
        dlq,
        limiter,
        rules,
        templates,
        providers,
        orchestrator,
        workers: workers.clone(),
        connectors,
        credentials,
        engine,
        bus,
        api_keys,
        audit,
    };

    // 7. Serve
    let app = create_router(state);
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, workers = config.worker.effective_workers(), "NotifyX server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 8. Drain
    info!("Shutdown signal received, draining");
    scheduler.abort();
    let clean = workers
        .stop(Duration::from_secs(config.worker.shutdown_timeout_secs))
        .await;
    if !clean {
        error!("Worker pool did not drain before the deadline");
    }
    info!(
        pending = queue.len(None),
        in_flight = queue.in_flight_len(),
        "NotifyX server shutdown complete"
    );
    Ok(())
}

/// Register channel providers from configuration. Providers with missing
/// mandatory settings are skipped (their channels simply have no sink).
fn register_providers(providers: &ProviderRegistry, config: &AppConfig) {
    let timeout = Duration::from_secs(config.provider.request_timeout_secs.max(5));

    match EmailProvider::new(&config.provider.smtp) {
        Ok(provider) => providers.register(Arc::new(provider)),
        Err(e) => warn!(error = %e, "Email provider disabled"),
    }
    match WebhookProvider::new(timeout, None) {
        Ok(provider) => providers.register(Arc::new(provider)),
        Err(e) => warn!(error = %e, "Webhook provider disabled"),
    }
    match SlackProvider::new(timeout) {
        Ok(provider) => providers.register(Arc::new(provider)),
        Err(e) => warn!(error = %e, "Slack provider disabled"),
    }
    match SmsProvider::new(config.provider.sms.clone(), timeout) {
        Ok(provider) => providers.register(Arc::new(provider)),
        Err(e) => warn!(error = %e, "SMS provider disabled"),
    }
    match PushProvider::new(config.provider.push.clone(), timeout) {
        Ok(provider) => providers.register(Arc::new(provider)),
        Err(e) => warn!(error = %e, "Push provider disabled"),
    }
}

/// Built-in connector manifests matching the shipped adapters, so saved
/// workflows validate out of the box.
fn seed_builtin_connectors(registry: &ConnectorRegistry) {
    let manifests = vec![
        manifest("trigger.manual", ConnectorType::Trigger, "core", vec![]),
        manifest(
            "notifyx.deliveryStatus",
            ConnectorType::Trigger,
            "notifyx",
            vec![],
        ),
        manifest(
            "http.request",
            ConnectorType::Action,
            "http",
            vec![required("url", PortType::String)],
        ),
        manifest(
            "db.query",
            ConnectorType::Action,
            "database",
            vec![required("query", PortType::String)],
        ),
        manifest(
            "slack.send",
            ConnectorType::Action,
            "messaging",
            vec![required("text", PortType::String)],
        ),
        manifest(
            "data.set",
            ConnectorType::Transform,
            "core",
            vec![required("assignments", PortType::Array)],
        ),
        manifest(
            "logic.if",
            ConnectorType::Transform,
            "core",
            vec![required("operator", PortType::String)],
        ),
        manifest(
            "notifyx.send",
            ConnectorType::Action,
            "notifyx",
            vec![required("eventType", PortType::String)],
        ),
    ];
    for m in manifests {
        if let Err(e) = registry.insert(m) {
            warn!(error = %e, "Builtin connector seed skipped");
        }
    }
}

fn manifest(
    id: &str,
    connector_type: ConnectorType,
    category: &str,
    inputs: Vec<InputSpec>,
) -> ConnectorManifest {
    ConnectorManifest {
        id: id.into(),
        version: semver::Version::new(1, 0, 0),
        connector_type,
        category: category.into(),
        inputs,
        outputs: vec![],
        auth: AuthSpec::default(),
        dependencies: ConnectorDependencies::default(),
        conflict_rules: ConflictRules::default(),
        compatibility: Compatibility::default(),
    }
}

fn required(name: &str, port_type: PortType) -> InputSpec {
    InputSpec {
        name: name.into(),
        required: true,
        port_type,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
