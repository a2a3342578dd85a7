//! REST API Tests
//!
//! Drives the full router with tower::oneshot over an in-process service
//! graph (dev-mode auth, mock notification provider, real engine).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use nx_api::{create_router, ApiKeyStore, AppState, AuditLog};
use nx_common::{Channel, DeliveryResult, NotificationEvent, NotificationRecipient};
use nx_config::AppConfig;
use nx_limiter::RateLimiter;
use nx_orchestrator::{NotificationStore, Orchestrator, WorkerPool};
use nx_provider::{NotificationProvider, ProviderHealth, ProviderRegistry, ValidationResult};
use nx_queue::{DeadLetterStore, PriorityQueue};
use nx_registry::{
    AuthSpec, Compatibility, ConflictRules, ConnectorDependencies, ConnectorManifest,
    ConnectorRegistry, ConnectorType, DependencySpec,
};
use nx_rules::RuleEngine;
use nx_template::TemplateService;
use nx_workflow::adapters::{ManualTriggerAdapter, SetDataAdapter};
use nx_workflow::{
    AdapterRegistry, CredentialStore, InMemoryRunRepository, InMemoryWorkflowRepository,
    RunEventBus, WorkflowEngine,
};

struct OkProvider;

#[async_trait]
impl NotificationProvider for OkProvider {
    fn name(&self) -> &str {
        "ok"
    }
    fn channel(&self) -> Channel {
        Channel::Email
    }
    fn validate(&self, _: &NotificationEvent, r: &NotificationRecipient) -> ValidationResult {
        if r.email.is_some() {
            ValidationResult::ok()
        } else {
            ValidationResult::fail("no email")
        }
    }
    async fn send(&self, _: &NotificationEvent, _: &NotificationRecipient) -> DeliveryResult {
        DeliveryResult::delivered("ok-1")
    }
    async fn health(&self) -> ProviderHealth {
        ProviderHealth {
            name: "ok".into(),
            healthy: true,
            message: None,
        }
    }
}

fn manifest(id: &str, version: &str, connector_type: ConnectorType) -> ConnectorManifest {
    ConnectorManifest {
        id: id.into(),
        version: semver::Version::parse(version).unwrap(),
        connector_type,
        category: "test".into(),
        inputs: vec![],
        outputs: vec![],
        auth: AuthSpec::default(),
        dependencies: ConnectorDependencies::default(),
        conflict_rules: ConflictRules::default(),
        compatibility: Compatibility::default(),
    }
}

fn build_app(start_workers: bool) -> (Router, AppState) {
    let mut config = AppConfig::default();
    config.dev_mode = true;
    config.queue.poll_interval_ms = 10;
    config.retry.initial_delay_ms = 10;
    let config = Arc::new(config);

    let queue = Arc::new(PriorityQueue::new(10_000));
    let dlq = Arc::new(DeadLetterStore::new(1_000));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let rules = Arc::new(RuleEngine::new());
    let templates = Arc::new(TemplateService::new());
    let store = Arc::new(NotificationStore::new());

    let providers = Arc::new(ProviderRegistry::new());
    providers.register(Arc::new(OkProvider));

    let orchestrator = Arc::new(Orchestrator::new(
        queue.clone(),
        dlq.clone(),
        limiter.clone(),
        rules.clone(),
        templates.clone(),
        providers.clone(),
        store.clone(),
    ));

    let workers = Arc::new(WorkerPool::new(
        queue.clone(),
        dlq.clone(),
        providers.clone(),
        store.clone(),
        config.retry.clone(),
        config.queue.clone(),
        2,
    ));
    if start_workers {
        workers.start();
    }

    let connectors = Arc::new(ConnectorRegistry::new());
    connectors
        .insert(manifest("trigger.manual", "1.0.0", ConnectorType::Trigger))
        .unwrap();
    connectors
        .insert(manifest("data.set", "1.0.0", ConnectorType::Transform))
        .unwrap();

    let credentials = Arc::new(CredentialStore::new(&CredentialStore::generate_key()).unwrap());
    let adapters = Arc::new(AdapterRegistry::new());
    adapters.register(Arc::new(ManualTriggerAdapter));
    adapters.register(Arc::new(SetDataAdapter));

    let bus = Arc::new(RunEventBus::new(256));
    let engine = WorkflowEngine::new(
        Arc::new(InMemoryWorkflowRepository::new()),
        Arc::new(InMemoryRunRepository::new()),
        adapters,
        credentials.clone(),
        bus.clone(),
        config.engine.clone(),
    );

    let state = AppState {
        config,
        queue,
        dlq,
        limiter,
        rules,
        templates,
        providers,
        orchestrator,
        workers,
        connectors,
        credentials,
        engine,
        bus,
        api_keys: Arc::new(ApiKeyStore::new()),
        audit: Arc::new(AuditLog::new(1_000)),
    };

    (create_router(state.clone()), state)
}

async fn request(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_checks() {
    let (app, _) = build_app(false);
    let (status, body) = request(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Healthy");
    assert!(body["checks"].as_array().unwrap().len() >= 2);

    let (status, _) = request(&app, "GET", "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn notification_ingest_status_and_ack() {
    let (app, state) = build_app(true);

    let (status, body) = request(
        &app,
        "POST",
        "/api/notifications",
        Some(json!({
            "id": "n1",
            "tenantId": "ignored-by-auth",
            "eventType": "welcome",
            "priority": "Normal",
            "subject": "Hi",
            "content": "Hello {{name}}",
            "recipients": [{"id": "r1", "email": "a@x", "metadata": {"name": "A"}}],
            "preferredChannels": ["email"],
            "createdAt": chrono::Utc::now(),
            "source": "test"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["notificationId"], "n1");
    assert_eq!(body["perTargetResults"][0]["enqueued"], true);

    // wait for the worker to deliver
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (_, body) = request(&app, "GET", "/api/notifications/n1", None).await;
        if body["status"] == "Delivered" {
            assert_eq!(body["targets"][0]["status"], "Delivered");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "delivery timed out");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (status, _) = request(&app, "POST", "/api/notifications/n1/ack", Some(json!({"by": "ops"}))).await;
    assert_eq!(status, StatusCode::OK);
    // idempotent
    let (status, _) = request(&app, "POST", "/api/notifications/n1/ack", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, record) = request(&app, "GET", "/api/notifications/n1", None).await;
    assert_eq!(record["status"], "Acknowledged");
    assert_eq!(record["acknowledgedBy"], "ops");

    state.workers.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn unknown_notification_is_404() {
    let (app, _) = build_app(false);
    let (status, _) = request(&app, "GET", "/api/notifications/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn workflow_crud_and_run() {
    let (app, _) = build_app(false);

    let workflow = json!({
        "id": "wf-1",
        "tenantId": "",
        "name": "set-data-flow",
        "version": 1,
        "nodes": [
            {"id": "start", "type": "trigger.manual"},
            {"id": "set", "type": "data.set",
             "config": {"assignments": [{"field": "greeting", "value": "hi {{who}}", "valueType": "string"}]}}
        ],
        "edges": [{"from": "start", "to": "set"}],
        "triggers": ["start"],
        "isActive": true,
        "createdAt": chrono::Utc::now(),
        "updatedAt": chrono::Utc::now()
    });

    let (status, _) = request(&app, "POST", "/api/workflows", Some(workflow)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = request(&app, "GET", "/api/workflows/wf-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "set-data-flow");

    let (status, body) = request(
        &app,
        "POST",
        "/api/workflows/wf-1/runs",
        Some(json!({"input": {"who": "world"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = body["runId"].as_str().unwrap().to_string();

    // poll until the run terminates
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let run = loop {
        let (_, run) = request(&app, "GET", &format!("/api/runs/{}", run_id), None).await;
        if run["status"] == "Completed" || run["status"] == "Failed" {
            break run;
        }
        assert!(tokio::time::Instant::now() < deadline, "run timed out");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(run["status"], "Completed");
    assert_eq!(run["output"]["set"]["greeting"], "hi world");

    let (status, nodes) = request(&app, "GET", &format!("/api/runs/{}/nodes", run_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(nodes.as_array().unwrap().len(), 2);

    // listing filters
    let (status, runs) = request(
        &app,
        "GET",
        "/api/workflows/wf-1/runs?status=Completed",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs.as_array().unwrap().len(), 1);

    // replay produces a fresh run
    let (status, body) = request(&app, "POST", &format!("/api/runs/{}/replay", run_id), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(body["runId"].as_str().unwrap(), run_id);

    let (status, _) = request(&app, "DELETE", "/api/workflows/wf-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn invalid_workflow_is_rejected() {
    let (app, _) = build_app(false);

    // no trigger node
    let workflow = json!({
        "id": "bad",
        "tenantId": "",
        "name": "bad",
        "version": 1,
        "nodes": [{"id": "set", "type": "data.set", "config": {"assignments": []}}],
        "edges": [],
        "triggers": [],
        "isActive": true,
        "createdAt": chrono::Utc::now(),
        "updatedAt": chrono::Utc::now()
    });
    let (status, body) = request(&app, "POST", "/api/workflows", Some(workflow)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn connector_resolution_preview() {
    let (app, state) = build_app(false);

    let mut a = manifest("A", "1.0.0", ConnectorType::Action);
    a.dependencies.peers.push(DependencySpec {
        id: "B".into(),
        range: ">=1.0.0, <2.0.0".into(),
    });
    state.connectors.insert(a).unwrap();
    state
        .connectors
        .insert(manifest("B", "1.2.0", ConnectorType::Action))
        .unwrap();
    state
        .connectors
        .insert(manifest("B", "2.0.0", ConnectorType::Action))
        .unwrap();

    let (status, body) = request(
        &app,
        "POST",
        "/api/connectors/resolve",
        Some(json!({"requirements": {"A": "*"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["resolvedVersions"]["A"], "1.0.0");
    assert_eq!(body["resolvedVersions"]["B"], "1.2.0");

    // a conflicting lockfile pin fails resolution but still answers 200
    let (status, body) = request(
        &app,
        "POST",
        "/api/connectors/resolve",
        Some(json!({"requirements": {"A": "*"}, "lockfile": {"B": "2.0.0"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["errorMessage"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn export_then_import_roundtrip() {
    let (app, _) = build_app(false);

    let workflow = json!({
        "id": "wf-exp",
        "tenantId": "",
        "name": "exportable",
        "version": 1,
        "nodes": [{"id": "start", "type": "trigger.manual"}],
        "edges": [],
        "triggers": ["start"],
        "isActive": true,
        "createdAt": chrono::Utc::now(),
        "updatedAt": chrono::Utc::now()
    });
    let (status, _) = request(&app, "POST", "/api/workflows", Some(workflow)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, mut document) =
        request(&app, "GET", "/api/workflows/wf-exp/export", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(document["connectors"][0]["id"], "trigger.manual");
    assert_eq!(document["lockfile"]["trigger.manual"], "1.0.0");

    // re-import under a new id
    document["workflow"]["id"] = json!("wf-imported");
    let (status, body) = request(&app, "POST", "/api/workflows/import", Some(document)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["workflowId"], "wf-imported");
    assert_eq!(body["resolvedVersions"]["trigger.manual"], "1.0.0");
}

#[tokio::test]
async fn queue_stats_and_dlq_endpoints() {
    let (app, _) = build_app(false);

    let (status, stats) = request(&app, "GET", "/api/queue/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["inFlight"], 0);

    let (status, entries) = request(&app, "GET", "/api/dlq", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entries.as_array().unwrap().len(), 0);
}
