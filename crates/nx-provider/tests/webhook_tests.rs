//! Webhook / Slack Provider Tests
//!
//! Exercises HTTP status classification and payload signing against a mock
//! server.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nx_common::{Channel, NotificationEvent, NotificationRecipient};
use nx_provider::{NotificationProvider, SlackProvider, WebhookProvider};

fn event() -> NotificationEvent {
    NotificationEvent {
        id: "n1".into(),
        tenant_id: "t1".into(),
        event_type: "welcome".into(),
        priority: Default::default(),
        subject: Some("Hi".into()),
        content: Some("Hello A".into()),
        title: None,
        icon_url: None,
        action_url: None,
        recipients: vec![],
        preferred_channels: vec![Channel::Webhook],
        scheduled_for: None,
        correlation_id: None,
        source: "test".into(),
        metadata: HashMap::new(),
        created_at: Utc::now(),
        template_id: None,
    }
}

fn recipient(url: String) -> NotificationRecipient {
    NotificationRecipient {
        id: "r1".into(),
        webhook_url: Some(url),
        ..Default::default()
    }
}

#[tokio::test]
async fn webhook_2xx_is_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let provider = WebhookProvider::new(Duration::from_secs(5), None).unwrap();
    let result = provider
        .send(&event(), &recipient(format!("{}/hook", server.uri())))
        .await;

    assert!(result.success);
    assert!(!result.retryable);
    assert!(result.provider_message_id.is_some());
}

#[tokio::test]
async fn webhook_5xx_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let provider = WebhookProvider::new(Duration::from_secs(5), None).unwrap();
    let result = provider
        .send(&event(), &recipient(format!("{}/hook", server.uri())))
        .await;

    assert!(!result.success);
    assert!(result.retryable);
    assert_eq!(result.error_code.as_deref(), Some("HTTP_503"));
}

#[tokio::test]
async fn webhook_404_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let provider = WebhookProvider::new(Duration::from_secs(5), None).unwrap();
    let result = provider
        .send(&event(), &recipient(format!("{}/hook", server.uri())))
        .await;

    assert!(!result.success);
    assert!(!result.retryable);
}

#[tokio::test]
async fn webhook_429_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let provider = WebhookProvider::new(Duration::from_secs(5), None).unwrap();
    let result = provider
        .send(&event(), &recipient(format!("{}/hook", server.uri())))
        .await;

    assert!(result.retryable);
}

#[tokio::test]
async fn webhook_signing_adds_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("X-NOTIFYX-SIGNATURE"))
        .and(header_exists("X-NOTIFYX-TIMESTAMP"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let provider = WebhookProvider::new(Duration::from_secs(5), Some("secret".into())).unwrap();
    let result = provider
        .send(&event(), &recipient(format!("{}/hook", server.uri())))
        .await;

    assert!(result.success);
}

#[tokio::test]
async fn webhook_connection_refused_is_retryable() {
    let provider = WebhookProvider::new(Duration::from_secs(1), None).unwrap();
    let result = provider
        .send(&event(), &recipient("http://127.0.0.1:1/hook".into()))
        .await;

    assert!(!result.success);
    assert!(result.retryable);
}

#[tokio::test]
async fn slack_success_and_permanent_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let provider = SlackProvider::new(Duration::from_secs(5)).unwrap();

    let ok = provider
        .send(&event(), &recipient(format!("{}/ok", server.uri())))
        .await;
    assert!(ok.success);

    let bad = provider
        .send(&event(), &recipient(format!("{}/bad", server.uri())))
        .await;
    assert!(!bad.success);
    assert!(!bad.retryable);
}
