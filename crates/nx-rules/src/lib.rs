//! Rule Engine
//!
//! Evaluates tenant rules against an ingested event. Rules are applied in
//! descending priority order (ties broken by id); later transforms see the
//! effect of earlier ones. Action semantics:
//! - `transform` merges metadata into the event
//! - `reroute` replaces the event's preferred channels
//! - `escalate` requests a delayed follow-up, cancelled on acknowledgement
//! - `aggregate` registers the event in a `(tenant, key)` window bucket and
//!   defers it; the bucket flushes as one synthesized event
//! - `suppress` discards the event

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use nx_common::expr::Expr;
use nx_common::substitution::substitute;
use nx_common::{Channel, NotificationEvent, NotificationRecipient};

pub mod aggregate;

pub use aggregate::AggregationBuckets;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Invalid rule: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, RuleError>;

/// One rule action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    #[serde(rename_all = "camelCase")]
    Transform {
        metadata: std::collections::HashMap<String, serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    Escalate {
        after_seconds: u64,
        to_recipients: Vec<NotificationRecipient>,
    },
    #[serde(rename_all = "camelCase")]
    Aggregate {
        /// May contain `{{path}}` tokens, resolved against the event
        key: String,
        window_seconds: u64,
    },
    Suppress,
    #[serde(rename_all = "camelCase")]
    Reroute { channel: Channel },
}

/// A tenant rule: predicate expression plus ordered actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub tenant_id: String,
    pub id: String,
    pub priority: i32,
    pub predicate: String,
    pub actions: Vec<RuleAction>,
}

/// Final disposition after rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Send,
    Suppress,
    Defer,
}

/// A requested escalation, scheduled by the orchestrator and cancelled when
/// the original notification is acknowledged.
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    pub original_event_id: String,
    pub tenant_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub recipients: Vec<NotificationRecipient>,
}

/// Outcome of evaluating one event.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub matched_rules: Vec<String>,
    pub event: NotificationEvent,
    pub verdict: Verdict,
    pub escalations: Vec<EscalationRequest>,
}

/// In-memory rule store + evaluator.
pub struct RuleEngine {
    rules: DashMap<String, Vec<Rule>>,
    buckets: AggregationBuckets,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            buckets: AggregationBuckets::new(),
        }
    }

    pub fn upsert(&self, rule: Rule) -> Result<()> {
        if rule.id.is_empty() {
            return Err(RuleError::Invalid("rule id must not be empty".into()));
        }
        // reject unparseable predicates at write time, not per event
        Expr::parse(&rule.predicate)
            .map_err(|e| RuleError::Invalid(format!("bad predicate: {}", e)))?;

        let mut list = self.rules.entry(rule.tenant_id.clone()).or_default();
        match list.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => list.push(rule),
        }
        Ok(())
    }

    pub fn get(&self, tenant_id: &str, rule_id: &str) -> Option<Rule> {
        self.rules
            .get(tenant_id)
            .and_then(|list| list.iter().find(|r| r.id == rule_id).cloned())
    }

    pub fn list(&self, tenant_id: &str) -> Vec<Rule> {
        self.rules
            .get(tenant_id)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn delete(&self, tenant_id: &str, rule_id: &str) -> bool {
        if let Some(mut list) = self.rules.get_mut(tenant_id) {
            let before = list.len();
            list.retain(|r| r.id != rule_id);
            return list.len() != before;
        }
        false
    }

    /// Evaluate all tenant rules against an event.
    ///
    /// Suppress and aggregate are terminal for the evaluation pass; transform
    /// and reroute mutate the working copy that later rules (and the
    /// returned evaluation) see.
    pub fn evaluate(&self, event: &NotificationEvent) -> Evaluation {
        let mut rules = self.list(&event.tenant_id);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        let mut working = event.clone();
        let mut matched = Vec::new();
        let mut escalations = Vec::new();

        for rule in &rules {
            let ctx = working.as_context();
            let holds = match Expr::parse(&rule.predicate).and_then(|e| e.evaluate(&ctx)) {
                Ok(v) => v,
                Err(e) => {
                    // validated at upsert; only reachable for rules seeded
                    // around the store
                    warn!(
                        tenant_id = %rule.tenant_id,
                        rule_id = %rule.id,
                        error = %e,
                        "Skipping rule with unevaluable predicate"
                    );
                    false
                }
            };
            if !holds {
                continue;
            }

            matched.push(rule.id.clone());
            debug!(
                tenant_id = %rule.tenant_id,
                rule_id = %rule.id,
                event_id = %working.id,
                "Rule matched"
            );

            for action in &rule.actions {
                match action {
                    RuleAction::Transform { metadata } => {
                        for (k, v) in metadata {
                            working.metadata.insert(k.clone(), v.clone());
                        }
                    }
                    RuleAction::Reroute { channel } => {
                        working.preferred_channels = vec![*channel];
                    }
                    RuleAction::Escalate { after_seconds, to_recipients } => {
                        escalations.push(EscalationRequest {
                            original_event_id: working.id.clone(),
                            tenant_id: working.tenant_id.clone(),
                            scheduled_for: Utc::now() + chrono::Duration::seconds(*after_seconds as i64),
                            recipients: to_recipients.clone(),
                        });
                    }
                    // a flushed bucket product must not re-enter a bucket
                    RuleAction::Aggregate { .. }
                        if working.metadata.contains_key("aggregateCount") => {}
                    RuleAction::Aggregate { key, window_seconds } => {
                        let resolved = substitute(key, &working.as_context()).text;
                        self.buckets.register(&working, &resolved, *window_seconds);
                        return Evaluation {
                            matched_rules: matched,
                            event: working,
                            verdict: Verdict::Defer,
                            escalations,
                        };
                    }
                    RuleAction::Suppress => {
                        return Evaluation {
                            matched_rules: matched,
                            event: working,
                            verdict: Verdict::Suppress,
                            escalations: Vec::new(),
                        };
                    }
                }
            }
        }

        Evaluation {
            matched_rules: matched,
            event: working,
            verdict: Verdict::Send,
            escalations,
        }
    }

    /// Aggregation buckets whose windows have closed, flushed as synthesized
    /// events. Driven by the orchestrator's scheduler tick.
    pub fn drain_expired_aggregates(&self, now: DateTime<Utc>) -> Vec<NotificationEvent> {
        self.buckets.drain_expired(now)
    }

    pub fn pending_aggregates(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn event(event_type: &str) -> NotificationEvent {
        NotificationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: "t1".into(),
            event_type: event_type.into(),
            priority: Default::default(),
            subject: None,
            content: None,
            title: None,
            icon_url: None,
            action_url: None,
            recipients: vec![],
            preferred_channels: vec![Channel::Email],
            scheduled_for: None,
            correlation_id: None,
            source: "test".into(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            template_id: None,
        }
    }

    fn rule(id: &str, priority: i32, predicate: &str, actions: Vec<RuleAction>) -> Rule {
        Rule {
            tenant_id: "t1".into(),
            id: id.into(),
            priority,
            predicate: predicate.into(),
            actions,
        }
    }

    #[test]
    fn suppress_discards_matching_events() {
        let engine = RuleEngine::new();
        engine
            .upsert(rule("noise-filter", 10, "eventType == \"noise\"", vec![RuleAction::Suppress]))
            .unwrap();

        let evaluation = engine.evaluate(&event("noise"));
        assert_eq!(evaluation.verdict, Verdict::Suppress);
        assert_eq!(evaluation.matched_rules, vec!["noise-filter"]);

        let evaluation = engine.evaluate(&event("signal"));
        assert_eq!(evaluation.verdict, Verdict::Send);
        assert!(evaluation.matched_rules.is_empty());
    }

    #[test]
    fn transforms_compose_in_priority_order() {
        let engine = RuleEngine::new();
        engine
            .upsert(rule(
                "first",
                100,
                "eventType == \"x\"",
                vec![RuleAction::Transform {
                    metadata: HashMap::from([("stage".to_string(), serde_json::json!("one"))]),
                }],
            ))
            .unwrap();
        // lower priority rule only matches once the first transform ran
        engine
            .upsert(rule(
                "second",
                50,
                "stage == \"one\"",
                vec![RuleAction::Transform {
                    metadata: HashMap::from([("stage".to_string(), serde_json::json!("two"))]),
                }],
            ))
            .unwrap();

        let evaluation = engine.evaluate(&event("x"));
        assert_eq!(evaluation.verdict, Verdict::Send);
        assert_eq!(evaluation.matched_rules, vec!["first", "second"]);
        assert_eq!(evaluation.event.metadata["stage"], "two");
    }

    #[test]
    fn reroute_replaces_channels() {
        let engine = RuleEngine::new();
        engine
            .upsert(rule(
                "to-slack",
                1,
                "eventType == \"alert\"",
                vec![RuleAction::Reroute { channel: Channel::Slack }],
            ))
            .unwrap();

        let evaluation = engine.evaluate(&event("alert"));
        assert_eq!(evaluation.event.preferred_channels, vec![Channel::Slack]);
    }

    #[test]
    fn escalation_is_requested_with_future_schedule() {
        let engine = RuleEngine::new();
        engine
            .upsert(rule(
                "escalate",
                1,
                "eventType == \"incident\"",
                vec![RuleAction::Escalate {
                    after_seconds: 300,
                    to_recipients: vec![NotificationRecipient {
                        id: "oncall".into(),
                        email: Some("oncall@x".into()),
                        ..Default::default()
                    }],
                }],
            ))
            .unwrap();

        let evaluation = engine.evaluate(&event("incident"));
        assert_eq!(evaluation.verdict, Verdict::Send);
        assert_eq!(evaluation.escalations.len(), 1);
        let escalation = &evaluation.escalations[0];
        assert!(escalation.scheduled_for > Utc::now() + chrono::Duration::seconds(250));
        assert_eq!(escalation.recipients[0].id, "oncall");
    }

    #[test]
    fn aggregate_defers_and_flushes_one_event() {
        let engine = RuleEngine::new();
        engine
            .upsert(rule(
                "batch",
                1,
                "eventType == \"digest\"",
                vec![RuleAction::Aggregate { key: "{{eventType}}".into(), window_seconds: 60 }],
            ))
            .unwrap();

        for _ in 0..3 {
            let evaluation = engine.evaluate(&event("digest"));
            assert_eq!(evaluation.verdict, Verdict::Defer);
        }
        assert_eq!(engine.pending_aggregates(), 1);

        // window not yet closed
        assert!(engine.drain_expired_aggregates(Utc::now()).is_empty());

        let flushed = engine.drain_expired_aggregates(Utc::now() + chrono::Duration::seconds(120));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].metadata["aggregateCount"], 3);
        assert_eq!(engine.pending_aggregates(), 0);
    }

    #[test]
    fn bad_predicate_rejected_at_upsert() {
        let engine = RuleEngine::new();
        let result = engine.upsert(rule("broken", 1, "eventType ==", vec![RuleAction::Suppress]));
        assert!(matches!(result, Err(RuleError::Invalid(_))));
    }
}
