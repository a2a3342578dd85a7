//! Template Service
//!
//! Stores per-tenant per-channel templates and renders them with `{{path}}`
//! substitution. Token resolution walks event metadata first, then recipient
//! fields; a missing token renders as the empty string and produces a
//! warning, never a failure. Rendering is side-effect-free.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use nx_common::substitution::substitute;
use nx_common::{Channel, NotificationEvent, NotificationRecipient};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Template validation failed: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, TemplateError>;

/// A stored message template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub tenant_id: String,
    pub id: String,
    pub channel: Channel,
    #[serde(default)]
    pub subject_template: Option<String>,
    pub body_template: String,
    /// Declared variables, for canvas hints; not enforced at render time
    #[serde(default)]
    pub variables: Vec<String>,
}

/// Output of one render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub body: String,
    pub warnings: Vec<String>,
}

/// In-memory template store keyed by `(tenant, channel)`.
pub struct TemplateService {
    templates: DashMap<(String, Channel), Vec<Template>>,
}

impl TemplateService {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
        }
    }

    /// Insert or replace a template (matched by id within its tenant+channel
    /// list).
    pub fn upsert(&self, template: Template) -> Result<()> {
        if template.id.is_empty() {
            return Err(TemplateError::Invalid("template id must not be empty".into()));
        }
        if template.body_template.is_empty() {
            return Err(TemplateError::Invalid("body template must not be empty".into()));
        }
        let key = (template.tenant_id.clone(), template.channel);
        let mut list = self.templates.entry(key).or_default();
        match list.iter_mut().find(|t| t.id == template.id) {
            Some(existing) => *existing = template,
            None => list.push(template),
        }
        Ok(())
    }

    pub fn get(&self, tenant_id: &str, template_id: &str) -> Option<Template> {
        for entry in self.templates.iter() {
            if entry.key().0 == tenant_id {
                if let Some(t) = entry.value().iter().find(|t| t.id == template_id) {
                    return Some(t.clone());
                }
            }
        }
        None
    }

    pub fn list(&self, tenant_id: &str, channel: Option<Channel>) -> Vec<Template> {
        self.templates
            .iter()
            .filter(|entry| {
                entry.key().0 == tenant_id && channel.map(|c| entry.key().1 == c).unwrap_or(true)
            })
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    pub fn delete(&self, tenant_id: &str, template_id: &str) -> bool {
        for mut entry in self.templates.iter_mut() {
            if entry.key().0 == tenant_id {
                let before = entry.value().len();
                entry.value_mut().retain(|t| t.id != template_id);
                if entry.value().len() != before {
                    return true;
                }
            }
        }
        false
    }

    /// Render a stored template against an event and recipient.
    pub fn render(
        &self,
        event: &NotificationEvent,
        recipient: &NotificationRecipient,
        template_id: &str,
    ) -> Result<RenderedMessage> {
        let template = self
            .get(&event.tenant_id, template_id)
            .ok_or_else(|| TemplateError::NotFound(template_id.to_string()))?;
        Ok(render_template(&template, event, recipient))
    }

    /// Render the event's inline subject/content when no template is stored.
    pub fn render_inline(
        &self,
        event: &NotificationEvent,
        recipient: &NotificationRecipient,
    ) -> RenderedMessage {
        let ctx = render_context(event, recipient);
        let mut warnings = Vec::new();

        let subject = event.subject.as_ref().map(|s| {
            let rendered = substitute(s, &ctx);
            warnings.extend(rendered.warnings);
            rendered.text
        });
        let body = event
            .content
            .as_ref()
            .map(|c| {
                let rendered = substitute(c, &ctx);
                warnings.extend(rendered.warnings);
                rendered.text
            })
            .unwrap_or_default();

        RenderedMessage { subject, body, warnings }
    }
}

impl Default for TemplateService {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure render of one template.
pub fn render_template(
    template: &Template,
    event: &NotificationEvent,
    recipient: &NotificationRecipient,
) -> RenderedMessage {
    let ctx = render_context(event, recipient);
    let mut warnings = Vec::new();

    let subject = template.subject_template.as_ref().map(|s| {
        let rendered = substitute(s, &ctx);
        warnings.extend(rendered.warnings);
        rendered.text
    });
    let body = {
        let rendered = substitute(&template.body_template, &ctx);
        warnings.extend(rendered.warnings);
        rendered.text
    };

    if !warnings.is_empty() {
        debug!(
            tenant_id = %event.tenant_id,
            template_id = %template.id,
            warnings = warnings.len(),
            "Template rendered with unresolved variables"
        );
    }

    RenderedMessage { subject, body, warnings }
}

/// Lookup context: recipient fields overlaid by event fields + metadata, so
/// event metadata wins on key collisions.
fn render_context(event: &NotificationEvent, recipient: &NotificationRecipient) -> serde_json::Value {
    let mut base = recipient.as_context();
    let overlay = event.as_context();
    if let (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) =
        (&mut base, overlay)
    {
        for (k, v) in overlay_map {
            base_map.insert(k, v);
        }
    }
    base
}
