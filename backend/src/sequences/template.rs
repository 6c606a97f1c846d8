// Template rendering for sequence emails

use crm_shared::{ContactSnapshot, EmailTemplate, LeadSnapshot, Sequence};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

use super::SequenceResult;

pub type VariableBag = HashMap<String, String>;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
}

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &EmailTemplate, variables: &VariableBag) -> SequenceResult<RenderedEmail>;
}

/// Substitutes `{{name}}` placeholders. Unknown names are left exactly as written.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    pub fn new() -> Self {
        Self
    }

    fn substitute(&self, input: &str, variables: &VariableBag) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &Captures| match variables.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, template: &EmailTemplate, variables: &VariableBag) -> SequenceResult<RenderedEmail> {
        Ok(RenderedEmail {
            subject: self.substitute(&template.subject, variables),
            html: template.html_body.as_deref().map(|b| self.substitute(b, variables)),
            text: template.text_body.as_deref().map(|b| self.substitute(b, variables)),
        })
    }
}

/// Variables available to sequence templates, taken from the lead and contact snapshots.
pub fn variable_bag(sequence: &Sequence, lead: &LeadSnapshot, contact: &ContactSnapshot) -> VariableBag {
    let mut vars = VariableBag::new();

    vars.insert("sequence.name".to_string(), sequence.name.clone());
    vars.insert("lead.title".to_string(), lead.title.clone());
    if let Some(amount) = lead.amount {
        vars.insert("lead.amount".to_string(), amount.to_string());
    }
    if let Some(org) = &lead.organization_name {
        vars.insert("organization.name".to_string(), org.clone());
    }
    if let Some(name) = &lead.assignee_name {
        vars.insert("assignee.name".to_string(), name.clone());
    }
    if let Some(email) = &lead.assignee_email {
        vars.insert("assignee.email".to_string(), email.clone());
    }

    if let Some(name) = &contact.name {
        vars.insert("contact.name".to_string(), name.clone());
    }
    if let Some(first) = contact.first_name() {
        vars.insert("contact.first_name".to_string(), first.to_string());
    }
    if let Some(email) = contact.deliverable_address() {
        vars.insert("contact.email".to_string(), email.to_string());
    }

    if let Some(fields) = lead.custom_fields.as_object() {
        for (key, value) in fields {
            let rendered = match value {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.insert(format!("custom.{}", key), rendered);
        }
    }

    vars
}
