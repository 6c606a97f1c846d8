//! Delivery channels used by sequence steps.
//!
//! Both channels bound their calls with a timeout. Email failures propagate to
//! the poller; webhook failures are logged by the executor and never block.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_shared::Enrollment;
use std::time::Duration;

use super::{SequenceError, SequenceResult};

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    /// Sender overrides; the transport default is used when absent.
    pub from_name: Option<String>,
    pub from_email: Option<String>,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, email: &OutboundEmail) -> SequenceResult<()>;
}

#[async_trait]
pub trait WebhookCaller: Send + Sync {
    async fn post_webhook(&self, url: &str, body: &serde_json::Value) -> SequenceResult<()>;
}

pub const WEBHOOK_EVENT: &str = "sequence.step.webhook";

/// Body POSTed by webhook steps
pub fn webhook_body(enrollment: &Enrollment, step_index: i32, timestamp: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "event": WEBHOOK_EVENT,
        "enrollment_id": enrollment.id,
        "sequence_id": enrollment.sequence_id,
        "lead_id": enrollment.lead_id,
        "contact_id": enrollment.contact_id,
        "step_index": step_index,
        "timestamp": timestamp,
    })
}

pub struct HttpWebhookCaller {
    client: reqwest::Client,
}

impl HttpWebhookCaller {
    pub fn new(timeout: Duration) -> SequenceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crm-sequences/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SequenceError::Configuration(format!("webhook client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookCaller for HttpWebhookCaller {
    async fn post_webhook(&self, url: &str, body: &serde_json::Value) -> SequenceResult<()> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SequenceError::Delivery(format!("webhook {} timed out", url))
                } else {
                    SequenceError::Delivery(format!("webhook {}: {}", url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SequenceError::Delivery(format!(
                "webhook {} responded with {}",
                url, status
            )));
        }

        Ok(())
    }
}
