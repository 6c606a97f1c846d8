// Step Executor - advances one enrollment through its sequence

use chrono::{DateTime, Duration, Utc};
use crm_shared::{ContactSnapshot, Enrollment, LeadSnapshot, Sequence, StepKind};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::delivery::{webhook_body, EmailSender, OutboundEmail, WebhookCaller};
use super::store::{EnrollmentStore, NewEmailActivity, Transition};
use super::template::{variable_bag, TemplateRenderer};
use super::wait_until;
use super::{SequenceError, SequenceResult};
use crate::config::SequenceConfig;

/// Leads carrying this tag (any casing) are never emailed again.
pub const DO_NOT_EMAIL_TAG: &str = "do not email";

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub email_throttle: Duration,
    pub email_timeout: std::time::Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&SequenceConfig::default())
    }
}

impl From<&SequenceConfig> for ExecutorSettings {
    fn from(config: &SequenceConfig) -> Self {
        Self {
            email_throttle: config.email_throttle(),
            email_timeout: config.email_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    LeadClosed,
    DoNotEmail,
    SequenceExhausted,
    Unsubscribed,
    NoEmailAddress,
    /// The sequence, lead or contact no longer exists
    MissingRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Not due, not active, or finished concurrently; nothing was written
    Skipped,
    Advanced { enrollment: Enrollment, email_sent: bool },
    /// Waiting at the same step with a new `next_step_at`
    Rescheduled { enrollment: Enrollment },
    Completed { enrollment: Enrollment, reason: CompletionReason },
}

impl StepOutcome {
    pub fn enrollment(&self) -> Option<&Enrollment> {
        match self {
            StepOutcome::Skipped => None,
            StepOutcome::Advanced { enrollment, .. }
            | StepOutcome::Rescheduled { enrollment }
            | StepOutcome::Completed { enrollment, .. } => Some(enrollment),
        }
    }
}

/// When the step at `index` becomes due if the cursor lands on it at `now`.
///
/// Delays start counting on arrival and wait-until steps resolve on arrival;
/// every other step (or no step at all) is due immediately.
pub fn due_time_for(sequence: &Sequence, index: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match sequence.step_at(index).map(|s| &s.kind) {
        Some(StepKind::Delay { delay_minutes }) => Some(now + Duration::minutes((*delay_minutes).max(0))),
        Some(StepKind::WaitUntil { condition }) => wait_until::resolve(condition, now),
        _ => None,
    }
}

#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn EnrollmentStore>,
    renderer: Arc<dyn TemplateRenderer>,
    email: Arc<dyn EmailSender>,
    webhooks: Arc<dyn WebhookCaller>,
    settings: ExecutorSettings,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn EnrollmentStore>,
        renderer: Arc<dyn TemplateRenderer>,
        email: Arc<dyn EmailSender>,
        webhooks: Arc<dyn WebhookCaller>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            renderer,
            email,
            webhooks,
            settings,
        }
    }

    /// Run the enrollment forward from `now`.
    ///
    /// Structural steps (delay, condition, a passed wait-until) chain into the next
    /// step while the enrollment stays due; an email or webhook step always ends
    /// the run, so a contact gets at most one email per invocation.
    pub async fn execute(&self, enrollment: Enrollment, now: DateTime<Utc>) -> SequenceResult<StepOutcome> {
        if !enrollment.is_due(now) {
            return Ok(StepOutcome::Skipped);
        }

        let Some(sequence) = self.store.get_sequence(enrollment.sequence_id).await? else {
            warn!("Sequence {} for enrollment {} no longer exists", enrollment.sequence_id, enrollment.id);
            return self.complete(&enrollment, CompletionReason::MissingRecord, now).await;
        };

        let Some(lead) = self.store.get_lead(enrollment.lead_id).await? else {
            warn!("Lead {} for enrollment {} no longer exists", enrollment.lead_id, enrollment.id);
            return self.complete(&enrollment, CompletionReason::MissingRecord, now).await;
        };

        let mut current = enrollment;
        let mut outcome = StepOutcome::Skipped;

        // A condition may jump backwards; never walk more hops than there are steps
        for _ in 0..=sequence.step_count() {
            let (next, chains) = self.execute_step(&sequence, &lead, &current, now).await?;
            outcome = next;

            match &outcome {
                StepOutcome::Advanced { enrollment, .. } if chains && enrollment.is_due(now) => {
                    current = enrollment.clone();
                }
                _ => return Ok(outcome),
            }
        }

        debug!("Enrollment {} hit the structural step limit for this run", current.id);
        Ok(outcome)
    }

    /// Evaluate guards and dispatch the current step. The flag says whether the
    /// run may continue into the following step.
    async fn execute_step(
        &self,
        sequence: &Sequence,
        lead: &LeadSnapshot,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> SequenceResult<(StepOutcome, bool)> {
        if lead.is_closed() {
            return Ok((self.complete(enrollment, CompletionReason::LeadClosed, now).await?, false));
        }

        if lead.has_tag_named(DO_NOT_EMAIL_TAG) {
            return Ok((self.complete(enrollment, CompletionReason::DoNotEmail, now).await?, false));
        }

        let index = enrollment.current_step_index;
        let Some(step) = sequence.step_at(index) else {
            return Ok((self.complete(enrollment, CompletionReason::SequenceExhausted, now).await?, false));
        };

        match &step.kind {
            StepKind::Delay { .. } => {
                let outcome = self.advance_to(sequence, enrollment, index + 1, now).await?;
                Ok((outcome, true))
            }
            StepKind::WaitUntil { condition } => {
                // First arrival without a resolved time: store it and come back later
                if enrollment.next_step_at.is_none() {
                    if let Some(at) = wait_until::resolve(condition, now) {
                        let outcome = self.reschedule(enrollment, at, now).await?;
                        return Ok((outcome, false));
                    }
                }
                let outcome = self.advance_to(sequence, enrollment, index + 1, now).await?;
                Ok((outcome, true))
            }
            StepKind::Email { template_id } => {
                let outcome = self.execute_email(sequence, lead, enrollment, *template_id, now).await?;
                Ok((outcome, false))
            }
            StepKind::Webhook { url } => {
                self.fire_webhook(enrollment, url, now).await;
                let outcome = self.advance_to(sequence, enrollment, index + 1, now).await?;
                Ok((outcome, false))
            }
            StepKind::Condition { branch } => {
                let target = match branch {
                    Some(rule) => {
                        let matched = lead.has_tag(rule.tag_id) == rule.present;
                        if matched { rule.then_step_index } else { rule.else_step_index }
                    }
                    None => index + 1,
                };

                if target < 0 {
                    return Err(SequenceError::InvalidStep(format!(
                        "condition step {} of sequence {} branches to index {}",
                        index, sequence.id, target
                    )));
                }

                debug!("Enrollment {} branching from step {} to {}", enrollment.id, index, target);
                let outcome = self.advance_to(sequence, enrollment, target, now).await?;
                Ok((outcome, true))
            }
        }
    }

    async fn execute_email(
        &self,
        sequence: &Sequence,
        lead: &LeadSnapshot,
        enrollment: &Enrollment,
        template_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> SequenceResult<StepOutcome> {
        let contact = match self.store.get_contact(enrollment.contact_id).await? {
            Some(contact) => contact,
            None => return self.complete(enrollment, CompletionReason::MissingRecord, now).await,
        };

        if contact.is_unsubscribed() {
            return self.complete(enrollment, CompletionReason::Unsubscribed, now).await;
        }

        let Some(address) = contact.deliverable_address() else {
            return self.complete(enrollment, CompletionReason::NoEmailAddress, now).await;
        };

        let index = enrollment.current_step_index;
        let template_id = template_id.ok_or_else(|| {
            SequenceError::Configuration(format!(
                "email step {} of sequence {} has no template bound",
                index, sequence.id
            ))
        })?;
        let template = self.store.get_template(template_id).await?.ok_or_else(|| {
            SequenceError::Configuration(format!(
                "email step {} of sequence {} references missing template {}",
                index, sequence.id, template_id
            ))
        })?;

        if let Some(last_sent) = self.store.last_email_sent_at(contact.id).await? {
            let resume_at = last_sent + self.settings.email_throttle;
            if resume_at > now {
                debug!(
                    "Contact {} emailed at {}, holding enrollment {} until {}",
                    contact.id, last_sent, enrollment.id, resume_at
                );
                return self.reschedule(enrollment, resume_at, now).await;
            }
        }

        let variables = variable_bag(sequence, lead, &contact);
        let rendered = self.renderer.render(&template, &variables)?;

        let email = OutboundEmail {
            to: address.to_string(),
            to_name: contact.name.clone(),
            subject: rendered.subject.clone(),
            html: rendered.html,
            text: rendered.text,
            from_name: sequence.from_name.clone(),
            from_email: sequence.from_email.clone(),
        };

        self.send_with_timeout(&email, &contact).await?;

        let activity = NewEmailActivity {
            enrollment_id: enrollment.id,
            lead_id: enrollment.lead_id,
            contact_id: contact.id,
            subject: rendered.subject,
            completed_at: now,
        };

        let next_index = index + 1;
        let transition = Transition::advance(next_index, due_time_for(sequence, next_index, now));

        info!(
            "Sent sequence email (step {}) for enrollment {} to contact {}",
            index, enrollment.id, contact.id
        );

        match self.store.apply_transition(enrollment.id, transition, Some(activity), now).await? {
            Some(updated) => Ok(StepOutcome::Advanced {
                enrollment: updated,
                email_sent: true,
            }),
            None => {
                warn!("Enrollment {} finished while its email was being sent", enrollment.id);
                Ok(StepOutcome::Skipped)
            }
        }
    }

    async fn send_with_timeout(&self, email: &OutboundEmail, contact: &ContactSnapshot) -> SequenceResult<()> {
        match tokio::time::timeout(self.settings.email_timeout, self.email.send_email(email)).await {
            Ok(result) => result,
            Err(_) => Err(SequenceError::Delivery(format!(
                "email to contact {} timed out after {:?}",
                contact.id, self.settings.email_timeout
            ))),
        }
    }

    /// Best-effort; failures are logged and never stop the enrollment.
    async fn fire_webhook(&self, enrollment: &Enrollment, url: &str, now: DateTime<Utc>) {
        if url.trim().is_empty() {
            warn!(
                "Webhook step {} for enrollment {} has no URL, skipping call",
                enrollment.current_step_index, enrollment.id
            );
            return;
        }

        let body = webhook_body(enrollment, enrollment.current_step_index, now);
        if let Err(e) = self.webhooks.post_webhook(url, &body).await {
            warn!("Webhook for enrollment {} failed: {}", enrollment.id, e);
        }
    }

    /// Move the cursor to `target` and schedule it by peeking at that step.
    async fn advance_to(
        &self,
        sequence: &Sequence,
        enrollment: &Enrollment,
        target: i32,
        now: DateTime<Utc>,
    ) -> SequenceResult<StepOutcome> {
        let transition = Transition::advance(target, due_time_for(sequence, target, now));

        Ok(match self.store.apply_transition(enrollment.id, transition, None, now).await? {
            Some(updated) => StepOutcome::Advanced {
                enrollment: updated,
                email_sent: false,
            },
            None => StepOutcome::Skipped,
        })
    }

    async fn reschedule(
        &self,
        enrollment: &Enrollment,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SequenceResult<StepOutcome> {
        let transition = Transition::advance(enrollment.current_step_index, Some(at));

        Ok(match self.store.apply_transition(enrollment.id, transition, None, now).await? {
            Some(updated) => StepOutcome::Rescheduled { enrollment: updated },
            None => StepOutcome::Skipped,
        })
    }

    async fn complete(
        &self,
        enrollment: &Enrollment,
        reason: CompletionReason,
        now: DateTime<Utc>,
    ) -> SequenceResult<StepOutcome> {
        let transition = Transition::complete(enrollment.current_step_index);

        Ok(match self.store.apply_transition(enrollment.id, transition, None, now).await? {
            Some(updated) => {
                info!("Enrollment {} completed ({:?})", enrollment.id, reason);
                StepOutcome::Completed {
                    enrollment: updated,
                    reason,
                }
            }
            None => StepOutcome::Skipped,
        })
    }
}
