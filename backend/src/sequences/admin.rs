// Sequence Admin - builds and edits sequences outside the scheduling loop

use chrono::Utc;
use crm_shared::{Enrollment, Sequence, StepKind};
use std::sync::Arc;
use tracing::info;
use url::Url;
use uuid::Uuid;

use super::store::{EnrollmentStore, NewSequence};
use super::{SequenceError, SequenceResult};

#[derive(Clone)]
pub struct SequenceAdmin {
    store: Arc<dyn EnrollmentStore>,
}

impl SequenceAdmin {
    pub fn new(store: Arc<dyn EnrollmentStore>) -> Self {
        Self { store }
    }

    /// Validate and persist a sequence; steps are numbered 0..n in the order given.
    pub async fn create_sequence(&self, new: NewSequence) -> SequenceResult<Sequence> {
        if new.name.trim().is_empty() {
            return Err(SequenceError::Validation("Sequence name is required".to_string()));
        }
        self.validate_steps(&new.steps).await?;

        let new = NewSequence {
            name: new.name.trim().to_string(),
            ..new
        };
        let sequence = self.store.create_sequence(new, Utc::now()).await?;

        info!(
            "Created sequence {} ({}) with {} steps",
            sequence.id,
            sequence.name,
            sequence.step_count()
        );
        Ok(sequence)
    }

    /// Replace the full step list. Running enrollments keep their index, which
    /// now points into the new list.
    pub async fn replace_steps(&self, sequence_id: Uuid, steps: Vec<StepKind>) -> SequenceResult<Sequence> {
        self.validate_steps(&steps).await?;

        let sequence = self
            .store
            .replace_steps(sequence_id, steps, Utc::now())
            .await?
            .ok_or_else(|| SequenceError::NotFound(format!("Sequence {}", sequence_id)))?;

        info!("Replaced steps of sequence {} ({} steps)", sequence.id, sequence.step_count());
        Ok(sequence)
    }

    pub async fn get_sequence(&self, sequence_id: Uuid) -> SequenceResult<Sequence> {
        self.store
            .get_sequence(sequence_id)
            .await?
            .ok_or_else(|| SequenceError::NotFound(format!("Sequence {}", sequence_id)))
    }

    pub async fn list_enrollments(&self, sequence_id: Uuid) -> SequenceResult<Vec<Enrollment>> {
        // Surface a missing sequence as 404 rather than an empty list
        self.get_sequence(sequence_id).await?;
        self.store.list_enrollments(sequence_id).await
    }

    async fn validate_steps(&self, steps: &[StepKind]) -> SequenceResult<()> {
        let mut problems = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            match step {
                StepKind::Email { template_id: Some(id) } => {
                    if self.store.get_template(*id).await?.is_none() {
                        problems.push(format!("step {}: template {} does not exist", index, id));
                    }
                }
                StepKind::Email { template_id: None } => {}
                StepKind::Delay { delay_minutes } if *delay_minutes < 0 => {
                    problems.push(format!("step {}: delay_minutes must not be negative", index));
                }
                StepKind::Delay { .. } => {}
                StepKind::WaitUntil { .. } => {}
                StepKind::Webhook { url } => {
                    if let Err(reason) = check_webhook_url(url) {
                        problems.push(format!("step {}: {}", index, reason));
                    }
                }
                StepKind::Condition { branch: Some(rule) } => {
                    if rule.then_step_index < 0 || rule.else_step_index < 0 {
                        problems.push(format!("step {}: branch indices must not be negative", index));
                    }
                }
                StepKind::Condition { branch: None } => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SequenceError::Validation(problems.join("; ")))
        }
    }
}

fn check_webhook_url(raw: &str) -> Result<(), String> {
    let parsed = Url::parse(raw.trim()).map_err(|e| format!("invalid webhook url: {}", e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("webhook url scheme must be http or https, got {}", other)),
    }
}
