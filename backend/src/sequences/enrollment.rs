// Enrollment API - creates and mutates enrollments outside the poll cycle

use chrono::{DateTime, Utc};
use crm_shared::{Enrollment, EnrollmentState};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::executor::due_time_for;
use super::store::{EnrollmentStore, NewEnrollment};
use super::{SequenceError, SequenceResult};

#[derive(Clone)]
pub struct EnrollmentService {
    store: Arc<dyn EnrollmentStore>,
}

impl EnrollmentService {
    pub fn new(store: Arc<dyn EnrollmentStore>) -> Self {
        Self { store }
    }

    pub async fn enroll(&self, sequence_id: Uuid, lead_id: Uuid, contact_id: Uuid) -> SequenceResult<Enrollment> {
        self.enroll_at(sequence_id, lead_id, contact_id, Utc::now()).await
    }

    /// Enroll a lead's contact. The first step's due time is computed on entry,
    /// so a leading delay or wait-until holds the enrollment until then.
    pub async fn enroll_at(
        &self,
        sequence_id: Uuid,
        lead_id: Uuid,
        contact_id: Uuid,
        now: DateTime<Utc>,
    ) -> SequenceResult<Enrollment> {
        let sequence = self
            .store
            .get_sequence(sequence_id)
            .await?
            .ok_or_else(|| SequenceError::NotFound(format!("Sequence {}", sequence_id)))?;

        let contact = self
            .store
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| SequenceError::NotFound(format!("Contact {}", contact_id)))?;

        if contact.deliverable_address().is_none() {
            return Err(SequenceError::Validation("Contact has no email address".to_string()));
        }

        if contact.is_unsubscribed() {
            return Err(SequenceError::Validation("Contact has unsubscribed".to_string()));
        }

        let enrollment = self
            .store
            .create_enrollment(NewEnrollment {
                sequence_id,
                lead_id,
                contact_id,
                next_step_at: due_time_for(&sequence, 0, now),
                enrolled_at: now,
            })
            .await?;

        info!(
            "Enrolled lead {} (contact {}) in sequence {}",
            lead_id, contact_id, sequence_id
        );
        Ok(enrollment)
    }

    pub async fn pause(&self, enrollment_id: Uuid) -> SequenceResult<Enrollment> {
        self.transition(enrollment_id, EnrollmentState::Active, EnrollmentState::Paused)
            .await
    }

    pub async fn resume(&self, enrollment_id: Uuid) -> SequenceResult<Enrollment> {
        self.transition(enrollment_id, EnrollmentState::Paused, EnrollmentState::Active)
            .await
    }

    /// Complete every unfinished enrollment of a lead.
    pub async fn unenroll_by_lead(&self, lead_id: Uuid) -> SequenceResult<Vec<Enrollment>> {
        let completed = self.store.complete_for_lead(lead_id, Utc::now()).await?;
        info!("Unenrolled lead {} from {} sequence(s)", lead_id, completed.len());
        Ok(completed)
    }

    pub async fn get(&self, enrollment_id: Uuid) -> SequenceResult<Enrollment> {
        self.store
            .get_enrollment(enrollment_id)
            .await?
            .ok_or_else(|| SequenceError::NotFound(format!("Enrollment {}", enrollment_id)))
    }

    /// Repeating a transition, or targeting a completed enrollment, returns the
    /// current snapshot unchanged.
    async fn transition(
        &self,
        enrollment_id: Uuid,
        from: EnrollmentState,
        to: EnrollmentState,
    ) -> SequenceResult<Enrollment> {
        if let Some(updated) = self
            .store
            .update_state(enrollment_id, from, to, Utc::now())
            .await?
        {
            info!("Enrollment {} is now {}", enrollment_id, to);
            return Ok(updated);
        }

        self.get(enrollment_id).await
    }
}
