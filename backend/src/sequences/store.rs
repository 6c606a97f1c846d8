//! Persistence contract for the sequence engine.
//!
//! The engine only mutates enrollments (and appends email activities); sequences,
//! leads and contacts are read-only inputs while the poller runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_shared::{
    ContactSnapshot, EmailTemplate, Enrollment, EnrollmentState, LeadSnapshot, Sequence, StepKind,
};
use uuid::Uuid;

use super::SequenceResult;

#[derive(Debug, Clone)]
pub struct NewSequence {
    pub name: String,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub steps: Vec<StepKind>,
}

#[derive(Debug, Clone)]
pub struct NewEnrollment {
    pub sequence_id: Uuid,
    pub lead_id: Uuid,
    pub contact_id: Uuid,
    pub next_step_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
}

/// One atomic cursor update. The state is left alone unless `complete` is set,
/// so a pause issued mid-execution survives the in-flight transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub current_step_index: i32,
    pub next_step_at: Option<DateTime<Utc>>,
    pub complete: bool,
}

impl Transition {
    pub fn advance(current_step_index: i32, next_step_at: Option<DateTime<Utc>>) -> Self {
        Self {
            current_step_index,
            next_step_at,
            complete: false,
        }
    }

    pub fn complete(current_step_index: i32) -> Self {
        Self {
            current_step_index,
            next_step_at: None,
            complete: true,
        }
    }
}

/// Completed email activity recorded alongside the transition that sent it.
#[derive(Debug, Clone)]
pub struct NewEmailActivity {
    pub enrollment_id: Uuid,
    pub lead_id: Uuid,
    pub contact_id: Uuid,
    pub subject: String,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    // Sequences
    async fn get_sequence(&self, id: Uuid) -> SequenceResult<Option<Sequence>>;
    async fn create_sequence(&self, new: NewSequence, now: DateTime<Utc>) -> SequenceResult<Sequence>;
    /// Swap the full step list in one transaction. `None` if the sequence does not exist.
    async fn replace_steps(
        &self,
        sequence_id: Uuid,
        steps: Vec<StepKind>,
        now: DateTime<Utc>,
    ) -> SequenceResult<Option<Sequence>>;
    async fn get_template(&self, id: Uuid) -> SequenceResult<Option<EmailTemplate>>;

    // Enrollments
    /// Fails with `Conflict` when the (sequence, lead) pair is already enrolled.
    async fn create_enrollment(&self, new: NewEnrollment) -> SequenceResult<Enrollment>;
    async fn get_enrollment(&self, id: Uuid) -> SequenceResult<Option<Enrollment>>;
    async fn list_enrollments(&self, sequence_id: Uuid) -> SequenceResult<Vec<Enrollment>>;
    /// Atomically claim up to `limit` due, unclaimed active enrollments until `lease_until`,
    /// oldest due first.
    async fn claim_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease_until: DateTime<Utc>,
    ) -> SequenceResult<Vec<Enrollment>>;
    async fn release_claim(&self, id: Uuid) -> SequenceResult<()>;
    /// Apply a transition (and its activity, if any) unless the enrollment is already
    /// completed. Clears the claim. Returns `None` when nothing was updated.
    async fn apply_transition(
        &self,
        id: Uuid,
        transition: Transition,
        activity: Option<NewEmailActivity>,
        now: DateTime<Utc>,
    ) -> SequenceResult<Option<Enrollment>>;
    /// Move `from` -> `to`; `None` when the enrollment was not in `from`.
    /// A completed enrollment never leaves that state.
    async fn update_state(
        &self,
        id: Uuid,
        from: EnrollmentState,
        to: EnrollmentState,
        now: DateTime<Utc>,
    ) -> SequenceResult<Option<Enrollment>>;
    /// Complete every unfinished enrollment of a lead, returning the updated rows.
    async fn complete_for_lead(&self, lead_id: Uuid, now: DateTime<Utc>) -> SequenceResult<Vec<Enrollment>>;

    // CRM snapshots
    async fn get_lead(&self, id: Uuid) -> SequenceResult<Option<LeadSnapshot>>;
    async fn get_contact(&self, id: Uuid) -> SequenceResult<Option<ContactSnapshot>>;
    async fn last_email_sent_at(&self, contact_id: Uuid) -> SequenceResult<Option<DateTime<Utc>>>;
}
