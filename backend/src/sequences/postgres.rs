// Postgres-backed enrollment store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_shared::{
    ConditionPayload, ContactSnapshot, EmailTemplate, Enrollment, EnrollmentState, LeadSnapshot,
    LeadTag, Sequence, Step, StepKind, WaitUntilCondition,
};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::store::{EnrollmentStore, NewEmailActivity, NewEnrollment, NewSequence, Transition};
use super::{SequenceError, SequenceResult};

const ENROLLMENT_COLUMNS: &str =
    "id, sequence_id, lead_id, contact_id, current_step_index, state, next_step_at, enrolled_at, updated_at";

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgSequenceStore {
    db_pool: PgPool,
}

impl PgSequenceStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[derive(Debug, FromRow)]
struct EnrollmentRow {
    id: Uuid,
    sequence_id: Uuid,
    lead_id: Uuid,
    contact_id: Uuid,
    current_step_index: i32,
    state: String,
    next_step_at: Option<DateTime<Utc>>,
    enrolled_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = SequenceError;

    fn try_from(row: EnrollmentRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<EnrollmentState>()
            .map_err(|e| SequenceError::Configuration(format!("enrollment {}: {}", row.id, e)))?;

        Ok(Enrollment {
            id: row.id,
            sequence_id: row.sequence_id,
            lead_id: row.lead_id,
            contact_id: row.contact_id,
            current_step_index: row.current_step_index,
            state,
            next_step_at: row.next_step_at,
            enrolled_at: row.enrolled_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_enrollments(rows: Vec<EnrollmentRow>) -> SequenceResult<Vec<Enrollment>> {
    rows.into_iter().map(Enrollment::try_from).collect()
}

#[derive(Debug, FromRow)]
struct SequenceRow {
    id: Uuid,
    name: String,
    from_name: Option<String>,
    from_email: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
struct StepRow {
    id: Uuid,
    sequence_id: Uuid,
    step_order: i32,
    step_type: String,
    template_id: Option<Uuid>,
    delay_minutes: Option<i32>,
    condition: Option<serde_json::Value>,
}

impl TryFrom<StepRow> for Step {
    type Error = SequenceError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let invalid = |e: serde_json::Error| {
            SequenceError::InvalidStep(format!("step {} ({}): {}", row.id, row.step_type, e))
        };

        let kind = match row.step_type.as_str() {
            "email" => StepKind::Email {
                template_id: row.template_id,
            },
            "delay" => StepKind::Delay {
                delay_minutes: row.delay_minutes.unwrap_or(0) as i64,
            },
            "wait_until" => StepKind::WaitUntil {
                condition: match &row.condition {
                    Some(value) => serde_json::from_value::<WaitUntilCondition>(value.clone()).map_err(invalid)?,
                    None => WaitUntilCondition::default(),
                },
            },
            "webhook" => StepKind::Webhook {
                url: row
                    .condition
                    .as_ref()
                    .and_then(|c| c.get("url"))
                    .and_then(|u| u.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            "condition" => StepKind::Condition {
                branch: match &row.condition {
                    Some(value) => serde_json::from_value::<ConditionPayload>(value.clone())
                        .map_err(invalid)?
                        .into_branch(),
                    None => None,
                },
            },
            other => {
                return Err(SequenceError::InvalidStep(format!(
                    "step {} has unknown type '{}'",
                    row.id, other
                )))
            }
        };

        Ok(Step {
            id: row.id,
            sequence_id: row.sequence_id,
            order: row.step_order,
            kind,
        })
    }
}

/// Column values for one step: (type, template_id, delay_minutes, condition)
fn step_columns(kind: &StepKind) -> (&'static str, Option<Uuid>, Option<i32>, Option<serde_json::Value>) {
    match kind {
        StepKind::Email { template_id } => ("email", *template_id, None, None),
        StepKind::Delay { delay_minutes } => (
            "delay",
            None,
            Some((*delay_minutes).clamp(0, i32::MAX as i64) as i32),
            None,
        ),
        StepKind::WaitUntil { condition } => {
            ("wait_until", None, None, serde_json::to_value(condition).ok())
        }
        StepKind::Webhook { url } => ("webhook", None, None, Some(serde_json::json!({ "url": url }))),
        StepKind::Condition { branch } => (
            "condition",
            None,
            None,
            branch.as_ref().map(|b| {
                serde_json::json!({
                    "tagId": b.tag_id,
                    "present": b.present,
                    "thenStepIndex": b.then_step_index,
                    "elseStepIndex": b.else_step_index,
                })
            }),
        ),
    }
}

async fn insert_steps(
    tx: &mut Transaction<'_, Postgres>,
    sequence_id: Uuid,
    steps: &[StepKind],
) -> Result<Vec<Step>, sqlx::Error> {
    let mut inserted = Vec::with_capacity(steps.len());

    for (order, kind) in steps.iter().enumerate() {
        let id = Uuid::new_v4();
        let (step_type, template_id, delay_minutes, condition) = step_columns(kind);

        sqlx::query(
            "INSERT INTO sequence_steps (id, sequence_id, step_order, step_type, template_id, delay_minutes, condition)
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        )
        .bind(id)
        .bind(sequence_id)
        .bind(order as i32)
        .bind(step_type)
        .bind(template_id)
        .bind(delay_minutes)
        .bind(condition)
        .execute(&mut **tx)
        .await?;

        inserted.push(Step {
            id,
            sequence_id,
            order: order as i32,
            kind: kind.clone(),
        });
    }

    Ok(inserted)
}

#[derive(Debug, FromRow)]
struct LeadRow {
    id: Uuid,
    title: String,
    amount: Option<Decimal>,
    stage_won: bool,
    stage_lost: bool,
    organization_name: Option<String>,
    assignee_name: Option<String>,
    assignee_email: Option<String>,
    custom_fields: serde_json::Value,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn map_unique_violation(err: sqlx::Error, message: String) -> SequenceError {
    if is_unique_violation(&err) {
        SequenceError::Conflict(message)
    } else {
        SequenceError::Database(err)
    }
}

#[async_trait]
impl EnrollmentStore for PgSequenceStore {
    async fn get_sequence(&self, id: Uuid) -> SequenceResult<Option<Sequence>> {
        let row = sqlx::query_as::<_, SequenceRow>(
            "SELECT id, name, from_name, from_email, created_at, updated_at FROM sequences WHERE id = $1"
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let steps = sqlx::query_as::<_, StepRow>(
            "SELECT id, sequence_id, step_order, step_type, template_id, delay_minutes, condition
             FROM sequence_steps
             WHERE sequence_id = $1
             ORDER BY step_order ASC"
        )
        .bind(id)
        .fetch_all(&self.db_pool)
        .await?
        .into_iter()
        .map(Step::try_from)
        .collect::<SequenceResult<Vec<_>>>()?;

        Ok(Some(Sequence {
            id: row.id,
            name: row.name,
            from_name: row.from_name,
            from_email: row.from_email,
            steps,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    async fn create_sequence(&self, new: NewSequence, now: DateTime<Utc>) -> SequenceResult<Sequence> {
        let id = Uuid::new_v4();
        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            "INSERT INTO sequences (id, name, from_name, from_email, created_at)
             VALUES ($1, $2, $3, $4, $5)"
        )
        .bind(id)
        .bind(&new.name)
        .bind(&new.from_name)
        .bind(&new.from_email)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let steps = insert_steps(&mut tx, id, &new.steps).await?;
        tx.commit().await?;

        info!("Created sequence {} '{}' with {} steps", id, new.name, steps.len());

        Ok(Sequence {
            id,
            name: new.name,
            from_name: new.from_name,
            from_email: new.from_email,
            steps,
            created_at: now,
            updated_at: None,
        })
    }

    async fn replace_steps(
        &self,
        sequence_id: Uuid,
        steps: Vec<StepKind>,
        now: DateTime<Utc>,
    ) -> SequenceResult<Option<Sequence>> {
        let mut tx = self.db_pool.begin().await?;

        let touched = sqlx::query("UPDATE sequences SET updated_at = $2 WHERE id = $1")
            .bind(sequence_id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if touched == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query("DELETE FROM sequence_steps WHERE sequence_id = $1")
            .bind(sequence_id)
            .execute(&mut *tx)
            .await?;

        insert_steps(&mut tx, sequence_id, &steps).await?;
        tx.commit().await?;

        info!("Replaced steps of sequence {} ({} steps)", sequence_id, steps.len());

        self.get_sequence(sequence_id).await
    }

    async fn get_template(&self, id: Uuid) -> SequenceResult<Option<EmailTemplate>> {
        let template = sqlx::query_as::<_, EmailTemplate>(
            "SELECT id, name, subject, html_body, text_body FROM email_templates WHERE id = $1"
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(template)
    }

    async fn create_enrollment(&self, new: NewEnrollment) -> SequenceResult<Enrollment> {
        let query = format!(
            "INSERT INTO sequence_enrollments
                (id, sequence_id, lead_id, contact_id, current_step_index, state, next_step_at, enrolled_at, updated_at)
             VALUES ($1, $2, $3, $4, 0, 'active', $5, $6, $6)
             RETURNING {}",
            ENROLLMENT_COLUMNS
        );

        let row = sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(Uuid::new_v4())
            .bind(new.sequence_id)
            .bind(new.lead_id)
            .bind(new.contact_id)
            .bind(new.next_step_at)
            .bind(new.enrolled_at)
            .fetch_one(&self.db_pool)
            .await
            .map_err(|e| {
                map_unique_violation(
                    e,
                    format!("Lead {} is already enrolled in sequence {}", new.lead_id, new.sequence_id),
                )
            })?;

        row.try_into()
    }

    async fn get_enrollment(&self, id: Uuid) -> SequenceResult<Option<Enrollment>> {
        let query = format!("SELECT {} FROM sequence_enrollments WHERE id = $1", ENROLLMENT_COLUMNS);

        sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?
            .map(Enrollment::try_from)
            .transpose()
    }

    async fn list_enrollments(&self, sequence_id: Uuid) -> SequenceResult<Vec<Enrollment>> {
        let query = format!(
            "SELECT {} FROM sequence_enrollments WHERE sequence_id = $1 ORDER BY enrolled_at ASC",
            ENROLLMENT_COLUMNS
        );

        let rows = sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(sequence_id)
            .fetch_all(&self.db_pool)
            .await?;

        into_enrollments(rows)
    }

    async fn claim_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease_until: DateTime<Utc>,
    ) -> SequenceResult<Vec<Enrollment>> {
        let query = format!(
            "UPDATE sequence_enrollments
             SET claimed_until = $3
             WHERE id IN (
                 SELECT id FROM sequence_enrollments
                 WHERE state = 'active'
                   AND (next_step_at IS NULL OR next_step_at <= $1)
                   AND (claimed_until IS NULL OR claimed_until <= $1)
                 ORDER BY next_step_at ASC NULLS FIRST, enrolled_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            ENROLLMENT_COLUMNS
        );

        let rows = sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(now)
            .bind(limit as i64)
            .bind(lease_until)
            .fetch_all(&self.db_pool)
            .await?;

        // RETURNING does not preserve the subquery order
        let mut claimed = into_enrollments(rows)?;
        claimed.sort_by_key(|e| (e.next_step_at, e.enrolled_at));

        debug!("Claimed {} due enrollments until {}", claimed.len(), lease_until);
        Ok(claimed)
    }

    async fn release_claim(&self, id: Uuid) -> SequenceResult<()> {
        sqlx::query("UPDATE sequence_enrollments SET claimed_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        transition: Transition,
        activity: Option<NewEmailActivity>,
        now: DateTime<Utc>,
    ) -> SequenceResult<Option<Enrollment>> {
        let mut tx = self.db_pool.begin().await?;

        let query = format!(
            "UPDATE sequence_enrollments
             SET current_step_index = $2,
                 next_step_at = $3,
                 state = CASE WHEN $4 THEN 'completed' ELSE state END,
                 claimed_until = NULL,
                 updated_at = $5
             WHERE id = $1 AND state <> 'completed'
             RETURNING {}",
            ENROLLMENT_COLUMNS
        );

        let row = sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(id)
            .bind(transition.current_step_index)
            .bind(transition.next_step_at)
            .bind(transition.complete)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        if let Some(activity) = activity {
            sqlx::query(
                "INSERT INTO activities
                    (id, activity_type, lead_id, contact_id, enrollment_id, subject, is_completed, completed_at, created_at)
                 VALUES ($1, 'email', $2, $3, $4, $5, true, $6, $6)"
            )
            .bind(Uuid::new_v4())
            .bind(activity.lead_id)
            .bind(activity.contact_id)
            .bind(activity.enrollment_id)
            .bind(&activity.subject)
            .bind(activity.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(row.try_into()?))
    }

    async fn update_state(
        &self,
        id: Uuid,
        from: EnrollmentState,
        to: EnrollmentState,
        now: DateTime<Utc>,
    ) -> SequenceResult<Option<Enrollment>> {
        let query = format!(
            "UPDATE sequence_enrollments
             SET state = $3, updated_at = $4
             WHERE id = $1 AND state = $2 AND state <> 'completed'
             RETURNING {}",
            ENROLLMENT_COLUMNS
        );

        sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(now)
            .fetch_optional(&self.db_pool)
            .await?
            .map(Enrollment::try_from)
            .transpose()
    }

    async fn complete_for_lead(&self, lead_id: Uuid, now: DateTime<Utc>) -> SequenceResult<Vec<Enrollment>> {
        let query = format!(
            "UPDATE sequence_enrollments
             SET state = 'completed', next_step_at = NULL, claimed_until = NULL, updated_at = $2
             WHERE lead_id = $1 AND state <> 'completed'
             RETURNING {}",
            ENROLLMENT_COLUMNS
        );

        let rows = sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(lead_id)
            .bind(now)
            .fetch_all(&self.db_pool)
            .await?;

        into_enrollments(rows)
    }

    async fn get_lead(&self, id: Uuid) -> SequenceResult<Option<LeadSnapshot>> {
        let row = sqlx::query_as::<_, LeadRow>(
            r#"
            SELECT
                l.id,
                l.title,
                l.amount,
                COALESCE(s.is_won, false) AS stage_won,
                COALESCE(s.is_lost, false) AS stage_lost,
                o.name AS organization_name,
                u.first_name || ' ' || u.last_name AS assignee_name,
                u.email AS assignee_email,
                l.custom_fields
            FROM leads l
            LEFT JOIN pipeline_stages s ON l.stage_id = s.id
            LEFT JOIN organizations o ON l.organization_id = o.id
            LEFT JOIN users u ON l.assignee_id = u.id
            WHERE l.id = $1
            "#
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tags = sqlx::query_as::<_, LeadTag>(
            "SELECT t.id, t.name
             FROM lead_tags lt
             JOIN tags t ON t.id = lt.tag_id
             WHERE lt.lead_id = $1"
        )
        .bind(id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(Some(LeadSnapshot {
            id: row.id,
            title: row.title,
            amount: row.amount,
            stage_won: row.stage_won,
            stage_lost: row.stage_lost,
            tags,
            organization_name: row.organization_name,
            assignee_name: row.assignee_name,
            assignee_email: row.assignee_email,
            custom_fields: row.custom_fields,
        }))
    }

    async fn get_contact(&self, id: Uuid) -> SequenceResult<Option<ContactSnapshot>> {
        let contact = sqlx::query_as::<_, ContactSnapshot>(
            "SELECT id, name, email, unsubscribed_at FROM contacts WHERE id = $1"
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(contact)
    }

    async fn last_email_sent_at(&self, contact_id: Uuid) -> SequenceResult<Option<DateTime<Utc>>> {
        let last = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(completed_at)
             FROM activities
             WHERE contact_id = $1 AND activity_type = 'email' AND is_completed"
        )
        .bind(contact_id)
        .fetch_one(&self.db_pool)
        .await?;

        Ok(last)
    }
}
