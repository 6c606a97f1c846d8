use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ==================== Sequences ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    /// Overrides the default SMTP sender for emails sent by this sequence.
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    /// Sorted by `order`. Enrollments address steps by position in this list.
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Sequence {
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn step_at(&self, index: i32) -> Option<&Step> {
        usize::try_from(index).ok().and_then(|i| self.steps.get(i))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub order: i32,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Typed step payloads; each step type only carries its own configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Email {
        template_id: Option<Uuid>,
    },
    Delay {
        delay_minutes: i64,
    },
    WaitUntil {
        condition: WaitUntilCondition,
    },
    Webhook {
        url: String,
    },
    Condition {
        #[serde(default)]
        branch: Option<BranchRule>,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Email { .. } => "email",
            StepKind::Delay { .. } => "delay",
            StepKind::WaitUntil { .. } => "wait_until",
            StepKind::Webhook { .. } => "webhook",
            StepKind::Condition { .. } => "condition",
        }
    }

    /// Email and webhook steps talk to the outside world; the rest only move the cursor.
    pub fn has_side_effect(&self) -> bool {
        matches!(self, StepKind::Email { .. } | StepKind::Webhook { .. })
    }
}

/// `{rule: "next_week"}` or `{dayOfWeek: 0..6}`, each with optional `hour`/`minute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitUntilCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, alias = "day_of_week", skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchRule {
    #[serde(alias = "tag_id")]
    pub tag_id: Uuid,
    #[serde(default = "default_present")]
    pub present: bool,
    #[serde(alias = "then_step_index")]
    pub then_step_index: i32,
    #[serde(alias = "else_step_index")]
    pub else_step_index: i32,
}

fn default_present() -> bool {
    true
}

/// Raw condition-step payload as stored. Only a complete payload becomes a [`BranchRule`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionPayload {
    #[serde(default, alias = "tag_id")]
    pub tag_id: Option<Uuid>,
    #[serde(default)]
    pub present: Option<bool>,
    #[serde(default, alias = "then_step_index")]
    pub then_step_index: Option<i32>,
    #[serde(default, alias = "else_step_index")]
    pub else_step_index: Option<i32>,
}

impl ConditionPayload {
    pub fn into_branch(self) -> Option<BranchRule> {
        match (self.tag_id, self.then_step_index, self.else_step_index) {
            (Some(tag_id), Some(then_step_index), Some(else_step_index)) => Some(BranchRule {
                tag_id,
                present: self.present.unwrap_or(true),
                then_step_index,
                else_step_index,
            }),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
}

// ==================== Enrollments ====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    Active,
    Paused,
    Completed,
}

impl EnrollmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentState::Active => "active",
            EnrollmentState::Paused => "paused",
            EnrollmentState::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EnrollmentState::Completed)
    }
}

impl fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EnrollmentState::Active),
            "paused" => Ok(EnrollmentState::Paused),
            "completed" => Ok(EnrollmentState::Completed),
            other => Err(format!("unknown enrollment state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub lead_id: Uuid,
    pub contact_id: Uuid,
    /// May exceed the step count once the sequence is exhausted.
    pub current_step_index: i32,
    pub state: EnrollmentState,
    /// `None` means due immediately.
    pub next_step_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == EnrollmentState::Active && self.next_step_at.is_none_or(|at| at <= now)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailActivity {
    pub id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub lead_id: Uuid,
    pub contact_id: Uuid,
    pub subject: String,
    pub completed_at: DateTime<Utc>,
}

// ==================== CRM snapshots (read-only) ====================

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadTag {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadSnapshot {
    pub id: Uuid,
    pub title: String,
    pub amount: Option<Decimal>,
    pub stage_won: bool,
    pub stage_lost: bool,
    pub tags: Vec<LeadTag>,
    pub organization_name: Option<String>,
    pub assignee_name: Option<String>,
    pub assignee_email: Option<String>,
    pub custom_fields: serde_json::Value,
}

impl LeadSnapshot {
    pub fn is_closed(&self) -> bool {
        self.stage_won || self.stage_lost
    }

    pub fn has_tag(&self, tag_id: Uuid) -> bool {
        self.tags.iter().any(|t| t.id == tag_id)
    }

    pub fn has_tag_named(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name.trim().eq_ignore_ascii_case(name))
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

impl ContactSnapshot {
    pub fn deliverable_address(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed_at.is_some()
    }

    pub fn first_name(&self) -> Option<&str> {
        self.name.as_deref().and_then(|n| n.split_whitespace().next())
    }
}
