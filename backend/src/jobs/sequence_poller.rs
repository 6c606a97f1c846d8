// Sequence Poller Job - Claims due enrollments and runs their next step

use chrono::{DateTime, Duration, Utc};
use crm_shared::Enrollment;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::scheduler::JobResult;
use crate::config::SequenceConfig;
use crate::sequences::{EnrollmentStore, SequenceResult, StepExecutor, StepOutcome};

pub struct SequencePollerJob {
    store: Arc<dyn EnrollmentStore>,
    executor: StepExecutor,
    batch_size: u32,
    max_concurrency: usize,
    claim_lease: Duration,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PollResult {
    pub due: i32,
    pub processed: i32,
    pub emails_sent: i32,
    pub completed: i32,
    pub rescheduled: i32,
    pub errors: Vec<String>,
}

impl SequencePollerJob {
    pub fn new(store: Arc<dyn EnrollmentStore>, executor: StepExecutor, config: &SequenceConfig) -> Self {
        Self {
            store,
            executor,
            batch_size: config.batch_size,
            max_concurrency: config.max_concurrency.max(1),
            claim_lease: config.claim_lease(),
        }
    }

    pub async fn run(&self) -> JobResult<PollResult> {
        self.run_at(Utc::now()).await
    }

    /// One tick: claim up to a batch of due enrollments and execute each in
    /// isolation. Whatever stays due past the batch cap waits for the next tick.
    pub async fn run_at(&self, now: DateTime<Utc>) -> JobResult<PollResult> {
        let mut result = PollResult::default();

        let claimed = self
            .store
            .claim_due_enrollments(now, self.batch_size, now + self.claim_lease)
            .await?;

        result.due = claimed.len() as i32;
        if claimed.is_empty() {
            debug!("No sequence enrollments due");
            return Ok(result);
        }

        info!("Processing {} due sequence enrollments", claimed.len());

        // The email throttle is read-then-send, so one contact's enrollments
        // run in order; only different contacts run concurrently
        let outcomes: Vec<Vec<(Uuid, SequenceResult<StepOutcome>)>> = stream::iter(group_by_contact(claimed))
            .map(|group| async move {
                let mut outcomes = Vec::with_capacity(group.len());
                for enrollment in group {
                    let id = enrollment.id;
                    outcomes.push((id, self.executor.execute(enrollment, now).await));
                }
                outcomes
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (enrollment_id, outcome) in outcomes.into_iter().flatten() {
            match outcome {
                Ok(outcome) => {
                    result.processed += 1;
                    match outcome {
                        StepOutcome::Advanced { email_sent: true, .. } => result.emails_sent += 1,
                        StepOutcome::Completed { .. } => result.completed += 1,
                        StepOutcome::Rescheduled { .. } => result.rescheduled += 1,
                        StepOutcome::Advanced { .. } | StepOutcome::Skipped => {}
                    }
                }
                Err(e) => {
                    error!("Failed to process enrollment {} ({}): {}", enrollment_id, e.kind(), e);
                    result.errors.push(format!("Enrollment {}: {}", enrollment_id, e));

                    // Leave index and due time untouched so the next tick retries
                    if let Err(release_err) = self.store.release_claim(enrollment_id).await {
                        error!("Failed to release claim on enrollment {}: {}", enrollment_id, release_err);
                    }
                }
            }
        }

        info!(
            "Sequence poll finished: {} due, {} processed, {} emails sent, {} completed, {} rescheduled, {} errors",
            result.due,
            result.processed,
            result.emails_sent,
            result.completed,
            result.rescheduled,
            result.errors.len()
        );

        Ok(result)
    }
}

/// Split a claimed batch per contact, keeping the claim order inside each group.
fn group_by_contact(claimed: Vec<Enrollment>) -> Vec<Vec<Enrollment>> {
    let mut groups: Vec<Vec<Enrollment>> = Vec::new();
    let mut positions: HashMap<Uuid, usize> = HashMap::new();

    for enrollment in claimed {
        match positions.get(&enrollment.contact_id) {
            Some(&i) => groups[i].push(enrollment),
            None => {
                positions.insert(enrollment.contact_id, groups.len());
                groups.push(vec![enrollment]);
            }
        }
    }
    groups
}
