use chrono::Duration;
use crm_shared::{ContactSnapshot, EnrollmentState, LeadSnapshot, StepKind};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::SequenceConfig;
use crate::jobs::{run_job_now, ExecutionLogs, JobError, JobStatus};
use crate::sequences::{EnrollmentStore, ExecutorSettings, SequenceError, StepOutcome};
use crate::tests::fixtures::*;
use crate::tests::helpers::{at, init_test_logging};

fn email_sequence(h: &Harness) -> crm_shared::Sequence {
    let template = h.store.add_template("Hi {{contact.first_name}}", "<p>Hi</p>");
    h.store.add_sequence(vec![
        StepKind::Email {
            template_id: Some(template.id),
        },
        StepKind::Delay { delay_minutes: 60 },
    ])
}

#[tokio::test]
async fn test_one_failure_does_not_abort_the_batch() {
    init_test_logging();
    let h = Harness::new();
    let now = at(2024, 1, 3, 14, 30);
    let sequence = email_sequence(&h);

    let healthy: Vec<_> = (0..3).map(|_| h.enroll_new(&sequence).2).collect();

    let lead = h.store.add_lead(lead_fixture());
    let bouncing = h.store.add_contact(ContactSnapshot {
        email: Some("bounce@blocked.example".to_string()),
        ..contact_fixture()
    });
    h.email.fail_for("bounce@blocked.example");
    let failing = h.store.insert_enrollment(sequence.id, lead.id, bouncing.id, 0, None);

    let result = h.poller(&SequenceConfig::default()).run_at(now).await.unwrap();

    assert_eq!(result.due, 4);
    assert_eq!(result.processed, 3);
    assert_eq!(result.emails_sent, 3);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains(&failing.id.to_string()));

    for enrollment in healthy {
        assert_eq!(h.store.enrollment(enrollment.id).current_step_index, 1);
    }

    // Untouched and released, so the next tick retries it
    let stuck = h.store.enrollment(failing.id);
    assert_eq!(stuck, failing);
    assert!(!h.store.is_claimed(failing.id));

    let retry = h.poller(&SequenceConfig::default()).run_at(now + Duration::minutes(5)).await.unwrap();
    assert_eq!(retry.due, 1);
    assert_eq!(retry.errors.len(), 1);
}

#[tokio::test]
async fn test_batch_is_capped_and_remainder_waits() {
    let h = Harness::new();
    let now = at(2024, 1, 3, 14, 30);
    let sequence = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 60 }]);
    for _ in 0..45 {
        h.enroll_new(&sequence);
    }

    let config = SequenceConfig::default();
    assert_eq!(config.batch_size, 30);

    let first = h.poller(&config).run_at(now).await.unwrap();
    assert_eq!(first.due, 30);
    assert_eq!(first.processed, 30);

    let second = h.poller(&config).run_at(now + Duration::minutes(5)).await.unwrap();
    assert_eq!(second.due, 15);

    let third = h.poller(&config).run_at(now + Duration::minutes(10)).await.unwrap();
    assert_eq!(third.due, 0);
}

#[tokio::test]
async fn test_claimed_enrollments_are_not_picked_twice() {
    let h = Harness::new();
    let now = at(2024, 1, 3, 14, 30);
    let sequence = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 60 }]);
    let (_, _, enrollment) = h.enroll_new(&sequence);

    let lease_until = now + Duration::minutes(10);
    let claimed = h.store.claim_due_enrollments(now, 30, lease_until).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let during_lease = h.poller(&SequenceConfig::default()).run_at(now).await.unwrap();
    assert_eq!(during_lease.due, 0);

    // An expired lease (crashed poller) makes the enrollment visible again
    let after_lease = h.poller(&SequenceConfig::default()).run_at(lease_until).await.unwrap();
    assert_eq!(after_lease.due, 1);
    assert_eq!(h.store.enrollment(enrollment.id).current_step_index, 1);
}

#[tokio::test]
async fn test_won_lead_completes_on_next_tick() {
    let h = Harness::new();
    let now = at(2024, 1, 3, 14, 30);
    let sequence = email_sequence(&h);
    let lead = h.store.add_lead(LeadSnapshot {
        stage_won: true,
        ..lead_fixture()
    });
    let contact = h.store.add_contact(contact_fixture());
    let enrollment = h.store.insert_enrollment(sequence.id, lead.id, contact.id, 0, None);

    let result = h.poller(&SequenceConfig::default()).run_at(now).await.unwrap();

    assert_eq!(result.completed, 1);
    assert_eq!(result.emails_sent, 0);
    assert_eq!(h.store.enrollment(enrollment.id).state, EnrollmentState::Completed);
}

#[tokio::test]
async fn test_throttled_enrollment_waits_for_later_tick() {
    let h = Harness::new();
    let now = at(2024, 1, 3, 14, 30);
    let sequence = email_sequence(&h);
    let (_, _, enrollment) = h.enroll_new(&sequence);
    h.store.record_email(&enrollment, now - Duration::hours(2));
    let poller = h.poller(&SequenceConfig::default());

    let first = poller.run_at(now).await.unwrap();
    assert_eq!(first.rescheduled, 1);
    assert_eq!(h.store.enrollment(enrollment.id).next_step_at, Some(now + Duration::hours(22)));

    let early = poller.run_at(now + Duration::hours(21)).await.unwrap();
    assert_eq!(early.due, 0);

    let on_time = poller.run_at(now + Duration::hours(22)).await.unwrap();
    assert_eq!(on_time.emails_sent, 1);
    assert_eq!(h.email.sent().len(), 1);
}

#[tokio::test]
async fn test_run_job_now_records_execution() {
    let h = Harness::new();
    let sequence = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 60 }]);
    h.enroll_new(&sequence);
    let poller = h.poller(&SequenceConfig::default());
    let logs: ExecutionLogs = Arc::new(RwLock::new(Vec::new()));

    let log = run_job_now("sequence_poller", &poller, &logs).await.unwrap();
    assert_eq!(log.status, JobStatus::Completed);
    assert_eq!(log.items_processed, 1);

    let unknown = run_job_now("sla_checker", &poller, &logs).await.unwrap_err();
    assert!(matches!(unknown, JobError::ConfigError(_)));

    assert_eq!(logs.read().await.len(), 1);
}

#[tokio::test]
async fn test_one_contact_gets_one_email_per_tick_across_sequences() {
    init_test_logging();
    let h = Harness::new();
    let now = at(2024, 1, 3, 14, 30);
    let first = email_sequence(&h);
    let second = email_sequence(&h);
    let lead = h.store.add_lead(lead_fixture());
    let contact = h.store.add_contact(contact_fixture());
    let a = h.store.insert_enrollment(first.id, lead.id, contact.id, 0, None);
    let b = h.store.insert_enrollment(second.id, lead.id, contact.id, 0, None);

    // A slow relay keeps the first send in flight while the batch runs
    h.email.set_latency(std::time::Duration::from_millis(20));
    let config = SequenceConfig {
        max_concurrency: 4,
        ..Default::default()
    };

    let result = h.poller(&config).run_at(now).await.unwrap();

    assert_eq!(result.due, 2);
    assert_eq!(result.emails_sent, 1);
    assert_eq!(result.rescheduled, 1);
    assert_eq!(h.email.sent().len(), 1);

    let held: Vec<_> = [a.id, b.id]
        .into_iter()
        .map(|id| h.store.enrollment(id))
        .filter(|e| e.current_step_index == 0)
        .collect();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].next_step_at, Some(now + Duration::hours(24)));
}

#[tokio::test]
async fn test_email_timeout_leaves_enrollment_for_retry() {
    let h = Harness::with_settings(ExecutorSettings {
        email_timeout: std::time::Duration::from_millis(20),
        ..Default::default()
    });
    h.email.set_latency(std::time::Duration::from_millis(500));
    let now = at(2024, 1, 3, 14, 30);
    let sequence = email_sequence(&h);
    let (_, _, enrollment) = h.enroll_new(&sequence);

    let err = h.executor.execute(enrollment.clone(), now).await.unwrap_err();
    let SequenceError::Delivery(message) = err else {
        panic!("expected a delivery error, got {:?}", err);
    };
    assert!(message.contains("timed out"), "{}", message);

    let result = h.poller(&SequenceConfig::default()).run_at(now).await.unwrap();
    assert_eq!(result.due, 1);
    assert_eq!(result.processed, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("timed out"));

    assert_eq!(h.store.enrollment(enrollment.id), enrollment);
    assert!(h.store.activities().is_empty());
    assert!(h.email.sent().is_empty());
    assert!(!h.store.is_claimed(enrollment.id));
}

#[tokio::test]
async fn test_paused_enrollment_is_never_claimed() {
    let h = Harness::new();
    let now = at(2024, 1, 3, 14, 30);
    let sequence = email_sequence(&h);
    let (_, _, enrollment) = h.enroll_new(&sequence);
    h.enrollments().pause(enrollment.id).await.unwrap();

    let result = h.poller(&SequenceConfig::default()).run_at(now).await.unwrap();

    assert_eq!(result.due, 0);
    assert!(h.email.sent().is_empty());
    assert_eq!(h.store.enrollment(enrollment.id).current_step_index, 0);
}

#[tokio::test]
async fn test_pause_during_execution_survives_the_transition() {
    let h = Harness::new();
    let now = at(2024, 1, 3, 14, 30);
    let sequence = h.store.add_sequence(vec![
        StepKind::Delay { delay_minutes: 60 },
        StepKind::Delay { delay_minutes: 60 },
    ]);
    let (_, _, enrollment) = h.enroll_new(&sequence);

    let claimed = h
        .store
        .claim_due_enrollments(now, 30, now + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // Paused after the poller picked it up, before the step ran
    h.enrollments().pause(enrollment.id).await.unwrap();
    let stale = claimed.into_iter().next().unwrap();
    assert_eq!(stale.state, EnrollmentState::Active);

    let outcome = h.executor.execute(stale, now).await.unwrap();
    assert!(matches!(outcome, StepOutcome::Advanced { .. }));

    let stored = h.store.enrollment(enrollment.id);
    assert_eq!(stored.current_step_index, 1);
    assert_eq!(stored.state, EnrollmentState::Paused);
    assert!(!stored.is_due(now + Duration::days(30)));
}
