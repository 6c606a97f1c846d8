use chrono::Duration;
use crm_shared::{ContactSnapshot, EnrollmentState, StepKind, WaitUntilCondition};
use uuid::Uuid;

use crate::sequences::SequenceError;
use crate::tests::fixtures::*;
use crate::tests::helpers::at;

#[tokio::test]
async fn test_enroll_computes_first_due_time() {
    let h = Harness::new();
    let service = h.enrollments();
    let now = at(2024, 1, 3, 14, 30);
    let template = h.store.add_template("Hi", "<p>Hi</p>");

    let starts_with_delay = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 90 }]);
    let starts_with_wait = h.store.add_sequence(vec![StepKind::WaitUntil {
        condition: WaitUntilCondition {
            rule: Some("next_week".to_string()),
            ..Default::default()
        },
    }]);
    let starts_with_email = h.store.add_sequence(vec![StepKind::Email {
        template_id: Some(template.id),
    }]);

    let lead = h.store.add_lead(lead_fixture());
    let contact = h.store.add_contact(contact_fixture());

    let delayed = service.enroll_at(starts_with_delay.id, lead.id, contact.id, now).await.unwrap();
    assert_eq!(delayed.state, EnrollmentState::Active);
    assert_eq!(delayed.current_step_index, 0);
    assert_eq!(delayed.next_step_at, Some(now + Duration::minutes(90)));

    let waiting = service.enroll_at(starts_with_wait.id, lead.id, contact.id, now).await.unwrap();
    assert_eq!(waiting.next_step_at, Some(at(2024, 1, 8, 9, 0)));

    let immediate = service.enroll_at(starts_with_email.id, lead.id, contact.id, now).await.unwrap();
    assert_eq!(immediate.next_step_at, None);
}

#[tokio::test]
async fn test_enroll_twice_is_conflict() {
    let h = Harness::new();
    let service = h.enrollments();
    let sequence = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 10 }]);
    let lead = h.store.add_lead(lead_fixture());
    let contact = h.store.add_contact(contact_fixture());

    service.enroll(sequence.id, lead.id, contact.id).await.unwrap();
    let err = service.enroll(sequence.id, lead.id, contact.id).await.unwrap_err();

    assert!(matches!(err, SequenceError::Conflict(_)));
}

#[tokio::test]
async fn test_enroll_rejects_unreachable_contacts() {
    let h = Harness::new();
    let service = h.enrollments();
    let sequence = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 10 }]);
    let lead = h.store.add_lead(lead_fixture());

    let no_email = h.store.add_contact(ContactSnapshot {
        email: Some("   ".to_string()),
        ..contact_fixture()
    });
    let unsubscribed = h.store.add_contact(ContactSnapshot {
        unsubscribed_at: Some(at(2023, 12, 1, 0, 0)),
        ..contact_fixture()
    });

    for contact in [no_email, unsubscribed] {
        let err = service.enroll(sequence.id, lead.id, contact.id).await.unwrap_err();
        assert!(matches!(err, SequenceError::Validation(_)), "got {:?}", err);
    }

    let missing = service.enroll(sequence.id, lead.id, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(missing, SequenceError::NotFound(_)));

    let contact = h.store.add_contact(contact_fixture());
    let no_sequence = service.enroll(Uuid::new_v4(), lead.id, contact.id).await.unwrap_err();
    assert!(matches!(no_sequence, SequenceError::NotFound(_)));
}

#[tokio::test]
async fn test_pause_and_resume_are_idempotent() {
    let h = Harness::new();
    let service = h.enrollments();
    let sequence = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 10 }]);
    let (_, _, enrollment) = h.enroll_new(&sequence);

    let paused = service.pause(enrollment.id).await.unwrap();
    assert_eq!(paused.state, EnrollmentState::Paused);
    let paused_again = service.pause(enrollment.id).await.unwrap();
    assert_eq!(paused_again.state, EnrollmentState::Paused);

    // Paused enrollments are never due
    assert!(!paused_again.is_due(at(2030, 1, 1, 0, 0)));

    let resumed = service.resume(enrollment.id).await.unwrap();
    assert_eq!(resumed.state, EnrollmentState::Active);
    let resumed_again = service.resume(enrollment.id).await.unwrap();
    assert_eq!(resumed_again.state, EnrollmentState::Active);
    assert_eq!(resumed_again.current_step_index, enrollment.current_step_index);
}

#[tokio::test]
async fn test_pause_on_completed_enrollment_changes_nothing() {
    let h = Harness::new();
    let service = h.enrollments();
    let sequence = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 10 }]);
    let (lead, _, enrollment) = h.enroll_new(&sequence);
    service.unenroll_by_lead(lead.id).await.unwrap();

    let paused = service.pause(enrollment.id).await.unwrap();
    assert_eq!(paused.state, EnrollmentState::Completed);
    let resumed = service.resume(enrollment.id).await.unwrap();
    assert_eq!(resumed.state, EnrollmentState::Completed);

    let missing = service.pause(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(missing, SequenceError::NotFound(_)));
}

#[tokio::test]
async fn test_unenroll_by_lead_completes_every_open_enrollment() {
    let h = Harness::new();
    let service = h.enrollments();
    let first = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 10 }]);
    let second = h.store.add_sequence(vec![StepKind::Delay { delay_minutes: 10 }]);
    let lead = h.store.add_lead(lead_fixture());
    let contact = h.store.add_contact(contact_fixture());

    let a = service.enroll(first.id, lead.id, contact.id).await.unwrap();
    let b = service.enroll(second.id, lead.id, contact.id).await.unwrap();
    service.pause(b.id).await.unwrap();
    let (_, _, other_lead) = h.enroll_new(&first);

    let completed = service.unenroll_by_lead(lead.id).await.unwrap();

    assert_eq!(completed.len(), 2);
    for enrollment in [a, b] {
        let stored = h.store.enrollment(enrollment.id);
        assert_eq!(stored.state, EnrollmentState::Completed);
        assert_eq!(stored.next_step_at, None);
    }
    assert_eq!(h.store.enrollment(other_lead.id).state, EnrollmentState::Active);

    // Nothing left to cancel the second time
    assert!(service.unenroll_by_lead(lead.id).await.unwrap().is_empty());
}
